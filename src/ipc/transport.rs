//! NDJSON framing over async byte streams
//!
//! One envelope per line. The manager drives a worker through the child's
//! stdin/stdout pair; the worker uses its own stdin/stdout.

use crate::error::FleetError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::warn;

/// Encode a message as one newline-terminated JSON line
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, FleetError> {
    let mut line = serde_json::to_vec(message).map_err(FleetError::Codec)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one line (trailing whitespace allowed)
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, FleetError> {
    serde_json::from_str(line.trim_end()).map_err(FleetError::Codec)
}

/// Drain `rx` into `writer`, flushing after every message.
///
/// Returns when the channel closes or the pipe breaks.
pub async fn write_messages<W, T>(writer: W, mut rx: mpsc::UnboundedReceiver<T>) -> Result<(), FleetError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut writer = BufWriter::new(writer);

    while let Some(message) = rx.recv().await {
        let line = encode(&message)?;
        writer.write_all(&line).await.map_err(FleetError::Transport)?;
        writer.flush().await.map_err(FleetError::Transport)?;
    }

    Ok(())
}

/// Read lines from `reader` until EOF, handing every decoded message to
/// `on_message`. Undecodable lines are logged and skipped.
pub async fn read_messages<R, T, F>(reader: R, mut on_message: F) -> Result<(), FleetError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
    F: FnMut(T),
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(FleetError::Transport)?;
        if read == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        match decode::<T>(&line) {
            Ok(message) => on_message(message),
            Err(e) => warn!(error = %e, line = line.trim_end(), "Dropping undecodable envelope"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{ManagerMessage, WorkerMessage};

    #[test]
    fn encode_appends_newline() {
        let line = encode(&WorkerMessage::ShardsStarted).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(
            std::str::from_utf8(&line).unwrap(),
            "{\"type\":\"shards-started\"}\n"
        );
    }

    #[tokio::test]
    async fn writer_and_reader_share_framing() {
        let (client, server) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(ManagerMessage::StatsRequest { round: 1 }).unwrap();
        tx.send(ManagerMessage::RestartRequest).unwrap();
        drop(tx);

        let writer = tokio::spawn(write_messages(client, rx));

        let mut received = Vec::new();
        read_messages(server, |msg: ManagerMessage| received.push(msg))
            .await
            .unwrap();
        writer.await.unwrap().unwrap();

        assert_eq!(
            received,
            vec![
                ManagerMessage::StatsRequest { round: 1 },
                ManagerMessage::RestartRequest,
            ]
        );
    }

    #[tokio::test]
    async fn garbage_lines_are_skipped() {
        let input: &[u8] = b"not json\n\n{\"type\":\"shards-started\"}\n";
        let mut received = Vec::new();
        read_messages(input, |msg: WorkerMessage| received.push(msg))
            .await
            .unwrap();
        assert_eq!(received, vec![WorkerMessage::ShardsStarted]);
    }
}

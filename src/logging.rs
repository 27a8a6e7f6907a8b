//! Tracing setup for both process roles
//!
//! The manager logs JSON to stdout. A worker's stdout is its IPC channel, so
//! its events are turned into `lifecycle-log` envelopes by [`IpcLogLayer`]
//! and re-emitted by the manager with a `cluster_id` field.

use crate::error::FleetError;
use crate::ipc::{LogLevel, WorkerMessage};
use std::fmt::{self, Write as _};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

fn filter(level: &str) -> Result<EnvFilter, FleetError> {
    let directive = |d: &str| {
        d.parse::<Directive>()
            .map_err(|e| FleetError::Config(format!("invalid log directive '{d}': {e}")))
    };

    Ok(EnvFilter::from_default_env()
        .add_directive(directive(&format!("shard_fleet={level}"))?)
        .add_directive(directive("twilight_gateway=info")?)
        .add_directive(directive("twilight_http=info")?)
        .add_directive(directive("async_nats=warn")?))
}

/// JSON logs on stdout
pub fn init_manager(level: &str) -> Result<(), FleetError> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level)?)
        .json()
        .try_init()
        .map_err(|e| FleetError::Config(format!("failed to install tracing subscriber: {e}")))
}

/// Route every event through the manager
pub fn init_worker(level: &str, outbound: &mpsc::UnboundedSender<WorkerMessage>) -> Result<(), FleetError> {
    tracing_subscriber::registry()
        .with(IpcLogLayer::new(outbound).with_filter(filter(level)?))
        .try_init()
        .map_err(|e| FleetError::Config(format!("failed to install tracing subscriber: {e}")))
}

/// Forwards tracing events to the manager as `lifecycle-log` envelopes.
///
/// Holds a weak sender: the layer alone never keeps the IPC writer alive.
pub struct IpcLogLayer {
    outbound: mpsc::WeakUnboundedSender<WorkerMessage>,
}

impl IpcLogLayer {
    pub fn new(outbound: &mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            outbound: outbound.downgrade(),
        }
    }
}

impl<S: Subscriber> Layer<S> for IpcLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let level = match *event.metadata().level() {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warn,
            Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        };

        // Nowhere to report a closed pipe; the process is about to exit
        if let Some(outbound) = self.outbound.upgrade() {
            let _ = outbound.send(WorkerMessage::LifecycleLog {
                level,
                message: visitor.finish(),
            });
        }
    }
}

/// Renders `message key=value ...`
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_become_lifecycle_logs() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(IpcLogLayer::new(&tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(shard_id = 3, "Shard disconnected");
            tracing::info!("Cluster ready");
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            WorkerMessage::LifecycleLog {
                level: LogLevel::Warn,
                message: "Shard disconnected shard_id=3".to_string(),
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            WorkerMessage::LifecycleLog {
                level: LogLevel::Info,
                message: "Cluster ready".to_string(),
            }
        );
    }

    #[test]
    fn string_fields_are_not_quoted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(IpcLogLayer::new(&tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(reason = "boom", "Bootstrap failed");
        });

        match rx.try_recv().unwrap() {
            WorkerMessage::LifecycleLog { level, message } => {
                assert_eq!(level, LogLevel::Error);
                assert_eq!(message, "Bootstrap failed reason=boom");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}

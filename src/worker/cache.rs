//! Entity cache
//!
//! Guilds, users and channels seen on this worker's shards, plus the voice
//! channels the bot itself sits in. Shard tasks write through
//! [`EntityCache::update`]; the supervisor reads it for fetches and
//! telemetry. Clones share the same maps.

use crate::ipc::EntityKind;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use twilight_model::channel::Channel;
use twilight_model::gateway::event::Event;
use twilight_model::gateway::payload::incoming::GuildCreate;
use twilight_model::guild::Guild;
use twilight_model::user::User;
use twilight_model::voice::VoiceState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedGuild {
    pub id: u64,
    pub name: String,
    pub shard_id: u32,
    pub member_count: u64,
    pub large: bool,
    /// Bot accounts among the cached members, this bot included
    pub bots: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedUser {
    pub id: u64,
    pub name: String,
    pub bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedChannel {
    pub id: u64,
    pub guild_id: Option<u64>,
    pub name: Option<String>,
    pub kind: u8,
}

/// Counts reported in telemetry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounts {
    pub guilds: u64,
    pub users: u64,
    pub voice: u64,
    pub large_guilds: u64,
    /// Guilds where this bot is the only bot
    pub exclusive_guilds: u64,
}

#[derive(Debug, Clone, Default)]
pub struct EntityCache {
    inner: Arc<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    guilds: DashMap<u64, CachedGuild>,
    users: DashMap<u64, CachedUser>,
    channels: DashMap<u64, CachedChannel>,
    /// guild id → voice channel id, for this bot's own sessions
    voice: DashMap<u64, u64>,
    current_user: AtomicU64,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one gateway event received on `shard_id`
    pub fn update(&self, shard_id: u32, event: &Event) {
        match event {
            Event::Ready(ready) => {
                self.inner
                    .current_user
                    .store(ready.user.id.get(), Ordering::Relaxed);
            }
            Event::GuildCreate(create) => {
                if let GuildCreate::Available(guild) = create.as_ref() {
                    self.cache_guild(shard_id, guild);
                }
            }
            Event::GuildDelete(delete) => {
                // Unavailable guilds are an outage, not a removal
                if delete.unavailable != Some(true) {
                    self.remove_guild(delete.id.get());
                }
            }
            Event::MemberAdd(add) => {
                let user = &add.member.user;
                self.cache_user(user);
                if let Some(mut guild) = self.inner.guilds.get_mut(&add.guild_id.get()) {
                    guild.member_count += 1;
                    if user.bot {
                        guild.bots += 1;
                    }
                }
            }
            Event::MemberRemove(remove) => {
                if let Some(mut guild) = self.inner.guilds.get_mut(&remove.guild_id.get()) {
                    guild.member_count = guild.member_count.saturating_sub(1);
                    if remove.user.bot {
                        guild.bots = guild.bots.saturating_sub(1);
                    }
                }
            }
            Event::ChannelCreate(create) => self.cache_channel(&create.0),
            Event::ChannelUpdate(update) => self.cache_channel(&update.0),
            Event::ChannelDelete(delete) => {
                self.inner.channels.remove(&delete.0.id.get());
            }
            Event::VoiceStateUpdate(update) => self.cache_voice_state(&update.0),
            _ => {}
        }
    }

    fn cache_guild(&self, shard_id: u32, guild: &Guild) {
        let bots = guild.members.iter().filter(|m| m.user.bot).count() as u64;
        for member in &guild.members {
            self.cache_user(&member.user);
        }
        for channel in &guild.channels {
            self.cache_channel(channel);
        }
        for state in &guild.voice_states {
            self.cache_voice_state(state);
        }

        self.insert_guild(CachedGuild {
            id: guild.id.get(),
            name: guild.name.clone(),
            shard_id,
            member_count: guild.member_count.unwrap_or(guild.members.len() as u64),
            large: guild.large,
            bots,
        });
    }

    fn cache_user(&self, user: &User) {
        self.insert_user(CachedUser {
            id: user.id.get(),
            name: user.name.clone(),
            bot: user.bot,
        });
    }

    fn cache_channel(&self, channel: &Channel) {
        self.insert_channel(CachedChannel {
            id: channel.id.get(),
            guild_id: channel.guild_id.map(|id| id.get()),
            name: channel.name.clone(),
            kind: u8::from(channel.kind),
        });
    }

    fn cache_voice_state(&self, state: &VoiceState) {
        if state.user_id.get() != self.inner.current_user.load(Ordering::Relaxed) {
            return;
        }
        let Some(guild_id) = state.guild_id else {
            return;
        };
        match state.channel_id {
            Some(channel_id) => self.join_voice(guild_id.get(), channel_id.get()),
            None => self.leave_voice(guild_id.get()),
        }
    }

    pub fn insert_guild(&self, guild: CachedGuild) {
        self.inner.guilds.insert(guild.id, guild);
    }

    pub fn insert_user(&self, user: CachedUser) {
        self.inner.users.insert(user.id, user);
    }

    pub fn insert_channel(&self, channel: CachedChannel) {
        self.inner.channels.insert(channel.id, channel);
    }

    /// Drop a guild together with its channels and voice session
    pub fn remove_guild(&self, guild_id: u64) {
        self.inner.guilds.remove(&guild_id);
        self.inner.voice.remove(&guild_id);
        self.inner
            .channels
            .retain(|_, channel| channel.guild_id != Some(guild_id));
    }

    pub fn join_voice(&self, guild_id: u64, channel_id: u64) {
        self.inner.voice.insert(guild_id, channel_id);
    }

    pub fn leave_voice(&self, guild_id: u64) {
        self.inner.voice.remove(&guild_id);
    }

    /// Serialized entity, if this worker has it
    pub fn lookup(&self, kind: EntityKind, id: u64) -> Option<Value> {
        match kind {
            EntityKind::Guild => self.inner.guilds.get(&id).map(|g| to_value(&*g)),
            EntityKind::User => self.inner.users.get(&id).map(|u| to_value(&*u)),
            EntityKind::Channel => self.inner.channels.get(&id).map(|c| to_value(&*c)),
        }
    }

    pub fn counts(&self) -> CacheCounts {
        let mut counts = CacheCounts {
            users: self.inner.users.len() as u64,
            voice: self.inner.voice.len() as u64,
            ..CacheCounts::default()
        };
        for guild in self.inner.guilds.iter() {
            counts.guilds += 1;
            if guild.large {
                counts.large_guilds += 1;
            }
            if guild.bots == 1 {
                counts.exclusive_guilds += 1;
            }
        }
        counts
    }
}

fn to_value<T: Serialize>(entity: &T) -> Value {
    serde_json::to_value(entity).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guild(id: u64, large: bool, bots: u64) -> CachedGuild {
        CachedGuild {
            id,
            name: format!("guild-{id}"),
            shard_id: 0,
            member_count: 10,
            large,
            bots,
        }
    }

    #[test]
    fn counts_follow_cached_guilds() {
        let cache = EntityCache::new();
        cache.insert_guild(guild(1, true, 1));
        cache.insert_guild(guild(2, false, 3));
        cache.insert_guild(guild(3, false, 1));
        cache.join_voice(1, 100);

        let counts = cache.counts();
        assert_eq!(counts.guilds, 3);
        assert_eq!(counts.large_guilds, 1);
        assert_eq!(counts.exclusive_guilds, 2);
        assert_eq!(counts.voice, 1);
    }

    #[test]
    fn remove_guild_drops_its_channels_and_voice() {
        let cache = EntityCache::new();
        cache.insert_guild(guild(1, false, 1));
        cache.insert_channel(CachedChannel {
            id: 10,
            guild_id: Some(1),
            name: Some("general".to_string()),
            kind: 0,
        });
        cache.insert_channel(CachedChannel {
            id: 20,
            guild_id: None,
            name: None,
            kind: 1,
        });
        cache.join_voice(1, 11);

        cache.remove_guild(1);
        assert!(cache.lookup(EntityKind::Guild, 1).is_none());
        assert!(cache.lookup(EntityKind::Channel, 10).is_none());
        assert!(cache.lookup(EntityKind::Channel, 20).is_some());
        assert_eq!(cache.counts().voice, 0);
    }

    #[test]
    fn lookup_serializes_entities() {
        let cache = EntityCache::new();
        cache.insert_user(CachedUser {
            id: 5,
            name: "someone".to_string(),
            bot: false,
        });

        assert_eq!(
            cache.lookup(EntityKind::User, 5),
            Some(json!({"id": 5, "name": "someone", "bot": false}))
        );
        assert_eq!(cache.lookup(EntityKind::User, 6), None);
    }

    #[test]
    fn clones_share_state() {
        let cache = EntityCache::new();
        let other = cache.clone();
        other.insert_guild(guild(9, false, 1));
        assert_eq!(cache.counts().guilds, 1);
    }
}

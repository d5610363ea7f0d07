//! Abstraction over the chat platform the sync jobs act on.
//!
//! The jobs only need two things from Discord: the current guild/member
//! snapshot and the ability to rename a member. Keeping that surface behind
//! a trait lets the job logic run against recording fakes in tests.

use async_trait::async_trait;

/// A member of a guild as seen at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub user_id: i64,
    /// Current display name, nickname if set.
    pub display_name: String,
}

/// A guild the bot is connected to, with its member list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSnapshot {
    pub id: i64,
    pub name: String,
    pub members: Vec<MemberSnapshot>,
}

/// Operations the sync jobs perform against the chat platform.
#[async_trait]
pub trait CommunityPlatform: Send + Sync {
    /// Snapshot of every guild the bot is currently a member of.
    async fn connected_guilds(&self) -> anyhow::Result<Vec<GuildSnapshot>>;

    /// Set a member's nickname.
    async fn set_nickname(&self, guild_id: i64, user_id: i64, nickname: &str)
        -> anyhow::Result<()>;
}

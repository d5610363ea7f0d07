//! The periodic sync jobs: guild bookkeeping and nickname reconciliation.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::bungie::model::{DestinyMembership, UserMembershipData};
use crate::bungie::DestinyService;
use crate::db::{self, Pool};
use crate::oauth::TokenSource;
use crate::platform::{CommunityPlatform, GuildSnapshot};
use crate::scheduler::{Task, TaskError};

/// Reconciles the guilds table with the set of guilds the bot is actually
/// in. Guilds the bot left keep no stale rows behind.
pub struct GuildSyncTask {
    pool: Pool,
    platform: Arc<dyn CommunityPlatform>,
}

impl GuildSyncTask {
    pub fn new(pool: Pool, platform: Arc<dyn CommunityPlatform>) -> Self {
        Self { pool, platform }
    }
}

#[async_trait]
impl Task for GuildSyncTask {
    fn name(&self) -> &'static str {
        "guild-sync"
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), TaskError> {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let guilds = self
            .platform
            .connected_guilds()
            .await
            .context("listing connected guilds")?;
        let ids: Vec<i64> = guilds.iter().map(|g| g.id).collect();
        db::sync_guilds(&self.pool, &ids)
            .await
            .context("deleting removed guilds")?;
        Ok(())
    }
}

/// Renames every linked member of every guild to their Destiny 2 display
/// name. Guilds are processed concurrently, members within a guild one at
/// a time.
///
/// Per-member failures are logged and absorbed so one broken account never
/// blocks the rest of the roster; the task itself only ends early on
/// shutdown.
pub struct NicknameSyncTask {
    pool: Pool,
    platform: Arc<dyn CommunityPlatform>,
    destiny: Arc<dyn DestinyService>,
    tokens: Arc<dyn TokenSource>,
}

impl NicknameSyncTask {
    pub fn new(
        pool: Pool,
        platform: Arc<dyn CommunityPlatform>,
        destiny: Arc<dyn DestinyService>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            pool,
            platform,
            destiny,
            tokens,
        }
    }
}

#[async_trait]
impl Task for NicknameSyncTask {
    fn name(&self) -> &'static str {
        "nickname-sync"
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), TaskError> {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let guilds = match self.platform.connected_guilds().await {
            Ok(guilds) => guilds,
            Err(err) => {
                warn!(error = ?err, "listing connected guilds failed; skipping round");
                return Ok(());
            }
        };

        // One spawned unit of work per guild. The set is unbounded; the
        // guild count equals the number of communities running the bot,
        // which stays small in practice.
        let mut set = JoinSet::new();
        for guild in guilds {
            let pool = self.pool.clone();
            let platform = self.platform.clone();
            let destiny = self.destiny.clone();
            let tokens = self.tokens.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                sync_guild_nicknames(&pool, &*platform, &*destiny, &*tokens, &guild, &cancel).await;
            });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(err) = joined {
                warn!(error = ?err, "guild sync worker panicked");
            }
        }

        Ok(())
    }
}

/// Walk the members of one guild and bring their nicknames in line with
/// their linked Destiny 2 accounts. Members without a linked account are
/// the common case and are skipped without a log line.
#[instrument(skip_all, fields(guild_id = guild.id, guild = %guild.name))]
async fn sync_guild_nicknames(
    pool: &Pool,
    platform: &dyn CommunityPlatform,
    destiny: &dyn DestinyService,
    tokens: &dyn TokenSource,
    guild: &GuildSnapshot,
    cancel: &CancellationToken,
) {
    for member in &guild.members {
        if cancel.is_cancelled() {
            return;
        }
        let user_id = member.user_id;

        let account = match db::get_linked_account(pool, user_id).await {
            Ok(Some(account)) => account,
            Ok(None) => continue,
            Err(err) => {
                warn!(user_id, error = ?err, "loading linked account failed");
                continue;
            }
        };

        let (cred, refreshed) = match tokens.ensure_fresh(&account.credential()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(user_id, error = ?err, "token refresh failed");
                continue;
            }
        };
        if refreshed {
            if let Err(err) = db::update_account_tokens(pool, user_id, &cred).await {
                warn!(user_id, error = ?err, "persisting refreshed tokens failed");
            }
        }

        let data = match destiny
            .memberships_for_current_user(&cred.access_token, cancel)
            .await
        {
            Ok(data) => data,
            Err(err) => {
                warn!(user_id, error = ?err, "membership lookup failed");
                continue;
            }
        };

        let Some(membership) = active_membership(&data) else {
            debug!(user_id, "no active cross-save membership");
            continue;
        };

        // Renames unconditionally; an already-correct nickname is a no-op
        // on the platform side.
        if let Err(err) = platform
            .set_nickname(guild.id, user_id, &membership.display_name)
            .await
        {
            warn!(user_id, error = ?err, "nickname update failed");
        }
    }
}

/// The membership whose platform matches the account's cross-save override,
/// i.e. the one the player actually plays on. First match wins when the
/// API reports duplicates.
pub fn active_membership(data: &UserMembershipData) -> Option<&DestinyMembership> {
    data.destiny_memberships
        .iter()
        .find(|m| m.membership_type == m.cross_save_override)
}

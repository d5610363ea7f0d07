//! Discord gateway glue: the cache-backed platform adapter and the event
//! handler that boots the scheduler once the gateway is ready.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serenity::all::{Cache, Context, EditMember, EventHandler, GuildId, Http, Ready, UserId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bungie::DestinyService;
use crate::db::Pool;
use crate::jobs::{GuildSyncTask, NicknameSyncTask};
use crate::oauth::TokenSource;
use crate::platform::{CommunityPlatform, GuildSnapshot, MemberSnapshot};
use crate::scheduler::{self, Task};

/// [`CommunityPlatform`] backed by the serenity gateway cache for reads and
/// the HTTP API for writes.
pub struct DiscordPlatform {
    http: Arc<Http>,
    cache: Arc<Cache>,
}

impl DiscordPlatform {
    pub fn new(http: Arc<Http>, cache: Arc<Cache>) -> Self {
        Self { http, cache }
    }
}

#[async_trait]
impl CommunityPlatform for DiscordPlatform {
    async fn connected_guilds(&self) -> anyhow::Result<Vec<GuildSnapshot>> {
        // Cache reads only; the guard must not be held across an await.
        let mut snapshots = Vec::new();
        for guild_id in self.cache.guilds() {
            let Some(guild) = self.cache.guild(guild_id) else {
                continue;
            };
            let members = guild
                .members
                .iter()
                .map(|(user_id, member)| MemberSnapshot {
                    user_id: user_id.get() as i64,
                    display_name: member.display_name().to_string(),
                })
                .collect();
            snapshots.push(GuildSnapshot {
                id: guild_id.get() as i64,
                name: guild.name.clone(),
                members,
            });
        }
        Ok(snapshots)
    }

    async fn set_nickname(
        &self,
        guild_id: i64,
        user_id: i64,
        nickname: &str,
    ) -> anyhow::Result<()> {
        GuildId::new(guild_id as u64)
            .edit_member(
                self.http.as_ref(),
                UserId::new(user_id as u64),
                EditMember::new().nickname(nickname),
            )
            .await
            .with_context(|| format!("setting nickname in guild {guild_id}"))?;
        Ok(())
    }
}

/// Gateway event handler. Starts the sync scheduler on the first `ready`
/// event and keeps its join handle so shutdown can wait for in-flight work.
pub struct Handler {
    pool: Pool,
    destiny: Arc<dyn DestinyService>,
    tokens: Arc<dyn TokenSource>,
    interval: Duration,
    cancel: CancellationToken,
    scheduler_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    started: AtomicBool,
}

impl Handler {
    pub fn new(
        pool: Pool,
        destiny: Arc<dyn DestinyService>,
        tokens: Arc<dyn TokenSource>,
        interval: Duration,
        cancel: CancellationToken,
        scheduler_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    ) -> Self {
        Self {
            pool,
            destiny,
            tokens,
            interval,
            cancel,
            scheduler_handle,
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(user = %ready.user.name, guilds = ready.guilds.len(), "gateway ready");

        // Ready fires again on every reconnect; the scheduler starts once.
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let platform: Arc<dyn CommunityPlatform> =
            Arc::new(DiscordPlatform::new(ctx.http.clone(), ctx.cache.clone()));
        let tasks: Vec<Arc<dyn Task>> = vec![
            Arc::new(GuildSyncTask::new(self.pool.clone(), platform.clone())),
            Arc::new(NicknameSyncTask::new(
                self.pool.clone(),
                platform,
                self.destiny.clone(),
                self.tokens.clone(),
            )),
        ];

        let handle = tokio::spawn(scheduler::run_every(
            self.interval,
            tasks,
            self.cancel.clone(),
        ));
        if let Ok(mut slot) = self.scheduler_handle.lock() {
            *slot = Some(handle);
        }
    }
}

//! End-to-end tests of the sync tasks against an in-memory database and
//! recording fakes for Discord and the Bungie API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use guardian_sync::bungie::model::{DestinyMembership, UserMembershipData};
use guardian_sync::bungie::{self, DestinyService};
use guardian_sync::db::{self, Pool};
use guardian_sync::jobs::{GuildSyncTask, NicknameSyncTask};
use guardian_sync::model::{Credential, LinkedAccount};
use guardian_sync::oauth::{RefreshError, TokenSource};
use guardian_sync::platform::{CommunityPlatform, GuildSnapshot, MemberSnapshot};
use guardian_sync::scheduler::{Task, TaskError};

async fn setup_pool() -> Pool {
    let pool = Pool::connect("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

struct RecordingPlatform {
    guilds: Vec<GuildSnapshot>,
    renames: Mutex<Vec<(i64, i64, String)>>,
}

impl RecordingPlatform {
    fn new(guilds: Vec<GuildSnapshot>) -> Arc<Self> {
        Arc::new(Self {
            guilds,
            renames: Mutex::new(Vec::new()),
        })
    }

    fn renames(&self) -> Vec<(i64, i64, String)> {
        self.renames.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommunityPlatform for RecordingPlatform {
    async fn connected_guilds(&self) -> anyhow::Result<Vec<GuildSnapshot>> {
        Ok(self.guilds.clone())
    }

    async fn set_nickname(
        &self,
        guild_id: i64,
        user_id: i64,
        nickname: &str,
    ) -> anyhow::Result<()> {
        self.renames
            .lock()
            .unwrap()
            .push((guild_id, user_id, nickname.to_string()));
        Ok(())
    }
}

/// Fake Bungie API keyed by access token.
#[derive(Default)]
struct FakeDestiny {
    memberships: HashMap<String, UserMembershipData>,
    calls: AtomicUsize,
}

impl FakeDestiny {
    fn with_account(mut self, access_token: &str, data: UserMembershipData) -> Self {
        self.memberships.insert(access_token.to_string(), data);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DestinyService for FakeDestiny {
    async fn memberships_for_current_user(
        &self,
        access_token: &str,
        _cancel: &CancellationToken,
    ) -> Result<UserMembershipData, bungie::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.memberships
            .get(access_token)
            .cloned()
            .ok_or(bungie::Error::Api(bungie::ApiFailure::Unauthorized))
    }
}

/// Fake token source: refreshes listed tokens, rejects listed tokens,
/// passes everything else through unchanged.
#[derive(Default)]
struct FakeTokens {
    rotate: HashMap<String, Credential>,
    reject: Vec<String>,
}

impl FakeTokens {
    fn rotating(mut self, old_access: &str, new: Credential) -> Self {
        self.rotate.insert(old_access.to_string(), new);
        self
    }

    fn rejecting(mut self, access: &str) -> Self {
        self.reject.push(access.to_string());
        self
    }
}

#[async_trait]
impl TokenSource for FakeTokens {
    async fn ensure_fresh(&self, cred: &Credential) -> Result<(Credential, bool), RefreshError> {
        if self.reject.contains(&cred.access_token) {
            return Err(RefreshError::Rejected {
                status: reqwest::StatusCode::BAD_REQUEST,
                body: "invalid_grant".into(),
            });
        }
        if let Some(next) = self.rotate.get(&cred.access_token) {
            return Ok((next.clone(), true));
        }
        Ok((cred.clone(), false))
    }
}

fn guild(id: i64, members: &[(i64, &str)]) -> GuildSnapshot {
    GuildSnapshot {
        id,
        name: format!("guild-{id}"),
        members: members
            .iter()
            .map(|(user_id, name)| MemberSnapshot {
                user_id: *user_id,
                display_name: name.to_string(),
            })
            .collect(),
    }
}

fn linked(user_id: i64, access_token: &str) -> LinkedAccount {
    LinkedAccount {
        id: user_id,
        membership_type: 3,
        membership_id: 4611686018467000000 + user_id,
        access_token: access_token.into(),
        refresh_token: format!("{access_token}-refresh"),
        expiry: Utc::now() + Duration::hours(1),
    }
}

fn steam_account(display_name: &str) -> UserMembershipData {
    UserMembershipData {
        destiny_memberships: vec![DestinyMembership {
            membership_type: 3,
            cross_save_override: 3,
            display_name: display_name.into(),
            ..Default::default()
        }],
    }
}

#[tokio::test]
async fn unlinked_members_are_skipped_silently() {
    let pool = setup_pool().await;
    let platform = RecordingPlatform::new(vec![guild(1, &[(10, "a"), (11, "b")])]);
    let destiny = Arc::new(FakeDestiny::default());
    let tokens = Arc::new(FakeTokens::default());

    let task = NicknameSyncTask::new(pool, platform.clone(), destiny.clone(), tokens);
    task.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(destiny.calls(), 0);
    assert!(platform.renames().is_empty());
}

#[tokio::test]
async fn linked_member_renamed_to_destiny_display_name() {
    let pool = setup_pool().await;
    db::upsert_linked_account(&pool, &linked(10, "tok-10"))
        .await
        .unwrap();

    let platform = RecordingPlatform::new(vec![guild(1, &[(10, "old-name"), (11, "unlinked")])]);
    let destiny = Arc::new(FakeDestiny::default().with_account("tok-10", steam_account("Ikora")));
    let tokens = Arc::new(FakeTokens::default());

    let task = NicknameSyncTask::new(pool, platform.clone(), destiny, tokens);
    task.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(platform.renames(), vec![(1, 10, "Ikora".to_string())]);
}

#[tokio::test]
async fn rename_issued_even_when_name_already_matches() {
    let pool = setup_pool().await;
    db::upsert_linked_account(&pool, &linked(10, "tok-10"))
        .await
        .unwrap();

    let platform = RecordingPlatform::new(vec![guild(1, &[(10, "Ikora")])]);
    let destiny = Arc::new(FakeDestiny::default().with_account("tok-10", steam_account("Ikora")));

    let task = NicknameSyncTask::new(pool, platform.clone(), destiny, Arc::new(FakeTokens::default()));
    task.run(&CancellationToken::new()).await.unwrap();

    // Exactly one rename per matching entry; the platform no-ops an
    // already-correct nickname.
    assert_eq!(platform.renames(), vec![(1, 10, "Ikora".to_string())]);
}

#[tokio::test]
async fn account_without_cross_save_match_is_not_renamed() {
    let pool = setup_pool().await;
    db::upsert_linked_account(&pool, &linked(10, "tok-10"))
        .await
        .unwrap();

    // Plays nowhere: no membership matches the override.
    let data = UserMembershipData {
        destiny_memberships: vec![DestinyMembership {
            membership_type: 1,
            cross_save_override: 3,
            display_name: "xbox-name".into(),
            ..Default::default()
        }],
    };
    let platform = RecordingPlatform::new(vec![guild(1, &[(10, "old-name")])]);
    let destiny = Arc::new(FakeDestiny::default().with_account("tok-10", data));

    let task = NicknameSyncTask::new(pool, platform.clone(), destiny, Arc::new(FakeTokens::default()));
    task.run(&CancellationToken::new()).await.unwrap();

    assert!(platform.renames().is_empty());
}

#[tokio::test]
async fn refresh_failure_skips_member_but_not_the_rest() {
    let pool = setup_pool().await;
    db::upsert_linked_account(&pool, &linked(10, "tok-10"))
        .await
        .unwrap();
    db::upsert_linked_account(&pool, &linked(11, "tok-11"))
        .await
        .unwrap();

    let platform = RecordingPlatform::new(vec![guild(1, &[(10, "a"), (11, "b")])]);
    let destiny = Arc::new(FakeDestiny::default().with_account("tok-11", steam_account("Zavala")));
    let tokens = Arc::new(FakeTokens::default().rejecting("tok-10"));

    let task = NicknameSyncTask::new(pool, platform.clone(), destiny, tokens);
    task.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(platform.renames(), vec![(1, 11, "Zavala".to_string())]);
}

#[tokio::test]
async fn refreshed_tokens_are_persisted() {
    let pool = setup_pool().await;
    db::upsert_linked_account(&pool, &linked(10, "stale"))
        .await
        .unwrap();

    let rotated = Credential {
        access_token: "fresh".into(),
        refresh_token: "fresh-refresh".into(),
        expires_at: Utc::now() + Duration::hours(1),
    };
    let platform = RecordingPlatform::new(vec![guild(1, &[(10, "old-name")])]);
    let destiny = Arc::new(FakeDestiny::default().with_account("fresh", steam_account("Eris")));
    let tokens = Arc::new(FakeTokens::default().rotating("stale", rotated));

    let task = NicknameSyncTask::new(pool.clone(), platform.clone(), destiny, tokens);
    task.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(platform.renames(), vec![(1, 10, "Eris".to_string())]);
    let stored = db::get_linked_account(&pool, 10).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "fresh");
    assert_eq!(stored.refresh_token, "fresh-refresh");
}

#[tokio::test]
async fn nickname_sync_absorbs_api_failures() {
    let pool = setup_pool().await;
    db::upsert_linked_account(&pool, &linked(10, "tok-10"))
        .await
        .unwrap();

    // Fake knows no accounts, so every lookup fails.
    let platform = RecordingPlatform::new(vec![guild(1, &[(10, "a")])]);
    let destiny = Arc::new(FakeDestiny::default());

    let task = NicknameSyncTask::new(pool, platform.clone(), destiny, Arc::new(FakeTokens::default()));
    task.run(&CancellationToken::new()).await.unwrap();

    assert!(platform.renames().is_empty());
}

#[tokio::test]
async fn nickname_sync_reports_cancellation() {
    let pool = setup_pool().await;
    let platform = RecordingPlatform::new(vec![guild(1, &[(10, "a")])]);
    let destiny = Arc::new(FakeDestiny::default());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let task = NicknameSyncTask::new(pool, platform, destiny, Arc::new(FakeTokens::default()));
    let err = task.run(&cancel).await.unwrap_err();
    assert!(matches!(err, TaskError::Cancelled));
}

#[tokio::test]
async fn guild_sync_deletes_guilds_the_bot_left() {
    let pool = setup_pool().await;
    for id in [1, 2, 3] {
        db::upsert_guild(&pool, id, None).await.unwrap();
    }

    let platform = RecordingPlatform::new(vec![guild(1, &[]), guild(3, &[])]);
    let task = GuildSyncTask::new(pool.clone(), platform);
    task.run(&CancellationToken::new()).await.unwrap();

    let remaining: Vec<i64> = sqlx::query_scalar("SELECT id FROM guilds ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, vec![1, 3]);

    // Row creation is someone else's job; sync only deletes.
    assert!(db::get_guild(&pool, 2).await.unwrap().is_none());
}

#[tokio::test]
async fn guild_sync_reports_cancellation() {
    let pool = setup_pool().await;
    let platform = RecordingPlatform::new(vec![]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let task = GuildSyncTask::new(pool, platform);
    let err = task.run(&cancel).await.unwrap_err();
    assert!(matches!(err, TaskError::Cancelled));
}

#[tokio::test]
async fn guilds_fan_out_independently() {
    let pool = setup_pool().await;
    db::upsert_linked_account(&pool, &linked(10, "tok-10"))
        .await
        .unwrap();
    db::upsert_linked_account(&pool, &linked(20, "tok-20"))
        .await
        .unwrap();

    let platform = RecordingPlatform::new(vec![
        guild(1, &[(10, "a")]),
        guild(2, &[(20, "b")]),
    ]);
    let destiny = Arc::new(
        FakeDestiny::default()
            .with_account("tok-10", steam_account("Saint"))
            .with_account("tok-20", steam_account("Osiris")),
    );

    let task = NicknameSyncTask::new(pool, platform.clone(), destiny, Arc::new(FakeTokens::default()));
    task.run(&CancellationToken::new()).await.unwrap();

    let mut renames = platform.renames();
    renames.sort();
    assert_eq!(
        renames,
        vec![(1, 10, "Saint".to_string()), (2, 20, "Osiris".to_string())]
    );
}

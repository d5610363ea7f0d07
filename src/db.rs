use crate::model::{Credential, GuildRecord, LinkedAccount};
use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

/// Open the SQLite pool, capped at a single connection so every sync tick
/// sees a consistent view and transactions never contend with each other.
pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&normalized)
        .await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rel), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rel),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %err, "creating database directory failed");
            }
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded_path, q),
        None => format!("sqlite://{}", expanded_path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Get a guild record by its Discord id. `None` when the guild is unknown.
#[instrument(skip_all)]
pub async fn get_guild(pool: &Pool, guild_id: i64) -> Result<Option<GuildRecord>> {
    let guild = sqlx::query_as::<_, GuildRecord>("SELECT id, group_id FROM guilds WHERE id = ?")
        .bind(guild_id)
        .fetch_optional(pool)
        .await?;
    Ok(guild)
}

#[instrument(skip_all)]
pub async fn upsert_guild(pool: &Pool, guild_id: i64, group_id: Option<i64>) -> Result<()> {
    sqlx::query(
        "INSERT INTO guilds (id, group_id) VALUES (?, ?) \
         ON CONFLICT(id) DO UPDATE SET group_id = excluded.group_id",
    )
    .bind(guild_id)
    .bind(group_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete guild records whose id is not in the provided snapshot.
#[instrument(skip_all)]
pub async fn sync_guilds(pool: &Pool, guild_ids: &[i64]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sync_guilds_tx(&mut tx, guild_ids).await?;
    tx.commit().await?;
    Ok(())
}

/// Transaction-scoped variant of [`sync_guilds`] for callers that batch
/// several store operations into one transaction.
pub async fn sync_guilds_tx(tx: &mut Transaction<'_, Sqlite>, guild_ids: &[i64]) -> Result<()> {
    if guild_ids.is_empty() {
        sqlx::query("DELETE FROM guilds").execute(&mut **tx).await?;
        return Ok(());
    }

    let placeholders = vec!["?"; guild_ids.len()].join(", ");
    let sql = format!("DELETE FROM guilds WHERE id NOT IN ({placeholders})");
    let mut query = sqlx::query(&sql);
    for id in guild_ids {
        query = query.bind(id);
    }
    query.execute(&mut **tx).await?;
    Ok(())
}

/// Get the linked Destiny 2 account for a Discord user. Most members have
/// none; that is the `None` case, not an error.
#[instrument(skip_all)]
pub async fn get_linked_account(pool: &Pool, user_id: i64) -> Result<Option<LinkedAccount>> {
    let account = sqlx::query_as::<_, LinkedAccount>(
        "SELECT id, membership_type, membership_id, access_token, refresh_token, expiry \
         FROM linked_accounts WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(account)
}

#[instrument(skip_all)]
pub async fn get_linked_account_by_membership(
    pool: &Pool,
    membership_id: i64,
) -> Result<Option<LinkedAccount>> {
    let account = sqlx::query_as::<_, LinkedAccount>(
        "SELECT id, membership_type, membership_id, access_token, refresh_token, expiry \
         FROM linked_accounts WHERE membership_id = ?",
    )
    .bind(membership_id)
    .fetch_optional(pool)
    .await?;
    Ok(account)
}

#[instrument(skip_all)]
pub async fn upsert_linked_account(pool: &Pool, account: &LinkedAccount) -> Result<()> {
    sqlx::query(
        "INSERT INTO linked_accounts \
         (id, membership_type, membership_id, access_token, refresh_token, expiry) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
         membership_type = excluded.membership_type, \
         membership_id = excluded.membership_id, \
         access_token = excluded.access_token, \
         refresh_token = excluded.refresh_token, \
         expiry = excluded.expiry",
    )
    .bind(account.id)
    .bind(account.membership_type)
    .bind(account.membership_id)
    .bind(&account.access_token)
    .bind(&account.refresh_token)
    .bind(account.expiry)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist tokens obtained from a refresh round-trip so the next tick does
/// not have to refresh again.
#[instrument(skip_all)]
pub async fn update_account_tokens(pool: &Pool, user_id: i64, cred: &Credential) -> Result<()> {
    sqlx::query(
        "UPDATE linked_accounts SET access_token = ?, refresh_token = ?, expiry = ? WHERE id = ?",
    )
    .bind(&cred.access_token)
    .bind(&cred.refresh_token)
    .bind(cred.expires_at)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

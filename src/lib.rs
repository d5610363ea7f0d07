//! Discord bot that keeps guild member nicknames in sync with their linked
//! Destiny 2 accounts.
//!
//! A background scheduler periodically snapshots the guilds the bot is
//! connected to, prunes stale guild records from the database, and renames
//! every member with a linked account to the display name of their active
//! cross-save membership.

pub mod bungie;
pub mod config;
pub mod db;
pub mod discord;
pub mod jobs;
pub mod model;
pub mod oauth;
pub mod platform;
pub mod scheduler;

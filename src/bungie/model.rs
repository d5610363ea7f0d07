//! Wire types for the Bungie.net API, named after the schemas they decode.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// The envelope every Bungie endpoint wraps its payload in. `ErrorCode` 1
/// means success; anything else means the `Response` field is not usable.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "ErrorCode")]
    pub error_code: i32,
    #[serde(rename = "ThrottleSeconds", default)]
    pub throttle_seconds: i32,
    #[serde(rename = "ErrorStatus", default)]
    pub error_status: String,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "MessageData", default)]
    pub message_data: HashMap<String, String>,
    #[serde(rename = "DetailedErrorTrace", default)]
    pub detailed_error_trace: String,
    #[serde(rename = "Response", default)]
    pub response: Value,
}

/// User-UserMembershipData: the accounts associated with the signed-in user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserMembershipData {
    #[serde(rename = "destinyMemberships", default)]
    pub destiny_memberships: Vec<DestinyMembership>,
}

/// GroupsV2-GroupUserInfoCard: one platform membership of a Destiny account.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinyMembership {
    #[serde(rename = "membershipType", default)]
    pub membership_type: i32,
    #[serde(rename = "membershipId", with = "string_i64", default)]
    pub membership_id: i64,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(rename = "crossSaveOverride", default)]
    pub cross_save_override: i32,
    #[serde(rename = "applicableMembershipTypes", default)]
    pub applicable_membership_types: Vec<i32>,
    #[serde(rename = "isPublic", default)]
    pub is_public: bool,
}

/// SearchResultOfGroupMember: one page of a clan member listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResultOfGroupMember {
    #[serde(default)]
    pub results: Vec<GroupMember>,
    #[serde(rename = "totalResults", default)]
    pub total_results: i32,
    #[serde(rename = "hasMore", default)]
    pub has_more: bool,
    #[serde(default)]
    pub query: PagedQuery,
}

/// Queries-PagedQuery.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PagedQuery {
    #[serde(rename = "itemsPerPage", default)]
    pub items_per_page: i32,
    #[serde(rename = "currentPage", default)]
    pub current_page: i32,
}

/// GroupsV2-GroupMember.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupMember {
    #[serde(rename = "memberType", default)]
    pub member_type: i32,
    #[serde(rename = "isOnline", default)]
    pub is_online: bool,
    #[serde(rename = "groupId", with = "string_i64", default)]
    pub group_id: i64,
    #[serde(rename = "destinyUserInfo", default)]
    pub destiny_user_info: DestinyMembership,
    #[serde(rename = "joinDate", default)]
    pub join_date: Option<DateTime<Utc>>,
}

/// Bungie serializes 64-bit ids as JSON strings.
mod string_i64 {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

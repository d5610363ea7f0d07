//! HTTP client for the Bungie.net API.
//!
//! The API conflates transport-level and application-level failures: on
//! some edge conditions (maintenance pages among them) it answers with an
//! HTML body instead of the usual JSON envelope, so an HTTP 200 cannot be
//! trusted and a non-200 may still carry a structured error. The client
//! therefore branches on the response content type before attempting any
//! structured decoding.

use std::fmt;
use std::time::Duration;

use reqwest::{header, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bungie::model::{Envelope, GroupMember, SearchResultOfGroupMember, UserMembershipData};

pub mod model;

/// Base URL for the Bungie API.
pub const BASE_URL: &str = "https://www.bungie.net/Platform";

/// Hard stop for pagination in case the provider never clears `hasMore`.
const MAX_PAGES: i64 = 1_000;

/// Application-level failure derived from either the envelope's error code
/// or, when the body is not JSON, the HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFailure {
    /// Invalid or expired credentials.
    Unauthorized,
    /// Requested resource does not exist. Also, weirdly, what the API
    /// returns when an endpoint is hit with an unexpected method.
    NotFound,
    /// The endpoint requires auth credentials that were not supplied.
    WebAuthRequired,
    /// Anything the client does not map explicitly.
    Unknown,
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApiFailure::Unauthorized => "Unauthorized",
            ApiFailure::NotFound => "NotFound",
            ApiFailure::WebAuthRequired => "WebAuthRequired",
            ApiFailure::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("response decode failure: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("bungie api failure: {0}")]
    Api(ApiFailure),
    #[error("request cancelled")]
    Cancelled,
}

/// Per-request configuration applied when building a request.
///
/// Ordering contract: repeated [`RequestOptions::query`] calls with the same
/// key replace the earlier value, so a caller re-setting `currentPage` for
/// the next page always wins.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    query: Vec<(String, String)>,
    body: Option<Value>,
    bearer: Option<String>,
    cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a query parameter; a later call with the same key overrides it.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let key = key.into();
        self.query.retain(|(k, _)| *k != key);
        self.query.push((key, value.to_string()));
        self
    }

    /// Attach a JSON body.
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Authenticate the request with a bearer access token.
    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Abort the request when the token fires.
    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Client for the Bungie API. Holds its own transport; nothing global.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl Client {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("guardian-sync/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        // Bungie routes require the trailing slash.
        format!(
            "{}/{}/",
            self.base_url.trim_end_matches('/'),
            path.trim_matches('/')
        )
    }

    /// Dispatch a request and decode the success payload into `T`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        opts: RequestOptions,
    ) -> Result<T, Error> {
        let mut request = self
            .http
            .request(method, self.endpoint(path))
            .header("X-Api-Key", &self.api_key);
        if !opts.query.is_empty() {
            request = request.query(&opts.query);
        }
        if let Some(token) = &opts.bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = &opts.body {
            request = request.json(body);
        }

        let send = request.send();
        let response = match &opts.cancel {
            Some(cancel) => tokio::select! {
                // Check the token first so cancellation beats a racing
                // transport failure.
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                response = send => response?,
            },
            None => send.await?,
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await?;
        decode_response(content_type.as_deref(), status, &body)
    }

    /// Accounts associated with the signed-in user. Requires a bearer token.
    pub async fn get_membership_data_for_current_user(
        &self,
        opts: RequestOptions,
    ) -> Result<UserMembershipData, Error> {
        self.execute(Method::GET, "User/GetMembershipsForCurrentUser", opts)
            .await
    }

    /// One page of the member listing of a clan.
    pub async fn get_members_of_group(
        &self,
        group_id: i64,
        opts: RequestOptions,
    ) -> Result<SearchResultOfGroupMember, Error> {
        self.execute(Method::GET, &format!("GroupV2/{group_id}/Members"), opts)
            .await
    }

    /// All members of a clan, paginating until the API reports no more
    /// pages.
    pub async fn get_all_members_of_group(
        &self,
        group_id: i64,
        opts: RequestOptions,
    ) -> Result<Vec<GroupMember>, Error> {
        paginate(|page| {
            let opts = opts.clone().query("currentPage", page);
            async move {
                let result = self.get_members_of_group(group_id, opts).await?;
                Ok(Page {
                    items: result.results,
                    has_more: result.has_more,
                })
            }
        })
        .await
    }
}

/// One page of a multi-page result set.
pub(crate) struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

/// Drive `fetch` with page numbers 1, 2, 3, … and accumulate the items
/// until a page reports no more results. A failed page call discards the
/// accumulator and propagates the failure.
pub(crate) async fn paginate<T, F, Fut>(mut fetch: F) -> Result<Vec<T>, Error>
where
    F: FnMut(i64) -> Fut,
    Fut: std::future::Future<Output = Result<Page<T>, Error>>,
{
    let mut items = Vec::new();
    for page in 1..=MAX_PAGES {
        let mut result = fetch(page).await?;
        items.append(&mut result.items);
        if !result.has_more {
            return Ok(items);
        }
    }
    warn!(pages = MAX_PAGES, "pagination cutoff reached; hasMore never cleared");
    Ok(items)
}

/// Classify a response and decode the payload on success.
///
/// Non-JSON bodies carry no envelope, so the status code is all there is to
/// go on. JSON bodies are classified by the envelope's error code even when
/// the HTTP status says 200.
fn decode_response<T: DeserializeOwned>(
    content_type: Option<&str>,
    status: StatusCode,
    body: &str,
) -> Result<T, Error> {
    let essence = content_type
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if essence != "application/json" {
        return Err(Error::Api(classify_status(status)));
    }

    let envelope: Envelope = serde_json::from_str(body)?;
    if envelope.error_code != 1 {
        debug!(
            code = envelope.error_code,
            status = %envelope.error_status,
            message = %envelope.message,
            message_data = ?envelope.message_data,
            throttle_seconds = envelope.throttle_seconds,
            trace = %envelope.detailed_error_trace,
            "bungie api returned an error envelope"
        );
        return Err(Error::Api(classify_code(envelope.error_code)));
    }

    Ok(serde_json::from_value(envelope.response)?)
}

fn classify_status(status: StatusCode) -> ApiFailure {
    match status {
        StatusCode::UNAUTHORIZED => ApiFailure::Unauthorized,
        StatusCode::NOT_FOUND => ApiFailure::NotFound,
        _ => ApiFailure::Unknown,
    }
}

fn classify_code(code: i32) -> ApiFailure {
    match code {
        21 => ApiFailure::NotFound,
        99 => ApiFailure::WebAuthRequired,
        _ => ApiFailure::Unknown,
    }
}

/// The one Bungie call the nickname sync needs, behind a trait so the sync
/// task can be exercised with a fake in tests.
#[async_trait::async_trait]
pub trait DestinyService: Send + Sync {
    async fn memberships_for_current_user(
        &self,
        access_token: &str,
        cancel: &CancellationToken,
    ) -> Result<UserMembershipData, Error>;
}

#[async_trait::async_trait]
impl DestinyService for Client {
    async fn memberships_for_current_user(
        &self,
        access_token: &str,
        cancel: &CancellationToken,
    ) -> Result<UserMembershipData, Error> {
        let opts = RequestOptions::new()
            .bearer(access_token)
            .cancel_with(cancel.clone());
        self.get_membership_data_for_current_user(opts).await
    }
}

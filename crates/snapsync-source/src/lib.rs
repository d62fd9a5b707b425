//! Snapshot hub GraphQL client plus raw-vote decoding and normalization.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use snapsync_core::{NormalizePolicy, VoteRecord, WatermarkFilter};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "snapsync-source";

pub const DEFAULT_ENDPOINT: &str = "https://hub.snapshot.org/graphql";

/// Votes requested per query; the hub caps `first` at this value.
pub const PAGE_SIZE: usize = 1000;

pub const DEFAULT_RECENCY_GUARD: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("graphql errors: {0}")]
    Graphql(String),
    #[error("unexpected response body: {0}")]
    Body(String),
}

/// A single vote whose shape does not match what the hub documents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} (vote id: {})", .id.as_deref().unwrap_or("<missing>"))]
pub struct MalformedRecord {
    pub id: Option<String>,
    pub reason: String,
}

impl MalformedRecord {
    fn missing(id: Option<&str>, field: &str) -> Self {
        Self {
            id: id.map(ToString::to_string),
            reason: format!("missing required field `{field}`"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("remote source error: {0}")]
    Remote(#[from] RemoteError),
    #[error("watermark {since} is newer than {latest_allowed}; refusing to query a window the hub may not have indexed")]
    InvalidWatermark { since: i64, latest_allowed: i64 },
    #[error("malformed vote at index {index}: {source}")]
    MalformedRecord {
        index: usize,
        #[source]
        source: MalformedRecord,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawVote {
    pub id: Option<String>,
    pub voter: Option<String>,
    pub choice: Option<JsonValue>,
    pub created: Option<f64>,
    pub space: Option<RawSpace>,
    pub proposal: Option<RawProposal>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSpace {
    pub id: Option<String>,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub admins: Option<Vec<String>>,
    pub moderators: Option<Vec<String>>,
    pub members: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawProposal {
    pub id: Option<String>,
    pub author: Option<String>,
    pub title: Option<String>,
}

/// Turn one raw vote into its canonical row.
///
/// Absent proposals, space names, choices and member lists fall back to empty
/// values. Absent identity fields are rejected.
pub fn normalize(raw: &RawVote, policy: &NormalizePolicy) -> Result<VoteRecord, MalformedRecord> {
    let id = raw.id.as_deref().ok_or_else(|| MalformedRecord::missing(None, "id"))?;
    let voter = raw
        .voter
        .as_deref()
        .ok_or_else(|| MalformedRecord::missing(Some(id), "voter"))?;
    let created = raw
        .created
        .ok_or_else(|| MalformedRecord::missing(Some(id), "created"))?;
    let created = epoch_seconds_to_utc(created).ok_or_else(|| MalformedRecord {
        id: Some(id.to_string()),
        reason: format!("`created` {created} is not a valid epoch timestamp"),
    })?;
    let space = raw
        .space
        .as_ref()
        .ok_or_else(|| MalformedRecord::missing(Some(id), "space"))?;
    let space_id = space
        .id
        .as_deref()
        .ok_or_else(|| MalformedRecord::missing(Some(id), "space.id"))?;
    let space_avatar = space
        .avatar
        .as_deref()
        .ok_or_else(|| MalformedRecord::missing(Some(id), "space.avatar"))?;

    let proposal = raw.proposal.clone().unwrap_or_default();

    Ok(VoteRecord {
        id: id.to_string(),
        voter: policy.apply_case(voter),
        choice: choice_to_int(raw.choice.as_ref()),
        created,
        space_id: policy.apply_case(space_id),
        space_name: policy.apply_case(space.name.as_deref().unwrap_or_default()),
        space_avatar: space_avatar.to_string(),
        space_admins: string_list(space.admins.as_deref(), policy),
        space_moderators: string_list(space.moderators.as_deref(), policy),
        space_members: string_list(space.members.as_deref(), policy),
        proposal_id: policy.apply_case(proposal.id.as_deref().unwrap_or_default()),
        proposal_author: policy.apply_case(proposal.author.as_deref().unwrap_or_default()),
        proposal_title: proposal.title.unwrap_or_default(),
    })
}

/// Normalize a fetched page. One bad vote fails the whole page.
pub fn normalize_batch(raw: &[RawVote], policy: &NormalizePolicy) -> Result<Vec<VoteRecord>, SourceError> {
    raw.iter()
        .enumerate()
        .map(|(index, vote)| {
            normalize(vote, policy).map_err(|source| SourceError::MalformedRecord { index, source })
        })
        .collect()
}

fn epoch_seconds_to_utc(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp(secs.trunc() as i64, 0)
}

// Ranked and weighted ballots arrive as arrays/objects; only single-choice is kept.
fn choice_to_int(choice: Option<&JsonValue>) -> i32 {
    choice
        .and_then(JsonValue::as_f64)
        .map(|c| c as i32)
        .unwrap_or(0)
}

fn string_list(values: Option<&[String]>, policy: &NormalizePolicy) -> Vec<String> {
    values
        .unwrap_or_default()
        .iter()
        .map(|v| policy.apply_case(v))
        .collect()
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<VotesData>,
    #[serde(default)]
    errors: Vec<GraphqlErrorMessage>,
}

#[derive(Debug, Deserialize)]
struct VotesData {
    votes: Option<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlErrorMessage {
    message: String,
}

/// Decode a `votes` query response body into raw votes.
pub fn decode_votes_response(body: &[u8]) -> Result<Vec<RawVote>, SourceError> {
    let response: GraphqlResponse =
        serde_json::from_slice(body).map_err(|e| RemoteError::Body(e.to_string()))?;

    if !response.errors.is_empty() {
        let messages = response
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(RemoteError::Graphql(messages).into());
    }

    let votes = response
        .data
        .and_then(|d| d.votes)
        .ok_or_else(|| RemoteError::Body("response has no `data.votes` array".to_string()))?;

    votes
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            let id = value.get("id").and_then(JsonValue::as_str).map(ToString::to_string);
            serde_json::from_value::<RawVote>(value).map_err(|e| SourceError::MalformedRecord {
                index,
                source: MalformedRecord {
                    id,
                    reason: e.to_string(),
                },
            })
        })
        .collect()
}

/// The fixed `votes` query for a given watermark comparison.
pub fn votes_query(filter: WatermarkFilter) -> String {
    format!(
        r#"query Votes($createGt: Int!) {{
  votes(first: {PAGE_SIZE}, where: {{ {}: $createGt }}, orderBy: "created", orderDirection: asc) {{
    id
    voter
    choice
    created
    space {{
      id
      name
      avatar
      admins
      moderators
      members
    }}
    proposal {{
      author
      id
      title
    }}
  }}
}}"#,
        filter.where_field()
    )
}

/// Refuse watermarks inside the window the hub may still be indexing.
pub fn check_recency_guard(since: i64, now: DateTime<Utc>, guard: Duration) -> Result<(), SourceError> {
    let guard_secs = i64::try_from(guard.as_secs()).unwrap_or(i64::MAX);
    let latest_allowed = now.timestamp().saturating_sub(guard_secs);
    if since > latest_allowed {
        return Err(SourceError::InvalidWatermark {
            since,
            latest_allowed,
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub filter: WatermarkFilter,
    pub recency_guard: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            filter: WatermarkFilter::Inclusive,
            recency_guard: Some(DEFAULT_RECENCY_GUARD),
        }
    }
}

#[async_trait]
pub trait VoteSource: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Fetch up to [`PAGE_SIZE`] votes created after `since`, oldest first.
    async fn fetch(&self, since: i64) -> Result<Vec<RawVote>, SourceError>;
}

#[derive(Debug)]
pub struct GraphqlVoteSource {
    client: reqwest::Client,
    endpoint: String,
    options: FetchOptions,
    query: String,
}

impl GraphqlVoteSource {
    pub fn new(
        endpoint: impl Into<String>,
        http: HttpClientConfig,
        options: FetchOptions,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(http.timeout);

        if let Some(user_agent) = &http.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            query: votes_query(options.filter),
            options,
        })
    }

    async fn post_query(&self, since: i64) -> Result<Vec<u8>, RemoteError> {
        let body = json!({
            "query": self.query,
            "variables": { "createGt": since },
        });
        let resp = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RemoteError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl VoteSource for GraphqlVoteSource {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self, since: i64) -> Result<Vec<RawVote>, SourceError> {
        if let Some(guard) = self.options.recency_guard {
            check_recency_guard(since, Utc::now(), guard)?;
        }

        let span = info_span!("graphql_fetch", endpoint = %self.endpoint, since);
        async {
            let body = self.post_query(since).await?;
            let votes = decode_votes_response(&body)?;
            debug!(votes = votes.len(), bytes = body.len(), "decoded votes page");
            Ok::<_, SourceError>(votes)
        }
        .instrument(span)
        .await
    }
}

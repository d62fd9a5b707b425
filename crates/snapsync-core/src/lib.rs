//! Core domain model for Snapshot vote sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "snapsync-core";

/// Canonical persisted vote, one row of the `vote` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    pub id: String,
    pub voter: String,
    pub choice: i32,
    pub created: DateTime<Utc>,
    pub space_id: String,
    pub space_name: String,
    pub space_avatar: String,
    pub space_admins: Vec<String>,
    pub space_moderators: Vec<String>,
    pub space_members: Vec<String>,
    pub proposal_id: String,
    pub proposal_author: String,
    pub proposal_title: String,
}

impl VoteRecord {
    /// `created` as epoch seconds, the unit the watermark is expressed in.
    pub fn created_unix(&self) -> i64 {
        self.created.timestamp()
    }
}

/// Highest `created` in a batch, in epoch seconds.
pub fn high_water_mark(records: &[VoteRecord]) -> Option<i64> {
    records.iter().map(VoteRecord::created_unix).max()
}

/// How the fetch lower bound compares against `created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkFilter {
    /// `created >= since`; the newest stored vote is re-delivered and dropped on insert.
    Inclusive,
    /// `created > since`.
    Exclusive,
}

impl WatermarkFilter {
    /// Name of the GraphQL `where` argument for this comparison.
    pub fn where_field(self) -> &'static str {
        match self {
            Self::Inclusive => "created_gte",
            Self::Exclusive => "created_gt",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gte" | ">=" | "inclusive" => Some(Self::Inclusive),
            "gt" | ">" | "exclusive" => Some(Self::Exclusive),
            _ => None,
        }
    }
}

/// Knobs applied while turning raw API votes into [`VoteRecord`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizePolicy {
    pub lowercase: bool,
}

impl Default for NormalizePolicy {
    fn default() -> Self {
        Self { lowercase: true }
    }
}

impl NormalizePolicy {
    pub fn apply_case(&self, value: &str) -> String {
        if self.lowercase {
            value.to_lowercase()
        } else {
            value.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn vote_at(id: &str, created: i64) -> VoteRecord {
        VoteRecord {
            id: id.to_string(),
            voter: "0xabc".into(),
            choice: 1,
            created: Utc.timestamp_opt(created, 0).single().unwrap(),
            space_id: "aave.eth".into(),
            space_name: "aave".into(),
            space_avatar: String::new(),
            space_admins: vec![],
            space_moderators: vec![],
            space_members: vec![],
            proposal_id: String::new(),
            proposal_author: String::new(),
            proposal_title: String::new(),
        }
    }

    #[test]
    fn high_water_mark_picks_latest_created() {
        let batch = vec![vote_at("a", 1001), vote_at("b", 1003), vote_at("c", 1002)];
        assert_eq!(high_water_mark(&batch), Some(1003));
        assert_eq!(high_water_mark(&[]), None);
    }

    #[test]
    fn watermark_filter_maps_to_graphql_argument() {
        assert_eq!(WatermarkFilter::Inclusive.where_field(), "created_gte");
        assert_eq!(WatermarkFilter::Exclusive.where_field(), "created_gt");
        assert_eq!(WatermarkFilter::parse(" GTE "), Some(WatermarkFilter::Inclusive));
        assert_eq!(WatermarkFilter::parse("gt"), Some(WatermarkFilter::Exclusive));
        assert_eq!(WatermarkFilter::parse("lt"), None);
    }

    #[test]
    fn vote_serializes_with_camel_case_columns() {
        let json = serde_json::to_value(vote_at("a", 1000)).unwrap();
        assert_eq!(json["spaceId"], "aave.eth");
        assert!(json["spaceAdmins"].as_array().unwrap().is_empty());
    }

    #[test]
    fn case_policy_is_optional() {
        assert_eq!(NormalizePolicy { lowercase: true }.apply_case("0xAB"), "0xab");
        assert_eq!(NormalizePolicy { lowercase: false }.apply_case("0xAB"), "0xAB");
    }
}

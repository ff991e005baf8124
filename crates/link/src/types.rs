use std::fmt;

use chrono::{DateTime, Utc};
use matcher::MatchResult;
use serde::{Deserialize, Serialize};

/// Classification carried by a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkMatchResult {
    NoMatch,
    PossibleMatch,
    PossibleDuplicate,
    Match,
}

impl LinkMatchResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMatchResult::NoMatch => "NO_MATCH",
            LinkMatchResult::PossibleMatch => "POSSIBLE_MATCH",
            LinkMatchResult::PossibleDuplicate => "POSSIBLE_DUPLICATE",
            LinkMatchResult::Match => "MATCH",
        }
    }

    /// Strength used when two links compete for the same pair.
    pub fn rank(&self) -> u8 {
        match self {
            LinkMatchResult::NoMatch => 0,
            LinkMatchResult::PossibleDuplicate => 1,
            LinkMatchResult::PossibleMatch => 2,
            LinkMatchResult::Match => 3,
        }
    }
}

impl From<MatchResult> for LinkMatchResult {
    fn from(result: MatchResult) -> Self {
        match result {
            MatchResult::NoMatch => LinkMatchResult::NoMatch,
            MatchResult::PossibleMatch => LinkMatchResult::PossibleMatch,
            MatchResult::Match => LinkMatchResult::Match,
        }
    }
}

impl fmt::Display for LinkMatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who decided a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkSource {
    Auto,
    Manual,
}

/// Relation between a source record and a golden record.
///
/// `POSSIBLE_DUPLICATE` links relate two golden records; the first golden is
/// stored as `source_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub resource_type: String,
    pub source_id: String,
    pub golden_id: String,
    pub match_result: LinkMatchResult,
    pub link_source: LinkSource,
    pub score: Option<f64>,
    pub eid_match: bool,
    /// Bumped on every change to this link.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Link {
    pub fn new(
        resource_type: &str,
        source_id: &str,
        golden_id: &str,
        match_result: LinkMatchResult,
        link_source: LinkSource,
    ) -> Self {
        let now = Utc::now();
        Self {
            resource_type: resource_type.to_string(),
            source_id: source_id.to_string(),
            golden_id: golden_id.to_string(),
            match_result,
            link_source,
            score: None,
            eid_match: false,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn auto(resource_type: &str, source_id: &str, golden_id: &str, result: LinkMatchResult) -> Self {
        Self::new(resource_type, source_id, golden_id, result, LinkSource::Auto)
    }

    pub fn with_score(mut self, score: Option<f64>) -> Self {
        self.score = score;
        self
    }

    pub fn with_eid_match(mut self, eid_match: bool) -> Self {
        self.eid_match = eid_match;
        self
    }

    pub fn is_auto(&self) -> bool {
        self.link_source == LinkSource::Auto
    }

    pub fn is_manual(&self) -> bool {
        self.link_source == LinkSource::Manual
    }

    pub fn is_match(&self) -> bool {
        self.match_result == LinkMatchResult::Match
    }

    /// True when `other` carries the same decision, ignoring bookkeeping.
    pub fn same_decision(&self, other: &Link) -> bool {
        self.resource_type == other.resource_type
            && self.source_id == other.source_id
            && self.golden_id == other.golden_id
            && self.match_result == other.match_result
            && self.link_source == other.link_source
            && self.eid_match == other.eid_match
            && self.score == other.score
    }

    /// Relates `a` and `b` in either direction.
    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.source_id == a && self.golden_id == b) || (self.source_id == b && self.golden_id == a)
    }

    /// `(rank, manual)` ordering used to keep the stronger of two links.
    pub fn strength(&self) -> (u8, bool) {
        (self.match_result.rank(), self.is_manual())
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} -> {}/{} {} ({:?})",
            self.resource_type,
            self.source_id,
            self.resource_type,
            self.golden_id,
            self.match_result,
            self.link_source
        )
    }
}

/// Filter for [`LinkManager::query_links`](crate::LinkManager::query_links).
/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkQuery {
    pub resource_type: Option<String>,
    pub source_id: Option<String>,
    pub golden_id: Option<String>,
    pub match_result: Option<LinkMatchResult>,
    pub link_source: Option<LinkSource>,
}

impl LinkQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource_type(mut self, resource_type: &str) -> Self {
        self.resource_type = Some(resource_type.to_string());
        self
    }

    pub fn source_id(mut self, source_id: &str) -> Self {
        self.source_id = Some(source_id.to_string());
        self
    }

    pub fn golden_id(mut self, golden_id: &str) -> Self {
        self.golden_id = Some(golden_id.to_string());
        self
    }

    pub fn match_result(mut self, result: LinkMatchResult) -> Self {
        self.match_result = Some(result);
        self
    }

    pub fn link_source(mut self, source: LinkSource) -> Self {
        self.link_source = Some(source);
        self
    }

    pub fn matches(&self, link: &Link) -> bool {
        self.resource_type
            .as_ref()
            .is_none_or(|v| *v == link.resource_type)
            && self.source_id.as_ref().is_none_or(|v| *v == link.source_id)
            && self.golden_id.as_ref().is_none_or(|v| *v == link.golden_id)
            && self.match_result.is_none_or(|v| v == link.match_result)
            && self.link_source.is_none_or(|v| v == link.link_source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_decision_ignores_timestamps_and_version() {
        let a = Link::auto("Patient", "p1", "g1", LinkMatchResult::Match).with_score(Some(0.9));
        let mut b = a.clone();
        b.version = 7;
        b.updated_at = Utc::now();
        assert!(a.same_decision(&b));
        b.link_source = LinkSource::Manual;
        assert!(!a.same_decision(&b));
    }

    #[test]
    fn query_filters_compose() {
        let link = Link::auto("Patient", "p1", "g1", LinkMatchResult::PossibleMatch);
        assert!(LinkQuery::new().matches(&link));
        assert!(LinkQuery::new()
            .source_id("p1")
            .match_result(LinkMatchResult::PossibleMatch)
            .matches(&link));
        assert!(!LinkQuery::new().golden_id("g2").matches(&link));
        assert!(!LinkQuery::new().link_source(LinkSource::Manual).matches(&link));
    }

    #[test]
    fn results_rank_by_confidence() {
        assert!(LinkMatchResult::Match.rank() > LinkMatchResult::PossibleMatch.rank());
        assert!(LinkMatchResult::PossibleMatch.rank() > LinkMatchResult::PossibleDuplicate.rank());
        assert_eq!(LinkMatchResult::from(MatchResult::PossibleMatch), LinkMatchResult::PossibleMatch);
        assert_eq!(
            serde_json::to_string(&LinkMatchResult::PossibleDuplicate).unwrap(),
            "\"POSSIBLE_DUPLICATE\""
        );
    }
}

//! Query descriptions.
//!
//! A query names the sensors of interest and optionally an inclusive time
//! range. Without a range it asks for the latest event of every sensor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tonic::Status;

/// Inclusive `[since, until]` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawQuerySpec", into = "RawQuerySpec")]
pub struct QuerySpec {
    sids: Vec<String>,
    range: Option<TimeRange>,
}

impl QuerySpec {
    /// Latest-snapshot query over `sids`.
    pub fn latest<I, S>(sids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sids: sids.into_iter().map(Into::into).collect(),
            range: None,
        }
    }

    /// Range query over `sids`, both bounds inclusive.
    pub fn range<I, S>(sids: I, since: DateTime<Utc>, until: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sids: sids.into_iter().map(Into::into).collect(),
            range: Some(TimeRange { since, until }),
        }
    }

    /// Builds a spec from optional textual bounds as they arrive on the wire.
    ///
    /// Both bounds must be present or both absent, and each must be an
    /// RFC 3339 instant.
    pub fn from_bounds(
        sids: Vec<String>,
        since: Option<&str>,
        until: Option<&str>,
    ) -> Result<Self, Status> {
        match (since, until) {
            (None, None) => Ok(Self::latest(sids)),
            (Some(since), Some(until)) => Ok(Self::range(
                sids,
                parse_bound("since", since)?,
                parse_bound("until", until)?,
            )),
            _ => Err(Status::invalid_argument(
                "since and until must be given together",
            )),
        }
    }

    pub fn sids(&self) -> &[String] {
        &self.sids
    }

    pub fn time_range(&self) -> Option<&TimeRange> {
        self.range.as_ref()
    }
}

fn parse_bound(name: &str, raw: &str) -> Result<DateTime<Utc>, Status> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Status::invalid_argument(format!("invalid {name} bound {raw:?}: {e}")))
}

#[derive(Serialize, Deserialize)]
struct RawQuerySpec {
    sids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    since: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    until: Option<String>,
}

impl TryFrom<RawQuerySpec> for QuerySpec {
    type Error = String;

    fn try_from(raw: RawQuerySpec) -> Result<Self, Self::Error> {
        QuerySpec::from_bounds(raw.sids, raw.since.as_deref(), raw.until.as_deref())
            .map_err(|status| status.message().to_string())
    }
}

impl From<QuerySpec> for RawQuerySpec {
    fn from(spec: QuerySpec) -> Self {
        Self {
            sids: spec.sids,
            since: spec.range.map(|r| r.since.to_rfc3339()),
            until: spec.range.map(|r| r.until.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bounds() {
        let latest = QuerySpec::from_bounds(vec!["a".into()], None, None).unwrap();
        assert!(latest.time_range().is_none());

        let range = QuerySpec::from_bounds(
            vec!["a".into(), "b".into()],
            Some("2024-01-01T00:00:00Z"),
            Some("2024-01-01T01:00:00+01:00"),
        )
        .unwrap();
        let bounds = range.time_range().unwrap();
        assert_eq!(bounds.since, bounds.until);
        assert_eq!(range.sids(), ["a", "b"]);
    }

    #[test]
    fn test_single_bound_is_rejected() {
        let status = QuerySpec::from_bounds(vec![], Some("2024-01-01T00:00:00Z"), None).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        let status = QuerySpec::from_bounds(vec![], Some("bogus"), Some("bogus")).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_wire_shape() {
        let spec: QuerySpec = serde_json::from_str(
            r#"{"sids":["a"],"since":"2024-01-01T00:00:00Z","until":"2024-01-02T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(spec.time_range().is_some());
        assert!(serde_json::from_str::<QuerySpec>(r#"{"sids":["a"],"until":"2024-01-02T00:00:00Z"}"#).is_err());
    }
}

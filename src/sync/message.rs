//! Wire format of the sentiment stream
//!
//! Inbound messages are JSON objects discriminated by `type`. Outbound
//! control messages are bare string tokens, not JSON envelopes.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Liveness ping sent while connected.
pub const PING_TOKEN: &str = "ping";

/// Asks the server to resend the complete sentiment map.
pub const REQUEST_STATE_TOKEN: &str = "get_state";

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// One incremental change to a single region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDelta {
    pub region: String,
    /// Running average for the region, clamped to [-1, 1].
    pub average: f64,
    pub sample_count: u64,
    pub timestamp: DateTime<Utc>,
    /// Score of the individual response that moved the average.
    pub latest_score: Option<f64>,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum SentimentUpdate {
    /// Replaces everything known.
    FullState { mapping: BTreeMap<String, f64> },
    /// Replaces one region.
    DeltaUpdate(RegionDelta),
    /// Liveness acknowledgement; no state effect.
    Heartbeat,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireMessage {
    #[serde(rename = "state", alias = "initial_state")]
    State {
        sentiments: serde_json::Map<String, serde_json::Value>,
    },
    #[serde(rename = "sentiment_update")]
    SentimentUpdate {
        department_id: String,
        average: f64,
        #[serde(default)]
        total_count: Option<u64>,
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default)]
        sentiment_score: Option<f64>,
    },
    #[serde(rename = "pong")]
    Pong {},
}

/// Clamp a score into [-1, 1]. The producer is supposed to do this already.
pub fn clamp_score(score: f64) -> f64 {
    score.clamp(-1.0, 1.0)
}

impl SentimentUpdate {
    /// Decode one inbound text payload.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let wire: WireMessage =
            serde_json::from_str(text).map_err(|e| ParseError::Malformed(e.to_string()))?;

        match wire {
            WireMessage::State { sentiments } => {
                let mut mapping = BTreeMap::new();
                for (region, value) in sentiments {
                    match value.as_f64().filter(|v| v.is_finite()) {
                        Some(score) => {
                            mapping.insert(region, clamp_score(score));
                        }
                        None => {
                            log::warn!("Skipping non-numeric score for region {}: {}", region, value);
                        }
                    }
                }
                Ok(SentimentUpdate::FullState { mapping })
            }
            WireMessage::SentimentUpdate {
                department_id,
                average,
                total_count,
                timestamp,
                sentiment_score,
            } => {
                if department_id.is_empty() {
                    return Err(ParseError::InvalidField {
                        field: "department_id",
                        reason: "empty".to_string(),
                    });
                }
                if !average.is_finite() {
                    return Err(ParseError::InvalidField {
                        field: "average",
                        reason: format!("{} is not finite", average),
                    });
                }
                let timestamp = timestamp
                    .as_deref()
                    .and_then(parse_timestamp)
                    .unwrap_or_else(Utc::now);

                Ok(SentimentUpdate::DeltaUpdate(RegionDelta {
                    region: department_id,
                    average: clamp_score(average),
                    sample_count: total_count.unwrap_or(0),
                    timestamp,
                    latest_score: sentiment_score.filter(|s| s.is_finite()).map(clamp_score),
                }))
            }
            WireMessage::Pong {} => Ok(SentimentUpdate::Heartbeat),
        }
    }
}

/// Accept RFC 3339, or the naive ISO-8601 form the server emits (read as UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_state_and_initial_state_are_full_state() {
        for kind in ["state", "initial_state"] {
            let text = format!(r#"{{"type":"{}","sentiments":{{"A":0.2,"B":-0.4}}}}"#, kind);
            let update = SentimentUpdate::parse(&text).unwrap();
            let mut expected = BTreeMap::new();
            expected.insert("A".to_string(), 0.2);
            expected.insert("B".to_string(), -0.4);
            assert_eq!(update, SentimentUpdate::FullState { mapping: expected });
        }
    }

    #[test]
    fn test_full_state_clamps_and_skips_garbage() {
        let text = r#"{"type":"state","sentiments":{"A":3.0,"B":-7,"C":"bad","D":null}}"#;
        let SentimentUpdate::FullState { mapping } = SentimentUpdate::parse(text).unwrap() else {
            panic!("expected full state");
        };
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping["A"], 1.0);
        assert_eq!(mapping["B"], -1.0);
    }

    #[test]
    fn test_sentiment_update_fields() {
        let text = r#"{
            "type": "sentiment_update",
            "department_id": "PY-ASU",
            "sentiment_score": 0.9,
            "average": 0.35,
            "total_count": 12,
            "timestamp": "2026-03-01T14:05:09.123456",
            "metadata": {"channel": "whatsapp"}
        }"#;
        let SentimentUpdate::DeltaUpdate(delta) = SentimentUpdate::parse(text).unwrap() else {
            panic!("expected delta");
        };
        assert_eq!(delta.region, "PY-ASU");
        assert_eq!(delta.average, 0.35);
        assert_eq!(delta.sample_count, 12);
        assert_eq!(delta.latest_score, Some(0.9));
        assert_eq!(delta.timestamp.year(), 2026);
        assert_eq!(delta.timestamp.hour(), 14);
        assert_eq!(delta.timestamp.second(), 9);
    }

    #[test]
    fn test_sentiment_update_optional_fields() {
        let before = Utc::now();
        let text = r#"{"type":"sentiment_update","department_id":"PY-1","average":-1.5}"#;
        let SentimentUpdate::DeltaUpdate(delta) = SentimentUpdate::parse(text).unwrap() else {
            panic!("expected delta");
        };
        assert_eq!(delta.average, -1.0);
        assert_eq!(delta.sample_count, 0);
        assert_eq!(delta.latest_score, None);
        assert!(delta.timestamp >= before);
    }

    #[test]
    fn test_rfc3339_timestamp() {
        let ts = parse_timestamp("2026-03-01T14:05:09+02:00").unwrap();
        assert_eq!(ts.hour(), 12);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_pong_is_heartbeat() {
        assert_eq!(
            SentimentUpdate::parse(r#"{"type":"pong"}"#).unwrap(),
            SentimentUpdate::Heartbeat
        );
        assert_eq!(
            SentimentUpdate::parse(r#"{"type":"pong","server_time":"now"}"#).unwrap(),
            SentimentUpdate::Heartbeat
        );
    }

    #[test]
    fn test_malformed_messages() {
        assert!(SentimentUpdate::parse("not json").is_err());
        assert!(SentimentUpdate::parse(r#"{"type":"mystery"}"#).is_err());
        assert!(SentimentUpdate::parse(r#"{"sentiments":{}}"#).is_err());
        assert!(SentimentUpdate::parse(r#"{"type":"sentiment_update","average":0.1}"#).is_err());
        assert!(matches!(
            SentimentUpdate::parse(r#"{"type":"sentiment_update","department_id":"","average":0.1}"#),
            Err(ParseError::InvalidField { field: "department_id", .. })
        ));
    }
}

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use strum_macros::Display;

use crate::items::ItemPayload;

/// Number of bytes of the SHA-256 digest kept for an event id (48 hex chars).
const EVENT_ID_BYTES: usize = 24;

/// Adapter that produced the upstream record.
///
/// The set is open-ended: adapters we do not know about serialise their tag
/// verbatim and round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventSource {
    CodexSdk,
    CodexExec,
    Other(String),
}

impl EventSource {
    pub fn as_str(&self) -> &str {
        match self {
            EventSource::CodexSdk => "codex_sdk",
            EventSource::CodexExec => "codex_exec",
            EventSource::Other(tag) => tag,
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventSource {
    fn from(s: &str) -> Self {
        match s {
            "codex_sdk" => EventSource::CodexSdk,
            "codex_exec" => EventSource::CodexExec,
            other => EventSource::Other(other.to_string()),
        }
    }
}

impl FromStr for EventSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EventSource::from(s))
    }
}

impl Serialize for EventSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(EventSource::from(tag.as_str()))
    }
}

/// Coarse indicator of how much of the agent's internal reasoning survived
/// into the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReasoningAvailability {
    Full,
    Partial,
    Unavailable,
}

/// The canonical, redacted, persistent record of one agent observation.
///
/// Envelopes are immutable once created. Serialisation of an envelope is
/// canonical: minified JSON with object keys in lexicographic order (see
/// [`canonical_line`]), which is also the byte string the mirror persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Content-derived identity; the primary idempotency key everywhere.
    pub event_id: String,
    pub source: EventSource,
    /// Opaque stable repository identity. Derived once per local path by the
    /// caller, never re-derived per event.
    pub repo_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    pub session_id: String,
    /// Sub-session identity; omitted means "same as the session".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(with = "ts_serde")]
    pub ts: DateTime<Utc>,
    /// Monotonic per `(repoId, sessionId)`, caller-supplied.
    pub sequence: u64,
    pub event_type: String,
    /// Semantic body, post-redaction. Always a JSON object.
    pub payload: Value,
    pub reasoning_availability: ReasoningAvailability,
}

impl EventEnvelope {
    /// The effective thread for this envelope.
    pub fn thread(&self) -> &str {
        self.thread_id.as_deref().unwrap_or(&self.session_id)
    }

    /// Parsed view of `payload.item`. Returns `None` when the payload carries
    /// no item; unrecognised item shapes come back as
    /// [`ItemPayload::Unknown`] with the original JSON preserved.
    pub fn item(&self) -> Option<ItemPayload> {
        let item = self.payload.get("item")?;
        Some(
            serde_json::from_value(item.clone())
                .unwrap_or_else(|_| ItemPayload::Unknown(item.clone())),
        )
    }

    /// Recompute the content identity from the envelope's own fields.
    pub fn derived_event_id(&self) -> String {
        compute_event_id(
            &self.repo_id,
            &self.session_id,
            self.sequence,
            &self.event_type,
            &self.payload,
            &self.ts,
        )
    }
}

/// Fixed-precision RFC3339 UTC rendering used everywhere an envelope
/// timestamp appears on disk or on the wire.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse any RFC3339 timestamp and normalise it to UTC.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// serde adapter for the canonical timestamp rendering; usable via
/// `#[serde(with = "codaph_protocol::ts_serde")]`.
pub mod ts_serde {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_ts(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_ts(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid RFC3339 ts: {s}")))
    }
}

/// Serialise an envelope as its canonical line: minified JSON with object
/// keys in lexicographic order and no trailing newline.
///
/// serde_json's default `Map` is BTreeMap-backed, so routing the envelope
/// through a `Value` sorts every object in the tree, payload included.
pub fn canonical_line(env: &EventEnvelope) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(env)?;
    serde_json::to_string(&value)
}

/// Parse one canonical line back into an envelope.
pub fn parse_line(line: &str) -> Result<EventEnvelope, serde_json::Error> {
    serde_json::from_str(line)
}

/// Stable 24-byte identity over arbitrary string parts, for records that
/// arrive without a content-derived event id (e.g. remote timeline entries).
pub fn stable_hash_id(parts: &[&str]) -> String {
    let key = Value::Array(parts.iter().map(|p| Value::from(*p)).collect());
    let digest = Sha256::digest(key.to_string().as_bytes());
    let hex = format!("{digest:x}");
    hex[..EVENT_ID_BYTES * 2].to_string()
}

/// Derive the 24-byte content identity for an event.
///
/// The digest input is the canonical JSON array
/// `[repoId, sessionId, sequence, eventType, payload, ts]` where `payload`
/// is the redacted payload and `ts` the normalised RFC3339 rendering.
pub fn compute_event_id(
    repo_id: &str,
    session_id: &str,
    sequence: u64,
    event_type: &str,
    payload: &Value,
    ts: &DateTime<Utc>,
) -> String {
    let key = Value::Array(vec![
        Value::from(repo_id),
        Value::from(session_id),
        Value::from(sequence),
        Value::from(event_type),
        payload.clone(),
        Value::from(format_ts(ts)),
    ]);
    let canonical = key.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let hex = format!("{digest:x}");
    hex[..EVENT_ID_BYTES * 2].to_string()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn sample() -> EventEnvelope {
        let ts = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let payload = json!({"item": {"type": "agent_message", "text": "done"}});
        let event_id = compute_event_id("repo-1", "s1", 7, "item.completed", &payload, &ts);
        EventEnvelope {
            event_id,
            source: EventSource::CodexSdk,
            repo_id: "repo-1".to_string(),
            actor_id: Some("alice".to_string()),
            session_id: "s1".to_string(),
            thread_id: None,
            ts,
            sequence: 7,
            event_type: "item.completed".to_string(),
            payload,
            reasoning_availability: ReasoningAvailability::Unavailable,
        }
    }

    #[test]
    fn canonical_line_round_trips() {
        let env = sample();
        let line = canonical_line(&env).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(parse_line(&line).unwrap(), env);
    }

    #[test]
    fn canonical_line_sorts_keys() {
        let env = sample();
        let line = canonical_line(&env).unwrap();
        let actor = line.find("\"actorId\"").unwrap();
        let event = line.find("\"eventId\"").unwrap();
        let ts = line.find("\"ts\"").unwrap();
        assert!(actor < event);
        assert!(event < ts);
    }

    #[test]
    fn event_id_is_stable_and_payload_sensitive() {
        let env = sample();
        assert_eq!(env.event_id.len(), 48);
        assert_eq!(env.derived_event_id(), env.event_id);

        let other = compute_event_id(
            &env.repo_id,
            &env.session_id,
            env.sequence,
            &env.event_type,
            &json!({"item": {"type": "agent_message", "text": "different"}}),
            &env.ts,
        );
        assert_ne!(other, env.event_id);
    }

    #[test]
    fn source_round_trips_unknown_tags() {
        let source: EventSource = "some_future_adapter".parse().unwrap();
        assert_eq!(source, EventSource::Other("some_future_adapter".to_string()));
        let json = serde_json::to_string(&source).unwrap();
        assert_eq!(json, "\"some_future_adapter\"");
        let back: EventSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, source);
    }

    #[test]
    fn ts_is_normalised_to_utc_millis() {
        let parsed = parse_ts("2025-03-14T10:26:53.120+01:00").unwrap();
        assert_eq!(format_ts(&parsed), "2025-03-14T09:26:53.120Z");
    }

    #[test]
    fn thread_defaults_to_session() {
        let mut env = sample();
        assert_eq!(env.thread(), "s1");
        env.thread_id = Some("t9".to_string());
        assert_eq!(env.thread(), "t9");
    }
}

//! Canonical event model shared by the ingest pipeline, the mirror store and
//! the memory engine client.
//!
//! Every observation captured from an agent session is normalised into an
//! [`EventEnvelope`] before anything else happens to it: redaction operates on
//! the payload, the mirror persists the canonical line rendering, and the
//! memory engine receives the envelope's identity as its idempotency key.

mod envelope;
mod items;

pub use envelope::EventEnvelope;
pub use envelope::EventSource;
pub use envelope::ReasoningAvailability;
pub use envelope::canonical_line;
pub use envelope::compute_event_id;
pub use envelope::format_ts;
pub use envelope::parse_line;
pub use envelope::parse_ts;
pub use envelope::stable_hash_id;
pub use envelope::ts_serde;
pub use items::FileChange;
pub use items::FileChangeKind;
pub use items::ItemPayload;

/// Reserved event-type prefixes. Types outside these namespaces are passed
/// through verbatim.
pub const RESERVED_EVENT_TYPE_PREFIXES: [&str; 4] = ["prompt.", "item.", "turn.", "thread."];

/// Well-known event types emitted by the projection layer.
pub mod event_types {
    pub const PROMPT_SUBMITTED: &str = "prompt.submitted";
    pub const ITEM_COMPLETED: &str = "item.completed";
    pub const TURN_STARTED: &str = "turn.started";
    pub const TURN_COMPLETED: &str = "turn.completed";
    pub const THREAD_STARTED: &str = "thread.started";
}

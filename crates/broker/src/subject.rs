//! Subject naming and topic validation.

use crate::Error;

/// Subject a receiver consumes messages for `topic` on.
pub fn receiver_subject(wire_id: &str, receiver_id: &str, topic: &str) -> String {
    format!("wire.{wire_id}.receiver.{receiver_id}.{topic}")
}

/// Wildcard covering every topic routed to a receiver.
pub fn receiver_wildcard(wire_id: &str, receiver_id: &str) -> String {
    format!("wire.{wire_id}.receiver.{receiver_id}.>")
}

/// Subject completed responses on `topic` are broadcast to.
pub fn broadcast_subject(wire_id: &str, topic: &str) -> String {
    format!("wire.{wire_id}.topic.responses.{topic}")
}

/// Checks that a topic can be embedded into a subject.
///
/// # Errors
/// Returns `Error::InvalidTopic` describing the first problem found.
pub fn validate_topic(topic: &str) -> Result<(), Error> {
    let reason = if topic.is_empty() {
        "must not be empty"
    } else if topic.contains(['*', '>']) {
        "must not contain wildcards"
    } else if topic.contains(char::is_whitespace) {
        "must not contain whitespace"
    } else if topic.split('.').any(str::is_empty) {
        "must not contain empty segments"
    } else {
        return Ok(());
    };

    Err(Error::InvalidTopic {
        topic: topic.to_string(),
        reason,
    })
}

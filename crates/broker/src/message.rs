//! Envelopes exchanged between senders and receivers. All are camelCase JSON.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use wire_coordination::now_millis;

use crate::Error;

/// A request published by a sender to the receiver owning `topic`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Stable across all retries of one logical send.
    pub message_id: String,

    /// The topic the message belongs to.
    pub topic: String,

    /// Application payload.
    pub payload: Value,

    /// Where responses and extensions are published.
    pub reply_subject: String,

    /// Sender timeout for this attempt, in milliseconds.
    pub timeout: u64,

    /// When the attempt was sent, in milliseconds since the Unix epoch.
    pub sent_at: u64,

    /// Zero for the first attempt.
    pub retry_count: u32,
}

/// The terminal result of processing a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// The message this responds to.
    pub message_id: String,

    /// Whether the handler succeeded.
    pub success: bool,

    /// Handler result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Handler error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When processing finished, in milliseconds since the Unix epoch.
    pub processed_at: u64,
}

impl Response {
    /// A successful response.
    #[must_use]
    pub fn success(message_id: impl Into<String>, result: Value) -> Self {
        Self {
            message_id: message_id.into(),
            success: true,
            result: Some(result),
            error: None,
            processed_at: now_millis(),
        }
    }

    /// A failed response.
    #[must_use]
    pub fn failure(message_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            processed_at: now_millis(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ExtensionType {
    TimeoutExtension,
}

/// Tells a waiting sender that processing needs more time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutExtension {
    /// The message still being processed.
    pub message_id: String,

    /// New wait, in milliseconds, replacing the sender's current timer.
    pub extension_ms: u64,

    #[serde(rename = "type")]
    kind: ExtensionType,
}

impl TimeoutExtension {
    /// Creates a new extension signal.
    #[must_use]
    pub fn new(message_id: impl Into<String>, extension_ms: u64) -> Self {
        Self {
            message_id: message_id.into(),
            extension_ms,
            kind: ExtensionType::TimeoutExtension,
        }
    }
}

/// Anything a sender may receive on its reply subject.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    /// Keep waiting.
    Extension(TimeoutExtension),

    /// Processing finished.
    Response(Response),
}

/// Fan-out notification of a completed response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicResponseBroadcast {
    /// The topic the response belongs to.
    pub topic: String,

    /// The message that was processed.
    pub message_id: String,

    /// The response sent to the requester.
    pub response: Response,

    /// The receiver that processed the message.
    pub receiver_id: String,

    /// When the broadcast was published, in milliseconds since the Unix epoch.
    pub broadcast_at: u64,
}

macro_rules! json_codec {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl TryFrom<Bytes> for $ty {
                type Error = Error;

                fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
                    Ok(serde_json::from_slice(&bytes)?)
                }
            }

            impl TryFrom<&$ty> for Bytes {
                type Error = Error;

                fn try_from(value: &$ty) -> Result<Self, Self::Error> {
                    Ok(Self::from(serde_json::to_vec(value)?))
                }
            }
        )+
    };
}

json_codec!(
    RequestEnvelope,
    Response,
    TimeoutExtension,
    Reply,
    TopicResponseBroadcast,
);

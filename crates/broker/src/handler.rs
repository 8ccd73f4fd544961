use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BoxError;

/// Error returned by user handlers. Its message becomes `Response::error`.
pub type HandlerError = BoxError;

/// Processes the payload of one message on a topic.
#[async_trait]
pub trait MessageHandler
where
    Self: Send + Sync + 'static,
{
    /// Handles the payload, returning the result sent back to the sender.
    async fn handle(&self, topic: String, payload: Value) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, topic: String, payload: Value) -> Result<Value, HandlerError> {
        (self)(topic, payload).await
    }
}

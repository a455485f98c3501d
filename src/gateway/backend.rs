use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::conversation::Role;

use super::GatewayError;

/// One exchanged message kept in the session memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Everything the service needs to answer `message` in the context of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system_instructions: String,
    pub temperature: f32,
    pub history: Vec<Turn>,
    pub message: String,
}

/// A one-shot request whose answer must follow `schema`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub schema: serde_json::Value,
}

pub type FragmentStream = BoxStream<'static, Result<String, GatewayError>>;

/// The hosted model service as seen by the gateway.
#[async_trait]
pub trait ModelBackend: Send + Sync + 'static {
    /// Errors may be reported either here or as an item of the stream.
    async fn open_stream(&self, request: ChatRequest) -> Result<FragmentStream, GatewayError>;

    /// Returns the raw text of the answer.
    async fn complete(&self, request: CompletionRequest) -> Result<String, GatewayError>;
}

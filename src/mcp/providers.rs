use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::auth::RequestContext;
use crate::error::AppError;

/// Advertised in `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Advertised in `resources/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Advertised in `prompts/list`.
#[derive(Debug, Clone, Serialize)]
pub struct PromptDescriptor {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptArgument {
    pub name: String,
    pub description: String,
    pub required: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Bad arguments: surfaces as JSON-RPC -32602 with the message.
    #[error("{0}")]
    InvalidParams(String),

    /// Execution failure: surfaces as a tool result with `isError` set.
    /// Messages must already be client-safe.
    #[error("{0}")]
    Failed(String),

    /// Internal failure: logged verbosely, sanitized at the boundary.
    #[error(transparent)]
    App(#[from] AppError),
}

/// A callable tool. The SQL tools of the full product implement this
/// behind the same contract as the built-in auth and connection tools.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;
    async fn call(&self, ctx: &RequestContext, args: Value) -> Result<Value, ProviderError>;
}

/// A readable resource. Returns the `contents` array for `resources/read`.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    fn descriptor(&self) -> ResourceDescriptor;
    async fn read(&self, ctx: &RequestContext) -> Result<Value, ProviderError>;
}

/// A retrievable prompt.
#[async_trait]
pub trait PromptProvider: Send + Sync {
    fn descriptor(&self) -> PromptDescriptor;
    async fn get(&self, ctx: &RequestContext, args: Value) -> Result<Value, ProviderError>;
}

//! Execution-engine boundary.
//!
//! The engine that actually runs a prepared bundle's model and tool calls
//! is external to this crate. The [`ExecutionEngine`] trait decouples the
//! session manager from it the same way a protocol driver would: an
//! object-safe surface with boxed futures and a boxed chunk stream for the
//! streaming variant.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::models::bundle::PreparedBundle;
use crate::models::session::TranscriptEntry;
use crate::Result;

/// Complete response from a non-streaming exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResponse {
    /// Response payload appended to the transcript as the assistant entry.
    pub content: Value,
}

/// One incremental piece of a streaming response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineChunk {
    /// Incremental response text.
    pub delta: String,
}

/// Boxed stream of incremental engine output.
pub type ChunkStream = BoxStream<'static, Result<EngineChunk>>;

/// Opaque capability that executes a prepared bundle against a transcript.
pub trait ExecutionEngine: Send + Sync {
    /// Run one exchange and return the complete response.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Engine`](crate::AppError::Engine) on execution
    /// failure; the session manager records the failure in the transcript
    /// and fails the session.
    fn execute(
        &self,
        bundle: Arc<PreparedBundle>,
        transcript: Vec<TranscriptEntry>,
        message: TranscriptEntry,
    ) -> Pin<Box<dyn Future<Output = Result<EngineResponse>> + Send + '_>>;

    /// Run one exchange, yielding the response incrementally.
    ///
    /// Dropping the returned stream signals the engine to abort work in
    /// progress; cancellation is cooperative at each yield point.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Engine`](crate::AppError::Engine) if the
    /// exchange cannot be started. Mid-stream failures arrive as `Err`
    /// items on the stream.
    fn execute_streaming(
        &self,
        bundle: Arc<PreparedBundle>,
        transcript: Vec<TranscriptEntry>,
        message: TranscriptEntry,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkStream>> + Send + '_>>;
}

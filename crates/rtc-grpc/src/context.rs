// ABOUTME: Execution context handed to callers of a client stream.
// ABOUTME: Wraps the stream's cancellation scope and, once known, its incoming metadata.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::metadata::Metadata;

/// Context of a client stream.
///
/// Before headers arrive this is the bare cancellation scope. Afterwards it
/// also carries the header metadata as incoming call metadata.
#[derive(Debug, Clone)]
pub struct StreamContext {
    token: CancellationToken,
    incoming: Option<Arc<Metadata>>,
}

impl StreamContext {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            token,
            incoming: None,
        }
    }

    pub(crate) fn with_incoming(token: CancellationToken, metadata: Metadata) -> Self {
        Self {
            token,
            incoming: Some(Arc::new(metadata)),
        }
    }

    /// Header metadata received from the server, if headers have arrived.
    pub fn incoming_metadata(&self) -> Option<&Metadata> {
        self.incoming.as_deref()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the stream's scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::proxy::ProxyError;

pub type Result<T, E = ConsumerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(
        "error dialing traffic controller server: {source}.\nPlease ask your platform operator to check the platform configuration (traffic controller is {target})."
    )]
    Dial {
        target: String,
        #[source]
        source: DialFailure,
    },
    #[error("unauthorized: {body}")]
    Unauthorized { body: String },
    #[error("stream read failed: {0}")]
    Read(#[from] ReadFailure),
    #[error("connection does not exist")]
    NoActiveConnection,
    #[error("failed to close websocket: {0}")]
    Close(#[source] tungstenite::Error),
}

impl ConsumerError {
    /// True when a proxy refused the CONNECT tunnel for this attempt.
    pub fn is_proxy_refusal(&self) -> bool {
        matches!(
            self,
            ConsumerError::Dial {
                source: DialFailure::Proxy(ProxyError::Tunnel { .. }),
                ..
            }
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ConsumerError::Unauthorized { .. })
    }
}

#[derive(Debug, Error)]
pub enum DialFailure {
    #[error("invalid stream url: {0}")]
    InvalidUrl(String),
    #[error("invalid header value for {0}")]
    InvalidHeader(&'static str),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Handshake(#[from] tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum ReadFailure {
    #[error("no frame received within idle timeout of {0:?}")]
    IdleTimeout(Duration),
    #[error("connection closed by peer{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    ClosedByPeer(Option<String>),
    #[error("stream ended without a close frame")]
    StreamEnded,
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
}

//! Call-engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] crate::call::InvalidTransition),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("transport error: {0}")]
    Transport(#[from] webrtc::Error),

    #[error("media device unavailable: {0}")]
    Device(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("session closed")]
    Closed,
}

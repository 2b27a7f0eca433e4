//! Call-related error types.

use meshcore::StateError;
use thiserror::Error;

use super::media::{DeviceError, TransportError};
use crate::server::ServerError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("real-time media is not supported in this environment")]
    Unsupported,

    #[error("not in a call")]
    NotInCall,

    #[error(transparent)]
    AlreadyInCall(#[from] StateError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("call engine has stopped")]
    EngineClosed,
}

//! Engine errors.

use crate::link::LinkError;
use p2g4_common::{SimTime, TraceError};
use p2g4_models::facade::FacadeError;
use p2g4_models::ModelError;
use thiserror::Error;

/// Fatal simulation errors.
#[derive(Debug, Error)]
pub enum PhyError {
    /// A device broke the protocol contract.
    #[error("@{time} device {device}: {reason}")]
    Protocol {
        device: usize,
        time: SimTime,
        reason: String,
    },

    /// The engine broke one of its own invariants.
    #[error("@{time} internal error: {reason}")]
    Internal { time: SimTime, reason: String },

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

impl From<FacadeError> for PhyError {
    fn from(e: FacadeError) -> Self {
        match e {
            FacadeError::Model(m) => PhyError::Model(m),
            FacadeError::Trace(t) => PhyError::Trace(t),
        }
    }
}

//! Error taxonomy (spec §7). Transient-vs-fatal classification lives in
//! [`crate::retry`]; this enum is what reconciliation and its callers see
//! once a retry wrapper has given up.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{field} is required on {object}")]
    Validation { object: String, field: &'static str },

    #[error("deadline exceeded during {operation}")]
    Timeout { operation: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;

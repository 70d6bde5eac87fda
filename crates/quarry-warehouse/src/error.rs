//! Warehouse Error Types
//!
//! Errors surfaced by a [`WarehouseClient`](crate::WarehouseClient) or a
//! [`RowDecoder`](crate::RowDecoder).
//!
//! ## Error Categories
//!
//! - `Transport`: the request never produced a usable response (network, RPC status)
//! - `Api`: the warehouse answered with a failure and a list of reported entries
//! - `NotFound`: a job, table, session, or partition is unknown
//! - `Schema` / `Decode`: session metadata or a row block could not be interpreted
//! - `Cancelled` / `DeadlineExceeded`: the caller's scope ended; always benign

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::types::ErrorEntry;

pub type Result<T> = std::result::Result<T, WarehouseError>;

lazy_static! {
    static ref CANCELLED_RE: Regex =
        Regex::new(r"(?i)context canceled|operation was cancel+ed").expect("valid regex");
}

#[derive(Debug, Clone, Error)]
pub enum WarehouseError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{message}")]
    Api {
        message: String,
        errors: Vec<ErrorEntry>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl WarehouseError {
    /// True when the error only reports that the caller's scope ended.
    ///
    /// Transport layers frequently stringify cancellation, so the message is
    /// matched as well as the variant.
    pub fn is_cancellation(&self) -> bool {
        match self {
            WarehouseError::Cancelled | WarehouseError::DeadlineExceeded => true,
            WarehouseError::Transport(msg) => CANCELLED_RE.is_match(msg),
            _ => false,
        }
    }

    /// Entries reported by the warehouse alongside an API failure.
    pub fn reported_errors(&self) -> &[ErrorEntry] {
        match self {
            WarehouseError::Api { errors, .. } => errors,
            _ => &[],
        }
    }
}

impl From<apache_avro::Error> for WarehouseError {
    fn from(e: apache_avro::Error) -> Self {
        WarehouseError::Decode(e.to_string())
    }
}

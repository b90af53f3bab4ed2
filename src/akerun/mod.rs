//! Akerun access-event integration
//!
//! - [`client`] - HTTP client for the door-access API
//! - [`poller`] - the background worker feeding the daily-bonus engine

pub mod client;
pub mod poller;

use thiserror::Error;

use crate::error::LedgerError;

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Akerun API returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

pub use client::{AccessEventSource, AkerunClient};
pub use poller::AccessPoller;

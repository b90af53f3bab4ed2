//! point-ledger - virtual-point ledger service
//!
//! Users hold non-negative integer point balances that move through
//! transfers, administrative grants, catalog exchanges, and daily-bonus
//! events. Every movement is an immutable transaction row created in the
//! same persistence scope as the balance mutation, and duplicate client
//! submissions are absorbed by the idempotency registry.
//!
//! # Modules
//!
//! - [`core_types`] - identifiers, point amounts, caller identity
//! - [`error`] - the error taxonomy every operation returns
//! - [`config`] - YAML configuration with env overrides
//! - [`db`] - connection pool and startup schema
//! - [`account`] - user rows, optimistic profile updates, archival
//! - [`ledger`] - balances, transaction log, idempotency, the engine
//! - [`transfer_request`] - peer-to-peer approval workflow
//! - [`qr`] - single-use QR-mediated transfers
//! - [`exchange`] - spending points on catalog items
//! - [`daily_bonus`] - door-access bonuses and the lottery
//! - [`akerun`] - the external access-event poller

pub mod account;
pub mod akerun;
pub mod config;
pub mod core_types;
pub mod daily_bonus;
pub mod db;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod logging;
pub mod qr;
pub mod transfer_request;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use core_types::{Caller, Points, Role, UserId};
pub use db::{Database, Scope};
pub use error::LedgerError;
pub use ledger::{LedgerEngine, Transaction, TransactionStatus, TransactionType, TransferArgs};

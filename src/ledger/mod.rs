//! The ledger core
//!
//! - [`balances`] - row-locked balance arithmetic
//! - [`transactions`] - append-only transaction log
//! - [`idempotency`] - at-most-once key registry
//! - [`engine`] - the orchestrating protocol all flows funnel through
//! - [`friendship`] - capability gate consulted for transfers

pub mod balances;
pub mod engine;
pub mod friendship;
pub mod idempotency;
pub mod transactions;

pub use balances::{BalanceUpdate, Direction};
pub use engine::{ApplyOutcome, LedgerEngine, LedgerOp, TransferArgs};
pub use friendship::{AllowAll, DenyAll, FriendshipGate};
pub use transactions::{
    NewTransaction, Transaction, TransactionStatus, TransactionType, TxFilter,
};

//! Peer-to-peer transfer approval workflow
//!
//! A sender parks a pending request; the recipient approves or rejects it,
//! the sender may cancel it, and an expiry sweep retires the rest.

pub mod db;
pub mod service;
pub mod types;

pub use service::{CreateRequestArgs, TransferRequestService, run_sweeper};
pub use types::{RequestStatus, TransferRequest};

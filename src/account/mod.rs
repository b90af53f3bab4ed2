//! User accounts
//!
//! Models and repository for the `users` table. Balance arithmetic lives in
//! the ledger module; everything here uses the optimistic (version-CAS)
//! path and never touches `balance`.

pub mod models;
pub mod repository;

pub use models::{ArchivedUser, NewUser, ProfileUpdate, User};
pub use repository::UserRepository;

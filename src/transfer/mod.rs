//! Money transfer between two accounts
//!
//! A transfer writes one `transfers` row, two offsetting `entries` rows and
//! adjusts both account balances inside a single transaction run by
//! [`Store::exec_tx`](crate::store::Store::exec_tx).
//!
//! # Invariants
//!
//! 1. **All-or-nothing**: a failure at any step leaves no transfer, entry or
//!    balance change behind
//! 2. **Conservation**: the two entries of a transfer sum to zero
//! 3. **Lock order**: balance rows are updated in ascending account id,
//!    independent of transfer direction
//! 4. **Relative updates**: balances are adjusted with `balance + delta` in
//!    SQL, never overwritten from a value read earlier

pub mod service;
pub mod types;


pub use types::{TransferTxParams, TransferTxResult};

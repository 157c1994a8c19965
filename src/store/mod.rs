//! Bank store
//!
//! PostgreSQL-backed storage for accounts, ledger entries and transfers,
//! plus the transaction runner every multi-statement workflow goes through.

pub mod context;
pub mod error;
pub mod models;
pub mod queries;
pub mod tx;

#[cfg(test)]
pub(crate) mod mock;

// Re-export commonly used types
pub use context::{CancelHandle, TxContext};
pub use error::{TxError, ValidationError};
pub use models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer,
};
pub use queries::Queries;
pub use tx::{PgTx, Store, Transactional, TxHandle};

//! simple_bank - transactional bank store on PostgreSQL
//!
//! # Modules
//!
//! - [`store`] - Row types, query executor and the transaction runner
//! - [`transfer`] - Deadlock-free money transfer workflow
//! - [`db`] - Connection pool management
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod db;
pub mod logging;
pub mod store;
pub mod transfer;

// Convenient re-exports at crate root
pub use db::Database;
pub use store::{
    Account, CancelHandle, Entry, Queries, Store, Transactional, Transfer, TxContext, TxError,
    TxHandle, ValidationError,
};
pub use transfer::{TransferTxParams, TransferTxResult};

//! Row types and query parameters for the bank store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Bank account
///
/// `balance` is held in minor units of `currency` and is only ever changed
/// through relative adjustments (see [`AddAccountBalanceParams`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub balance: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Ledger entry: one signed balance change on one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Entry {
    pub id: i64,
    pub account_id: i64,
    /// Negative for money out, positive for money in
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Money movement between two accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: i64,
    pub to_account_id: i64,
    /// Always positive
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Query parameters
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ListAccountsParams {
    pub limit: i64,
    pub offset: i64,
}

/// Relative balance adjustment: `balance = balance + amount`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AddAccountBalanceParams {
    pub id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreateEntryParams {
    pub account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ListEntriesParams {
    pub account_id: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreateTransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Transfers where `from_account_id` matches OR `to_account_id` matches
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ListTransfersParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub limit: i64,
    pub offset: i64,
}

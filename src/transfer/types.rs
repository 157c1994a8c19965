//! Transfer request and result types

use serde::{Deserialize, Serialize};

use crate::store::{Account, Entry, Transfer, ValidationError};

/// Input of a money transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    /// Account the money is moved out of
    pub from_account_id: i64,
    /// Account the money is moved into
    pub to_account_id: i64,
    /// Minor units, must be positive
    pub amount: i64,
}

impl TransferTxParams {
    pub fn new(from_account_id: i64, to_account_id: i64, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Reject requests that must never reach the store
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.amount <= 0 {
            return Err(ValidationError::InvalidAmount(self.amount));
        }
        if self.from_account_id == self.to_account_id {
            return Err(ValidationError::SameAccount(self.from_account_id));
        }
        Ok(())
    }
}

/// Everything a committed transfer produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    /// Source account after its balance was updated
    pub from_account: Account,
    /// Destination account after its balance was updated
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

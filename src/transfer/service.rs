//! Transfer workflow
//!
//! One transfer = one transaction:
//!
//! ```text
//! validate ─▶ BEGIN ─▶ transfer ─▶ entry(from, -amt) ─▶ entry(to, +amt)
//!                  ─▶ balance(min id) ─▶ balance(max id) ─▶ COMMIT
//! ```
//!
//! Balances are always updated smaller account id first. Two transfers over
//! the same pair of accounts, in either direction, therefore request the row
//! locks in the same order and cannot wait on each other in a cycle.

use tracing::{debug, info};

use super::types::{TransferTxParams, TransferTxResult};
use crate::store::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, Queries, Store,
    Transactional, TxContext, TxError,
};

impl<B: Transactional> Store<B> {
    /// Move `amount` from one account to another
    ///
    /// Creates the transfer record, one entry per account and adjusts both
    /// balances, all inside a single transaction. Nothing is visible unless
    /// every step succeeded.
    pub async fn transfer_tx(
        &self,
        ctx: &TxContext,
        arg: TransferTxParams,
    ) -> Result<TransferTxResult, TxError> {
        arg.validate()?;

        let result = self
            .exec_tx(ctx, move |q| {
                Box::pin(async move {
                    debug!("create transfer");
                    let transfer = q
                        .create_transfer(CreateTransferParams {
                            from_account_id: arg.from_account_id,
                            to_account_id: arg.to_account_id,
                            amount: arg.amount,
                        })
                        .await?;

                    debug!("create entry 1");
                    let from_entry = q
                        .create_entry(CreateEntryParams {
                            account_id: arg.from_account_id,
                            amount: -arg.amount,
                        })
                        .await?;

                    debug!("create entry 2");
                    let to_entry = q
                        .create_entry(CreateEntryParams {
                            account_id: arg.to_account_id,
                            amount: arg.amount,
                        })
                        .await?;

                    let (from_account, to_account) = if arg.from_account_id < arg.to_account_id {
                        add_money(
                            q,
                            arg.from_account_id,
                            -arg.amount,
                            arg.to_account_id,
                            arg.amount,
                        )
                        .await?
                    } else {
                        let (to_account, from_account) = add_money(
                            q,
                            arg.to_account_id,
                            arg.amount,
                            arg.from_account_id,
                            -arg.amount,
                        )
                        .await?;
                        (from_account, to_account)
                    };

                    Ok::<_, TxError>(TransferTxResult {
                        transfer,
                        from_account,
                        to_account,
                        from_entry,
                        to_entry,
                    })
                })
            })
            .await?;

        info!(
            tx = %ctx.label(),
            transfer_id = result.transfer.id,
            from_account_id = arg.from_account_id,
            to_account_id = arg.to_account_id,
            amount = arg.amount,
            "Transfer committed"
        );
        Ok(result)
    }
}

/// Apply two balance deltas in the order given; the first account's row is
/// locked first
async fn add_money<Q: Queries + ?Sized>(
    q: &mut Q,
    account_id1: i64,
    amount1: i64,
    account_id2: i64,
    amount2: i64,
) -> Result<(Account, Account), sqlx::Error> {
    debug!(account_id = account_id1, amount = amount1, "update balance");
    let account1 = q
        .add_account_balance(AddAccountBalanceParams {
            id: account_id1,
            amount: amount1,
        })
        .await?;

    debug!(account_id = account_id2, amount = amount2, "update balance");
    let account2 = q
        .add_account_balance(AddAccountBalanceParams {
            id: account_id2,
            amount: amount2,
        })
        .await?;

    Ok((account1, account2))
}

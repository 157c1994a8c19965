//! Query executor
//!
//! [`Queries`] is the narrow, single-statement interface the transaction
//! runner and workflows are written against. It is implemented for the base
//! connection pool and for an open transaction, so the same workflow code runs
//! either standalone or inside [`Store::exec_tx`](super::Store::exec_tx).

use async_trait::async_trait;
use sqlx::{PgExecutor, PgPool};

use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer,
};
use super::tx::PgTx;

/// Single-statement operations against the bank schema
///
/// Every method is one SQL statement; atomicity across several calls comes
/// only from running them on a transaction handle.
#[async_trait]
pub trait Queries: Send {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, sqlx::Error>;

    /// Fails with [`sqlx::Error::RowNotFound`] for an unknown id
    async fn get_account(&mut self, id: i64) -> Result<Account, sqlx::Error>;

    async fn list_accounts(&mut self, arg: ListAccountsParams)
    -> Result<Vec<Account>, sqlx::Error>;

    /// `balance = balance + amount`, evaluated by the store
    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, sqlx::Error>;

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, sqlx::Error>;

    async fn get_entry(&mut self, id: i64) -> Result<Entry, sqlx::Error>;

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, sqlx::Error>;

    async fn create_transfer(&mut self, arg: CreateTransferParams)
    -> Result<Transfer, sqlx::Error>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, sqlx::Error>;

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, sqlx::Error>;
}

// ============================================================================
// SQL
// ============================================================================

async fn create_account<'e, E: PgExecutor<'e>>(
    e: E,
    arg: CreateAccountParams,
) -> Result<Account, sqlx::Error> {
    sqlx::query_as::<_, Account>(
        r#"
        INSERT INTO accounts (owner, balance, currency)
        VALUES ($1, $2, $3)
        RETURNING id, owner, balance, currency, created_at
        "#,
    )
    .bind(arg.owner)
    .bind(arg.balance)
    .bind(arg.currency)
    .fetch_one(e)
    .await
}

async fn get_account<'e, E: PgExecutor<'e>>(e: E, id: i64) -> Result<Account, sqlx::Error> {
    sqlx::query_as::<_, Account>(
        "SELECT id, owner, balance, currency, created_at FROM accounts WHERE id = $1 LIMIT 1",
    )
    .bind(id)
    .fetch_one(e)
    .await
}

async fn list_accounts<'e, E: PgExecutor<'e>>(
    e: E,
    arg: ListAccountsParams,
) -> Result<Vec<Account>, sqlx::Error> {
    sqlx::query_as::<_, Account>(
        r#"
        SELECT id, owner, balance, currency, created_at
        FROM accounts
        ORDER BY id
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(arg.limit)
    .bind(arg.offset)
    .fetch_all(e)
    .await
}

async fn add_account_balance<'e, E: PgExecutor<'e>>(
    e: E,
    arg: AddAccountBalanceParams,
) -> Result<Account, sqlx::Error> {
    sqlx::query_as::<_, Account>(
        r#"
        UPDATE accounts
        SET balance = balance + $2
        WHERE id = $1
        RETURNING id, owner, balance, currency, created_at
        "#,
    )
    .bind(arg.id)
    .bind(arg.amount)
    .fetch_one(e)
    .await
}

async fn create_entry<'e, E: PgExecutor<'e>>(
    e: E,
    arg: CreateEntryParams,
) -> Result<Entry, sqlx::Error> {
    sqlx::query_as::<_, Entry>(
        r#"
        INSERT INTO entries (account_id, amount)
        VALUES ($1, $2)
        RETURNING id, account_id, amount, created_at
        "#,
    )
    .bind(arg.account_id)
    .bind(arg.amount)
    .fetch_one(e)
    .await
}

async fn get_entry<'e, E: PgExecutor<'e>>(e: E, id: i64) -> Result<Entry, sqlx::Error> {
    sqlx::query_as::<_, Entry>(
        "SELECT id, account_id, amount, created_at FROM entries WHERE id = $1 LIMIT 1",
    )
    .bind(id)
    .fetch_one(e)
    .await
}

async fn list_entries<'e, E: PgExecutor<'e>>(
    e: E,
    arg: ListEntriesParams,
) -> Result<Vec<Entry>, sqlx::Error> {
    sqlx::query_as::<_, Entry>(
        r#"
        SELECT id, account_id, amount, created_at
        FROM entries
        WHERE account_id = $1
        ORDER BY id
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(arg.account_id)
    .bind(arg.limit)
    .bind(arg.offset)
    .fetch_all(e)
    .await
}

async fn create_transfer<'e, E: PgExecutor<'e>>(
    e: E,
    arg: CreateTransferParams,
) -> Result<Transfer, sqlx::Error> {
    sqlx::query_as::<_, Transfer>(
        r#"
        INSERT INTO transfers (from_account_id, to_account_id, amount)
        VALUES ($1, $2, $3)
        RETURNING id, from_account_id, to_account_id, amount, created_at
        "#,
    )
    .bind(arg.from_account_id)
    .bind(arg.to_account_id)
    .bind(arg.amount)
    .fetch_one(e)
    .await
}

async fn get_transfer<'e, E: PgExecutor<'e>>(e: E, id: i64) -> Result<Transfer, sqlx::Error> {
    sqlx::query_as::<_, Transfer>(
        r#"
        SELECT id, from_account_id, to_account_id, amount, created_at
        FROM transfers
        WHERE id = $1
        LIMIT 1
        "#,
    )
    .bind(id)
    .fetch_one(e)
    .await
}

async fn list_transfers<'e, E: PgExecutor<'e>>(
    e: E,
    arg: ListTransfersParams,
) -> Result<Vec<Transfer>, sqlx::Error> {
    sqlx::query_as::<_, Transfer>(
        r#"
        SELECT id, from_account_id, to_account_id, amount, created_at
        FROM transfers
        WHERE from_account_id = $1 OR to_account_id = $2
        ORDER BY id
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(arg.from_account_id)
    .bind(arg.to_account_id)
    .bind(arg.limit)
    .bind(arg.offset)
    .fetch_all(e)
    .await
}

// ============================================================================
// Base connection
// ============================================================================

#[async_trait]
impl Queries for PgPool {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, sqlx::Error> {
        create_account(&*self, arg).await
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, sqlx::Error> {
        get_account(&*self, id).await
    }

    async fn list_accounts(
        &mut self,
        arg: ListAccountsParams,
    ) -> Result<Vec<Account>, sqlx::Error> {
        list_accounts(&*self, arg).await
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, sqlx::Error> {
        add_account_balance(&*self, arg).await
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, sqlx::Error> {
        create_entry(&*self, arg).await
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, sqlx::Error> {
        get_entry(&*self, id).await
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, sqlx::Error> {
        list_entries(&*self, arg).await
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, sqlx::Error> {
        create_transfer(&*self, arg).await
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, sqlx::Error> {
        get_transfer(&*self, id).await
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, sqlx::Error> {
        list_transfers(&*self, arg).await
    }
}

// ============================================================================
// Transaction handle
// ============================================================================

#[async_trait]
impl Queries for PgTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, sqlx::Error> {
        create_account(self.conn(), arg).await
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, sqlx::Error> {
        get_account(self.conn(), id).await
    }

    async fn list_accounts(
        &mut self,
        arg: ListAccountsParams,
    ) -> Result<Vec<Account>, sqlx::Error> {
        list_accounts(self.conn(), arg).await
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, sqlx::Error> {
        add_account_balance(self.conn(), arg).await
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, sqlx::Error> {
        create_entry(self.conn(), arg).await
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, sqlx::Error> {
        get_entry(self.conn(), id).await
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, sqlx::Error> {
        list_entries(self.conn(), arg).await
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, sqlx::Error> {
        create_transfer(self.conn(), arg).await
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, sqlx::Error> {
        get_transfer(self.conn(), id).await
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, sqlx::Error> {
        list_transfers(self.conn(), arg).await
    }
}

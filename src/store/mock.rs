//! In-memory store for tests
//!
//! Behaves like a read-committed database for the operations the bank uses:
//! - writes are staged per transaction and only applied on commit,
//! - `add_account_balance` takes a row lock held until commit/rollback,
//! - a row lock wait runs on its own task, like a statement on the server: it
//!   outlives a dropped caller, `rollback` waits for it and `abort` stops it,
//! - every call is recorded in order,
//! - failures and stalls can be injected per operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer,
};
use super::queries::Queries;
use super::tx::{Transactional, TxHandle};

/// Operation kinds that faults can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Begin,
    CreateAccount,
    GetAccount,
    ListAccounts,
    AddAccountBalance,
    CreateEntry,
    GetEntry,
    ListEntries,
    CreateTransfer,
    GetTransfer,
    ListTransfers,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Begin => "begin",
            Op::CreateAccount => "create_account",
            Op::GetAccount => "get_account",
            Op::ListAccounts => "list_accounts",
            Op::AddAccountBalance => "add_account_balance",
            Op::CreateEntry => "create_entry",
            Op::GetEntry => "get_entry",
            Op::ListEntries => "list_entries",
            Op::CreateTransfer => "create_transfer",
            Op::GetTransfer => "get_transfer",
            Op::ListTransfers => "list_transfers",
        }
    }
}

/// Recorded call, with the account it targeted where relevant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Begin,
    Commit,
    Rollback,
    Abort,
    CreateAccount,
    GetAccount(i64),
    ListAccounts,
    AddAccountBalance(i64),
    CreateEntry(i64),
    GetEntry(i64),
    ListEntries(i64),
    CreateTransfer { from: i64, to: i64 },
    GetTransfer(i64),
    ListTransfers,
}

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
    next_account_id: i64,
    next_entry_id: i64,
    next_transfer_id: i64,
}

#[derive(Default)]
struct Faults {
    fail_on: Option<(Op, usize)>,
    counts: HashMap<Op, usize>,
    stall_on: Option<Op>,
    fail_rollback: bool,
    fail_commit: bool,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    calls: Mutex<Vec<Call>>,
    faults: Mutex<Faults>,
}

impl Shared {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    /// Count the call and apply any injected fault for `op`
    async fn check(&self, op: Op) -> Result<(), sqlx::Error> {
        let (fail, stall) = {
            let mut faults = self.faults.lock().unwrap();
            let count = faults.counts.entry(op).or_insert(0);
            *count += 1;
            let nth = *count;
            (
                faults.fail_on == Some((op, nth)),
                faults.stall_on == Some(op),
            )
        };

        if fail {
            return Err(sqlx::Error::Protocol(format!(
                "injected {} failure",
                op.as_str()
            )));
        }
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn finish_rollback(&self) -> Result<(), sqlx::Error> {
        if self.faults.lock().unwrap().fail_rollback {
            return Err(sqlx::Error::Protocol("injected rollback failure".into()));
        }
        Ok(())
    }

    fn row_lock(&self, id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.row_locks
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .clone()
    }
}

/// Shared in-memory database; clones see the same data
#[derive(Clone, Default)]
pub struct MemStore {
    shared: Arc<Shared>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a committed account with a fixed id
    pub fn seed_account(&self, id: i64, balance: i64) -> Account {
        let account = Account {
            id,
            owner: format!("owner-{}", id),
            balance,
            currency: "USD".to_string(),
            created_at: Utc::now(),
        };
        let mut tables = self.shared.tables.lock().unwrap();
        tables.next_account_id = tables.next_account_id.max(id);
        tables.accounts.insert(id, account.clone());
        account
    }

    /// Committed balance of an account
    pub fn balance(&self, id: i64) -> Option<i64> {
        let tables = self.shared.tables.lock().unwrap();
        tables.accounts.get(&id).map(|a| a.balance)
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.shared.tables.lock().unwrap().entries.clone()
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.shared.tables.lock().unwrap().transfers.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.shared.calls.lock().unwrap().clear();
    }

    /// Fail the `nth` (1-based) call of `op`
    pub fn fail_on(&self, op: Op, nth: usize) {
        self.shared.faults.lock().unwrap().fail_on = Some((op, nth));
    }

    /// Never complete any call of `op`
    pub fn stall_on(&self, op: Op) {
        self.shared.faults.lock().unwrap().stall_on = Some(op);
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.shared.faults.lock().unwrap().fail_rollback = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        self.shared.faults.lock().unwrap().fail_commit = fail;
    }
}

#[async_trait]
impl Transactional for MemStore {
    type Tx = MemTx;

    async fn begin(&self) -> Result<MemTx, sqlx::Error> {
        self.shared.record(Call::Begin);
        self.shared.check(Op::Begin).await?;
        Ok(MemTx {
            shared: self.shared.clone(),
            new_accounts: BTreeMap::new(),
            deltas: BTreeMap::new(),
            entries: Vec::new(),
            transfers: Vec::new(),
            locks: HashMap::new(),
            lock_wait: None,
        })
    }
}

/// Open in-memory transaction
///
/// Row locks are released when the transaction is dropped, so an abandoned
/// transaction behaves like a closed connection.
pub struct MemTx {
    /// Row lock request still queued when the caller stopped waiting
    lock_wait: Option<JoinHandle<OwnedMutexGuard<()>>>,
    shared: Arc<Shared>,
    new_accounts: BTreeMap<i64, Account>,
    deltas: BTreeMap<i64, i64>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
    locks: HashMap<i64, OwnedMutexGuard<()>>,
}

impl MemTx {
    /// Account as seen by this transaction: committed row plus own writes
    fn visible_account(&self, id: i64) -> Option<Account> {
        let base = match self.new_accounts.get(&id) {
            Some(account) => account.clone(),
            None => self.shared.tables.lock().unwrap().accounts.get(&id)?.clone(),
        };
        let delta = self.deltas.get(&id).copied().unwrap_or(0);
        Some(Account {
            balance: base.balance + delta,
            ..base
        })
    }

    fn visible_entries(&self) -> Vec<Entry> {
        let mut all = self.shared.tables.lock().unwrap().entries.clone();
        all.extend(self.entries.iter().cloned());
        all
    }

    fn visible_transfers(&self) -> Vec<Transfer> {
        let mut all = self.shared.tables.lock().unwrap().transfers.clone();
        all.extend(self.transfers.iter().cloned());
        all
    }

    async fn lock_row(&mut self, id: i64) -> Result<(), sqlx::Error> {
        if self.locks.contains_key(&id) {
            return Ok(());
        }
        let lock = self.shared.row_lock(id);
        let wait = self
            .lock_wait
            .insert(tokio::spawn(async move { lock.lock_owned().await }));
        let acquired = wait.await;
        self.lock_wait = None;
        let guard = acquired.map_err(|e| sqlx::Error::Protocol(format!("row lock wait: {}", e)))?;
        self.locks.insert(id, guard);
        Ok(())
    }
}

fn page<T>(rows: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    rows.into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

#[async_trait]
impl Queries for MemTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, sqlx::Error> {
        self.shared.record(Call::CreateAccount);
        self.shared.check(Op::CreateAccount).await?;
        let id = {
            let mut tables = self.shared.tables.lock().unwrap();
            tables.next_account_id += 1;
            tables.next_account_id
        };
        let account = Account {
            id,
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        self.new_accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, sqlx::Error> {
        self.shared.record(Call::GetAccount(id));
        self.shared.check(Op::GetAccount).await?;
        self.visible_account(id).ok_or(sqlx::Error::RowNotFound)
    }

    async fn list_accounts(
        &mut self,
        arg: ListAccountsParams,
    ) -> Result<Vec<Account>, sqlx::Error> {
        self.shared.record(Call::ListAccounts);
        self.shared.check(Op::ListAccounts).await?;
        let mut ids: Vec<i64> = {
            let tables = self.shared.tables.lock().unwrap();
            tables.accounts.keys().copied().collect()
        };
        ids.extend(self.new_accounts.keys().copied());
        ids.sort_unstable();
        let rows = ids
            .into_iter()
            .filter_map(|id| self.visible_account(id))
            .collect();
        Ok(page(rows, arg.limit, arg.offset))
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, sqlx::Error> {
        self.shared.record(Call::AddAccountBalance(arg.id));
        self.shared.check(Op::AddAccountBalance).await?;
        if self.visible_account(arg.id).is_none() {
            return Err(sqlx::Error::RowNotFound);
        }
        self.lock_row(arg.id).await?;
        *self.deltas.entry(arg.id).or_insert(0) += arg.amount;
        self.visible_account(arg.id).ok_or(sqlx::Error::RowNotFound)
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, sqlx::Error> {
        self.shared.record(Call::CreateEntry(arg.account_id));
        self.shared.check(Op::CreateEntry).await?;
        let id = {
            let mut tables = self.shared.tables.lock().unwrap();
            tables.next_entry_id += 1;
            tables.next_entry_id
        };
        let entry = Entry {
            id,
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, sqlx::Error> {
        self.shared.record(Call::GetEntry(id));
        self.shared.check(Op::GetEntry).await?;
        self.visible_entries()
            .into_iter()
            .find(|e| e.id == id)
            .ok_or(sqlx::Error::RowNotFound)
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, sqlx::Error> {
        self.shared.record(Call::ListEntries(arg.account_id));
        self.shared.check(Op::ListEntries).await?;
        let mut rows: Vec<Entry> = self
            .visible_entries()
            .into_iter()
            .filter(|e| e.account_id == arg.account_id)
            .collect();
        rows.sort_by_key(|e| e.id);
        Ok(page(rows, arg.limit, arg.offset))
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, sqlx::Error> {
        self.shared.record(Call::CreateTransfer {
            from: arg.from_account_id,
            to: arg.to_account_id,
        });
        self.shared.check(Op::CreateTransfer).await?;
        let id = {
            let mut tables = self.shared.tables.lock().unwrap();
            tables.next_transfer_id += 1;
            tables.next_transfer_id
        };
        let transfer = Transfer {
            id,
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, sqlx::Error> {
        self.shared.record(Call::GetTransfer(id));
        self.shared.check(Op::GetTransfer).await?;
        self.visible_transfers()
            .into_iter()
            .find(|t| t.id == id)
            .ok_or(sqlx::Error::RowNotFound)
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, sqlx::Error> {
        self.shared.record(Call::ListTransfers);
        self.shared.check(Op::ListTransfers).await?;
        let mut rows: Vec<Transfer> = self
            .visible_transfers()
            .into_iter()
            .filter(|t| {
                t.from_account_id == arg.from_account_id || t.to_account_id == arg.to_account_id
            })
            .collect();
        rows.sort_by_key(|t| t.id);
        Ok(page(rows, arg.limit, arg.offset))
    }
}

#[async_trait]
impl TxHandle for MemTx {
    async fn commit(self) -> Result<(), sqlx::Error> {
        self.shared.record(Call::Commit);
        if self.shared.faults.lock().unwrap().fail_commit {
            return Err(sqlx::Error::Protocol("injected commit failure".into()));
        }

        let mut tables = self.shared.tables.lock().unwrap();
        for (id, account) in self.new_accounts {
            tables.accounts.insert(id, account);
        }
        for (id, delta) in self.deltas {
            if let Some(account) = tables.accounts.get_mut(&id) {
                account.balance += delta;
            }
        }
        tables.entries.extend(self.entries);
        tables.transfers.extend(self.transfers);
        // row locks in `self.locks` drop after the write is visible
        drop(tables);
        drop(self.locks);
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), sqlx::Error> {
        self.shared.record(Call::Rollback);
        // the queued statement has to finish before the rollback is read
        if let Some(wait) = self.lock_wait.take() {
            let _ = wait.await;
        }
        self.shared.finish_rollback()
    }

    async fn abort(mut self) -> Result<(), sqlx::Error> {
        self.shared.record(Call::Abort);
        if let Some(wait) = self.lock_wait.take() {
            wait.abort();
        }
        self.shared.finish_rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let mem = MemStore::new();
        mem.seed_account(1, 100);

        let mut tx = mem.begin().await.unwrap();
        let account = tx
            .add_account_balance(AddAccountBalanceParams { id: 1, amount: 25 })
            .await
            .unwrap();
        assert_eq!(account.balance, 125);
        assert_eq!(mem.balance(1), Some(100));

        tx.commit().await.unwrap();
        assert_eq!(mem.balance(1), Some(125));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let mem = MemStore::new();
        mem.seed_account(1, 100);

        let mut tx = mem.begin().await.unwrap();
        tx.create_entry(CreateEntryParams {
            account_id: 1,
            amount: 5,
        })
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        assert!(mem.entries().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_account_is_row_not_found() {
        let mem = MemStore::new();
        let mut tx = mem.begin().await.unwrap();
        let err = tx
            .add_account_balance(AddAccountBalanceParams { id: 9, amount: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, sqlx::Error::RowNotFound));
    }

    /// Holds row 1 in one transaction and leaves a second one queued on it
    async fn queued_behind_holder(mem: &MemStore) -> (MemTx, MemTx) {
        mem.seed_account(1, 100);
        let mut holder = mem.begin().await.unwrap();
        holder
            .add_account_balance(AddAccountBalanceParams { id: 1, amount: 1 })
            .await
            .unwrap();

        let mut queued = mem.begin().await.unwrap();
        let waited = tokio::time::timeout(
            Duration::from_millis(20),
            queued.add_account_balance(AddAccountBalanceParams { id: 1, amount: 2 }),
        )
        .await;
        assert!(waited.is_err(), "row lock should still be held");
        (holder, queued)
    }

    #[tokio::test]
    async fn test_rollback_waits_for_queued_lock() {
        let mem = MemStore::new();
        let (holder, queued) = queued_behind_holder(&mem).await;

        let rollback = tokio::spawn(queued.rollback());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!rollback.is_finished());

        holder.commit().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), rollback)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(mem.balance(1), Some(101));
    }

    #[tokio::test]
    async fn test_abort_stops_queued_lock() {
        let mem = MemStore::new();
        let (holder, queued) = queued_behind_holder(&mem).await;

        tokio::time::timeout(Duration::from_secs(1), queued.abort())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mem.calls().last(), Some(&Call::Abort));

        // the aborted request no longer sits in the lock queue
        holder.commit().await.unwrap();
        let mut next = mem.begin().await.unwrap();
        let account = tokio::time::timeout(
            Duration::from_secs(1),
            next.add_account_balance(AddAccountBalanceParams { id: 1, amount: 10 }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(account.balance, 111);
    }

    #[tokio::test]
    async fn test_fail_on_nth_call() {
        let mem = MemStore::new();
        mem.seed_account(1, 0);
        mem.fail_on(Op::CreateEntry, 2);

        let mut tx = mem.begin().await.unwrap();
        let p = CreateEntryParams {
            account_id: 1,
            amount: 1,
        };
        assert!(tx.create_entry(p).await.is_ok());
        assert!(tx.create_entry(p).await.is_err());
    }
}

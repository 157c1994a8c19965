//! Transaction runner
//!
//! [`Store::exec_tx`] wraps a unit of work in BEGIN / COMMIT / ROLLBACK and
//! owns the error policy:
//!
//! ```text
//! begin ──▶ work(&mut tx) ──Ok──▶ commit ──Err──▶ TxError::Commit
//!                  │
//!                 Err ─────────────▶ rollback ─┐
//!                  │                           │
//!             timeout / cancel ──▶ abort ──────┤
//!                                              ├─Err──▶ TxError::Rollback { work, rollback }
//!                                              └─Ok───▶ original work error
//! ```
//!
//! No retries, no in-process locks. Ordering between concurrent callers is
//! left entirely to the store's row locks.

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::{Connection, PgConnection, PgPool, Postgres, Transaction};
use tracing::{Instrument, debug, warn};

use super::context::TxContext;
use super::error::TxError;
use super::queries::Queries;

/// An open transaction that can run queries and then be finished
#[async_trait]
pub trait TxHandle: Queries + Send {
    async fn commit(self) -> Result<(), sqlx::Error>;

    /// Roll back once the last statement has completed
    async fn rollback(self) -> Result<(), sqlx::Error>;

    /// Roll back while a statement may still be running on the server
    ///
    /// Used after a timeout or cancellation dropped the work mid-statement.
    /// The running statement is stopped instead of waited for.
    async fn abort(self) -> Result<(), sqlx::Error>;
}

/// Something that can open transactions
#[async_trait]
pub trait Transactional: Send + Sync {
    type Tx: TxHandle;

    /// Open a transaction with the store's default isolation level
    async fn begin(&self) -> Result<Self::Tx, sqlx::Error>;
}

/// Transaction on a pooled PostgreSQL connection
///
/// Remembers the server process it runs on so an interrupted statement can
/// be cancelled from a separate connection.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
    pool: PgPool,
    backend_pid: i32,
}

impl PgTx {
    pub(super) fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Server process id of the connection this transaction runs on
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    async fn cancel_running_statement(&self) -> Result<(), sqlx::Error> {
        // The pool may be exhausted by transactions queued behind ours
        let mut conn = PgConnection::connect_with(&self.pool.connect_options()).await?;
        sqlx::query("SELECT pg_cancel_backend($1)")
            .bind(self.backend_pid)
            .execute(&mut conn)
            .await?;
        conn.close().await
    }
}

#[async_trait]
impl TxHandle for PgTx {
    async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }

    async fn abort(mut self) -> Result<(), sqlx::Error> {
        self.cancel_running_statement().await?;
        debug!(backend_pid = self.backend_pid, "running statement cancelled");

        // An interrupted statement leaves its reply unread; the first ping
        // consumes the error, the second waits for the connection to idle
        if let Err(e) = self.tx.ping().await {
            debug!(error = %e, "interrupted statement reply drained");
            self.tx.ping().await?;
        }
        self.tx.rollback().await
    }
}

#[async_trait]
impl Transactional for PgPool {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, sqlx::Error> {
        let mut tx = PgPool::begin(self).await?;
        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *tx)
            .await?;
        Ok(PgTx {
            tx,
            pool: self.clone(),
            backend_pid,
        })
    }
}

/// Executes queries and transactions against a backend
#[derive(Debug, Clone)]
pub struct Store<B> {
    backend: B,
}

impl<B: Transactional> Store<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Underlying backend, for statements that need no transaction
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run `work` inside a single database transaction
    ///
    /// `work` borrows the transaction only for the lifetime of the future it
    /// returns. Its error is returned unchanged after a successful rollback;
    /// if the rollback fails as well both causes are kept in
    /// [`TxError::Rollback`].
    ///
    /// The timeout and cancel signal of `ctx` cover begin and the work. When
    /// either fires during the work, the transaction is aborted: a statement
    /// still running on the server is stopped, then rolled back. Commit is
    /// never interrupted.
    pub async fn exec_tx<T, F>(&self, ctx: &TxContext, work: F) -> Result<T, TxError>
    where
        T: Send,
        F: for<'q> FnOnce(&'q mut B::Tx) -> BoxFuture<'q, Result<T, TxError>> + Send,
    {
        let span = ctx.span();

        async move {
            let deadline = ctx.deadline();

            let mut tx = ctx
                .guard(deadline, async {
                    self.backend.begin().await.map_err(TxError::Begin)
                })
                .await?;
            debug!("transaction started");

            let outcome = ctx.guard(deadline, work(&mut tx)).await;

            let err = match outcome {
                Ok(value) => {
                    tx.commit().await.map_err(|e| {
                        warn!(error = %e, "commit failed");
                        TxError::Commit(e)
                    })?;
                    debug!("transaction committed");
                    return Ok(value);
                }
                Err(err) => err,
            };

            let finished = if err.is_interrupted() {
                tx.abort().await
            } else {
                tx.rollback().await
            };

            match finished {
                Ok(()) => {
                    debug!(error = %err, code = err.code(), "transaction rolled back");
                    Err(err)
                }
                Err(rb_err) => {
                    warn!(error = %err, rollback_error = %rb_err, "rollback failed");
                    Err(TxError::with_rollback(err, rb_err))
                }
            }
        }
        .instrument(span)
        .await
    }
}

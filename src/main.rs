//! simple_bank - store health check
//!
//! Loads `config/<env>.yaml`, sets up logging, opens the PostgreSQL pool and
//! verifies the bank schema is reachable from inside a transaction, bounded
//! by the configured transfer timeout. Ctrl-C cancels the check.

use anyhow::Context;

use simple_bank::config::AppConfig;
use simple_bank::logging::init_logging;
use simple_bank::store::{CancelHandle, ListAccountsParams, Queries, TxError};
use simple_bank::Database;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _guard = init_logging(&config);

    tracing::info!(env = %env, "simple_bank starting");

    let url = config
        .postgres_url
        .as_deref()
        .context("postgres_url is not configured")?;

    let db = Database::connect(url, &config.database).await?;
    db.health_check().await?;

    let cancel = CancelHandle::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let ctx = config
        .transfer
        .tx_context()
        .with_label("startup")
        .with_cancel(&cancel);

    let accounts = db
        .store()
        .exec_tx(&ctx, |q| {
            Box::pin(async move {
                let accounts = q
                    .list_accounts(ListAccountsParams {
                        limit: 100,
                        offset: 0,
                    })
                    .await?;
                Ok::<_, TxError>(accounts)
            })
        })
        .await
        .context("accounts table not reachable")?;

    tracing::info!(
        accounts = accounts.len(),
        transfer_timeout_ms = ?config.transfer.timeout_ms,
        "store ready"
    );
    Ok(())
}

//! The rewards ledger: ad-watch reward tasks, balances, referrals and
//! withdrawals behind a JSON API.

mod api;
mod config;
mod error;
mod responses;

pub mod engine;
pub mod ledger;
pub mod service;
pub mod session;
pub mod types;
pub mod withdraw;

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

pub use api::{AppState, init_router};
pub use crate::config::{Config, LedgerBackend};
pub use engine::{Countdown, EngineError, RewardTaskEngine, TaskEvent};
pub use ledger::{Ledger, LedgerError, MemoryLedger, PgLedger};
pub use service::{RewardsError, RewardsService};
pub use session::{Session, SessionRegistry, UserId};

/// The reward credited for one completed ad watch.
pub const TASK_REWARD: Decimal = dec!(0.10);
/// The default length of an ad watch, in seconds.
pub const TASK_DURATION_SECS: u32 = 60;
/// The smallest amount that can be withdrawn.
pub const MIN_WITHDRAWAL: Decimal = dec!(5.00);
/// The bonus a referrer earns when someone signs up with their code.
pub const REFERRAL_BONUS: Decimal = dec!(1.00);
/// How many ad watches a day the progress bar counts towards.
pub const DAILY_TASK_GOAL: u32 = 10;
/// How many tasks the earn view lists.
pub const RECENT_TASK_LIMIT: usize = 3;

/// Initializes the database pool.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}

/// Builds the ledger selected by the configuration.
pub async fn init_ledger(config: &Config) -> Result<Arc<dyn Ledger>> {
    match config.ledger_backend {
        LedgerBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres ledger")?;
            let pool = init_pool(url, config.db_max_connections).await?;
            let ledger = PgLedger::new(pool);
            ledger.migrate().await.context("Failed to run migrations")?;
            info!("using postgres ledger");
            Ok(Arc::new(ledger))
        }
        LedgerBackend::Memory => {
            info!("using in-memory ledger");
            Ok(Arc::new(MemoryLedger::new()))
        }
    }
}

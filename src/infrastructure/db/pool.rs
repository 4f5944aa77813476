use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, Pool, Postgres};
use tracing::info;
use tracing::log::LevelFilter;

pub type DbPool = Pool<Postgres>;

const SLOW_STATEMENT: Duration = Duration::from_millis(500);

/// Connections reserved for request handlers on top of one per transcode
/// worker and one per maintenance loop.
const HANDLER_CONNECTIONS: u32 = 10;

/// Opens the Postgres pool sized for `background_tasks` long-running loops,
/// each of which may hold a connection while settling a job.
pub async fn connect_to_db(connection_string: &str, background_tasks: usize) -> Result<DbPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(connection_string)?
        .log_statements(LevelFilter::Debug)
        .log_slow_statements(LevelFilter::Warn, SLOW_STATEMENT);

    let max = HANDLER_CONNECTIONS + background_tasks as u32;

    let pool = PgPoolOptions::new()
        .max_connections(max)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .connect_with(options)
        .await?;

    info!("✅ Connected to PostgreSQL (pool of up to {})", max);
    Ok(pool)
}

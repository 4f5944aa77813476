use redis::{Client, RedisResult, aio::MultiplexedConnection};
use tracing::info;

/// Shared Redis handle. The multiplexed connection is cheap to clone and
/// safe to use from many tasks at once.
#[derive(Clone)]
pub struct RedisService {
    conn: MultiplexedConnection,
}

impl RedisService {
    pub async fn new(connection_string: &str) -> RedisResult<Self> {
        let client = Client::open(connection_string)?;
        let service = Self {
            conn: client.get_multiplexed_async_connection().await?,
        };

        service.ping().await?;

        info!("✅ Connected to Redis");
        Ok(service)
    }

    pub fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

//! Thin lapin wrapper. Messages on these queues are hints and alerts; the
//! job table stays the source of truth, so a lost message is never fatal.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const TRANSCODE_QUEUE: &str = "transcoding_tasks";
pub const OPERATOR_ALERT_QUEUE: &str = "operator_alerts";

const PERSISTENT: u8 = 2;
const NUDGE_PREFETCH: u16 = 16;

struct Link {
    conn: Connection,
    publisher: Channel,
    declared: HashSet<String>,
}

impl Link {
    async fn open(url: &str) -> Result<Self> {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;
        let publisher = conn.create_channel().await.context("Failed to open publish channel")?;

        Ok(Self { conn, publisher, declared: HashSet::new() })
    }

    async fn ensure_queue(&mut self, queue: &str) -> Result<()> {
        if !self.declared.contains(queue) {
            declare(&self.publisher, queue).await?;
            self.declared.insert(queue.to_string());
        }
        Ok(())
    }
}

async fn declare(channel: &Channel, queue: &str) -> Result<()> {
    let options = QueueDeclareOptions { durable: true, ..Default::default() };
    channel
        .queue_declare(queue, options, FieldTable::default())
        .await
        .map_err(|e| anyhow!("Failed to declare queue {}: {}", queue, e))?;
    Ok(())
}

#[derive(Clone)]
pub struct RabbitMqService {
    url: Arc<str>,
    link: Arc<Mutex<Link>>,
}

impl RabbitMqService {
    pub async fn new(url: &str) -> Result<Self> {
        let link = Link::open(url).await?;
        info!("✅ Connected to RabbitMQ");

        Ok(Self { url: url.into(), link: Arc::new(Mutex::new(link)) })
    }

    async fn send(&self, queue: &str, payload: &[u8], properties: BasicProperties) -> Result<()> {
        let mut link = self.link.lock().await;
        link.ensure_queue(queue).await?;

        link.publisher
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(|e| anyhow!("Failed to publish to {}: {}", queue, e))?
            .await
            .map_err(|e| anyhow!("Broker did not confirm publish to {}: {}", queue, e))?;

        debug!("Published {} bytes to {}", payload.len(), queue);
        Ok(())
    }

    /// Publishes once, and on failure reopens the connection and tries a
    /// second time.
    pub async fn publish(&self, queue: &str, payload: &[u8], properties: BasicProperties) -> Result<()> {
        let properties = properties.with_delivery_mode(PERSISTENT);

        if let Err(first) = self.send(queue, payload, properties.clone()).await {
            warn!("RabbitMQ publish failed ({}), reconnecting", first);
            *self.link.lock().await = Link::open(&self.url).await?;
            self.send(queue, payload, properties).await?;
        }

        Ok(())
    }

    pub async fn publish_json<T: Serialize>(&self, queue: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let properties = BasicProperties::default().with_content_type("application/json".into());
        self.publish(queue, &payload, properties).await
    }

    /// Opens a consumer on a dedicated channel so long-lived consumers never
    /// contend with publishers for the link lock.
    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Consumer> {
        let channel = {
            let link = self.link.lock().await;
            link.conn.create_channel().await.context("Failed to open consumer channel")?
        };

        declare(&channel, queue).await?;
        channel
            .basic_qos(NUDGE_PREFETCH, BasicQosOptions::default())
            .await
            .context("Failed to set consumer prefetch")?;

        channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| anyhow!("Failed to consume from {}: {}", queue, e))
    }
}

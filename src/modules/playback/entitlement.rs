use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::FromRow;
use uuid::Uuid;

use super::model::Entitlement;
use crate::infrastructure::db::pool::DbPool;

/// The subscription collaborator. Only its answer matters here; plans,
/// billing and payment reconciliation live elsewhere.
#[async_trait]
pub trait EntitlementProvider: Send + Sync {
    async fn entitlement(&self, account_id: Uuid) -> Result<Entitlement>;
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    max_devices: Option<i32>,
}

/// Reads the `subscriptions` table maintained by the billing service.
#[derive(Clone)]
pub struct PgEntitlements {
    pool: DbPool,
    default_ceiling: u32,
}

impl PgEntitlements {
    pub fn new(pool: DbPool, default_ceiling: u32) -> Self {
        Self { pool, default_ceiling }
    }
}

#[async_trait]
impl EntitlementProvider for PgEntitlements {
    async fn entitlement(&self, account_id: Uuid) -> Result<Entitlement> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT max_devices
            FROM subscriptions
            WHERE account_id = $1
              AND status = 'active'
              AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY max_devices DESC NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to read subscription: {}", e))?;

        Ok(match row {
            Some(row) => Entitlement {
                active: true,
                device_ceiling: row
                    .max_devices
                    .map(|n| n.max(0) as u32)
                    .unwrap_or(self.default_ceiling),
            },
            None => Entitlement { active: false, device_ceiling: 0 },
        })
    }
}

/// Static answers, for tests and local runs without a billing database.
#[derive(Debug, Clone, Default)]
pub struct FixedEntitlements {
    accounts: HashMap<Uuid, Entitlement>,
    fallback: Option<Entitlement>,
}

impl FixedEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, account_id: Uuid, entitlement: Entitlement) -> Self {
        self.accounts.insert(account_id, entitlement);
        self
    }

    /// Answer for accounts not listed explicitly. Without one they are
    /// not entitled.
    pub fn otherwise(mut self, entitlement: Entitlement) -> Self {
        self.fallback = Some(entitlement);
        self
    }
}

#[async_trait]
impl EntitlementProvider for FixedEntitlements {
    async fn entitlement(&self, account_id: Uuid) -> Result<Entitlement> {
        Ok(self
            .accounts
            .get(&account_id)
            .copied()
            .or(self.fallback)
            .unwrap_or(Entitlement { active: false, device_ceiling: 0 }))
    }
}

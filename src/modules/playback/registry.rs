use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{Activation, DenialReason, DeviceSession};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Active playback devices per account.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Counts the account's active devices and inserts this one in a single
    /// atomic step. Re-activating an already active device refreshes it
    /// without using another slot.
    async fn activate(
        &self,
        account_id: Uuid,
        device_id: &str,
        ceiling: u32,
        now: OffsetDateTime,
    ) -> Result<Activation, RegistryError>;

    /// Ends the session and forgets the device. Idempotent.
    async fn deactivate(&self, account_id: Uuid, device_id: &str) -> Result<(), RegistryError>;

    async fn is_active(&self, account_id: Uuid, device_id: &str) -> Result<bool, RegistryError>;

    /// Bumps `last_accessed_at` if the session is still active. Returns
    /// whether it was.
    async fn touch(&self, account_id: Uuid, device_id: &str, now: OffsetDateTime) -> Result<bool, RegistryError>;

    /// Sessions not yet ended, most recently used first.
    async fn list(&self, account_id: Uuid) -> Result<Vec<DeviceSession>, RegistryError>;

    /// Ends every session last accessed before `cutoff`.
    async fn sweep(&self, cutoff: OffsetDateTime) -> Result<usize, RegistryError>;
}

#[derive(Default)]
pub struct MemoryDeviceRegistry {
    accounts: Mutex<HashMap<Uuid, HashMap<String, DeviceSession>>>,
}

impl MemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

fn active_count(devices: &HashMap<String, DeviceSession>) -> u32 {
    devices.values().filter(|d| d.is_active).count() as u32
}

#[async_trait]
impl DeviceRegistry for MemoryDeviceRegistry {
    async fn activate(
        &self,
        account_id: Uuid,
        device_id: &str,
        ceiling: u32,
        now: OffsetDateTime,
    ) -> Result<Activation, RegistryError> {
        let mut accounts = self.accounts.lock().await;
        let devices = accounts.entry(account_id).or_default();

        if let Some(existing) = devices.get_mut(device_id).filter(|d| d.is_active) {
            existing.last_accessed_at = now;
            return Ok(Activation::granted(active_count(devices)));
        }

        let count = active_count(devices);
        if count >= ceiling {
            return Ok(Activation::denied(DenialReason::DeviceLimitExceeded, count));
        }

        devices.insert(
            device_id.to_string(),
            DeviceSession {
                account_id,
                device_id: device_id.to_string(),
                is_active: true,
                last_accessed_at: now,
            },
        );
        Ok(Activation::granted(count + 1))
    }

    async fn deactivate(&self, account_id: Uuid, device_id: &str) -> Result<(), RegistryError> {
        let mut accounts = self.accounts.lock().await;
        if let Some(devices) = accounts.get_mut(&account_id) {
            devices.remove(device_id);
            if devices.is_empty() {
                accounts.remove(&account_id);
            }
        }
        Ok(())
    }

    async fn is_active(&self, account_id: Uuid, device_id: &str) -> Result<bool, RegistryError> {
        Ok(self
            .accounts
            .lock()
            .await
            .get(&account_id)
            .and_then(|devices| devices.get(device_id))
            .is_some_and(|d| d.is_active))
    }

    async fn touch(&self, account_id: Uuid, device_id: &str, now: OffsetDateTime) -> Result<bool, RegistryError> {
        let mut accounts = self.accounts.lock().await;
        match accounts
            .get_mut(&account_id)
            .and_then(|devices| devices.get_mut(device_id))
            .filter(|d| d.is_active)
        {
            Some(session) => {
                session.last_accessed_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, account_id: Uuid) -> Result<Vec<DeviceSession>, RegistryError> {
        let mut sessions: Vec<_> = self
            .accounts
            .lock()
            .await
            .get(&account_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default();
        sessions.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        Ok(sessions)
    }

    async fn sweep(&self, cutoff: OffsetDateTime) -> Result<usize, RegistryError> {
        let mut swept = 0;
        let mut accounts = self.accounts.lock().await;
        for devices in accounts.values_mut() {
            let before = devices.len();
            devices.retain(|_, session| session.is_active && session.last_accessed_at >= cutoff);
            swept += before - devices.len();
        }
        accounts.retain(|_, devices| !devices.is_empty());
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use time::Duration;

    #[tokio::test]
    async fn reactivation_does_not_use_a_slot() {
        let registry = MemoryDeviceRegistry::new();
        let account = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        assert!(registry.activate(account, "a", 1, now).await.unwrap().granted);
        let again = registry.activate(account, "a", 1, now).await.unwrap();
        assert!(again.granted);
        assert_eq!(again.active_devices, 1);
    }

    #[tokio::test]
    async fn racing_activations_respect_ceiling() {
        let registry = Arc::new(MemoryDeviceRegistry::new());
        let account = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        let mut handles = Vec::new();
        for i in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.activate(account, &format!("dev-{i}"), 2, now).await.unwrap()
            }));
        }

        let mut granted = 0;
        for h in handles {
            if h.await.unwrap().granted {
                granted += 1;
            }
        }
        assert_eq!(granted, 2);
        let active = registry.list(account).await.unwrap().into_iter().filter(|d| d.is_active).count();
        assert_eq!(active, 2);
    }

    #[tokio::test]
    async fn sweep_frees_idle_devices() {
        let registry = MemoryDeviceRegistry::new();
        let account = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        registry.activate(account, "old", 2, now - Duration::hours(2)).await.unwrap();
        registry.activate(account, "new", 2, now).await.unwrap();

        assert_eq!(registry.sweep(now - Duration::hours(1)).await.unwrap(), 1);
        assert!(!registry.is_active(account, "old").await.unwrap());
        assert!(registry.is_active(account, "new").await.unwrap());
        assert!(!registry.touch(account, "old", now).await.unwrap());
        assert!(registry.activate(account, "third", 2, now).await.unwrap().granted);
    }

    #[tokio::test]
    async fn ended_sessions_leave_no_trace() {
        let registry = MemoryDeviceRegistry::new();
        let account = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        registry.activate(account, "phone", 3, now - Duration::hours(2)).await.unwrap();
        registry.activate(account, "tv", 3, now).await.unwrap();
        registry.activate(account, "tablet", 3, now).await.unwrap();

        registry.deactivate(account, "tv").await.unwrap();
        registry.deactivate(account, "tv").await.unwrap();
        registry.sweep(now - Duration::hours(1)).await.unwrap();

        let listed: Vec<_> = registry.list(account).await.unwrap().into_iter().map(|d| d.device_id).collect();
        assert_eq!(listed, vec!["tablet".to_string()]);

        registry.deactivate(account, "tablet").await.unwrap();
        assert!(registry.accounts.lock().await.is_empty());
    }
}

//! Read-through cache over the device/sensor/certificate registry.
//!
//! The registry itself - schema, transport, SQL - is an external
//! collaborator (see the specification's out-of-scope section); this module
//! only owns the cache and the trait boundary the core talks to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const CACHE_TTL: Duration = Duration::from_secs(900);

/// A device row as returned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    /// Registered device time-zone offset in hours, `[-12, 14]` when present.
    pub tz_offset_hours: Option<i32>,
}

/// A single sensor row, keyed by sensor key in [`lookup_sensor_meta`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorRecord {
    pub key: String,
    pub value: String,
}

/// The external registry/lookup-service interface. The core never owns
/// schema or transport; it only calls these three lookups.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn lookup_device(&self, device_id: &str) -> anyhow::Result<Option<DeviceRecord>>;
    async fn lookup_sensor_meta(
        &self,
        device_id: &str,
    ) -> anyhow::Result<HashMap<String, SensorRecord>>;
    /// Certificate PEM lookups are never cached (security posture).
    async fn lookup_certificate(&self, device_id: &str) -> anyhow::Result<Option<String>>;
}

struct CacheEntry<T> {
    value: T,
    inserted_at: Instant,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self) -> bool {
        self.inserted_at.elapsed() < CACHE_TTL
    }
}

/// A read-through cache decorating any [`DeviceRegistry`]. Device and sensor
/// lookups are memoized with a 900s TTL; certificate lookups always pass
/// through. A load failure returns an empty result and does not populate the
/// cache with a negative entry, so a subsequent call retries the backend.
pub struct CachedRegistry<R: DeviceRegistry> {
    inner: Arc<R>,
    devices: RwLock<HashMap<String, CacheEntry<Option<DeviceRecord>>>>,
    sensors: RwLock<HashMap<String, CacheEntry<HashMap<String, SensorRecord>>>>,
}

impl<R: DeviceRegistry> CachedRegistry<R> {
    pub fn new(inner: Arc<R>) -> Self {
        Self {
            inner,
            devices: RwLock::new(HashMap::new()),
            sensors: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<R: DeviceRegistry> DeviceRegistry for CachedRegistry<R> {
    async fn lookup_device(&self, device_id: &str) -> anyhow::Result<Option<DeviceRecord>> {
        if let Some(entry) = self.devices.read().await.get(device_id) {
            if entry.is_fresh() {
                return Ok(entry.value.clone());
            }
        }

        match self.inner.lookup_device(device_id).await {
            Ok(value) => {
                self.devices.write().await.insert(
                    device_id.to_string(),
                    CacheEntry {
                        value: value.clone(),
                        inserted_at: Instant::now(),
                    },
                );
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(device_id, error = %e, "device lookup failed, returning no metadata");
                Ok(None)
            }
        }
    }

    async fn lookup_sensor_meta(
        &self,
        device_id: &str,
    ) -> anyhow::Result<HashMap<String, SensorRecord>> {
        if let Some(entry) = self.sensors.read().await.get(device_id) {
            if entry.is_fresh() {
                return Ok(entry.value.clone());
            }
        }

        match self.inner.lookup_sensor_meta(device_id).await {
            Ok(value) => {
                self.sensors.write().await.insert(
                    device_id.to_string(),
                    CacheEntry {
                        value: value.clone(),
                        inserted_at: Instant::now(),
                    },
                );
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(device_id, error = %e, "sensor lookup failed, returning empty map");
                Ok(HashMap::new())
            }
        }
    }

    async fn lookup_certificate(&self, device_id: &str) -> anyhow::Result<Option<String>> {
        // Never cached: a revoked certificate must take effect immediately.
        self.inner.lookup_certificate(device_id).await
    }
}

/// An in-memory reference registry, used by tests and single-node
/// deployments that seed device/certificate data directly rather than
/// through a real registry backend.
#[derive(Default)]
pub struct StaticRegistry {
    devices: HashMap<String, DeviceRecord>,
    sensors: HashMap<String, HashMap<String, SensorRecord>>,
    certificates: HashMap<String, String>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: DeviceRecord) -> Self {
        self.devices.insert(device.device_id.clone(), device);
        self
    }

    pub fn with_sensors(mut self, device_id: &str, sensors: HashMap<String, SensorRecord>) -> Self {
        self.sensors.insert(device_id.to_string(), sensors);
        self
    }

    pub fn with_certificate(mut self, device_id: &str, pem: String) -> Self {
        self.certificates.insert(device_id.to_string(), pem);
        self
    }
}

#[async_trait]
impl DeviceRegistry for StaticRegistry {
    async fn lookup_device(&self, device_id: &str) -> anyhow::Result<Option<DeviceRecord>> {
        Ok(self.devices.get(device_id).cloned())
    }

    async fn lookup_sensor_meta(
        &self,
        device_id: &str,
    ) -> anyhow::Result<HashMap<String, SensorRecord>> {
        Ok(self.sensors.get(device_id).cloned().unwrap_or_default())
    }

    async fn lookup_certificate(&self, device_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.certificates.get(device_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_memoizes_device_lookups() {
        struct CountingRegistry {
            calls: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl DeviceRegistry for CountingRegistry {
            async fn lookup_device(&self, device_id: &str) -> anyhow::Result<Option<DeviceRecord>> {
                self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(Some(DeviceRecord {
                    device_id: device_id.to_string(),
                    tz_offset_hours: Some(2),
                }))
            }
            async fn lookup_sensor_meta(
                &self,
                _device_id: &str,
            ) -> anyhow::Result<HashMap<String, SensorRecord>> {
                Ok(HashMap::new())
            }
            async fn lookup_certificate(&self, _device_id: &str) -> anyhow::Result<Option<String>> {
                Ok(None)
            }
        }

        let inner = Arc::new(CountingRegistry {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let cached = CachedRegistry::new(inner.clone());

        cached.lookup_device("devA").await.unwrap();
        cached.lookup_device("devA").await.unwrap();
        assert_eq!(inner.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn load_failure_returns_empty_without_caching_negative() {
        struct FailingRegistry;

        #[async_trait]
        impl DeviceRegistry for FailingRegistry {
            async fn lookup_device(&self, _device_id: &str) -> anyhow::Result<Option<DeviceRecord>> {
                anyhow::bail!("backend unreachable")
            }
            async fn lookup_sensor_meta(
                &self,
                _device_id: &str,
            ) -> anyhow::Result<HashMap<String, SensorRecord>> {
                anyhow::bail!("backend unreachable")
            }
            async fn lookup_certificate(&self, _device_id: &str) -> anyhow::Result<Option<String>> {
                Ok(None)
            }
        }

        let cached = CachedRegistry::new(Arc::new(FailingRegistry));
        let result = cached.lookup_device("devA").await.unwrap();
        assert!(result.is_none());

        let sensors = cached.lookup_sensor_meta("devA").await.unwrap();
        assert!(sensors.is_empty());
    }

    #[tokio::test]
    async fn certificate_lookups_are_never_cached() {
        let registry = Arc::new(
            StaticRegistry::new().with_certificate("devA", "---CERT v1---".to_string()),
        );
        let cached = CachedRegistry::new(registry);
        assert_eq!(
            cached.lookup_certificate("devA").await.unwrap(),
            Some("---CERT v1---".to_string())
        );
    }
}

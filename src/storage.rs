//! Storage adapter contract and the bounded-concurrency worker that drains
//! `captured` events, invokes the adapter, and republishes `stored`/`failed`.

use crate::errors::FailureStage;
use crate::events::{day_bucket, EventBus, SnapshotCapturedEvent, SnapshotFailedEvent, SnapshotStoredEvent};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// What the storage worker hands the adapter for one snapshot.
pub struct StoreRequest {
    pub local_path: String,
    pub device_id: String,
    pub payload_id: Option<String>,
    pub captured_at: chrono::DateTime<chrono::Utc>,
    pub day: String,
}

/// What a successful `store()` call returns.
pub struct StoreResult {
    pub storage: String,
    pub stored_uri: String,
    /// Whether the local file should be deleted after a successful store.
    /// Defaults to `true`; an adapter returns `false` to keep it around.
    pub delete_local: bool,
}

impl Default for StoreResult {
    fn default() -> Self {
        Self {
            storage: String::new(),
            stored_uri: String::new(),
            delete_local: true,
        }
    }
}

/// Pluggable storage sink. Must be idempotent on retry: the core itself
/// never retries a failed store, but a future retry layer or an operator
/// re-ingesting a leftover local file must not corrupt `stored_uri`
/// derivation.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn store(&self, request: StoreRequest) -> anyhow::Result<StoreResult>;
}

/// Writes snapshots to `<root>/<device_id>/<day>/<filename>` on the local
/// filesystem. This is the default (`STORAGE_MODE=local`) adapter.
pub struct LocalFsStorageAdapter {
    root: String,
    delete_local: bool,
}

impl LocalFsStorageAdapter {
    pub fn new(root: impl Into<String>, delete_local: bool) -> Self {
        Self {
            root: root.into(),
            delete_local,
        }
    }
}

#[async_trait]
impl StorageAdapter for LocalFsStorageAdapter {
    async fn store(&self, request: StoreRequest) -> anyhow::Result<StoreResult> {
        let filename = Path::new(&request.local_path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snap.jpg".to_string());

        let dest_dir = Path::new(&self.root).join(&request.device_id).join(&request.day);
        tokio::fs::create_dir_all(&dest_dir).await?;

        let dest_path = dest_dir.join(&filename);
        tokio::fs::copy(&request.local_path, &dest_path).await?;

        Ok(StoreResult {
            storage: "local".to_string(),
            stored_uri: dest_path.to_string_lossy().into_owned(),
            delete_local: self.delete_local,
        })
    }
}

/// Object-store seam for `STORAGE_MODE=s3`. Wiring a real object-store
/// client is out of scope (see the specification's storage-adapter
/// contract, which treats storage as an external collaborator); this stub
/// exists so the seam is concrete and the worker compiles against a real
/// trait object either way.
pub struct S3StorageAdapter {
    bucket: String,
    delete_local: bool,
}

impl S3StorageAdapter {
    pub fn new(bucket: impl Into<String>, delete_local: bool) -> Self {
        Self {
            bucket: bucket.into(),
            delete_local,
        }
    }
}

#[async_trait]
impl StorageAdapter for S3StorageAdapter {
    async fn store(&self, request: StoreRequest) -> anyhow::Result<StoreResult> {
        anyhow::bail!(
            "S3StorageAdapter has no configured object-store client (bucket={}, delete_local={}, device={})",
            self.bucket,
            self.delete_local,
            request.device_id
        )
    }
}

/// Drains `captured` events with bounded concurrency (`STORAGE_CONCURRENCY`
/// permits) and republishes exactly one of `stored`/`failed` per event.
pub struct StorageWorker {
    adapter: Arc<dyn StorageAdapter>,
    bus: EventBus,
    semaphore: Arc<Semaphore>,
    use_device_tz: bool,
}

impl StorageWorker {
    pub fn new(adapter: Arc<dyn StorageAdapter>, bus: EventBus, concurrency: usize, use_device_tz: bool) -> Self {
        Self {
            adapter,
            bus,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            use_device_tz,
        }
    }

    /// Run forever, spawning one task per `captured` event once a
    /// concurrency permit is available. Intended to be spawned as its own
    /// task by the gateway lifecycle.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.bus.subscribe_captured();
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "storage worker lagged behind captured events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let worker = self.clone();
            tokio::spawn(async move {
                worker.handle_one(event).await;
            });
        }
    }

    async fn handle_one(&self, event: SnapshotCapturedEvent) {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");

        let day = day_bucket(event.captured_at, event.tz_offset_hours, self.use_device_tz);
        let request = StoreRequest {
            local_path: event.local_path.clone(),
            device_id: event.device_id.clone(),
            payload_id: event.payload_id.clone(),
            captured_at: event.captured_at,
            day: day.clone(),
        };

        match self.adapter.store(request).await {
            Ok(result) => {
                if result.delete_local {
                    if let Err(e) = tokio::fs::remove_file(&event.local_path).await {
                        tracing::warn!(path = %event.local_path, error = %e, "failed to delete local snapshot after store");
                    }
                }

                self.bus.publish_stored(SnapshotStoredEvent {
                    captured: event,
                    storage: result.storage,
                    stored_uri: result.stored_uri,
                    day,
                });
            }
            Err(e) => {
                tracing::error!(device_id = %event.device_id, error = %e, "snapshot store failed");
                self.bus.publish_failed(SnapshotFailedEvent {
                    session_id: event.session_id,
                    device_id: event.device_id,
                    payload_id: event.payload_id,
                    remote: event.remote,
                    stage: FailureStage::Store,
                    error: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    async fn write_fixture_file(dir: &Path, contents: &[u8]) -> String {
        let path = dir.join("snap-fixture.jpg");
        tokio::fs::write(&path, contents).await.unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn local_adapter_copies_file_and_reports_uri() {
        let src_dir = tempdir().unwrap();
        let dest_dir = tempdir().unwrap();
        let local_path = write_fixture_file(src_dir.path(), b"jpeg bytes").await;

        let adapter = LocalFsStorageAdapter::new(dest_dir.path().to_string_lossy().into_owned(), true);
        let result = adapter
            .store(StoreRequest {
                local_path,
                device_id: "devA".to_string(),
                payload_id: None,
                captured_at: Utc::now(),
                day: "2026-07-31".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(result.storage, "local");
        assert!(tokio::fs::metadata(&result.stored_uri).await.unwrap().len() > 0);
    }

    #[tokio::test]
    async fn worker_emits_stored_on_success_and_deletes_local_file() {
        let src_dir = tempdir().unwrap();
        let dest_dir = tempdir().unwrap();
        let local_path = write_fixture_file(src_dir.path(), b"jpeg bytes").await;

        let adapter = Arc::new(LocalFsStorageAdapter::new(
            dest_dir.path().to_string_lossy().into_owned(),
            true,
        ));
        let bus = EventBus::new();
        let mut stored_rx = bus.subscribe_stored();
        let mut failed_rx = bus.subscribe_failed();

        let worker = Arc::new(StorageWorker::new(adapter, bus.clone(), 2, false));
        let worker_handle = tokio::spawn(worker.clone().run());

        bus.publish_captured(SnapshotCapturedEvent {
            session_id: "s1".to_string(),
            device_id: "devA".to_string(),
            payload_id: None,
            remote: "127.0.0.1:1".to_string(),
            local_path: local_path.clone(),
            captured_at: Utc::now(),
            tz_offset_hours: None,
        });

        let stored = tokio::time::timeout(std::time::Duration::from_secs(2), stored_rx.recv())
            .await
            .expect("stored event in time")
            .unwrap();
        assert_eq!(stored.captured.device_id, "devA");
        assert!(failed_rx.try_recv().is_err());
        assert!(!tokio::fs::try_exists(&local_path).await.unwrap());

        worker_handle.abort();
    }

    struct FailingAdapter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StorageAdapter for FailingAdapter {
        async fn store(&self, _request: StoreRequest) -> anyhow::Result<StoreResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("object store unavailable")
        }
    }

    #[tokio::test]
    async fn worker_emits_failed_with_store_stage_on_adapter_error() {
        let adapter = Arc::new(FailingAdapter {
            calls: AtomicUsize::new(0),
        });
        let bus = EventBus::new();
        let mut failed_rx = bus.subscribe_failed();

        let worker = Arc::new(StorageWorker::new(adapter, bus.clone(), 2, false));
        let worker_handle = tokio::spawn(worker.clone().run());

        bus.publish_captured(SnapshotCapturedEvent {
            session_id: "s1".to_string(),
            device_id: "devA".to_string(),
            payload_id: None,
            remote: "127.0.0.1:1".to_string(),
            local_path: "/nonexistent/path.jpg".to_string(),
            captured_at: Utc::now(),
            tz_offset_hours: None,
        });

        let failed = tokio::time::timeout(std::time::Duration::from_secs(2), failed_rx.recv())
            .await
            .expect("failed event in time")
            .unwrap();
        assert_eq!(failed.stage, FailureStage::Store);

        worker_handle.abort();
    }
}

//! Leader lock (C8): distributed mutex gating which replica accepts public
//! WebSocket connections. The distributed backend itself (Redlock over a
//! shared cache) is an external collaborator per the specification's scope;
//! this module owns the trait boundary, the retry/renewal loop shape, and a
//! reference single-process implementation for tests and single-replica
//! deployments.

use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

const LOCK_TTL: Duration = Duration::from_secs(10);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const ACQUIRE_RETRY_BASE: Duration = Duration::from_millis(1500);
const ACQUIRE_RETRY_JITTER_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderEvent {
    Elected,
    Revoked,
}

/// Backend-agnostic distributed mutex. A real implementation would acquire
/// and renew a Redlock-style key (`mqtt:leader:lock`) on a shared cache with
/// [`LOCK_TTL`]/[`RENEW_INTERVAL`]; this trait only fixes the contract the
/// gateway lifecycle depends on.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Attempt to acquire or renew leadership. Returns `true` if this
    /// process holds the lock after the call.
    async fn try_acquire(&self) -> anyhow::Result<bool>;

    /// Release the lock, e.g. on orderly shutdown.
    async fn release(&self) -> anyhow::Result<()>;

    fn am_leader(&self) -> bool;

    /// A broadcast stream of `Elected`/`Revoked` transitions.
    fn events(&self) -> broadcast::Receiver<LeaderEvent>;
}

/// Drive `lock`'s acquire/renew loop forever (until the task is aborted),
/// retrying every [`ACQUIRE_RETRY_BASE`] ± jitter while not leader and
/// renewing every [`RENEW_INTERVAL`] while leader. Intended to be spawned as
/// its own task by the gateway lifecycle.
pub async fn run_leader_loop(lock: std::sync::Arc<dyn LeaderLock>) {
    loop {
        let was_leader = lock.am_leader();
        let acquired = match lock.try_acquire().await {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(error = %e, "leader lock acquire/renew failed");
                false
            }
        };

        if acquired && !was_leader {
            tracing::info!("acquired leadership");
        } else if !acquired && was_leader {
            tracing::warn!("lost leadership");
        }

        let sleep_for = if acquired {
            RENEW_INTERVAL
        } else {
            jittered_retry_interval()
        };
        tokio::time::sleep(sleep_for).await;
    }
}

fn jittered_retry_interval() -> Duration {
    let jitter_ms = rand::rngs::OsRng.gen_range(0..=2 * ACQUIRE_RETRY_JITTER_MS);
    let jitter = Duration::from_millis(jitter_ms).saturating_sub(Duration::from_millis(ACQUIRE_RETRY_JITTER_MS));
    if jitter_ms >= ACQUIRE_RETRY_JITTER_MS {
        ACQUIRE_RETRY_BASE + jitter
    } else {
        ACQUIRE_RETRY_BASE.saturating_sub(jitter)
    }
}

/// A trivial leader lock that is always elected, for single-replica
/// deployments and tests that don't exercise the distributed path.
pub struct SingleProcessLeaderLock {
    leader: AtomicBool,
    events_tx: broadcast::Sender<LeaderEvent>,
}

impl Default for SingleProcessLeaderLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleProcessLeaderLock {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(16);
        Self {
            leader: AtomicBool::new(false),
            events_tx,
        }
    }
}

#[async_trait]
impl LeaderLock for SingleProcessLeaderLock {
    async fn try_acquire(&self) -> anyhow::Result<bool> {
        if !self.leader.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(LeaderEvent::Elected);
        }
        Ok(true)
    }

    async fn release(&self) -> anyhow::Result<()> {
        if self.leader.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(LeaderEvent::Revoked);
        }
        Ok(())
    }

    fn am_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<LeaderEvent> {
        self.events_tx.subscribe()
    }
}

//! Single-capture coordinator (C7): enforces the replica-wide "at most one
//! capture in flight" invariant. Cross-replica exclusion is provided
//! separately by the leader lock (C8); this coordinator is intra-replica
//! only.

use tokio::sync::Mutex;

/// Guards the process-wide capture slot. `try_reserve` is the only way to
/// set it; `release` is idempotent and only clears the slot if the caller
/// currently holds it, so a stale release (e.g. a capture-timeout path
/// racing normal completion) can never clear another session's reservation.
#[derive(Default)]
pub struct CaptureCoordinator {
    state: Mutex<Option<String>>,
}

impl CaptureCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically reserve the capture slot for `session_id`. Succeeds only
    /// when no other session currently holds it.
    pub async fn try_reserve(&self, session_id: &str) -> bool {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return false;
        }
        *guard = Some(session_id.to_string());
        true
    }

    /// Release the slot, but only if `session_id` is the current holder.
    pub async fn release(&self, session_id: &str) {
        let mut guard = self.state.lock().await;
        if guard.as_deref() == Some(session_id) {
            *guard = None;
        }
    }

    /// The session id currently holding the capture slot, if any.
    pub async fn current_holder(&self) -> Option<String> {
        self.state.lock().await.clone()
    }

    pub async fn is_in_flight(&self) -> bool {
        self.state.lock().await.is_some()
    }
}

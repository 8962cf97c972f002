//! Concurrency gate: per-session admission lives on `Session::try_begin_run`;
//! this module owns the per-repository slot pools and the rejection wording.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::domain::{ExecutionPolicy, Rejection, Repository};
use crate::errors::ExecutionError;

pub const DEFAULT_SLOTS_PER_REPOSITORY: usize = 5;

/// Bounded pool of generator slots per repository key.
///
/// Pools are created lazily and never removed; the repository set is fixed
/// at startup.
#[derive(Debug)]
pub struct RepositorySlots {
    capacity: usize,
    pools: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for RepositorySlots {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS_PER_REPOSITORY)
    }
}

impl RepositorySlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn pool(&self, key: &str) -> Arc<Semaphore> {
        let mut pools = self.pools.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            pools
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.capacity))),
        )
    }

    /// Wait for a slot on `repository`. Cancel-safe: dropping the future
    /// before it resolves takes no slot.
    pub async fn acquire(
        &self,
        repository: &Repository,
    ) -> Result<OwnedSemaphorePermit, ExecutionError> {
        let key = repository.key();
        self.pool(&key)
            .acquire_owned()
            .await
            .map_err(|_| ExecutionError::SlotsClosed { repository: key })
    }

    /// Free slots right now, for status output and tests.
    pub fn available(&self, repository: &Repository) -> usize {
        self.pool(&repository.key()).available_permits()
    }
}

/// The in-thread reply for an instruction that was not admitted.
///
/// Ended sessions get no reply: the thread is treated as unknown.
pub fn rejection_message(rejection: Rejection) -> Option<&'static str> {
    match rejection {
        Rejection::Busy(ExecutionPolicy::Sync) => Some(
            ":hourglass_flowing_sand: A task is already running in this thread. \
             Please wait for it to finish and send your request again; it will not be queued.",
        ),
        Rejection::Busy(ExecutionPolicy::Async) => Some(
            ":arrows_counterclockwise: A task is already running in this thread. \
             Start a new thread to run another task in parallel.",
        ),
        Rejection::Ended => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn repo(name: &str) -> Repository {
        Repository::new("acme", name, "main")
    }

    #[tokio::test]
    async fn test_slots_are_bounded_per_repository() {
        let slots = RepositorySlots::new(2);
        let api = repo("api");
        let web = repo("web");

        let a = slots.acquire(&api).await.unwrap();
        let _b = slots.acquire(&api).await.unwrap();
        assert_eq!(slots.available(&api), 0);
        // Another repository has its own pool.
        assert_eq!(slots.available(&web), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(50), slots.acquire(&api)).await;
        assert!(blocked.is_err(), "third acquisition should wait");

        drop(a);
        assert_eq!(slots.available(&api), 1);
        let _c = tokio::time::timeout(Duration::from_millis(50), slots.acquire(&api))
            .await
            .expect("slot should be free")
            .unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_wait_takes_no_slot() {
        let slots = RepositorySlots::new(1);
        let api = repo("api");
        let held = slots.acquire(&api).await.unwrap();
        let _ = tokio::time::timeout(Duration::from_millis(20), slots.acquire(&api)).await;
        drop(held);
        assert_eq!(slots.available(&api), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(RepositorySlots::new(0).capacity(), 1);
        assert_eq!(RepositorySlots::default().capacity(), 5);
    }

    #[test]
    fn test_rejection_wording_depends_on_policy() {
        let sync = rejection_message(Rejection::Busy(ExecutionPolicy::Sync)).unwrap();
        assert!(sync.contains("wait"));
        assert!(sync.contains("not be queued"));
        let asynchronous = rejection_message(Rejection::Busy(ExecutionPolicy::Async)).unwrap();
        assert!(asynchronous.contains("new thread"));
    }

    #[test]
    fn test_ended_session_gets_no_rejection_reply() {
        assert_eq!(rejection_message(Rejection::Ended), None);
    }
}

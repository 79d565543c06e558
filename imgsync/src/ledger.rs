use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use ociclient::OciDigest;
use tokio::sync::OnceCell;

/// Run-scoped record of blob transfers.
///
/// At most one transfer runs per digest. Concurrent callers for the same
/// digest wait for the one in flight and share its outcome; later callers
/// get the stored outcome without transferring again. If the task driving
/// a transfer is dropped before it finishes, the next caller takes over.
#[derive(Debug)]
pub struct TransferLedger<T> {
    slots: Mutex<HashMap<OciDigest, Arc<OnceCell<T>>>>,
}

impl<T> Default for TransferLedger<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> TransferLedger<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `transfer` unless `digest` already has an outcome.
    ///
    /// Returns the outcome and whether this call performed the transfer.
    pub async fn run<F, Fut>(&self, digest: &OciDigest, transfer: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(digest.clone()).or_default())
        };

        let mut performed = false;
        let outcome = slot
            .get_or_init(|| {
                performed = true;
                transfer()
            })
            .await
            .clone();
        (outcome, performed)
    }

    /// The finished outcome for `digest`, if any
    pub fn outcome(&self, digest: &OciDigest) -> Option<T> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(digest).and_then(|slot| slot.get().cloned())
    }

    /// Number of digests with a finished outcome
    pub fn completed(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|slot| slot.initialized()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_transfer() {
        let ledger = Arc::new(TransferLedger::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let digest = OciDigest::sha256(b"layer");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (ledger, calls, digest) = (ledger.clone(), calls.clone(), digest.clone());
            tasks.push(tokio::spawn(async move {
                ledger
                    .run(&digest, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        42
                    })
                    .await
            }));
        }

        let mut performed = 0;
        for task in tasks {
            let (value, ran) = task.await.unwrap();
            assert_eq!(value, 42);
            performed += usize::from(ran);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(performed, 1);
        assert_eq!(ledger.outcome(&digest), Some(42));
    }

    #[tokio::test]
    async fn distinct_digests_are_independent() {
        let ledger = TransferLedger::<&'static str>::new();
        let (a, ran_a) = ledger.run(&OciDigest::sha256(b"a"), || async { "a" }).await;
        let (b, ran_b) = ledger.run(&OciDigest::sha256(b"b"), || async { "b" }).await;
        let (again, ran_again) = ledger.run(&OciDigest::sha256(b"a"), || async { "other" }).await;
        assert_eq!((a, ran_a, b, ran_b), ("a", true, "b", true));
        assert_eq!((again, ran_again), ("a", false));
        assert_eq!(ledger.completed(), 2);
    }

    #[tokio::test]
    async fn abandoned_transfer_is_retried() {
        let ledger = TransferLedger::<u8>::new();
        let digest = OciDigest::sha256(b"slow");

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            ledger.run(&digest, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                1
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(ledger.outcome(&digest), None);

        let (value, ran) = ledger.run(&digest, || async { 2 }).await;
        assert_eq!((value, ran), (2, true));
    }
}

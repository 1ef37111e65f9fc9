//! Single-flight coordination for identical in-flight work.
//!
//! For any key, at most one computation runs at a time. The first caller
//! (the winner) performs the work; concurrent callers for the same key
//! subscribe to the winner's slot and receive a clone of its outcome,
//! success or error. Slots are transient: the winner removes its slot
//! before broadcasting, so the next arrival after completion starts a
//! fresh flight.
//!
//! Waiters are independent of the winner's lifetime in both directions:
//! a waiter whose deadline lapses unsubscribes without cancelling the
//! winner, and a cancelled (dropped) winner broadcasts `Cancelled` to all
//! waiters, each of which may retry as a fresh winner.
//!
//! The slot map lock is a `std::sync::Mutex` — never held across an await
//! point; slots hold only a broadcast sender and are short-lived.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::telemetry;
use crate::{MimirError, Result};

/// How a flight concluded for this caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    /// This caller performed the upstream work.
    Winner,
    /// This caller received the winner's outcome.
    Waiter,
}

/// Deduplicates concurrent work keyed by a fingerprint.
pub struct SingleFlight<K, V> {
    slots: Mutex<HashMap<K, broadcast::Sender<Result<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().expect("flight lock poisoned").len()
    }

    /// Run `work` under single-flight semantics for `key`.
    ///
    /// Returns the outcome and this caller's role. A waiter bounded by
    /// `wait_budget` that lapses before the winner finishes gets
    /// `Timeout`; the winner is unaffected. A waiter whose winner was
    /// dropped gets `Cancelled`.
    pub async fn run<F, Fut>(
        &self,
        key: K,
        wait_budget: Option<Duration>,
        work: F,
    ) -> (Result<V>, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        enum Start<V> {
            Subscribed(broadcast::Receiver<Result<V>>),
            Lead,
        }

        let start = {
            let mut slots = self.slots.lock().expect("flight lock poisoned");
            match slots.get(&key) {
                Some(tx) => Start::Subscribed(tx.subscribe()),
                None => {
                    // Capacity 1: the slot carries exactly one terminal outcome.
                    let (tx, _) = broadcast::channel(1);
                    slots.insert(key.clone(), tx);
                    Start::Lead
                }
            }
        };

        let mut rx = match start {
            Start::Subscribed(rx) => rx,
            Start::Lead => return (self.lead(key, work).await, FlightRole::Winner),
        };

        metrics::counter!(telemetry::FLIGHT_COALESCED_TOTAL).increment(1);

        let received = match wait_budget {
            Some(budget) => match tokio::time::timeout(budget, rx.recv()).await {
                Ok(r) => r,
                Err(_) => {
                    // Deadline lapsed; dropping rx unsubscribes without
                    // touching the winner.
                    return (
                        Err(MimirError::Timeout {
                            elapsed_ms: budget.as_millis() as u64,
                        }),
                        FlightRole::Waiter,
                    );
                }
            },
            None => rx.recv().await,
        };

        let outcome = match received {
            Ok(outcome) => outcome,
            // Sender dropped without broadcasting: the winner was torn down.
            Err(_) => Err(MimirError::Cancelled),
        };
        (outcome, FlightRole::Waiter)
    }

    async fn lead<F, Fut>(&self, key: K, work: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let guard = SlotGuard {
            flight: self,
            key: Some(key),
        };
        let outcome = work().await;
        guard.settle(outcome.clone());
        outcome
    }

    fn remove_slot(&self, key: &K) -> Option<broadcast::Sender<Result<V>>> {
        self.slots.lock().expect("flight lock poisoned").remove(key)
    }
}

/// Removes the winner's slot on completion or cancellation.
///
/// Settling removes the slot BEFORE broadcasting, so late arrivals start a
/// fresh flight instead of subscribing to a spent slot. If the winner's
/// future is dropped before settling, `Drop` broadcasts `Cancelled`.
struct SlotGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    flight: &'a SingleFlight<K, V>,
    key: Option<K>,
}

impl<K, V> SlotGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn settle(mut self, outcome: Result<V>) {
        if let Some(key) = self.key.take()
            && let Some(tx) = self.flight.remove_slot(&key)
        {
            // No receivers is fine: the winner had no waiters.
            let _ = tx.send(outcome);
        }
    }
}

impl<K, V> Drop for SlotGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take()
            && let Some(tx) = self.flight.remove_slot(&key)
        {
            let _ = tx.send(Err(MimirError::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn winner_runs_work_once() {
        let flight: SingleFlight<String, u32> = SingleFlight::new();
        let (out, role) = flight.run("k".to_string(), None, || async { Ok(7) }).await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(role, FlightRole::Winner);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn waiters_share_the_winners_outcome() {
        let flight: Arc<SingleFlight<String, u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("k".to_string(), None, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42u32)
                    })
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            let (out, role) = handle.await.unwrap();
            assert_eq!(out.unwrap(), 42);
            if role == FlightRole::Winner {
                winners += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(winners, 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_are_shared_too() {
        let flight: Arc<SingleFlight<String, u32>> = Arc::new(SingleFlight::new());

        let f2 = flight.clone();
        let waiter = tokio::spawn(async move {
            // Give the winner time to claim the slot.
            tokio::time::sleep(Duration::from_millis(10)).await;
            f2.run("k".to_string(), None, || async { Ok(0) }).await
        });

        let (out, role) = flight
            .run("k".to_string(), None, || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(MimirError::Transient("boom".into()))
            })
            .await;
        assert_eq!(role, FlightRole::Winner);
        assert!(matches!(out, Err(MimirError::Transient(_))));

        let (out, role) = waiter.await.unwrap();
        assert_eq!(role, FlightRole::Waiter);
        assert!(matches!(out, Err(MimirError::Transient(_))));
    }

    #[tokio::test]
    async fn waiter_deadline_does_not_cancel_winner() {
        let flight: Arc<SingleFlight<String, u32>> = Arc::new(SingleFlight::new());

        let f2 = flight.clone();
        let winner = tokio::spawn(async move {
            f2.run("k".to_string(), None, || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(9u32)
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (out, role) = flight
            .run("k".to_string(), Some(Duration::from_millis(20)), || async {
                Ok(0)
            })
            .await;
        assert_eq!(role, FlightRole::Waiter);
        assert!(matches!(out, Err(MimirError::Timeout { .. })));

        // Winner is unaffected by the waiter's timeout.
        let (out, _) = winner.await.unwrap();
        assert_eq!(out.unwrap(), 9);
    }

    #[tokio::test]
    async fn dropped_winner_broadcasts_cancelled() {
        let flight: Arc<SingleFlight<String, u32>> = Arc::new(SingleFlight::new());

        let f2 = flight.clone();
        let winner = tokio::spawn(async move {
            f2.run("k".to_string(), None, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1u32)
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let f3 = flight.clone();
        let waiter =
            tokio::spawn(async move { f3.run("k".to_string(), None, || async { Ok(0) }).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        winner.abort();
        let (out, role) = waiter.await.unwrap();
        assert_eq!(role, FlightRole::Waiter);
        assert!(matches!(out, Err(MimirError::Cancelled)));
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn sequential_flights_do_not_coalesce() {
        let flight: SingleFlight<String, u32> = SingleFlight::new();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let (out, role) = flight
                .run("k".to_string(), None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await;
            assert!(out.is_ok());
            assert_eq!(role, FlightRole::Winner);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

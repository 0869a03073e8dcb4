//! Single-flight queue keyed by device endpoint.
//!
//! Sessions do not serialize themselves; a device that receives two
//! interleaved command streams may misbehave.  Callers that can issue
//! concurrent operations route them through [`DeviceQueue::run`], which gives
//! every endpoint address its own FIFO lane (a `tokio::sync::Mutex`, whose
//! waiters are served in arrival order).  Different endpoints never wait on
//! each other.
//!
//! Lanes are keyed by the address string, so two registry ids naming the
//! same address share one lane.  Addresses that differ only in spelling
//! (`localhost:5555` vs `127.0.0.1:5555`) do not.  Lanes are never removed;
//! the map holds one entry per address ever queued.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::trace;

#[derive(Debug, Default)]
pub struct DeviceQueue {
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeviceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `op` once every earlier operation on `address` has finished.
    pub async fn run<F, T>(&self, address: &str, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let lane = self.lane(address);
        let _turn = lane.lock().await;
        trace!(address, "device lane acquired");
        op.await
    }

    fn lane(&self, address: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(lanes.entry(address.to_string()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_same_device_runs_one_at_a_time() {
        // Arrange
        let queue = Arc::new(DeviceQueue::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let device = "10.0.0.7:5555".to_string();

        // Act: four overlapping operations on one device
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let (queue, in_flight, peak, device) = (
                    Arc::clone(&queue),
                    Arc::clone(&in_flight),
                    Arc::clone(&peak),
                    device.clone(),
                );
                tokio::spawn(async move {
                    queue
                        .run(&device, async {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // Assert
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_devices_run_concurrently() {
        // Arrange: both operations must be inside their lane at the same time
        // for the barrier to release.
        let queue = Arc::new(DeviceQueue::new());
        let barrier = Arc::new(Barrier::new(2));

        let run = |address: &'static str| {
            let (queue, barrier) = (Arc::clone(&queue), Arc::clone(&barrier));
            tokio::spawn(async move {
                queue
                    .run(address, async {
                        barrier.wait().await;
                    })
                    .await;
            })
        };

        // Act
        let both = async {
            let (a, b) = tokio::join!(run("sim://a"), run("sim://b"));
            a.unwrap();
            b.unwrap();
        };
        let result = tokio::time::timeout(Duration::from_secs(2), both).await;

        // Assert
        assert!(result.is_ok(), "devices blocked each other");
    }

    #[tokio::test]
    async fn test_run_returns_operation_output() {
        let queue = DeviceQueue::new();

        let value = queue.run("sim://x", async { 41 + 1 }).await;

        assert_eq!(value, 42);
    }
}

//! Global spacing for outbound results-service calls.
//!
//! The upstream service rate-limits aggressively, so every call in the
//! process goes through one gate that enforces a minimum delay between
//! consecutive calls. Callers that never reach the network (cache hits)
//! never touch the gate.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Async gate enforcing one call per configured interval, process-wide.
///
/// Waiters queue on the internal lock, so concurrent settlements serialize
/// their external calls instead of bypassing the spacing.
pub struct CallGate {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl CallGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until the next call is allowed, then claim the slot.
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_gate_spaces_consecutive_calls() {
        let gate = CallGate::new(Duration::from_millis(3000));

        let start = Instant::now();
        gate.acquire().await;
        let first = start.elapsed();
        gate.acquire().await;
        let second = start.elapsed();

        assert!(first < Duration::from_millis(10));
        assert!(second >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_free_after_interval() {
        let gate = CallGate::new(Duration::from_millis(100));

        gate.acquire().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = Instant::now();
        gate.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_serializes_concurrent_callers() {
        use std::sync::Arc;

        let gate = Arc::new(CallGate::new(Duration::from_millis(1000)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.acquire().await;
                start.elapsed()
            }));
        }

        let mut elapsed: Vec<Duration> = Vec::new();
        for h in handles {
            elapsed.push(h.await.unwrap());
        }
        elapsed.sort();

        // Three callers claim slots at ~0ms, ~1000ms and ~2000ms.
        assert!(elapsed[0] < Duration::from_millis(10));
        assert!(elapsed[1] >= Duration::from_millis(1000));
        assert!(elapsed[2] >= Duration::from_millis(2000));
    }
}

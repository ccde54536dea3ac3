use std::sync::Arc;

use tokio::sync::watch;

/// Counting barrier for fan-out joins. Every run calls `arrive` once, the
/// joining handler waits until the count reaches `expected` without spinning.
#[derive(Debug, Clone)]
pub struct JoinBarrier {
    expected: usize,
    counter: Arc<watch::Sender<usize>>,
}

impl JoinBarrier {
    pub fn new(expected: usize) -> Self {
        let (counter, _) = watch::channel(0);
        JoinBarrier { expected, counter: Arc::new(counter) }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn arrived(&self) -> usize {
        *self.counter.borrow()
    }

    /// # Returns
    /// The count after this arrival.
    pub fn arrive(&self) -> usize {
        let mut count = 0;
        self.counter.send_modify(|value| {
            *value += 1;
            count = *value;
        });
        count
    }

    pub async fn wait(&self) {
        let mut receiver = self.counter.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = receiver.wait_for(|count| *count >= self.expected).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_releases_after_all_arrivals() {
        let barrier = JoinBarrier::new(3);

        for _ in 0..3 {
            let runner = barrier.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                runner.arrive();
            });
        }

        tokio::time::timeout(Duration::from_secs(2), barrier.wait()).await.unwrap();
        assert_eq!(barrier.arrived(), 3);
    }

    #[tokio::test]
    async fn test_empty_barrier_is_open() {
        let barrier = JoinBarrier::new(0);
        tokio::time::timeout(Duration::from_millis(100), barrier.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn test_blocks_while_runs_are_missing() {
        let barrier = JoinBarrier::new(2);
        barrier.arrive();
        assert!(tokio::time::timeout(Duration::from_millis(20), barrier.wait()).await.is_err());
    }
}

//! Periodic queue-depth statistics for the sink worker pools.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default)]
struct StatWindow {
    latest: usize,
    max: usize,
    total: u64,
    count: u64,
}

/// Samples queue lengths and logs a summary line per interval, then resets
/// the window.
#[derive(Debug, Clone)]
pub struct QueueStats {
    name: &'static str,
    window: Arc<Mutex<StatWindow>>,
}

impl QueueStats {
    pub fn new(name: &'static str, interval_ms: u64) -> Self {
        let stats = Self {
            name,
            window: Arc::new(Mutex::new(StatWindow::default())),
        };
        let reporter = stats.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
            loop {
                ticker.tick().await;
                reporter.flush();
            }
        });
        stats
    }

    pub fn write(&self, queue_len: usize) {
        let mut window = self.window.lock().expect("stats window");
        window.latest = queue_len;
        window.max = window.max.max(queue_len);
        window.total += queue_len as u64;
        window.count += 1;
    }

    fn flush(&self) {
        let snapshot = {
            let mut window = self.window.lock().expect("stats window");
            std::mem::take(&mut *window)
        };
        if snapshot.count == 0 {
            return;
        }
        info!(
            name = self.name,
            latest = snapshot.latest,
            mean = snapshot.total / snapshot.count,
            max = snapshot.max,
            samples = snapshot.count,
            "queue stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_resets_after_flush() {
        let stats = QueueStats::new("test_queue", 60_000);
        stats.write(3);
        stats.write(9);
        {
            let window = stats.window.lock().unwrap();
            assert_eq!(window.latest, 9);
            assert_eq!(window.max, 9);
            assert_eq!(window.count, 2);
        }
        stats.flush();
        let window = stats.window.lock().unwrap();
        assert_eq!(window.count, 0);
        assert_eq!(window.max, 0);
    }
}

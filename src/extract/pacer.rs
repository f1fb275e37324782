use std::time::Duration;

use tracing::debug;

/// Fixed minimum dwell after each interaction
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    dwell: Duration,
}

impl Pacer {
    pub fn new(dwell: Duration) -> Self {
        Self { dwell }
    }

    pub fn dwell(&self) -> Duration {
        self.dwell
    }

    pub async fn settle(&self, label: &str) {
        if self.dwell.is_zero() {
            return;
        }
        debug!("[wait] {} … {}ms", label, self.dwell.as_millis());
        tokio::time::sleep(self.dwell).await;
    }
}

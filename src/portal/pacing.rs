use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

use crate::config::PacingConfig;

/// Human-like timing for typing and page turns.
#[derive(Debug, Clone)]
pub struct Pacer {
    config: PacingConfig,
}

impl Pacer {
    pub fn new(config: PacingConfig) -> Self {
        Self { config }
    }

    pub fn keystroke_delay(&self) -> Duration {
        jitter(self.config.keystroke_min_ms, self.config.keystroke_max_ms)
    }

    pub fn page_turn_delay(&self) -> Duration {
        jitter(self.config.page_turn_min_ms, self.config.page_turn_max_ms)
    }

    pub async fn keystroke(&self) {
        sleep(self.keystroke_delay()).await;
    }

    pub async fn page_turn(&self) {
        sleep(self.page_turn_delay()).await;
    }

    pub async fn after_username(&self) {
        sleep(Duration::from_millis(self.config.username_settle_ms)).await;
    }

    pub async fn after_password(&self) {
        sleep(Duration::from_millis(self.config.password_settle_ms)).await;
    }
}

fn jitter(min_ms: u64, max_ms: u64) -> Duration {
    let (lo, hi) = if min_ms <= max_ms { (min_ms, max_ms) } else { (max_ms, min_ms) };
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

//! Terminal-state webhook delivery.
//!
//! A notification is attempted a bounded number of times with exponential
//! backoff. Running out of attempts is logged and reported, never raised:
//! the job it describes has already finished.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::NotifyConfig;
use crate::retry::{Backoff, RetryPolicy};
use crate::state_machine::TerminalStatus;

/// JSON body posted to the webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub job_id: String,
    pub status: TerminalStatus,
    /// Storage locations on success, the error description on failure.
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

pub struct NotificationDispatcher {
    client: Client,
    retry: RetryPolicy,
}

impl NotificationDispatcher {
    pub fn new(config: &NotifyConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            retry: RetryPolicy::new(
                config.max_attempts,
                Backoff::Exponential {
                    unit: Duration::from_millis(config.backoff_unit_ms.max(1)),
                    base: config.backoff_base.max(2),
                },
            ),
        }
    }

    /// Wait after the given failed attempt. Strictly increasing.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry.delay_for_attempt(attempt)
    }

    /// POST the payload until a 2xx response or the attempt budget runs out.
    pub async fn notify(&self, endpoint: &str, payload: &NotificationPayload) -> DeliveryOutcome {
        let job_id = payload.job_id.as_str();
        let max = self.retry.max_attempts;

        for attempt in 1..=max {
            match self.client.post(endpoint).json(payload).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(job_id, attempt, status = response.status().as_u16(), "notification delivered");
                    return DeliveryOutcome::Delivered { attempts: attempt };
                }
                Ok(response) => {
                    warn!(
                        job_id,
                        attempt,
                        max,
                        status = response.status().as_u16(),
                        "webhook rejected notification"
                    );
                }
                Err(err) => {
                    warn!(job_id, attempt, max, error = %err, "webhook request failed");
                }
            }

            if self.retry.allows_retry_after(attempt) {
                sleep(self.backoff_for(attempt)).await;
            }
        }

        error!(job_id, attempts = max, "notification delivery exhausted");
        DeliveryOutcome::Exhausted { attempts: max }
    }
}

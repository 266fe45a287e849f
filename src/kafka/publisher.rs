use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Envelope, JsonSerializer, MessageSink};
use crate::config::RetryConfig;
use crate::Error;

/// Bounded exponential backoff between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): 500ms, 1s, 2s, ... by default.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Result of one publish attempt sequence.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Failed { attempts: u32, error: Error },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts } | DeliveryOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

pub struct Publisher<K: ?Sized> {
    sink: Arc<K>,
    policy: RetryPolicy,
}

impl<K: MessageSink + ?Sized> Publisher<K> {
    pub fn new(sink: Arc<K>, policy: RetryPolicy) -> Self {
        Self { sink, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Serializes the envelope and sends it keyed by its message id, retrying
    /// retryable errors. Every attempt reuses the same envelope, so retries
    /// share one identifier.
    pub async fn publish(&self, envelope: &Envelope) -> DeliveryOutcome {
        let payload = match JsonSerializer::serialize(envelope) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(message_id = %envelope.message_id, error = %error, "Failed to serialize envelope");
                return DeliveryOutcome::Failed { attempts: 0, error };
            }
        };

        let mut attempt = 1;
        loop {
            match self.sink.send(&envelope.message_id, &payload).await {
                Ok(()) => {
                    debug!(message_id = %envelope.message_id, attempt, "Envelope delivered");
                    return DeliveryOutcome::Delivered { attempts: attempt };
                }
                Err(error) if error.is_retryable() && attempt < self.policy.max_attempts => {
                    let backoff = self.policy.backoff(attempt);
                    warn!(
                        message_id = %envelope.message_id,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Delivery attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => {
                    return DeliveryOutcome::Failed {
                        attempts: attempt,
                        error,
                    };
                }
            }
        }
    }
}

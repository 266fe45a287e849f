use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::kafka::DeliveryOutcome;
use crate::postgres::{Record, StoreGateway};
use crate::Error;

/// What happened to the record's sent flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Marked,
    /// Delivery failed; the flag is untouched and the record stays pending.
    Skipped,
    /// Delivered, but the row is gone or no longer matches its key.
    NotFound,
    /// Delivered, but the update failed. The record will be published again.
    MarkFailed,
}

pub struct Acknowledger<S: ?Sized> {
    store: Arc<S>,
}

impl<S: StoreGateway + ?Sized> Acknowledger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Marks the record sent only after a confirmed delivery.
    pub async fn confirm(&self, record: &Record, outcome: &DeliveryOutcome) -> Acknowledgement {
        if !outcome.is_delivered() {
            return Acknowledgement::Skipped;
        }

        match self.store.mark_sent(record).await {
            Ok(()) => {
                debug!(key = %record.key, "Record marked as sent");
                Acknowledgement::Marked
            }
            Err(Error::RecordNotFound { key }) => {
                warn!(key = %key, "Delivered record no longer in store");
                Acknowledgement::NotFound
            }
            Err(e) => {
                error!(
                    key = %record.key,
                    error = %e,
                    "Failed to mark delivered record; it will be published again"
                );
                Acknowledgement::MarkFailed
            }
        }
    }
}

//! Bounded waits for a specific VM's callback.

use crate::events::{EventBus, WAIT_TIMED_OUT};
use crate::registry::{CorrelationRegistry, RegistrationId, RegistryError};
use phonehome_common::{Callback, CorrelationToken};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, info};

/// Result of one [`Waiter::wait`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The VM called home within the timeout.
    Delivered(Callback),
    /// No matching callback arrived in time.
    TimedOut,
}

impl WaitOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }

    pub fn callback(&self) -> Option<&Callback> {
        match self {
            Self::Delivered(callback) => Some(callback),
            Self::TimedOut => None,
        }
    }

    /// The delivered payload, or `None` on timeout.
    pub fn into_payload(self) -> Option<String> {
        match self {
            Self::Delivered(callback) => Some(callback.payload),
            Self::TimedOut => None,
        }
    }
}

/// Removes a registration when the wait ends without a delivery, including
/// when the waiting future is dropped mid-wait.
struct RegistrationGuard<'a> {
    registry: &'a CorrelationRegistry,
    token: &'a CorrelationToken,
    id: RegistrationId,
    armed: bool,
}

impl RegistrationGuard<'_> {
    /// Unregister now. Returns `false` if a publisher consumed the entry first.
    fn release(&mut self) -> bool {
        self.armed = false;
        self.registry.unregister(self.token, self.id)
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.registry.unregister(self.token, self.id) {
            debug!(
                kind = %self.registry.kind(),
                token = %self.token,
                "Wait abandoned; registration removed"
            );
        }
    }
}

/// Blocks test code until its VM phones home, for one callback kind.
#[derive(Clone, Debug)]
pub struct Waiter {
    registry: Arc<CorrelationRegistry>,
    events: EventBus,
}

impl Waiter {
    pub fn new(registry: Arc<CorrelationRegistry>, events: EventBus) -> Self {
        Self { registry, events }
    }

    /// Wait up to `timeout` for a callback carrying `token`.
    ///
    /// The registration never outlives this call: it is consumed by the
    /// delivery, removed on timeout, or removed when the future is dropped.
    pub async fn wait(
        &self,
        token: CorrelationToken,
        timeout: Duration,
    ) -> Result<WaitOutcome, RegistryError> {
        let kind = self.registry.kind();
        let handle = self.registry.register(token.clone())?;
        let (_, id, mut receiver) = handle.into_parts();
        let mut guard = RegistrationGuard {
            registry: &self.registry,
            token: &token,
            id,
            armed: true,
        };

        debug!(%kind, %token, timeout_secs = timeout.as_secs_f64(), "Waiting for phone-home");
        let started = Instant::now();

        let outcome = match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(callback)) => {
                guard.disarm();
                WaitOutcome::Delivered(callback)
            }
            // Sender dropped without a value: the registry let go of us.
            Ok(Err(_)) => {
                guard.release();
                WaitOutcome::TimedOut
            }
            Err(_) => {
                if guard.release() {
                    WaitOutcome::TimedOut
                } else {
                    // A publisher removed the entry first and sent under the
                    // registry lock, so the value is already in the channel.
                    match receiver.try_recv() {
                        Ok(callback) => WaitOutcome::Delivered(callback),
                        Err(TryRecvError::Empty | TryRecvError::Closed) => WaitOutcome::TimedOut,
                    }
                }
            }
        };

        match &outcome {
            WaitOutcome::Delivered(callback) => info!(
                %kind,
                %token,
                transaction_id = %callback.transaction_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "VM phoned home"
            ),
            WaitOutcome::TimedOut => {
                info!(%kind, %token, timeout_secs = timeout.as_secs(), "Timed out waiting for phone-home");
                self.events.emit(
                    WAIT_TIMED_OUT,
                    &json!({
                        "kind": kind,
                        "token": token,
                        "timeout_ms": timeout.as_millis() as u64,
                    }),
                );
            }
        }

        Ok(outcome)
    }
}

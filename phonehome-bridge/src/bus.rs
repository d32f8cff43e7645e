//! Notification bus: one registry per callback kind plus the event feed.
//!
//! The listener dispatches every accepted callback here; test code obtains
//! [`Waiter`]s from here. Cloning the bus shares the same registries.

use crate::events::{
    CALLBACK_DELIVERED, CALLBACK_DROPPED, CALLBACK_RECEIVED, CallbackEvent, DropReason, EventBus,
};
use crate::registry::{CorrelationRegistry, RegistryError};
use crate::waiter::{WaitOutcome, Waiter};
use phonehome_common::{Callback, CallbackKind, CorrelationToken, preview_payload};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// What happened to a dispatched callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the waiter registered for its token.
    Delivered,
    /// Dropped; see the reason.
    Dropped(DropReason),
}

#[derive(Clone, Debug)]
pub struct NotificationBus {
    connectivity: Arc<CorrelationRegistry>,
    metadata: Arc<CorrelationRegistry>,
    events: EventBus,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::with_events(EventBus::default())
    }

    pub fn with_events(events: EventBus) -> Self {
        Self {
            connectivity: Arc::new(CorrelationRegistry::new(CallbackKind::Connectivity)),
            metadata: Arc::new(CorrelationRegistry::new(CallbackKind::Metadata)),
            events,
        }
    }

    pub fn registry(&self, kind: CallbackKind) -> &Arc<CorrelationRegistry> {
        match kind {
            CallbackKind::Connectivity => &self.connectivity,
            CallbackKind::Metadata => &self.metadata,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// A waiter for callbacks of `kind`.
    pub fn waiter(&self, kind: CallbackKind) -> Waiter {
        Waiter::new(self.registry(kind).clone(), self.events.clone())
    }

    /// Wait up to `timeout` for a `kind` callback carrying `token`.
    pub async fn wait(
        &self,
        kind: CallbackKind,
        token: CorrelationToken,
        timeout: Duration,
    ) -> Result<WaitOutcome, RegistryError> {
        self.waiter(kind).wait(token, timeout).await
    }

    /// Route a callback to the waiter registered for its kind and token.
    pub fn dispatch(&self, callback: Callback) -> Dispatch {
        let kind = callback.kind;
        self.events
            .emit(CALLBACK_RECEIVED, &CallbackEvent::new(&callback));

        let Some(token) = callback.token.clone() else {
            debug!(
                %kind,
                transaction_id = %callback.transaction_id,
                payload = %preview_payload(&callback.payload),
                "Callback carries no hostname; cannot correlate it with any waiter"
            );
            self.events.emit(
                CALLBACK_DROPPED,
                &CallbackEvent::new(&callback).with_reason(DropReason::NoToken),
            );
            return Dispatch::Dropped(DropReason::NoToken);
        };

        // Keep what the events need; the callback itself moves into the registry.
        let record = callback.clone();
        if self.registry(kind).publish(&token, callback) {
            info!(
                %kind,
                %token,
                transaction_id = %record.transaction_id,
                "Callback delivered to waiting test"
            );
            self.events
                .emit(CALLBACK_DELIVERED, &CallbackEvent::new(&record));
            Dispatch::Delivered
        } else {
            debug!(
                %kind,
                %token,
                transaction_id = %record.transaction_id,
                "Received data is not awaited here; it probably belongs to another test run. Dropping it"
            );
            self.events.emit(
                CALLBACK_DROPPED,
                &CallbackEvent::new(&record).with_reason(DropReason::NoWaiter),
            );
            Dispatch::Dropped(DropReason::NoWaiter)
        }
    }

    /// Pending registrations for `kind`.
    pub fn pending(&self, kind: CallbackKind) -> usize {
        self.registry(kind).len()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

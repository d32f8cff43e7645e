//! Correlation registry: maps a live wait to the channel that completes it.
//!
//! One registry exists per [`CallbackKind`], so callbacks of one topic never
//! contend with the other topic's lock. Each entry is single-use: `publish`
//! removes it and hands the callback over in the same critical section, and
//! `unregister` only removes an entry it owns. A waiter that gives up and a
//! callback that arrives at the same instant therefore resolve to exactly one
//! of "delivered" or "unregistered".

use phonehome_common::{Callback, CallbackKind, CorrelationToken};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Errors returned by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Another wait for the same token is still outstanding.
    #[error("a {kind} wait for token '{token}' is already registered")]
    AlreadyRegistered {
        kind: CallbackKind,
        token: CorrelationToken,
    },
}

/// Identifies one registration, so cleanup never removes a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

struct Slot {
    id: RegistrationId,
    sender: oneshot::Sender<Callback>,
}

/// Receiving side of a registration, owned by the waiter that created it.
#[derive(Debug)]
pub struct DeliveryHandle {
    token: CorrelationToken,
    id: RegistrationId,
    receiver: oneshot::Receiver<Callback>,
}

impl DeliveryHandle {
    pub fn token(&self) -> &CorrelationToken {
        &self.token
    }

    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub(crate) fn into_parts(
        self,
    ) -> (CorrelationToken, RegistrationId, oneshot::Receiver<Callback>) {
        (self.token, self.id, self.receiver)
    }
}

/// Concurrency-safe map from token to pending delivery for one callback kind.
pub struct CorrelationRegistry {
    kind: CallbackKind,
    entries: Mutex<HashMap<CorrelationToken, Slot>>,
    next_id: AtomicU64,
}

impl CorrelationRegistry {
    pub fn new(kind: CallbackKind) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn kind(&self) -> CallbackKind {
        self.kind
    }

    // The map holds plain values, so a panic elsewhere cannot leave it torn.
    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationToken, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a single-use registration for `token`.
    ///
    /// Fails if a live registration already exists for the token. An entry
    /// whose handle has been dropped is replaced.
    pub fn register(&self, token: CorrelationToken) -> Result<DeliveryHandle, RegistryError> {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();

        let mut entries = self.lock();
        match entries.entry(token.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().sender.is_closed() {
                    return Err(RegistryError::AlreadyRegistered {
                        kind: self.kind,
                        token,
                    });
                }
                debug!(kind = %self.kind, token = %token, "Replacing abandoned registration");
                occupied.insert(Slot { id, sender });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot { id, sender });
            }
        }
        drop(entries);

        trace!(kind = %self.kind, token = %token, id = id.0, "Registered waiter");
        Ok(DeliveryHandle {
            token,
            id,
            receiver,
        })
    }

    /// Deliver `callback` to the registration for `token`, if there is one.
    ///
    /// Returns `true` only when the callback was handed to a live receiver.
    /// The registration is consumed either way; nothing is buffered.
    pub fn publish(&self, token: &CorrelationToken, callback: Callback) -> bool {
        let mut entries = self.lock();
        let Some(slot) = entries.remove(token) else {
            return false;
        };
        // Sending under the lock keeps remove+send atomic against `unregister`.
        let delivered = slot.sender.send(callback).is_ok();
        drop(entries);

        if !delivered {
            debug!(kind = %self.kind, token = %token, "Registration found but its waiter is gone");
        }
        delivered
    }

    /// Remove the registration `id` for `token`, if it is still pending.
    ///
    /// Returns `false` when the entry was already consumed by `publish` or
    /// belongs to a different registration.
    pub fn unregister(&self, token: &CorrelationToken, id: RegistrationId) -> bool {
        let mut entries = self.lock();
        let owned = entries.get(token).is_some_and(|slot| slot.id == id);
        if owned {
            entries.remove(token);
        }
        owned
    }

    /// Whether a wait for `token` is currently pending.
    pub fn is_registered(&self, token: &CorrelationToken) -> bool {
        self.lock().contains_key(token)
    }

    /// Number of pending registrations.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("kind", &self.kind)
            .field("pending", &self.len())
            .finish()
    }
}

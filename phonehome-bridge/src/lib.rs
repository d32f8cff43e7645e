//! PhoneHome bridge.
//!
//! Receives boot-time callbacks from test VMs over HTTP and hands each one to
//! the test that is waiting for that VM, matched by hostname.

pub mod bridge;
pub mod bus;
pub mod events;
pub mod http_api;
pub mod registry;
pub mod waiter;

pub use bridge::{BridgeError, BridgeState, PhoneHomeBridge, StopHandle};
pub use bus::{Dispatch, NotificationBus};
pub use events::{DropReason, EventBus};
pub use registry::{CorrelationRegistry, DeliveryHandle, RegistrationId, RegistryError};
pub use waiter::{WaitOutcome, Waiter};

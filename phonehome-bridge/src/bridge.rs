//! Bridge lifecycle: bind the listener, serve, shut down.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::bus::NotificationBus;
use crate::http_api::{ListenerState, create_router};
use crate::waiter::Waiter;
use phonehome_common::{BridgeConfig, CallbackKind, ConfigError, HostnameExtractor, ServeMode};

/// Lifecycle state of a [`PhoneHomeBridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Listening,
    Stopped,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Listening => "listening",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot {action} a bridge that is {state}")]
    InvalidState {
        action: &'static str,
        state: BridgeState,
    },
    #[error("failed to bind phone-home listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid hostname pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("listener failed: {0}")]
    Serve(#[source] std::io::Error),
    #[error("listener task failed: {0}")]
    Join(#[from] JoinError),
}

/// Requests a graceful shutdown of a running bridge from anywhere.
#[derive(Clone, Debug)]
pub struct StopHandle {
    signal: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        // notify_one keeps a permit, so a stop issued before the server
        // starts waiting is not lost.
        self.signal.notify_one();
    }
}

/// The phone-home listener plus the bus its callbacks are dispatched on.
pub struct PhoneHomeBridge {
    config: BridgeConfig,
    bus: NotificationBus,
    extractor: HostnameExtractor,
    stop_signal: Arc<Notify>,
    state: BridgeState,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl PhoneHomeBridge {
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        Self::with_bus(config, NotificationBus::new())
    }

    /// Build a bridge dispatching onto an existing bus.
    pub fn with_bus(config: BridgeConfig, bus: NotificationBus) -> Result<Self, BridgeError> {
        config.validate()?;
        Ok(Self {
            config,
            bus,
            extractor: HostnameExtractor::new()?,
            stop_signal: Arc::new(Notify::new()),
            state: BridgeState::Uninitialized,
            local_addr: None,
            task: None,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// A waiter for callbacks of `kind` arriving at this bridge.
    pub fn waiter(&self, kind: CallbackKind) -> Waiter {
        self.bus.waiter(kind)
    }

    /// Current state. A single-shot server that has finished on its own
    /// reports `Stopped` even before [`join`](Self::join) is called.
    pub fn state(&self) -> BridgeState {
        match (&self.state, &self.task) {
            (BridgeState::Listening, Some(task)) if task.is_finished() => BridgeState::Stopped,
            (state, _) => *state,
        }
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            signal: self.stop_signal.clone(),
        }
    }

    /// Bind the listener and start serving in the background.
    pub async fn start(&mut self) -> Result<SocketAddr, BridgeError> {
        if self.state != BridgeState::Uninitialized {
            return Err(BridgeError::InvalidState {
                action: "start",
                state: self.state,
            });
        }

        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(BridgeError::Serve)?;

        let state = ListenerState::new(self.bus.clone(), self.extractor.clone(), &self.config);
        let mut router = create_router(state, &self.config);
        let stop = self.stop_signal.clone();
        let answered = Arc::new(Notify::new());
        let idle = match self.config.mode {
            ServeMode::Forever => None,
            ServeMode::SingleShot => {
                router = router.layer(middleware::from_fn_with_state(
                    answered.clone(),
                    notify_when_answered,
                ));
                Some(self.config.effective_single_shot_timeout())
            }
        };

        info!(
            addr = %local_addr,
            mode = %self.config.mode,
            connectivity_path = %self.config.connectivity_path,
            metadata_path = %self.config.metadata_path,
            "PhoneHome listener started"
        );

        self.task = Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal(stop, answered, idle))
                .await
        }));
        self.local_addr = Some(local_addr);
        self.state = BridgeState::Listening;
        Ok(local_addr)
    }

    /// Trigger graceful shutdown and wait for the listener to exit.
    ///
    /// Pending waiters are left to their own timeouts.
    pub async fn stop(&mut self) -> Result<(), BridgeError> {
        match self.state {
            BridgeState::Uninitialized => Err(BridgeError::InvalidState {
                action: "stop",
                state: self.state,
            }),
            BridgeState::Stopped => Ok(()),
            BridgeState::Listening => {
                self.stop_signal.notify_one();
                self.join().await
            }
        }
    }

    /// Wait for the listener to exit without requesting shutdown.
    pub async fn join(&mut self) -> Result<(), BridgeError> {
        if self.state != BridgeState::Listening {
            return Err(BridgeError::InvalidState {
                action: "join",
                state: self.state,
            });
        }
        let Some(task) = self.task.as_mut() else {
            self.state = BridgeState::Stopped;
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        self.state = BridgeState::Stopped;
        let result = joined?.map_err(BridgeError::Serve);
        info!(pending = self.pending_waits(), "PhoneHome listener stopped");
        result
    }

    fn pending_waits(&self) -> usize {
        CallbackKind::ALL.iter().map(|kind| self.bus.pending(*kind)).sum()
    }

    /// Serve for at most `limit`, then stop. Mostly useful in tests.
    pub async fn run_for(&mut self, limit: Duration) -> Result<(), BridgeError> {
        if self.state == BridgeState::Uninitialized {
            self.start().await?;
        }
        let stop = self.stop_handle();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            stop.stop();
        });
        let result = self.join().await;
        timer.abort();
        result
    }
}

impl Drop for PhoneHomeBridge {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for PhoneHomeBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhoneHomeBridge")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr)
            .field("mode", &self.config.mode)
            .finish()
    }
}

/// Resolves when the server should begin graceful shutdown.
async fn shutdown_signal(stop: Arc<Notify>, answered: Arc<Notify>, idle: Option<Duration>) {
    match idle {
        None => stop.notified().await,
        Some(idle) => {
            tokio::select! {
                _ = stop.notified() => {}
                _ = answered.notified() => {
                    info!("Single-shot request answered; shutting down");
                }
                _ = tokio::time::sleep(idle) => {
                    warn!(
                        idle_secs = idle.as_secs(),
                        "No request received before the single-shot timeout; shutting down"
                    );
                }
            }
        }
    }
    debug!("Graceful shutdown started");
}

async fn notify_when_answered(
    State(answered): State<Arc<Notify>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    answered.notify_one();
    response
}

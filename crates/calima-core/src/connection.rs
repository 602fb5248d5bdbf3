//! Connection lifecycle for one fan.
//!
//! [`ConnectionManager`] owns the only link to a device. It turns the
//! [`Discovery`] capability into a durable connection: find the peripheral,
//! connect under a timeout, retry on the [`Backoff`] schedule, and reconnect
//! in the background when the fan drops the link.
//!
//! All use of the link goes through a [`LinkLease`], which holds the
//! device's operation lock. Leases are granted in FIFO order, so a sync and
//! a manual action never interleave their transport calls.
//!
//! ```text
//! Idle -> Discovering -> Found -> Connecting -> Connected
//!              ^           ^          |             |
//!              +-----------+----------+        Disconnected -> Connecting ...
//!
//! any phase -> Closed (terminal, after close())
//! ```

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use calima_types::DeviceIdentity;

use crate::advertisement::Advertisement;
use crate::client::ProtocolClient;
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::events::{DeviceEvent, DeviceId, DisconnectReason, EventDispatcher, EventReceiver};
use crate::reconnect::{Backoff, ReconnectPolicy};
use crate::traits::{Discovery, Link};

/// Phase of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    /// Nothing attempted yet.
    Idle,
    /// Scanning for the device.
    Discovering,
    /// Advertisement cached, not connected.
    Found,
    /// Connect in flight.
    Connecting,
    /// Link is up.
    Connected,
    /// Link went down (released or lost).
    Disconnected,
    /// Manager shut down; no further transitions.
    Closed,
}

impl std::fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkPhase::Idle => "idle",
            LinkPhase::Discovering => "discovering",
            LinkPhase::Found => "found",
            LinkPhase::Connecting => "connecting",
            LinkPhase::Connected => "connected",
            LinkPhase::Disconnected => "disconnected",
            LinkPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Snapshot of a device's connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    /// Current phase.
    pub phase: LinkPhase,
    /// Message of the last failed attempt, cleared on success.
    pub last_error: Option<String>,
    /// Attempts since the last successful connection.
    pub attempts: u32,
    /// Delay the next attempt will wait.
    pub retry_delay: Duration,
}

struct Shared {
    phase: LinkPhase,
    last_error: Option<String>,
    backoff: Backoff,
    advertisement: Option<(Advertisement, Instant)>,
    link: Option<Arc<dyn Link>>,
    generation: u64,
}

struct Inner {
    name: String,
    identity: DeviceIdentity,
    discovery: Arc<dyn Discovery>,
    policy: ReconnectPolicy,
    /// FIFO operation lock; whoever holds it owns the link.
    op_lock: Arc<AsyncMutex<()>>,
    shared: Mutex<Shared>,
    connecting: AtomicBool,
    events: EventDispatcher,
    cancel: CancellationToken,
}

/// Lowers the connecting flag when dropped.
struct ConnectingFlag<'a>(&'a AtomicBool);

impl<'a> ConnectingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ConnectingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn wait_for_disconnect(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|down| *down).await.is_ok()
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device_id(&self) -> DeviceId {
        DeviceId::with_name(self.identity.address.clone(), self.name.clone())
    }

    fn set_phase(&self, phase: LinkPhase) {
        {
            let mut shared = self.shared();
            if shared.phase == phase || shared.phase == LinkPhase::Closed {
                return;
            }
            shared.phase = phase;
        }
        info!(device = %self.name, %phase, "Link phase changed");
        self.events.send(DeviceEvent::PhaseChanged {
            device: self.device_id(),
            phase,
        });
    }

    fn take_link(&self) -> Option<Arc<dyn Link>> {
        self.shared().link.take()
    }

    /// Return the open link, connecting first if needed.
    ///
    /// Callers must hold the operation lock.
    async fn ensure_link(self: &Arc<Self>) -> Result<(Arc<dyn Link>, u32)> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let current = self.shared().link.clone();
        if let Some(link) = current {
            if link.is_connected().await {
                return Ok((link, 0));
            }
            debug!(device = %self.name, "Cached link is down, reconnecting");
            self.take_link();
            self.set_phase(LinkPhase::Disconnected);
        }

        let _connecting = ConnectingFlag::raise(&self.connecting);
        let mut attempts = 0u32;
        let mut last_error = None;

        loop {
            if self.policy.max_attempts.is_some_and(|max| attempts >= max) {
                break;
            }

            let delay = self.shared().backoff.next_delay();
            if !delay.is_zero() {
                debug!(device = %self.name, delay_secs = delay.as_secs(), "Waiting before next connection attempt");
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    _ = sleep(delay) => {}
                }
            }
            attempts += 1;

            match self.connect_once().await {
                Ok(link) => {
                    self.install(link.clone());
                    return Ok((link, attempts));
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(device = %self.name, attempt = attempts, error = %e, "Connection attempt failed");
                    self.shared().last_error = Some(e.to_string());
                    self.events.send(DeviceEvent::Error {
                        device: self.device_id(),
                        error: e.to_string(),
                    });
                    if !e.is_retryable() {
                        debug!(device = %self.name, "Error is not retryable, giving up");
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(Error::NotConnected))
    }

    async fn connect_once(&self) -> Result<Arc<dyn Link>> {
        let cached = self.shared().advertisement.clone();
        let (advertisement, fresh) = match cached {
            Some((adv, seen)) if seen.elapsed() < self.policy.advertisement_ttl => (adv, false),
            _ => (self.discover().await?, true),
        };

        self.set_phase(LinkPhase::Connecting);
        let connect = timeout(
            self.policy.connect_timeout,
            self.discovery.connect(&advertisement),
        );
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = connect => result,
        };

        let failure = match result {
            Ok(Ok(link)) => {
                if link.is_connected().await {
                    return Ok(link);
                }
                let _ = link.disconnect().await;
                Error::connection_failed(
                    Some(self.identity.address.clone()),
                    ConnectionFailureReason::NotLive,
                )
            }
            Ok(Err(e)) => e,
            Err(_) => Error::connection_failed(
                Some(self.identity.address.clone()),
                ConnectionFailureReason::Timeout,
            ),
        };

        // A reused advertisement that fails to connect is treated as stale.
        if fresh {
            self.set_phase(LinkPhase::Found);
        } else {
            self.shared().advertisement = None;
            self.set_phase(LinkPhase::Discovering);
        }
        Err(failure)
    }

    async fn discover(&self) -> Result<Advertisement> {
        self.set_phase(LinkPhase::Discovering);
        let find = self.discovery.find(&self.identity.id);
        let advertisement = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = find => result?,
        };
        debug!(device = %self.name, address = %advertisement.address, "Found advertisement");
        self.shared().advertisement = Some((advertisement.clone(), Instant::now()));
        self.set_phase(LinkPhase::Found);
        Ok(advertisement)
    }

    fn install(self: &Arc<Self>, link: Arc<dyn Link>) {
        let generation = {
            let mut shared = self.shared();
            shared.generation += 1;
            shared.link = Some(link.clone());
            shared.backoff.reset();
            shared.last_error = None;
            shared.generation
        };
        self.set_phase(LinkPhase::Connected);
        self.events.send(DeviceEvent::Connected {
            device: self.device_id(),
        });
        self.spawn_watcher(link, generation);
    }

    fn spawn_watcher(self: &Arc<Self>, link: Arc<dyn Link>, generation: u64) {
        let mut rx = link.disconnect_notifier();
        let cancel = self.cancel.clone();
        let weak: Weak<Inner> = Arc::downgrade(self);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                down = wait_for_disconnect(&mut rx) => {
                    if !down {
                        return;
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.on_link_lost(generation).await;
            }
        });
    }

    async fn on_link_lost(self: Arc<Self>, generation: u64) {
        let lost = {
            let mut shared = self.shared();
            if shared.generation == generation && shared.link.is_some() {
                shared.link = None;
                true
            } else {
                false
            }
        };
        if !lost {
            return;
        }

        warn!(device = %self.name, "Link lost unexpectedly");
        self.set_phase(LinkPhase::Disconnected);
        self.events.send(DeviceEvent::Disconnected {
            device: self.device_id(),
            reason: DisconnectReason::Unsolicited,
        });

        if !self.policy.auto_reconnect || self.cancel.is_cancelled() {
            return;
        }

        let attempt = self.shared().backoff.attempt() + 1;
        info!(device = %self.name, "Starting background reconnect");
        self.events.send(DeviceEvent::ReconnectStarted {
            device: self.device_id(),
            attempt,
        });

        let _guard = tokio::select! {
            _ = self.cancel.cancelled() => return,
            guard = self.op_lock.clone().lock_owned() => guard,
        };

        let relinked = self.shared().link.is_some();
        if relinked {
            return;
        }

        match self.ensure_link().await {
            Ok((_, attempts)) => {
                info!(device = %self.name, attempts, "Background reconnect succeeded");
                self.events.send(DeviceEvent::ReconnectSucceeded {
                    device: self.device_id(),
                    attempts,
                });
            }
            Err(e) => {
                warn!(device = %self.name, error = %e, "Background reconnect gave up");
            }
        }
    }

    async fn disconnect_current(&self, reason: DisconnectReason) -> Result<()> {
        let Some(link) = self.take_link() else {
            return Ok(());
        };
        self.set_phase(LinkPhase::Disconnected);
        let result = link.disconnect().await;
        if let Err(e) = &result {
            debug!(device = %self.name, error = %e, "Disconnect failed (link may already be down)");
        }
        self.events.send(DeviceEvent::Disconnected {
            device: self.device_id(),
            reason,
        });
        result
    }
}

/// Owner of the single link to one fan.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.inner.name)
            .field("address", &self.inner.identity.address)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager with its own event channel.
    pub fn new(
        name: impl Into<String>,
        identity: DeviceIdentity,
        discovery: Arc<dyn Discovery>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self::with_events(name, identity, discovery, policy, EventDispatcher::default())
    }

    /// Create a manager that publishes to `events`.
    pub fn with_events(
        name: impl Into<String>,
        identity: DeviceIdentity,
        discovery: Arc<dyn Discovery>,
        policy: ReconnectPolicy,
        events: EventDispatcher,
    ) -> Self {
        let backoff = Backoff::from_policy(&policy);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                identity,
                discovery,
                policy,
                op_lock: Arc::new(AsyncMutex::new(())),
                shared: Mutex::new(Shared {
                    phase: LinkPhase::Idle,
                    last_error: None,
                    backoff,
                    advertisement: None,
                    link: None,
                    generation: 0,
                }),
                connecting: AtomicBool::new(false),
                events,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Identity of the managed device.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    /// Current phase.
    pub fn phase(&self) -> LinkPhase {
        self.inner.shared().phase
    }

    /// Snapshot of the connection status.
    pub fn state(&self) -> LinkState {
        let shared = self.inner.shared();
        LinkState {
            phase: shared.phase,
            last_error: shared.last_error.clone(),
            attempts: shared.backoff.attempt(),
            retry_delay: shared.backoff.peek_delay(),
        }
    }

    /// Subscribe to this manager's events.
    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    async fn lock(&self) -> Result<OwnedMutexGuard<()>> {
        if self.is_closed() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(Error::Cancelled),
            guard = self.inner.op_lock.clone().lock_owned() => Ok(guard),
        }
    }

    /// Wait for exclusive use of the device and return a connected lease.
    ///
    /// Waits behind earlier leases in FIFO order. Connecting is bounded by
    /// the policy's `max_attempts`.
    #[tracing::instrument(level = "debug", skip(self), fields(device = %self.inner.name))]
    pub async fn lease(&self) -> Result<LinkLease> {
        let guard = self.lock().await?;
        let (link, _) = self.inner.ensure_link().await?;
        Ok(LinkLease {
            client: ProtocolClient::new(link, self.inner.identity.pin.clone()),
            inner: self.inner.clone(),
            guard: Some(guard),
        })
    }

    /// Establish the link without taking a lease.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectInProgress`] if another connection attempt is running.
    #[tracing::instrument(level = "info", skip(self), fields(device = %self.inner.name))]
    pub async fn try_connect(&self) -> Result<()> {
        if self.inner.connecting.load(Ordering::SeqCst) {
            return Err(Error::ConnectInProgress);
        }
        let _guard = self.lock().await?;
        self.inner.ensure_link().await.map(|_| ())
    }

    /// Cancel timers and background reconnects, disconnect, and move to
    /// [`LinkPhase::Closed`]. Later calls fail with [`Error::Cancelled`].
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        info!(device = %self.inner.name, "Closing connection");
        self.inner.cancel.cancel();
        let link = self.inner.take_link();
        self.inner.shared().phase = LinkPhase::Closed;
        self.inner.events.send(DeviceEvent::PhaseChanged {
            device: self.inner.device_id(),
            phase: LinkPhase::Closed,
        });

        if let Some(link) = link {
            if let Err(e) = link.disconnect().await {
                debug!(device = %self.inner.name, error = %e, "Disconnect on close failed");
            }
            self.inner.events.send(DeviceEvent::Disconnected {
                device: self.inner.device_id(),
                reason: DisconnectReason::Closed,
            });
        }
    }
}

/// Exclusive, connected access to a device.
///
/// Dereferences to the [`ProtocolClient`] bound to the link. Call
/// [`release`](Self::release) when done; dropping the lease instead still
/// frees the device but disconnects in the background.
pub struct LinkLease {
    client: ProtocolClient,
    inner: Arc<Inner>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for LinkLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkLease")
            .field("device", &self.inner.name)
            .field("released", &self.guard.is_none())
            .finish()
    }
}

impl LinkLease {
    /// Client for the leased link.
    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    /// Disconnect the link and free the device for the next lease holder.
    pub async fn release(mut self) -> Result<()> {
        let result = self
            .inner
            .disconnect_current(DisconnectReason::Released)
            .await;
        self.guard.take();
        result
    }
}

impl Deref for LinkLease {
    type Target = ProtocolClient;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl Drop for LinkLease {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };

        let link = self.inner.take_link();
        self.inner.set_phase(LinkPhase::Disconnected);
        drop(guard);

        let Some(link) = link else {
            return;
        };
        warn!(
            device = %self.inner.name,
            "LinkLease dropped without release() - disconnecting in the background"
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let name = self.inner.name.clone();
            handle.spawn(async move {
                if let Err(e) = link.disconnect().await {
                    debug!(device = %name, error = %e, "Best-effort disconnect failed");
                }
            });
        }
    }
}

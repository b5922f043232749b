//! Monitoring orchestrator
//!
//! Top-level state machine: fetch the monitoring mode, acquire data (device
//! readings or location fixes), dispatch to the backend, relay haptic
//! commands back to the device. Every stage retries itself on failure; the
//! pipeline only restarts from the top when the mode fetch itself failed.
//!
//! Concurrency discipline: every event that originates off the control
//! loop (device lines, location batches, timer firings, backend post
//! completions) is funnelled through the channels this loop selects over,
//! so state transitions are never interleaved. Backend posts are
//! fire-and-continue on spawned tasks; their completions re-enter through
//! the same loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendClient, LocationSample, NetworkError};
use crate::config::AgentConfig;
use crate::identity::{self, DeviceIdentity};
use crate::link::{ConnectionState, DeviceLink, LinkError, LinkEvent, LinkEventKind};
use crate::platform::{BondedDevice, LocationFix, PermissionKind, Platform, PlatformError};
use crate::protocol::{self, HapticCommand, MonitoringMode, Reading};
use crate::retry::{RetryPolicy, RetryState};

/// Conditions the embedder must show to the user. Everything else is
/// retried or skipped internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAlert {
    /// The bounded mode-fetch retry budget is exhausted; the session is
    /// over until restarted.
    ModeFetchAborted { attempts: u32, reason: String },
    /// An operation needs a permission the user has not granted. Not
    /// retried; re-trigger after the grant.
    PermissionDenied { kind: PermissionKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerEvent {
    FetchMode,
    Reconnect,
}

type PostOutcome = Result<HapticCommand, NetworkError>;

pub struct Orchestrator<P: Platform> {
    platform: Arc<P>,
    backend: BackendClient,
    link: DeviceLink<P>,
    mode: MonitoringMode,
    device_filter: String,
    min_location_interval: Duration,

    fetch_policy: RetryPolicy,
    fetch_retry: RetryState,
    connect_policy: RetryPolicy,
    connect_retry: RetryState,
    /// At most one reconnect may be pending at a time.
    reconnect_pending: bool,
    /// Set once the bounded mode-fetch budget is exhausted.
    aborted: bool,

    timers: Vec<JoinHandle<()>>,
    timer_tx: mpsc::Sender<TimerEvent>,
    timer_rx: Option<mpsc::Receiver<TimerEvent>>,
    link_rx: Option<mpsc::Receiver<LinkEvent>>,
    loc_tx: mpsc::Sender<Vec<LocationFix>>,
    loc_rx: Option<mpsc::Receiver<Vec<LocationFix>>>,
    post_tx: mpsc::Sender<PostOutcome>,
    post_rx: Option<mpsc::Receiver<PostOutcome>>,
    alerts: mpsc::Sender<UserAlert>,
}

/// Handle returned by [`Orchestrator::start`]; dropping it without calling
/// `stop` leaves the session running detached.
pub struct OrchestratorHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.task.await;
    }
}

impl<P: Platform> Orchestrator<P> {
    pub fn new(
        platform: Arc<P>,
        backend: BackendClient,
        config: &AgentConfig,
    ) -> (Self, mpsc::Receiver<UserAlert>) {
        let (link_tx, link_rx) = mpsc::channel(64);
        let (timer_tx, timer_rx) = mpsc::channel(32);
        let (loc_tx, loc_rx) = mpsc::channel(16);
        let (post_tx, post_rx) = mpsc::channel(16);
        let (alert_tx, alert_rx) = mpsc::channel(16);

        let orchestrator = Self {
            link: DeviceLink::new(platform.clone(), link_tx),
            platform,
            backend,
            mode: MonitoringMode::Unknown,
            device_filter: config.device.name_filter.to_lowercase(),
            min_location_interval: Duration::from_millis(config.location.min_update_interval_ms),
            fetch_policy: RetryPolicy::bounded(
                Duration::from_millis(config.retry.mode_fetch_delay_ms),
                config.retry.mode_fetch_limit,
            ),
            fetch_retry: RetryState::default(),
            connect_policy: RetryPolicy::unbounded(Duration::from_millis(
                config.retry.reconnect_delay_ms,
            )),
            connect_retry: RetryState::default(),
            reconnect_pending: false,
            aborted: false,
            timers: Vec::new(),
            timer_tx,
            timer_rx: Some(timer_rx),
            link_rx: Some(link_rx),
            loc_tx,
            loc_rx: Some(loc_rx),
            post_tx,
            post_rx: Some(post_rx),
            alerts: alert_tx,
        };
        (orchestrator, alert_rx)
    }

    /// Spawn the control loop; `stop` on the handle tears the session down.
    pub fn start(self) -> OrchestratorHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(stop_rx));
        OrchestratorHandle { stop_tx, task }
    }

    /// The serialized control loop. Runs until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        // `run` consumes self, so the receivers are always still in place.
        let mut link_rx = self.link_rx.take().expect("control loop receivers present");
        let mut timer_rx = self.timer_rx.take().expect("control loop receivers present");
        let mut loc_rx = self.loc_rx.take().expect("control loop receivers present");
        let mut post_rx = self.post_rx.take().expect("control loop receivers present");

        info!("monitoring orchestrator started");
        self.attempt_fetch_mode().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Some(event) = link_rx.recv() => self.on_link_event(event).await,
                Some(batch) = loc_rx.recv() => self.on_location_batch(batch),
                Some(timer) = timer_rx.recv() => self.on_timer(timer).await,
                Some(outcome) = post_rx.recv() => self.on_post_outcome(outcome).await,
            }
        }
        self.teardown();
    }

    // --- FetchingMode ---------------------------------------------------

    async fn attempt_fetch_mode(&mut self) {
        if self.aborted {
            return;
        }
        match self.backend.fetch_mode().await {
            Ok(mode) => {
                self.fetch_retry.reset();
                info!(%mode, "monitoring mode received");
                self.mode = mode;
                self.enter_mode().await;
            }
            Err(err) => {
                self.fetch_retry.record_failure();
                if self.fetch_retry.should_retry(&self.fetch_policy) {
                    let delay = self.fetch_policy.next_delay(self.fetch_retry.attempt);
                    warn!(%err, attempt = self.fetch_retry.attempt, ?delay, "mode fetch failed, retrying");
                    self.schedule(TimerEvent::FetchMode, delay);
                } else {
                    error!(%err, attempts = self.fetch_retry.attempt, "mode fetch abandoned, aborting session");
                    self.aborted = true;
                    self.alert(UserAlert::ModeFetchAborted {
                        attempts: self.fetch_retry.attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    async fn enter_mode(&mut self) {
        match self.mode {
            MonitoringMode::HeartRate => {
                self.connect_device().await;
            }
            MonitoringMode::SunAzimuth | MonitoringMode::MoonAzimuth => {
                if !self.platform.has_permission(PermissionKind::FineLocation) {
                    warn!("location permission not granted");
                    self.alert(UserAlert::PermissionDenied {
                        kind: PermissionKind::FineLocation,
                    });
                    return;
                }
                // The device link still gets connected so haptic feedback
                // can be delivered for celestial modes.
                self.connect_device().await;
                self.platform
                    .start_location_updates(self.min_location_interval, self.loc_tx.clone());
                if let Some(fix) = self.platform.last_location().await {
                    self.on_location_batch(vec![fix]);
                }
            }
            MonitoringMode::Unknown => {
                // fetch_mode never yields Unknown as a success.
                error!("entered Unknown mode, ignoring");
            }
        }
    }

    // --- Device connection ----------------------------------------------

    async fn connect_device(&mut self) {
        if self.aborted {
            return;
        }
        let device = match self.find_watch() {
            Ok(Some(device)) => device,
            Ok(None) => {
                error!(filter = %self.device_filter, "no paired watch found");
                self.connect_retry.record_failure();
                self.schedule_reconnect();
                return;
            }
            Err(PlatformError::PermissionDenied(kind)) => {
                error!(?kind, "device discovery refused: permission missing");
                self.alert(UserAlert::PermissionDenied { kind });
                return;
            }
            Err(err) => {
                error!(%err, "device discovery failed");
                self.connect_retry.record_failure();
                self.schedule_reconnect();
                return;
            }
        };

        match self.link.connect(&device.id, self.mode).await {
            Ok(()) => {
                self.connect_retry.reset();
            }
            Err(LinkError::PermissionDenied) => {
                self.alert(UserAlert::PermissionDenied {
                    kind: PermissionKind::DeviceConnect,
                });
            }
            Err(err) => {
                error!(%err, device = %device.display_name, "device connect failed");
                self.connect_retry.record_failure();
                self.schedule_reconnect();
            }
        }
    }

    /// First bonded device whose display name contains the filter
    /// substring, case-insensitive. No ranking beyond first-match order.
    fn find_watch(&self) -> Result<Option<BondedDevice>, PlatformError> {
        if !self.platform.has_permission(PermissionKind::DeviceConnect) {
            return Err(PlatformError::PermissionDenied(PermissionKind::DeviceConnect));
        }
        let devices = self.platform.bonded_devices()?;
        Ok(devices
            .into_iter()
            .find(|d| d.display_name.to_lowercase().contains(&self.device_filter)))
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_pending {
            debug!("reconnect already pending");
            return;
        }
        self.reconnect_pending = true;
        let delay = self.connect_policy.next_delay(self.connect_retry.attempt);
        info!(?delay, attempt = self.connect_retry.attempt, "reconnect scheduled");
        self.schedule(TimerEvent::Reconnect, delay);
    }

    // --- Event handlers --------------------------------------------------

    async fn on_link_event(&mut self, event: LinkEvent) {
        if event.attempt != self.link.attempt() {
            debug!(
                event_attempt = event.attempt,
                current = self.link.attempt(),
                "ignoring event from superseded connection attempt"
            );
            return;
        }
        match event.kind {
            LinkEventKind::Reading(reading) => self.dispatch_reading(reading),
            LinkEventKind::Decode { error, line } => {
                // Already logged by the read loop; nothing to do, the
                // stream continues.
                debug!(%error, %line, "decode failure observed");
            }
            LinkEventKind::Closed { error } => {
                match error {
                    Some(err) => error!(%err, "device link lost"),
                    None => warn!("device link closed by peer"),
                }
                self.link.mark_failed();
                self.connect_retry.record_failure();
                self.schedule_reconnect();
            }
        }
    }

    async fn on_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::FetchMode => self.attempt_fetch_mode().await,
            TimerEvent::Reconnect => {
                self.reconnect_pending = false;
                self.connect_device().await;
            }
        }
    }

    // --- Dispatching -----------------------------------------------------

    fn dispatch_reading(&mut self, reading: Reading) {
        if self.mode != MonitoringMode::HeartRate {
            debug!(mode = %self.mode, "reading ignored, not in heart-rate mode");
            return;
        }
        // The decoder refuses unresolved identities already; this is the
        // dispatch-side precondition on top of it.
        if !reading.identity.is_resolved() {
            warn!("reading skipped: identity unresolved");
            return;
        }
        debug!(value = reading.value, at = %reading.received_at, "dispatching reading");
        let backend = self.backend.clone();
        let tx = self.post_tx.clone();
        tokio::spawn(async move {
            let outcome = backend.post_heart_rate(&reading).await;
            let _ = tx.send(outcome).await;
        });
    }

    fn on_location_batch(&mut self, batch: Vec<LocationFix>) {
        if !self.mode.is_celestial() {
            debug!(mode = %self.mode, "location batch ignored");
            return;
        }
        // Smallest uncertainty radius wins within a batch.
        let Some(best) = batch
            .into_iter()
            .min_by(|a, b| a.accuracy_m.total_cmp(&b.accuracy_m))
        else {
            return;
        };

        let alias = self
            .link
            .device_id()
            .and_then(|id| self.platform.device_alias(id));
        let resolution = identity::resolve(
            DeviceIdentity::unknown(),
            self.platform.system_device_name().as_deref(),
            alias.as_deref(),
        );
        if resolution.unresolved {
            // Re-resolving needs a new reading, not a retransmission:
            // skip this cycle, do not retry it.
            warn!("location not sent: identity incomplete");
            return;
        }

        let sample = LocationSample {
            lat: best.lat,
            lon: best.lon,
            identity: resolution.identity,
        };
        debug!(lat = sample.lat, lon = sample.lon, "dispatching location sample");
        let backend = self.backend.clone();
        let tx = self.post_tx.clone();
        let mode = self.mode;
        tokio::spawn(async move {
            let outcome = backend.post_location(&sample, mode).await;
            let _ = tx.send(outcome).await;
        });
    }

    async fn on_post_outcome(&mut self, outcome: PostOutcome) {
        match outcome {
            Ok(cmd) if cmd.pulses > 0 => {
                let line = protocol::encode_haptic_command(&cmd);
                info!(
                    pulses = cmd.pulses,
                    intensity = cmd.intensity,
                    "relaying haptic command"
                );
                self.link.send_line(&line).await;
            }
            Ok(_) => {
                debug!("no haptic feedback requested (pulses=0)");
            }
            Err(err) => {
                // Post retries happen inside the client; only abandoned or
                // non-retriable failures land here.
                warn!(%err, "backend dispatch failed");
            }
        }
    }

    // --- Timers & lifecycle ----------------------------------------------

    fn schedule(&mut self, event: TimerEvent, delay: Duration) {
        let tx = self.timer_tx.clone();
        self.timers.retain(|t| !t.is_finished());
        self.timers.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event).await;
        }));
    }

    fn alert(&self, alert: UserAlert) {
        warn!(?alert, "user alert raised");
        if self.alerts.try_send(alert).is_err() {
            warn!("alert channel full or closed, alert dropped");
        }
    }

    /// Clear all pending timers for this session and release the link.
    fn teardown(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.platform.stop_location_updates();
        if self.link.state() != ConnectionState::Disconnected {
            self.link.disconnect();
        }
        info!("monitoring orchestrator stopped");
    }
}

//! Session lifecycle: spawns and supervises the producer/consumer pair.
//!
//! A session owns two tokio tasks sharing one [`InputBuffer`]:
//!
//! ```text
//! InputSource ──poll──► InputNormalizer ──frames──► InputBuffer
//!                                                       │ drain
//!                                                       ▼
//!                 CommandSink ◄──lines── CommandEmitter ◄── MovementCoordinator
//! ```
//!
//! The producer polls the device at a short interval and pushes one frame per
//! cycle; the consumer runs the coordinator tick loop. Settings and the work
//! envelope flow in through watch channels, session status and motion
//! snapshots flow out the same way. Shutdown is cooperative through a
//! [`CancellationToken`] with a bounded join timeout.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, Settings, WorkEnvelope};
use crate::gcode::{CommandEmitter, CommandSink, ControlCommand, EmitterError};
use crate::input::{InputBuffer, InputNormalizer, InputSource};
use crate::motion::{CoordinatorError, MotionSnapshot, MovementCoordinator, Waiting};

/// Errors raised while starting or stopping a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to send session preamble: {0}")]
    Preamble(#[from] EmitterError),

    #[error("Session channel closed: {0}")]
    Channel(String),

    #[error("Session tasks did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Externally visible session state, published through a watch channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub active: bool,
    /// Set when the session terminated on its own because of repeated
    /// failures; `None` for a clean shutdown.
    pub error: Option<String>,
}

/// Handle over a running control session.
///
/// Dropping the handle detaches the tasks; call [`SessionHandle::shutdown`]
/// for an orderly stop.
pub struct SessionHandle {
    cancel: CancellationToken,
    producer: JoinHandle<()>,
    consumer: JoinHandle<()>,
    settings_tx: watch::Sender<Settings>,
    envelope_tx: watch::Sender<WorkEnvelope>,
    status_rx: watch::Receiver<SessionStatus>,
    snapshot_rx: watch::Receiver<MotionSnapshot>,
}

impl SessionHandle {
    /// Validates the configuration, sends the activation preamble (absolute
    /// extrusion mode, then a homing cycle) and spawns both loops.
    pub fn spawn(
        source: Box<dyn InputSource>,
        sink: Box<dyn CommandSink>,
        settings: Settings,
        envelope: WorkEnvelope,
    ) -> Result<Self, SessionError> {
        settings.validate()?;
        envelope.validate()?;
        info!(
            "Starting control session: envelope {} x {} mm, tick {} ms",
            envelope.max_x, envelope.max_y, settings.motion.tick_interval_ms
        );

        let mut emitter = CommandEmitter::new(sink, settings.emitter.min_command_spacing_ms);
        emitter.begin_session()?;
        emitter.control(ControlCommand::Home)?;

        let buffer = Arc::new(InputBuffer::new(settings.motion.buffer_capacity));
        let wake = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        // Either loop can terminate the session fatally; the reason lands
        // here and the consumer publishes it with the inactive status.
        let fault_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let (settings_tx, settings_rx) = watch::channel(settings.clone());
        let (envelope_tx, envelope_rx) = watch::channel(envelope);
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            active: true,
            error: None,
        });
        let (snapshot_tx, snapshot_rx) = watch::channel(MotionSnapshot::default());

        let coordinator =
            MovementCoordinator::create(buffer.clone(), emitter, &settings, envelope);

        let producer = tokio::spawn(run_producer(
            source,
            buffer,
            wake.clone(),
            settings_rx.clone(),
            fault_slot.clone(),
            cancel.clone(),
        ));
        let consumer = tokio::spawn(run_consumer(
            coordinator,
            wake,
            settings_rx,
            envelope_rx,
            status_tx,
            snapshot_tx,
            fault_slot,
            cancel.clone(),
        ));

        Ok(Self {
            cancel,
            producer,
            consumer,
            settings_tx,
            envelope_tx,
            status_rx,
            snapshot_rx,
        })
    }

    /// Pushes a new settings object to both loops. Rejected atomically if any
    /// field is out of range; the running configuration is untouched then.
    pub fn update_settings(&self, settings: Settings) -> Result<(), SessionError> {
        settings.validate()?;
        self.settings_tx
            .send(settings)
            .map_err(|e| SessionError::Channel(e.to_string()))
    }

    /// Replaces the work envelope for subsequent ticks.
    pub fn set_envelope(&self, envelope: WorkEnvelope) -> Result<(), SessionError> {
        envelope.validate()?;
        self.envelope_tx
            .send(envelope)
            .map_err(|e| SessionError::Channel(e.to_string()))
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    pub fn snapshot(&self) -> MotionSnapshot {
        *self.snapshot_rx.borrow()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<MotionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Cancels both loops and waits for them to finish. Pending frames and
    /// undispatched moves are discarded; nothing is emitted past this point.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), SessionError> {
        info!("Shutting down control session");
        self.cancel.cancel();

        let joins = async {
            if let Err(e) = self.producer.await {
                warn!("Producer task join error: {}", e);
            }
            if let Err(e) = self.consumer.await {
                warn!("Consumer task join error: {}", e);
            }
        };
        match time::timeout(timeout, joins).await {
            Ok(()) => {
                info!("Control session stopped");
                Ok(())
            }
            Err(_) => Err(SessionError::ShutdownTimeout(timeout)),
        }
    }
}

/// Producer loop: polls the input source every poll interval, folds events
/// into the normalizer and pushes one frame snapshot per cycle.
async fn run_producer(
    mut source: Box<dyn InputSource>,
    buffer: Arc<InputBuffer>,
    wake: Arc<Notify>,
    mut settings_rx: watch::Receiver<Settings>,
    fault_slot: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
) {
    let initial = settings_rx.borrow().clone();
    let mut normalizer = InputNormalizer::new(initial.curve.clone());
    let mut poll_ms = initial.motion.poll_interval_ms;
    let mut error_limit = initial.motion.max_consecutive_errors;
    let mut interval = poll_interval(poll_ms);
    let mut poll_errors: u32 = 0;

    debug!("Producer loop started, polling every {} ms", poll_ms);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if settings_rx.has_changed().unwrap_or(false) {
            let settings = settings_rx.borrow_and_update().clone();
            normalizer.update_settings(settings.curve.clone());
            error_limit = settings.motion.max_consecutive_errors;
            if settings.motion.poll_interval_ms != poll_ms {
                poll_ms = settings.motion.poll_interval_ms;
                interval = poll_interval(poll_ms);
                debug!("Producer poll interval changed to {} ms", poll_ms);
            }
        }

        match source.poll() {
            Ok(events) => {
                poll_errors = 0;
                normalizer.apply_batch(&events);
                buffer.push(normalizer.snapshot());
                if buffer.above_high_water() {
                    wake.notify_one();
                }
            }
            Err(e) => {
                poll_errors += 1;
                warn!("Input poll failed ({} consecutive): {}", poll_errors, e);
                if poll_errors >= error_limit {
                    let reason = format!(
                        "input source unusable after {} consecutive read failures: {}",
                        poll_errors, e
                    );
                    error!("Session terminating: {}", reason);
                    *lock_fault(&fault_slot) = Some(reason);
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    debug!("Producer loop stopped");
}

/// Consumer loop: runs one coordinator cycle per tick, waking early when the
/// buffer crosses its high-water mark. Tick distances integrate over the
/// measured elapsed time, not the nominal interval.
async fn run_consumer(
    mut coordinator: MovementCoordinator<Waiting>,
    wake: Arc<Notify>,
    mut settings_rx: watch::Receiver<Settings>,
    mut envelope_rx: watch::Receiver<WorkEnvelope>,
    status_tx: watch::Sender<SessionStatus>,
    snapshot_tx: watch::Sender<MotionSnapshot>,
    fault_slot: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
) {
    let mut tick_ms = settings_rx.borrow().motion.tick_interval_ms;
    let mut interval = tick_interval(tick_ms);
    let mut last_tick = Instant::now();

    debug!("Consumer loop started, ticking every {} ms", tick_ms);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = wake.notified() => {
                debug!("Early tick: input buffer crossed high-water mark");
            }
        }

        if settings_rx.has_changed().unwrap_or(false) {
            let settings = settings_rx.borrow_and_update().clone();
            coordinator.update_settings(&settings);
            if settings.motion.tick_interval_ms != tick_ms {
                tick_ms = settings.motion.tick_interval_ms;
                interval = tick_interval(tick_ms);
                debug!("Consumer tick interval changed to {} ms", tick_ms);
            }
        }
        if envelope_rx.has_changed().unwrap_or(false) {
            let envelope = *envelope_rx.borrow_and_update();
            coordinator.set_envelope(envelope);
        }

        let now = Instant::now();
        let time_delta = now.duration_since(last_tick).as_secs_f64();
        last_tick = now;

        coordinator = coordinator.drain_input().plan(time_delta).dispatch();
        let _ = snapshot_tx.send(coordinator.snapshot());

        if coordinator.failure_limit_exceeded() {
            let fatal = CoordinatorError::TooManyFailures(coordinator.consecutive_errors());
            error!("Session terminating: {}", fatal);
            *lock_fault(&fault_slot) = Some(fatal.to_string());
            cancel.cancel();
            break;
        }
    }

    // Deactivation resets all session state so a later session starts clean.
    coordinator.reset();
    let _ = snapshot_tx.send(coordinator.snapshot());
    let _ = status_tx.send(SessionStatus {
        active: false,
        error: lock_fault(&fault_slot).take(),
    });
    debug!("Consumer loop stopped");
}

// Poisoning only means a panicking task dropped the guard; the slot itself
// stays coherent.
fn lock_fault(slot: &Mutex<Option<String>>) -> MutexGuard<'_, Option<String>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn poll_interval(poll_ms: u64) -> time::Interval {
    let mut interval = time::interval(Duration::from_millis(poll_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

fn tick_interval(tick_ms: u64) -> time::Interval {
    let mut interval = time::interval(Duration::from_millis(tick_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

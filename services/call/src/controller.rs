//! The call session controller.
//!
//! [`CallController`] owns every resource a call holds: the connection, the
//! microphone stream with its encoder, and the output stream with its
//! playback handle and ambience switch. It runs as a single actor task, so
//! inbound units, capture ticks, device faults and start/end commands are
//! handled one at a time and never concurrently. Every exit path goes through
//! [`CallController::teardown`], which releases only what is currently held.

use crate::{
    config::Config,
    device::{AudioBackend, DeviceFault, DeviceKind, DeviceStream, FaultSender},
    transport::{Connection, Connector},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Notify, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval},
};
use tracing::{debug, error, info, instrument, warn};
use voice_call_core::{
    AgentProfile,
    ambience::{AmbienceControl, AmbienceMixer, AmbienceTrack},
    capture::{CaptureEncoder, capture_ring},
    error::CallError,
    machine::{CallSnapshot, CallStateMachine, Effect},
    playback::{DEFAULT_BUFFER_CAPACITY, DEFAULT_COMMAND_CAPACITY, PlaybackHandle, playback_channel},
    protocol::Inbound,
};

/// Samples the capture ring can hold between ticks (4 s at 48 kHz).
const CAPTURE_RING_CAPACITY: usize = 192_000;

/// How often the displayed call duration is recomputed.
const DURATION_REFRESH: Duration = Duration::from_secs(1);

/// Requests handled by the controller's run loop.
#[derive(Debug)]
pub enum ControlCommand {
    Start {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<()>,
    },
}

struct ActiveCapture {
    encoder: CaptureEncoder,
    _stream: DeviceStream,
}

struct ActiveOutput {
    playback: PlaybackHandle,
    /// `None` when no ambience track is configured or it failed to load.
    ambience: Option<AmbienceControl>,
    _stream: DeviceStream,
}

pub struct CallController {
    config: Config,
    profile: AgentProfile,
    connector: Arc<dyn Connector>,
    backend: Arc<dyn AudioBackend>,
    machine: CallStateMachine,
    connection: Option<Connection>,
    capture: Option<ActiveCapture>,
    output: Option<ActiveOutput>,
    ambience_error: Option<CallError>,
    active: bool,
    call_started_at: Option<Instant>,
    elapsed_secs: u64,
    snapshot_tx: watch::Sender<CallSnapshot>,
    faults_tx: FaultSender,
    faults_rx: mpsc::UnboundedReceiver<DeviceFault>,
    cancel: Arc<Notify>,
}

impl CallController {
    pub fn new(
        config: Config,
        profile: AgentProfile,
        connector: Arc<dyn Connector>,
        backend: Arc<dyn AudioBackend>,
    ) -> Self {
        let machine = CallStateMachine::new(profile.greeting_message.clone());
        let (snapshot_tx, _) = watch::channel(machine.snapshot(false, 0));
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        Self {
            config,
            profile,
            connector,
            backend,
            machine,
            connection: None,
            capture: None,
            output: None,
            ambience_error: None,
            active: false,
            call_started_at: None,
            elapsed_secs: 0,
            snapshot_tx,
            faults_tx,
            faults_rx,
            cancel: Arc::new(Notify::new()),
        }
    }

    /// The current state as the UI would render it.
    pub fn snapshot(&self) -> CallSnapshot {
        self.machine.snapshot(self.active, self.elapsed_secs)
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Moves the controller onto its own task and returns the handle that drives it.
    pub fn spawn(self) -> (CallHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let handle = CallHandle {
            commands: commands_tx,
            cancel: self.cancel.clone(),
            snapshot: self.subscribe(),
        };
        let task = tokio::spawn(self.run(commands_rx));
        (handle, task)
    }

    /// Runs until every [`CallHandle`] is dropped, then ends any live call.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ControlCommand>) {
        let mut capture_tick = interval(self.config.capture_interval);
        capture_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut duration_tick = interval(DURATION_REFRESH);
        duration_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ControlCommand::Start { reply }) => {
                        let result = self.start_call().await;
                        let _ = reply.send(result);
                    }
                    Some(ControlCommand::End { reply }) => {
                        self.end_call();
                        let _ = reply.send(());
                    }
                    None => {
                        self.end_call();
                        break;
                    }
                },
                inbound = next_inbound(&mut self.connection) => {
                    // A pump that vanished without a close frame counts as an abnormal close.
                    let inbound = inbound.unwrap_or(Inbound::Closed {
                        code: None,
                        reason: String::new(),
                    });
                    self.handle_inbound(inbound);
                }
                _ = capture_tick.tick(), if self.capture.is_some() => self.on_capture_tick(),
                _ = duration_tick.tick() => self.refresh_duration(),
                Some(fault) = self.faults_rx.recv() => self.handle_fault(fault),
            }
        }
        debug!("Call controller stopped");
    }

    /// Acquires output, connection and microphone, in that order.
    ///
    /// Any failure releases whatever was already acquired and leaves the
    /// error visible. Racing [`CallHandle::end_call`] aborts the attempt.
    #[instrument(skip(self), fields(agent_id = %self.profile.agent_id))]
    pub async fn start_call(&mut self) -> Result<(), CallError> {
        if self.machine.is_live() {
            warn!("Start requested while a call is in progress");
            return Err(CallError::AlreadyActive);
        }

        let cancel = self.cancel.clone();
        let cancelled = cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        self.machine.begin_call();
        self.publish();
        info!("Starting call");

        let result = tokio::select! {
            result = self.acquire() => result,
            _ = &mut cancelled => Err(CallError::Cancelled),
        };

        match result {
            Ok(()) => {
                self.machine.capture_started();
                self.active = true;
                self.publish();
                info!("Call started, microphone live");
                Ok(())
            }
            Err(CallError::Cancelled) => {
                info!("Call setup cancelled");
                self.teardown();
                self.machine.clear_error();
                self.publish();
                Err(CallError::Cancelled)
            }
            Err(err) => {
                error!(error = %err, "Failed to start call");
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Releases everything and clears the displayed error. Safe to repeat.
    #[instrument(skip(self), fields(agent_id = %self.profile.agent_id))]
    pub fn end_call(&mut self) {
        info!("Ending call");
        self.teardown();
        self.machine.clear_error();
        self.publish();
    }

    /// Applies one inbound unit, unless the call it belongs to is gone.
    pub fn handle_inbound(&mut self, inbound: Inbound) {
        if self.connection.is_none() {
            debug!(?inbound, "Ignoring inbound unit after teardown");
            return;
        }
        for effect in self.machine.handle(inbound) {
            self.apply(effect);
        }
        self.publish();
    }

    /// Flushes captured audio to the agent.
    pub fn on_capture_tick(&mut self) {
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        // A held connection has completed its handshake.
        let messages = capture.encoder.poll(self.connection.is_some());
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        let sent = messages
            .into_iter()
            .try_for_each(|message| connection.send(message));
        if let Err(err) = sent {
            error!(error = %err, "Failed to send captured audio");
            self.fail(err);
        }
    }

    pub fn refresh_duration(&mut self) {
        self.elapsed_secs = self
            .call_started_at
            .map(|started| started.elapsed().as_secs())
            .unwrap_or(0);
        self.publish();
    }

    /// A running stream failed. Faults from streams already released are ignored.
    pub fn handle_fault(&mut self, fault: DeviceFault) {
        let held = match fault.kind {
            DeviceKind::Input => self.capture.is_some(),
            DeviceKind::Output => self.output.is_some(),
        };
        if !held {
            debug!(?fault, "Ignoring fault from a released stream");
            return;
        }
        error!(kind = ?fault.kind, message = %fault.message, "Audio device failed");
        self.fail(fault.into_call_error());
    }

    async fn acquire(&mut self) -> Result<(), CallError> {
        self.acquire_output().await?;

        let url = self.config.call_url(&self.profile.agent_id);
        let connection = self.connector.connect(&url).await?;
        self.connection = Some(connection);

        let (producer, consumer) = capture_ring(CAPTURE_RING_CAPACITY);
        let stream = self
            .backend
            .open_input(producer, self.faults_tx.clone())
            .await?;
        let encoder = CaptureEncoder::new(
            consumer,
            stream.sample_rate,
            self.config.capture_sample_rate,
            self.profile.greeting_message.clone(),
        )
        .map_err(|e| CallError::Microphone(e.to_string()))?;
        debug!(
            device_rate = stream.sample_rate,
            target_rate = self.config.capture_sample_rate,
            "Capture encoder ready"
        );
        self.capture = Some(ActiveCapture {
            encoder,
            _stream: stream,
        });
        Ok(())
    }

    /// Opens the output stream unless one is already held.
    async fn acquire_output(&mut self) -> Result<(), CallError> {
        if self.output.is_some() {
            debug!("Reusing output stream");
            return Ok(());
        }

        let (mut playback, processor) =
            playback_channel(DEFAULT_COMMAND_CAPACITY, DEFAULT_BUFFER_CAPACITY);
        let stream = self
            .backend
            .open_output(processor, self.faults_tx.clone())
            .await?;
        let wire_rate = self.config.playback_sample_rate;
        playback
            .resample(wire_rate, stream.sample_rate)
            .map_err(|e| CallError::Playback(e.to_string()))?;
        if stream.sample_rate != wire_rate {
            info!(
                wire_rate,
                device_rate = stream.sample_rate,
                "Resampling playback to the output device rate"
            );
        }

        self.ambience_error = None;
        let mut ambience = None;
        if let Some(path) = &self.config.ambience_path {
            let loaded = AmbienceTrack::load(path)
                .and_then(|track| track.resampled(wire_rate, stream.sample_rate));
            match loaded {
                Ok(track) => {
                    debug!(samples = track.len(), path = %path.display(), "Ambience track loaded");
                    let control = AmbienceControl::default();
                    playback.set_ambience(AmbienceMixer::new(
                        track,
                        self.config.ambience_volume,
                        control.clone(),
                    ))?;
                    ambience = Some(control);
                }
                Err(err) => {
                    warn!(error = %err, "Failed to load ambience track");
                    self.ambience_error = Some(err);
                }
            }
        }

        self.output = Some(ActiveOutput {
            playback,
            ambience,
            _stream: stream,
        });
        Ok(())
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::ConnectionOpened => {
                self.call_started_at = Some(Instant::now());
                self.elapsed_secs = 0;
            }
            Effect::AppendPlayback(bytes) => {
                let Some(output) = self.output.as_mut() else {
                    debug!(len = bytes.len(), "No output stream, dropping audio");
                    return;
                };
                if let Err(err) = output.playback.append_pcm16_le(&bytes) {
                    error!(error = %err, "Failed to queue audio for playback");
                    self.fail(err);
                }
            }
            Effect::FlushPlayback => {
                if let Some(output) = self.output.as_mut() {
                    output.playback.flush();
                }
            }
            Effect::StartAmbience => self.start_ambience(),
            Effect::Terminate => {
                info!("Call terminated");
                self.teardown();
            }
        }
    }

    fn start_ambience(&mut self) {
        if let Some(control) = self.output.as_ref().and_then(|o| o.ambience.as_ref()) {
            if !control.is_playing() {
                info!("Starting background ambience");
                control.start();
            }
            return;
        }
        match &self.ambience_error {
            Some(err) => self.machine.report(err),
            None => debug!("No ambience configured"),
        }
    }

    /// Reports a fatal error and releases the call.
    fn fail(&mut self, err: CallError) {
        self.teardown();
        self.machine.report(&err);
        self.publish();
    }

    /// Releases every held resource. The displayed error is kept.
    fn teardown(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!("Closing connection");
            connection.close();
        }
        if self.capture.take().is_some() {
            debug!("Microphone released");
        }
        if let Some(output) = self.output.take() {
            if let Some(ambience) = &output.ambience {
                ambience.stop();
            }
            debug!("Output stream released");
        }
        self.machine.reset();
        self.active = false;
        self.call_started_at = None;
        self.elapsed_secs = 0;
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn next_inbound(connection: &mut Option<Connection>) -> Option<Inbound> {
    match connection.as_mut() {
        Some(connection) => connection.recv().await,
        None => std::future::pending().await,
    }
}

/// A cloneable handle to a spawned [`CallController`].
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<ControlCommand>,
    cancel: Arc<Notify>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub async fn start_call(&self) -> Result<(), CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ControlCommand::Start { reply })
            .await
            .map_err(|_| CallError::Cancelled)?;
        response.await.map_err(|_| CallError::Cancelled)?
    }

    /// Ends the call, interrupting a start that is still acquiring resources.
    pub async fn end_call(&self) {
        self.cancel.notify_waiters();
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(ControlCommand::End { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }
}

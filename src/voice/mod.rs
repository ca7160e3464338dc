pub mod audio_capture;
pub mod audio_playback;
pub mod energy;
pub mod frame_processor;
pub mod pcm;
pub mod resampler;
pub mod suppression;
pub mod types;
pub mod vad;

use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use ringbuf::traits::{Consumer, Producer};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;

use crate::config::Config;
use crate::error::VoiceError;
use crate::realtime::connection::{connect, RealtimeSocket, RetryBudget};
use crate::realtime::protocol::ServerEvent;
use crate::realtime::turn::TurnState;
use crate::realtime::{EncodedChunk, RealtimeSession};
use audio_capture::{AudioCapture, CaptureOutput};
use audio_playback::{AudioPlayback, PlaybackSink};
use frame_processor::WorkletCommand;
use resampler::AudioResampler;
use suppression::NoiseSuppressor;
use types::*;

const FRAME_DRAIN_INTERVAL: Duration = Duration::from_millis(5);
/// A ready session that lasts this long restores the full retry budget.
const STABLE_CONNECTION: Duration = Duration::from_secs(10);

type Session = RealtimeSession<mpsc::UnboundedSender<String>>;

/// Central voice engine: owns the audio devices and the control task.
pub struct VoiceEngine {
    config: Config,
    capture: AudioCapture,
    playback: AudioPlayback,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl VoiceEngine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            capture: AudioCapture::new(),
            playback: AudioPlayback::new(),
            events: None,
            task: None,
        }
    }

    /// Open the devices and spawn the control task. Must be called from
    /// within a tokio runtime. Device failures are returned directly;
    /// everything after that arrives on the returned channel.
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<EngineEvent>, VoiceError> {
        if self.task.is_some() {
            self.disconnect();
        }

        let capture = self
            .capture
            .start(self.config.audio.input_device.as_deref(), &self.config.vad)?;

        let resampler = match AudioResampler::new(
            capture.sample_rate,
            self.config.audio.wire_sample_rate,
            FRAME_SIZE,
            1,
        ) {
            Ok(r) => r,
            Err(e) => {
                self.capture.stop();
                return Err(e);
            }
        };

        let playback = if self.config.audio.play_responses {
            match self.playback.start(
                self.config.audio.output_device.as_deref(),
                self.config.audio.wire_sample_rate,
            ) {
                Ok(sink) => Some(sink),
                Err(e) => {
                    log::warn!("Response playback disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let suppressor = NoiseSuppressor::new(
            self.config.suppression.clone(),
            capture.sample_rate,
            FRAME_SIZE,
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = ControlTask::new(
            self.config.clone(),
            capture,
            playback,
            suppressor,
            resampler,
            event_tx.clone(),
        );
        self.task = Some(tokio::spawn(task.run()));
        self.events = Some(event_tx);

        log::info!("Voice engine started");
        Ok(event_rx)
    }

    /// Tear down in order: input device (and the processor inside its
    /// callback), control task with its socket, output device. Never waits.
    pub fn disconnect(&mut self) {
        self.capture.stop();

        let mut interrupted = false;
        if let Some(task) = self.task.take() {
            interrupted = !task.is_finished();
            task.abort();
        }
        self.playback.stop();

        if let Some(events) = self.events.take() {
            if interrupted {
                let _ = events.send(EngineEvent::Turn(TurnState::Idle));
                let _ = events.send(EngineEvent::Stopped);
            }
        }
        log::info!("Voice engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// How one connection ended.
enum Exit {
    Disconnected(String),
    Fatal(VoiceError),
    Shutdown,
}

/// Everything the control task owns: ring ends, DSP state, event sender.
struct ControlTask {
    config: Config,
    capture: CaptureOutput,
    playback: Option<PlaybackSink>,
    suppressor: NoiseSuppressor,
    resampler: AudioResampler,
    events: mpsc::UnboundedSender<EngineEvent>,
    retry: RetryBudget,
    calibration_step: u8,
}

impl ControlTask {
    fn new(
        config: Config,
        capture: CaptureOutput,
        playback: Option<PlaybackSink>,
        suppressor: NoiseSuppressor,
        resampler: AudioResampler,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            retry: RetryBudget::new(&config.realtime),
            config,
            capture,
            playback,
            suppressor,
            resampler,
            events,
            calibration_step: 0,
        }
    }

    /// Connect, run, reconnect. Failed connects and dropped connections
    /// share one retry budget with a fixed backoff between attempts.
    async fn run(mut self) {
        loop {
            let connected = tokio::select! {
                result = connect(&self.config.realtime) => result,
                _ = self.events.closed() => break,
            };

            let failure = match connected {
                Ok(socket) => match self.run_connection(socket).await {
                    Exit::Disconnected(reason) => {
                        log::warn!("Realtime connection lost: {}", reason);
                        self.emit(EngineEvent::Error(VoiceError::WebSocket(reason.clone())));
                        reason
                    }
                    Exit::Fatal(e) => {
                        log::error!("Voice session failed: {}", e);
                        self.emit(EngineEvent::Error(e));
                        break;
                    }
                    Exit::Shutdown => break,
                },
                Err(e @ VoiceError::Config(_)) => {
                    self.emit(EngineEvent::Error(e));
                    break;
                }
                Err(e) => e.to_string(),
            };

            if !self.retry.record_failure(failure) {
                let exhausted = self.retry.exhausted();
                self.emit(EngineEvent::Error(exhausted));
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.retry.backoff()) => {}
                _ = self.events.closed() => break,
            }
        }

        self.send_command(WorkletCommand::Stop);
        self.emit(EngineEvent::Stopped);
        log::info!("Control task finished");
    }

    async fn run_connection(&mut self, socket: RealtimeSocket) -> Exit {
        let (write, mut read) = socket.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(write_loop(write, out_rx));

        let mut session = RealtimeSession::new(&self.config.realtime, &self.config.turn, out_tx);
        let exit = match session.begin_handshake() {
            Ok(()) => {
                self.emit(EngineEvent::Turn(session.turn_state()));
                // Frames queued before this connection belong to nobody.
                while self.capture.frames.try_pop().is_some() {}
                self.send_command(WorkletCommand::Start);
                let exit = self.event_loop(&mut session, &mut read).await;
                self.send_command(WorkletCommand::Stop);
                exit
            }
            Err(e) => Exit::Disconnected(e.to_string()),
        };

        session.close();
        self.emit(EngineEvent::Turn(session.turn_state()));
        writer.abort();
        exit
    }

    async fn event_loop(
        &mut self,
        session: &mut Session,
        read: &mut SplitStream<RealtimeSocket>,
    ) -> Exit {
        let mut drain = tokio::time::interval(FRAME_DRAIN_INTERVAL);
        drain.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ready_since: Option<Instant> = None;

        loop {
            let deadline = session.next_deadline();
            let settle = tokio::time::sleep_until(tokio::time::Instant::from_std(
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
            ));

            let result = tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_server_text(session, &text),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed by server".into());
                        return Exit::Disconnected(reason);
                    }
                    Some(Ok(_)) => Ok(()),
                    Some(Err(e)) => return Exit::Disconnected(e.to_string()),
                    None => return Exit::Disconnected("stream ended".into()),
                },
                _ = drain.tick() => self.drain_frames(session),
                Some(fault) = self.capture.faults.recv() => return Exit::Fatal(fault),
                _ = settle, if deadline.is_some() => {
                    let before = session.turn_state();
                    session.poll(Instant::now());
                    self.emit_turn_change(before, session);
                    Ok(())
                },
                _ = self.events.closed() => return Exit::Shutdown,
            };

            match result {
                Ok(()) => {}
                Err(VoiceError::WebSocket(reason)) => return Exit::Disconnected(reason),
                Err(e) if e.is_terminal() => return Exit::Fatal(e),
                Err(e) => self.emit(EngineEvent::Error(e)),
            }

            if ready_since.is_none() && session.turn_state() == TurnState::UserCapturing {
                ready_since = Some(Instant::now());
            }
            if ready_since.is_some_and(|t| t.elapsed() >= STABLE_CONNECTION) {
                self.retry.reset();
            }
        }
    }

    fn handle_server_text(&mut self, session: &mut Session, text: &str) -> Result<(), VoiceError> {
        let before = session.turn_state();
        let outcome = session.on_server_message(text, Instant::now());
        self.emit_turn_change(before, session);

        let inbound = match outcome {
            Ok(Some(inbound)) => inbound,
            Ok(None) => return Ok(()),
            // Surfaced verbatim; the session carries on.
            Err(e @ VoiceError::Remote(_)) => {
                self.emit(EngineEvent::Error(e));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let (ServerEvent::OutputAudioDelta { delta, .. }, Some(playback)) =
            (&inbound.event, self.playback.as_mut())
        {
            if let Err(e) = playback.play_delta(delta) {
                log::warn!("Dropping response audio: {}", e);
            }
        }
        if inbound.unprompted {
            self.emit(EngineEvent::UnpromptedResponse);
        }
        self.emit(EngineEvent::Server(inbound.event));
        Ok(())
    }

    fn drain_frames(&mut self, session: &mut Session) -> Result<(), VoiceError> {
        while let Some(frame) = self.capture.frames.try_pop() {
            self.process_frame(session, frame)?;
        }
        Ok(())
    }

    fn process_frame(&mut self, session: &mut Session, frame: FrameEvent) -> Result<(), VoiceError> {
        let audio = if self.config.suppression.enabled {
            if !self.suppressor.is_calibrated() && !frame.vad.is_speaking {
                self.calibrate(&frame.frame);
            }
            let processed = self.suppressor.process_audio(&frame.frame);
            if frame.frame_number % 100 == 0 {
                log::debug!("Frame {} noise metrics: {:?}", frame.frame_number, processed.metrics);
            }
            processed.audio
        } else {
            frame.frame.to_vec()
        };

        let resampled = self.resampler.process(&audio)?;
        let chunk = EncodedChunk {
            duration_ms: pcm::duration_ms(resampled.len(), self.config.audio.wire_sample_rate),
            audio: pcm::encode_pcm16_base64(&resampled),
        };

        let before = session.turn_state();
        session.on_frame(chunk, &frame.vad)?;
        self.emit_turn_change(before, session);

        self.emit(EngineEvent::Frame(Box::new(frame)));
        Ok(())
    }

    fn calibrate(&mut self, frame: &[f32]) {
        let status = self.suppressor.calibrate_from_silence(frame);
        if status.is_calibrated {
            self.emit(EngineEvent::CalibrationProgress(CalibrationProgress {
                progress: 100,
                message: "Background noise calibrated".into(),
            }));
            self.emit(EngineEvent::CalibrationComplete);
            return;
        }
        let step = status.progress / 10;
        if step > self.calibration_step {
            self.calibration_step = step;
            self.emit(EngineEvent::CalibrationProgress(CalibrationProgress {
                progress: step * 10,
                message: "Calibrating background noise, stay quiet".into(),
            }));
        }
    }

    fn emit_turn_change(&self, before: TurnState, session: &Session) {
        let after = session.turn_state();
        if after != before {
            log::debug!("Turn: {:?} -> {:?}", before, after);
            self.emit(EngineEvent::Turn(after));
        }
    }

    fn send_command(&mut self, command: WorkletCommand) {
        if self.capture.commands.try_push(command).is_err() {
            log::warn!("Capture command queue full, dropped {:?}", command);
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

/// Forward serialized client events to the socket until either side closes.
async fn write_loop(
    mut write: SplitSink<RealtimeSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = outbound.recv().await {
        if let Err(e) = write.send(Message::Text(text)).await {
            log::warn!("WebSocket write failed: {}", e);
            break;
        }
    }
}

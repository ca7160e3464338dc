//! Realtime session: turns encoded capture frames and inbound server events
//! into the outbound message stream, under the turn controller's rules.

pub mod connection;
pub mod protocol;
pub mod turn;

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::config::{RealtimeConfig, TurnConfig};
use crate::error::VoiceError;
use crate::voice::vad::{SpeechTransition, VadDecision};
use protocol::{ClientEvent, ServerEvent, SessionSettings};
use turn::{CommitDecision, ResponseOrigin, TurnController, TurnState};

/// Where outbound messages go. The engine uses the writer task's channel;
/// tests record.
pub trait Outbound {
    fn send(&mut self, event: &ClientEvent) -> Result<(), VoiceError>;
}

impl Outbound for mpsc::UnboundedSender<String> {
    fn send(&mut self, event: &ClientEvent) -> Result<(), VoiceError> {
        let text = event.to_json()?;
        mpsc::UnboundedSender::send(self, text)
            .map_err(|_| VoiceError::WebSocket("connection closed".into()))
    }
}

/// One capture frame, resampled and encoded for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    pub audio: String,
    pub duration_ms: f64,
}

/// What the engine needs to know about an inbound message.
#[derive(Debug)]
pub struct Inbound {
    pub event: ServerEvent,
    pub unprompted: bool,
}

pub struct RealtimeSession<O: Outbound> {
    config: RealtimeConfig,
    turn: TurnController,
    outbound: O,
    preroll: VecDeque<EncodedChunk>,
    preroll_frames: usize,
    in_segment: bool,
    greeted: bool,
}

impl<O: Outbound> RealtimeSession<O> {
    pub fn new(config: &RealtimeConfig, turn: &TurnConfig, outbound: O) -> Self {
        Self {
            config: config.clone(),
            turn: TurnController::new(turn),
            outbound,
            preroll: VecDeque::with_capacity(turn.preroll_frames),
            preroll_frames: turn.preroll_frames,
            in_segment: false,
            greeted: false,
        }
    }

    pub fn turn_state(&self) -> TurnState {
        self.turn.state()
    }

    pub fn turn(&self) -> &TurnController {
        &self.turn
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.turn.deadline()
    }

    /// Reset all per-connection state and configure the remote session.
    pub fn begin_handshake(&mut self) -> Result<(), VoiceError> {
        self.turn.on_connected();
        self.preroll.clear();
        self.in_segment = false;
        self.greeted = false;
        self.send(&ClientEvent::SessionUpdate {
            session: SessionSettings::from_config(&self.config),
        })
    }

    /// Route one encoded frame according to its VAD decision.
    pub fn on_frame(&mut self, chunk: EncodedChunk, vad: &VadDecision) -> Result<(), VoiceError> {
        if vad.transition == Some(SpeechTransition::Started) {
            self.in_segment = true;
            while let Some(buffered) = self.preroll.pop_front() {
                self.append(buffered)?;
            }
        }

        // Resampler warm-up can leave a frame with no output yet.
        if chunk.duration_ms > 0.0 {
            if self.in_segment {
                self.append(chunk)?;
            } else if self.preroll_frames > 0 {
                if self.preroll.len() == self.preroll_frames {
                    self.preroll.pop_front();
                }
                self.preroll.push_back(chunk);
            }
        }

        if vad.transition == Some(SpeechTransition::Stopped) && self.in_segment {
            self.in_segment = false;
            self.finish_segment()?;
        }
        Ok(())
    }

    fn append(&mut self, chunk: EncodedChunk) -> Result<(), VoiceError> {
        if !self.turn.admit_chunk(chunk.duration_ms) {
            return Ok(());
        }
        self.send(&ClientEvent::InputAudioBufferAppend { audio: chunk.audio })
    }

    fn finish_segment(&mut self) -> Result<(), VoiceError> {
        if self.config.server_vad {
            // The server segments and commits on its own.
            self.turn.hand_off_segment();
            return Ok(());
        }
        match self.turn.on_speech_stopped() {
            CommitDecision::Commit => {
                self.send(&ClientEvent::InputAudioBufferCommit)?;
                self.send(&ClientEvent::ResponseCreate)?;
                self.turn.mark_response_requested();
                log::info!("User turn committed");
            }
            CommitDecision::Discard { had_chunks: true } => {
                self.send(&ClientEvent::InputAudioBufferClear)?;
            }
            CommitDecision::Discard { had_chunks: false } => {}
        }
        Ok(())
    }

    /// Handle one inbound text frame. Malformed or unrecognised JSON is
    /// logged and skipped; a remote `error` event comes back as `Err`.
    pub fn on_server_message(
        &mut self,
        text: &str,
        now: Instant,
    ) -> Result<Option<Inbound>, VoiceError> {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!(
                    "Ignoring malformed server message ({}): {}",
                    e,
                    text.chars().take(100).collect::<String>()
                );
                return Ok(None);
            }
        };
        if !event.is_delta() {
            log::debug!("Server event: {:?}", event);
        }

        let mut unprompted = false;
        match &event {
            ServerEvent::SessionCreated { .. } | ServerEvent::SessionUpdated { .. } => {
                if self.turn.on_session_ready() {
                    log::info!("Realtime session ready");
                    if self.config.greet_on_connect && !self.greeted {
                        self.greeted = true;
                        self.send(&ClientEvent::ResponseCreate)?;
                        self.turn.mark_response_requested();
                    }
                }
            }
            ServerEvent::ResponseCreated { .. } => {
                if self.turn.on_response_created() == ResponseOrigin::Unprompted {
                    log::warn!("Response created without any committed user audio");
                    unprompted = true;
                }
            }
            ServerEvent::ResponseDone { .. } => self.turn.on_response_done(now),
            ServerEvent::InputAudioBufferCommitted { .. } => self.turn.on_committed(),
            ServerEvent::Error { error } => {
                log::error!(
                    "Realtime service error [{}]: {}",
                    error.code.as_deref().unwrap_or("unknown"),
                    error.message
                );
                return Err(VoiceError::Remote(error.clone()));
            }
            _ => {}
        }

        Ok(Some(Inbound { event, unprompted }))
    }

    /// Advance timers. Returns true if the turn state changed.
    pub fn poll(&mut self, now: Instant) -> bool {
        let reopened = self.turn.poll(now);
        if reopened {
            log::debug!("Settle delay elapsed, listening again");
        }
        reopened
    }

    pub fn close(&mut self) {
        self.turn.reset();
        self.preroll.clear();
        self.in_segment = false;
    }

    fn send(&mut self, event: &ClientEvent) -> Result<(), VoiceError> {
        if !matches!(event, ClientEvent::InputAudioBufferAppend { .. }) {
            log::debug!("-> {}", event.name());
        }
        self.outbound.send(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<ClientEvent>,
    }

    impl Outbound for Recorder {
        fn send(&mut self, event: &ClientEvent) -> Result<(), VoiceError> {
            self.sent.push(event.clone());
            Ok(())
        }
    }

    impl Recorder {
        fn appends(&self) -> usize {
            self.sent
                .iter()
                .filter(|e| matches!(e, ClientEvent::InputAudioBufferAppend { .. }))
                .count()
        }

        fn count(&self, name: &str) -> usize {
            self.sent.iter().filter(|e| e.name() == name).count()
        }
    }

    fn quiet_config() -> RealtimeConfig {
        RealtimeConfig {
            greet_on_connect: false,
            ..RealtimeConfig::default()
        }
    }

    fn ready_session(config: RealtimeConfig) -> RealtimeSession<Recorder> {
        let mut session = RealtimeSession::new(&config, &TurnConfig::default(), Recorder::default());
        session.begin_handshake().unwrap();
        session
            .on_server_message(r#"{"type":"session.created","session":{}}"#, Instant::now())
            .unwrap();
        assert_eq!(session.turn_state(), TurnState::UserCapturing);
        session
    }

    fn chunk(ms: f64) -> EncodedChunk {
        EncodedChunk {
            audio: "AAA=".into(),
            duration_ms: ms,
        }
    }

    fn decision(is_speaking: bool, transition: Option<SpeechTransition>) -> VadDecision {
        VadDecision {
            is_speaking,
            energy: 0.0,
            confirmed: is_speaking,
            transition,
        }
    }

    fn speak(session: &mut RealtimeSession<Recorder>, frames: usize, ms: f64) {
        session
            .on_frame(chunk(ms), &decision(true, Some(SpeechTransition::Started)))
            .unwrap();
        for _ in 1..frames {
            session.on_frame(chunk(ms), &decision(true, None)).unwrap();
        }
    }

    fn stop(session: &mut RealtimeSession<Recorder>, ms: f64) {
        session
            .on_frame(chunk(ms), &decision(false, Some(SpeechTransition::Stopped)))
            .unwrap();
    }

    #[test]
    fn handshake_sends_session_update_first() {
        let session = ready_session(quiet_config());
        assert!(matches!(session.outbound.sent[0], ClientEvent::SessionUpdate { .. }));
        assert_eq!(session.outbound.sent.len(), 1);
    }

    #[test]
    fn greeting_is_requested_once() {
        let mut session = ready_session(RealtimeConfig::default());
        session
            .on_server_message(r#"{"type":"session.updated"}"#, Instant::now())
            .unwrap();
        assert_eq!(session.outbound.count("response.create"), 1);

        let inbound = session
            .on_server_message(r#"{"type":"response.created"}"#, Instant::now())
            .unwrap()
            .unwrap();
        assert!(!inbound.unprompted);
    }

    #[test]
    fn silence_before_speech_only_fills_preroll() {
        let mut session = ready_session(quiet_config());
        for _ in 0..30 {
            session.on_frame(chunk(10.0), &decision(false, None)).unwrap();
        }
        assert_eq!(session.outbound.appends(), 0);

        session
            .on_frame(chunk(10.0), &decision(true, Some(SpeechTransition::Started)))
            .unwrap();
        // Ten buffered frames plus the one that confirmed speech.
        assert_eq!(session.outbound.appends(), 11);
    }

    #[test]
    fn confirmed_segment_commits_and_requests_response() {
        let mut session = ready_session(quiet_config());
        speak(&mut session, 20, 10.0);
        stop(&mut session, 10.0);

        assert_eq!(session.outbound.count("input_audio_buffer.commit"), 1);
        let n = session.outbound.sent.len();
        assert_eq!(session.outbound.sent[n - 2], ClientEvent::InputAudioBufferCommit);
        assert_eq!(session.outbound.sent[n - 1], ClientEvent::ResponseCreate);
        assert_eq!(session.turn_state(), TurnState::AwaitingCommit);

        // A second stop without new audio does nothing.
        stop(&mut session, 10.0);
        assert_eq!(session.outbound.count("input_audio_buffer.commit"), 1);
    }

    #[test]
    fn too_short_segment_is_cleared_not_committed() {
        let config = quiet_config();
        let turn = TurnConfig {
            preroll_frames: 0,
            ..TurnConfig::default()
        };
        let mut session = RealtimeSession::new(&config, &turn, Recorder::default());
        session.begin_handshake().unwrap();
        session
            .on_server_message(r#"{"type":"session.created"}"#, Instant::now())
            .unwrap();

        // 4 frames plus the stopping frame: 5 chunks, 99ms.
        speak(&mut session, 4, 19.8);
        stop(&mut session, 19.8);
        assert_eq!(session.outbound.appends(), 5);
        assert_eq!(session.outbound.count("input_audio_buffer.commit"), 0);
        assert_eq!(session.outbound.count("input_audio_buffer.clear"), 1);
        assert_eq!(session.turn().audio_chunks_since_last_commit(), 0);
        assert_eq!(session.turn().accumulated_audio_duration_ms(), 0.0);
    }

    #[test]
    fn nothing_is_appended_while_the_ai_speaks() {
        let mut session = ready_session(quiet_config());
        let t0 = Instant::now();
        session
            .on_server_message(r#"{"type":"response.created"}"#, t0)
            .unwrap();
        let before = session.outbound.appends();

        speak(&mut session, 50, 10.0);
        stop(&mut session, 10.0);
        session
            .on_server_message(r#"{"type":"response.done"}"#, t0)
            .unwrap();

        assert!(!session.poll(t0 + Duration::from_millis(1199)));
        speak(&mut session, 50, 10.0);
        stop(&mut session, 10.0);
        assert_eq!(session.outbound.appends(), before);
        assert_eq!(session.outbound.count("input_audio_buffer.commit"), 0);

        assert!(session.poll(t0 + Duration::from_millis(1200)));
        speak(&mut session, 5, 10.0);
        assert!(session.outbound.appends() > before);
    }

    #[test]
    fn unprompted_response_is_flagged_and_session_continues() {
        let mut session = ready_session(quiet_config());
        let inbound = session
            .on_server_message(r#"{"type":"response.created"}"#, Instant::now())
            .unwrap()
            .unwrap();
        assert!(inbound.unprompted);
        assert!(matches!(session.turn_state(), TurnState::AiResponding { .. }));
    }

    #[test]
    fn malformed_json_is_ignored() {
        let mut session = ready_session(quiet_config());
        let state = session.turn_state();
        assert!(session.on_server_message("{{{", Instant::now()).unwrap().is_none());
        assert!(session
            .on_server_message(r#"{"type":"response.done","response":"#, Instant::now())
            .unwrap()
            .is_none());
        assert_eq!(session.turn_state(), state);
    }

    #[test]
    fn remote_error_is_surfaced_verbatim() {
        let mut session = ready_session(quiet_config());
        let err = session
            .on_server_message(
                r#"{"type":"error","error":{"type":"server_error","code":"oops","message":"boom"}}"#,
                Instant::now(),
            )
            .unwrap_err();
        match err {
            VoiceError::Remote(remote) => {
                assert_eq!(remote.code.as_deref(), Some("oops"));
                assert_eq!(remote.message, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
        // Still usable.
        assert_eq!(session.turn_state(), TurnState::UserCapturing);
    }

    #[test]
    fn server_vad_mode_leaves_commits_to_the_server() {
        let config = RealtimeConfig {
            server_vad: true,
            ..quiet_config()
        };
        let mut session = ready_session(config);
        speak(&mut session, 20, 10.0);
        stop(&mut session, 10.0);
        assert!(session.outbound.appends() > 0);
        assert_eq!(session.outbound.count("input_audio_buffer.commit"), 0);
        assert_eq!(session.outbound.count("response.create"), 0);
        assert_eq!(session.turn_state(), TurnState::UserCapturing);
        assert!(!session.turn().user_has_committed_audio());

        session
            .on_server_message(r#"{"type":"input_audio_buffer.committed"}"#, Instant::now())
            .unwrap();
        assert!(session.turn().user_has_committed_audio());
        let inbound = session
            .on_server_message(r#"{"type":"response.created"}"#, Instant::now())
            .unwrap()
            .unwrap();
        assert!(!inbound.unprompted);
    }

    #[test]
    fn handshake_resets_a_reused_session() {
        let mut session = ready_session(quiet_config());
        speak(&mut session, 5, 10.0);
        session.begin_handshake().unwrap();
        assert_eq!(session.turn_state(), TurnState::Connected);
        assert_eq!(session.turn().audio_chunks_since_last_commit(), 0);
        // Gated until the new session is acknowledged.
        speak(&mut session, 5, 10.0);
        let appends = session.outbound.appends();
        speak(&mut session, 5, 10.0);
        assert_eq!(session.outbound.appends(), appends);
    }

    #[tokio::test]
    async fn channel_transport_serializes_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut session = RealtimeSession::new(&quiet_config(), &TurnConfig::default(), tx);
        session.begin_handshake().unwrap();
        let text = rx.recv().await.unwrap();
        assert!(text.contains(r#""type":"session.update""#));

        drop(rx);
        assert!(matches!(
            session.begin_handshake(),
            Err(VoiceError::WebSocket(_))
        ));
    }
}

//! Turn-taking state machine. No I/O; time is passed in.

use std::time::{Duration, Instant};

use crate::config::TurnConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    /// Socket open, session not yet acknowledged.
    Connected,
    UserCapturing,
    /// Segment committed, waiting for the server to acknowledge it.
    AwaitingCommit,
    /// The AI owns the turn. `settle_until` is set once its response is done.
    AiResponding { settle_until: Option<Instant> },
}

/// Why a response started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOrigin {
    /// The client sent `response.create` itself.
    Requested,
    /// Follows committed user audio.
    UserTurn,
    /// Neither: the service answered on its own.
    Unprompted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDecision {
    Commit,
    /// Too short, empty, or the AI holds the turn. `had_chunks` means the
    /// remote buffer holds audio that should be cleared.
    Discard { had_chunks: bool },
}

#[derive(Debug)]
pub struct TurnController {
    state: TurnState,
    settle_delay: Duration,
    min_commit_duration_ms: f64,
    audio_chunks_since_last_commit: u32,
    accumulated_audio_duration_ms: f64,
    user_has_committed_audio: bool,
    response_requested: bool,
}

impl TurnController {
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            state: TurnState::Idle,
            settle_delay: config.settle_delay(),
            min_commit_duration_ms: config.min_commit_duration_ms,
            audio_chunks_since_last_commit: 0,
            accumulated_audio_duration_ms: 0.0,
            user_has_committed_audio: false,
            response_requested: false,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn audio_chunks_since_last_commit(&self) -> u32 {
        self.audio_chunks_since_last_commit
    }

    pub fn accumulated_audio_duration_ms(&self) -> f64 {
        self.accumulated_audio_duration_ms
    }

    pub fn user_has_committed_audio(&self) -> bool {
        self.user_has_committed_audio
    }

    /// True while user audio must not leave the client.
    pub fn is_gated(&self) -> bool {
        matches!(
            self.state,
            TurnState::Idle | TurnState::Connected | TurnState::AiResponding { .. }
        )
    }

    /// Fresh socket: forget everything from the previous connection.
    pub fn on_connected(&mut self) {
        self.reset_counters();
        self.user_has_committed_audio = false;
        self.response_requested = false;
        self.state = TurnState::Connected;
    }

    /// `session.created` / `session.updated`. Returns true on the first
    /// acknowledgement of this connection.
    pub fn on_session_ready(&mut self) -> bool {
        if self.state == TurnState::Connected {
            self.state = TurnState::UserCapturing;
            true
        } else {
            false
        }
    }

    pub fn mark_response_requested(&mut self) {
        self.response_requested = true;
    }

    pub fn on_response_created(&mut self) -> ResponseOrigin {
        let origin = if self.response_requested {
            ResponseOrigin::Requested
        } else if self.user_has_committed_audio {
            ResponseOrigin::UserTurn
        } else {
            ResponseOrigin::Unprompted
        };
        self.response_requested = false;
        self.state = TurnState::AiResponding { settle_until: None };
        origin
    }

    /// Start the settle timer. The gate stays closed until [`poll`] sees it
    /// expire.
    ///
    /// [`poll`]: TurnController::poll
    pub fn on_response_done(&mut self, now: Instant) {
        if let TurnState::AiResponding { .. } = self.state {
            self.state = TurnState::AiResponding {
                settle_until: Some(now + self.settle_delay),
            };
        }
    }

    /// Advance time. Returns true if the settle delay just expired and the
    /// user got the turn back.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.state {
            TurnState::AiResponding {
                settle_until: Some(deadline),
            } if now >= deadline => {
                self.user_has_committed_audio = false;
                self.state = TurnState::UserCapturing;
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            TurnState::AiResponding { settle_until } => settle_until,
            _ => None,
        }
    }

    /// Account for one outbound chunk. Returns false if it must be dropped.
    pub fn admit_chunk(&mut self, duration_ms: f64) -> bool {
        if self.is_gated() {
            return false;
        }
        self.audio_chunks_since_last_commit += 1;
        self.accumulated_audio_duration_ms += duration_ms;
        true
    }

    /// End of a local speech segment. Counters reset whatever the outcome,
    /// so a repeated stop never commits twice.
    pub fn on_speech_stopped(&mut self) -> CommitDecision {
        let chunks = self.audio_chunks_since_last_commit;
        let duration = self.accumulated_audio_duration_ms;
        self.reset_counters();

        if self.is_gated() {
            return CommitDecision::Discard {
                had_chunks: chunks > 0,
            };
        }

        if chunks > 0 && duration >= self.min_commit_duration_ms {
            self.user_has_committed_audio = true;
            self.state = TurnState::AwaitingCommit;
            log::debug!("Committing {} chunks ({:.0}ms)", chunks, duration);
            CommitDecision::Commit
        } else {
            log::debug!(
                "Discarding segment: {} chunks, {:.1}ms < {}ms",
                chunks,
                duration,
                self.min_commit_duration_ms
            );
            CommitDecision::Discard {
                had_chunks: chunks > 0,
            }
        }
    }

    /// End of a local segment while the server detects turns itself. The
    /// server commits, so only the counters reset and nothing is marked
    /// committed until `input_audio_buffer.committed` arrives.
    pub fn hand_off_segment(&mut self) {
        self.reset_counters();
    }

    /// `input_audio_buffer.committed`, local or server-initiated.
    pub fn on_committed(&mut self) {
        self.user_has_committed_audio = true;
        if self.state == TurnState::AwaitingCommit {
            self.state = TurnState::UserCapturing;
        }
    }

    pub fn reset(&mut self) {
        self.reset_counters();
        self.user_has_committed_audio = false;
        self.response_requested = false;
        self.state = TurnState::Idle;
    }

    fn reset_counters(&mut self) {
        self.audio_chunks_since_last_commit = 0;
        self.accumulated_audio_duration_ms = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capturing() -> TurnController {
        let mut turn = TurnController::new(&TurnConfig::default());
        turn.on_connected();
        assert!(turn.on_session_ready());
        turn
    }

    #[test]
    fn handshake_opens_the_gate() {
        let mut turn = TurnController::new(&TurnConfig::default());
        assert!(turn.is_gated());
        turn.on_connected();
        assert_eq!(turn.state(), TurnState::Connected);
        assert!(!turn.admit_chunk(10.0));
        assert!(turn.on_session_ready());
        assert!(!turn.on_session_ready());
        assert!(turn.admit_chunk(10.0));
    }

    #[test]
    fn short_segment_is_discarded_and_counters_reset() {
        let mut turn = capturing();
        for _ in 0..5 {
            turn.admit_chunk(99.0 / 5.0);
        }
        assert_eq!(turn.on_speech_stopped(), CommitDecision::Discard { had_chunks: true });
        assert_eq!(turn.audio_chunks_since_last_commit(), 0);
        assert_eq!(turn.accumulated_audio_duration_ms(), 0.0);
        assert!(!turn.user_has_committed_audio());
        assert_eq!(turn.state(), TurnState::UserCapturing);
    }

    #[test]
    fn one_long_enough_chunk_commits() {
        let mut turn = capturing();
        turn.admit_chunk(100.0);
        assert_eq!(turn.on_speech_stopped(), CommitDecision::Commit);
        assert!(turn.user_has_committed_audio());
        assert_eq!(turn.state(), TurnState::AwaitingCommit);
        assert_eq!(turn.audio_chunks_since_last_commit(), 0);

        turn.on_committed();
        assert_eq!(turn.state(), TurnState::UserCapturing);
    }

    #[test]
    fn zero_chunks_never_commit() {
        let mut turn = capturing();
        assert_eq!(turn.on_speech_stopped(), CommitDecision::Discard { had_chunks: false });
    }

    #[test]
    fn duplicate_stop_does_not_double_commit() {
        let mut turn = capturing();
        turn.admit_chunk(150.0);
        assert_eq!(turn.on_speech_stopped(), CommitDecision::Commit);
        assert_eq!(turn.on_speech_stopped(), CommitDecision::Discard { had_chunks: false });
    }

    #[test]
    fn ai_turn_gates_until_settle_expires() {
        let mut turn = capturing();
        turn.admit_chunk(200.0);
        turn.on_speech_stopped();
        assert_eq!(turn.on_response_created(), ResponseOrigin::UserTurn);
        assert!(turn.is_gated());
        assert!(!turn.admit_chunk(10.0));

        let t0 = Instant::now();
        turn.on_response_done(t0);
        assert_eq!(turn.deadline(), Some(t0 + Duration::from_millis(1200)));

        assert!(!turn.poll(t0 + Duration::from_millis(1199)));
        assert!(turn.is_gated());
        assert!(turn.user_has_committed_audio());

        assert!(turn.poll(t0 + Duration::from_millis(1200)));
        assert_eq!(turn.state(), TurnState::UserCapturing);
        assert!(!turn.user_has_committed_audio());
        assert!(turn.admit_chunk(10.0));
    }

    #[test]
    fn response_without_user_audio_is_unprompted() {
        let mut turn = capturing();
        assert_eq!(turn.on_response_created(), ResponseOrigin::Unprompted);
        // Session carries on.
        assert!(matches!(turn.state(), TurnState::AiResponding { .. }));
    }

    #[test]
    fn requested_response_is_not_unprompted() {
        let mut turn = capturing();
        turn.mark_response_requested();
        assert_eq!(turn.on_response_created(), ResponseOrigin::Requested);
        // The flag is consumed.
        let t0 = Instant::now();
        turn.on_response_done(t0);
        turn.poll(t0 + Duration::from_secs(2));
        assert_eq!(turn.on_response_created(), ResponseOrigin::Unprompted);
    }

    #[test]
    fn stop_during_ai_turn_discards() {
        let mut turn = capturing();
        turn.admit_chunk(300.0);
        turn.on_response_created();
        assert_eq!(turn.on_speech_stopped(), CommitDecision::Discard { had_chunks: true });
        assert!(!turn.user_has_committed_audio());
    }

    #[test]
    fn handed_off_segment_waits_for_server_commit() {
        let mut turn = capturing();
        turn.admit_chunk(300.0);
        turn.hand_off_segment();
        assert_eq!(turn.state(), TurnState::UserCapturing);
        assert_eq!(turn.audio_chunks_since_last_commit(), 0);
        assert!(!turn.user_has_committed_audio());

        turn.on_committed();
        assert!(turn.user_has_committed_audio());
        assert_eq!(turn.state(), TurnState::UserCapturing);
    }

    #[test]
    fn done_before_created_is_ignored() {
        let mut turn = capturing();
        turn.on_response_done(Instant::now());
        assert_eq!(turn.state(), TurnState::UserCapturing);
        assert_eq!(turn.deadline(), None);
    }

    #[test]
    fn reconnect_clears_state() {
        let mut turn = capturing();
        turn.admit_chunk(300.0);
        turn.on_speech_stopped();
        turn.on_connected();
        assert_eq!(turn.state(), TurnState::Connected);
        assert!(!turn.user_has_committed_audio());
        turn.reset();
        assert_eq!(turn.state(), TurnState::Idle);
    }
}

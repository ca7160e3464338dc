//! Client-side real-time speech pipeline for interview practice.
//!
//! Mic → frame processor (gate, framing, energy, VAD) → noise suppression →
//! 24kHz PCM16 → realtime session (turn-taking, commits) → WebSocket.

pub mod config;
pub mod error;
pub mod realtime;
pub mod voice;

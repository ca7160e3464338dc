use std::process::ExitCode;

use interview_voice::config;
use interview_voice::error::VoiceErrorKind;
use interview_voice::realtime::protocol::ServerEvent;
use interview_voice::voice::types::EngineEvent;
use interview_voice::voice::VoiceEngine;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    log::info!("interview-voice v{} starting", env!("CARGO_PKG_VERSION"));

    let path = config::config_path();
    let cfg = match config::load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "Config: url={}, server_vad={}, suppression={}, playback={}",
        cfg.realtime.url,
        cfg.realtime.server_vad,
        cfg.suppression.enabled,
        cfg.audio.play_responses
    );

    let mut engine = VoiceEngine::new(cfg);
    let mut events = match engine.start() {
        Ok(rx) => rx,
        Err(e) => {
            match e.kind() {
                VoiceErrorKind::Permission => log::error!("Grant microphone access: {}", e),
                _ => log::error!("Could not start audio: {}", e),
            }
            return ExitCode::FAILURE;
        }
    };

    let mut failed = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(EngineEvent::Stopped) | None => break,
                Some(EngineEvent::Error(e)) => {
                    log::error!("[{:?}] {}", e.kind(), e);
                    failed |= e.is_terminal();
                }
                Some(EngineEvent::Turn(state)) => log::info!("Turn: {:?}", state),
                Some(EngineEvent::CalibrationProgress(p)) => {
                    log::info!("{} ({}%)", p.message, p.progress)
                }
                Some(EngineEvent::CalibrationComplete) => log::info!("Calibration complete"),
                Some(EngineEvent::UnpromptedResponse) => {
                    log::warn!("AI responded without user input")
                }
                Some(EngineEvent::Server(ServerEvent::ResponseDone { .. })) => {
                    log::info!("AI finished speaking")
                }
                Some(EngineEvent::Server(_)) | Some(EngineEvent::Frame(_)) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
        }
    }

    engine.disconnect();
    log::info!("interview-voice stopped");
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

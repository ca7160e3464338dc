use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::RealtimeConfig;
use crate::error::VoiceError;

pub type RealtimeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open one WebSocket connection, bounded by the configured timeout.
pub async fn connect(config: &RealtimeConfig) -> Result<RealtimeSocket, VoiceError> {
    let mut request = config.url.as_str().into_client_request()?;
    match config.api_key() {
        Some(key) => {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| VoiceError::Config(format!("invalid API key: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        None => log::warn!(
            "{} is not set, connecting without authorization",
            config.api_key_env
        ),
    }
    request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    log::info!("Connecting to {}", config.url);
    match tokio::time::timeout(
        config.connect_timeout(),
        tokio_tungstenite::connect_async(request),
    )
    .await
    {
        Ok(Ok((socket, response))) => {
            log::info!("Connected (HTTP {})", response.status());
            Ok(socket)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(VoiceError::ConnectTimeout(config.connect_timeout_ms)),
    }
}

/// Consecutive connection failures, counted across reconnects. A
/// connection that held long enough to be trusted calls [`reset`].
///
/// [`reset`]: RetryBudget::reset
#[derive(Debug, Clone)]
pub struct RetryBudget {
    attempts: u32,
    backoff: Duration,
    failures: u32,
    last_error: String,
}

impl RetryBudget {
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            attempts: config.max_reconnect_attempts.max(1),
            backoff: config.reconnect_backoff(),
            failures: 0,
            last_error: String::new(),
        }
    }

    /// Count a failure. Returns false once the budget is spent.
    pub fn record_failure(&mut self, error: impl Into<String>) -> bool {
        self.failures += 1;
        self.last_error = error.into();
        log::warn!(
            "Connection attempt {}/{} failed: {}",
            self.failures,
            self.attempts,
            self.last_error
        );
        self.failures < self.attempts
    }

    pub fn reset(&mut self) {
        if self.failures > 0 {
            log::debug!("Connection stable, retry budget restored");
        }
        self.failures = 0;
        self.last_error.clear();
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn exhausted(&self) -> VoiceError {
        log::error!("Giving up after {} connection attempts", self.failures);
        VoiceError::ReconnectExhausted {
            attempts: self.failures,
            last_error: self.last_error.clone(),
        }
    }
}

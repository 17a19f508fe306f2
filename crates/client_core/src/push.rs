use std::time::Duration;

use futures::StreamExt;
use shared::{domain::Procedure, protocol::PushMessage};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{engine::EngineHandle, error::TransportError};

/// One decoded push frame. `None` means the field was absent and must not
/// touch local state; `Some(None)` clears the reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushSnapshot {
    pub setpoint: Option<Option<f64>>,
    pub actual: Option<Option<f64>>,
    pub status_label: Option<Option<String>>,
    pub active_procedure: Option<Procedure>,
}

impl From<PushMessage> for PushSnapshot {
    /// An invalid `active_procedure` is dropped; the readings in the same
    /// frame are still used.
    fn from(message: PushMessage) -> Self {
        let active_procedure = message.active_procedure.and_then(|record| {
            let id = record.id.clone();
            match Procedure::try_from(record) {
                Ok(procedure) => Some(procedure),
                Err(err) => {
                    warn!(procedure_id = %id, "push: dropping invalid active procedure: {err}");
                    None
                }
            }
        });
        Self {
            setpoint: message.temperature_setpoint,
            actual: message.temperature_actual,
            status_label: message.temperature_status,
            active_procedure,
        }
    }
}

pub fn decode_push_frame(text: &str) -> Result<PushSnapshot, TransportError> {
    let message: PushMessage =
        serde_json::from_str(text).map_err(|err| TransportError::Malformed(err.to_string()))?;
    Ok(message.into())
}

/// Capped exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failed
    /// connects. Zero failures (a clean disconnect) waits `initial`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Handle to the supervisor task. Dropping it stops the connection.
pub struct PushChannel {
    task: JoinHandle<()>,
}

impl PushChannel {
    pub fn spawn(ws_url: Url, policy: ReconnectPolicy, engine: EngineHandle) -> Self {
        let task = tokio::spawn(supervise(ws_url, policy, engine));
        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum PumpExit {
    Disconnected,
    EngineClosed,
}

async fn supervise(ws_url: Url, policy: ReconnectPolicy, engine: EngineHandle) {
    let mut failures: u32 = 0;
    loop {
        if engine.is_closed() {
            break;
        }
        match pump(&ws_url, &engine).await {
            Ok(PumpExit::EngineClosed) => break,
            Ok(PumpExit::Disconnected) => failures = 0,
            Err(err) => {
                failures = failures.saturating_add(1);
                warn!(url = %ws_url, failures, "push: connect failed: {err}");
            }
        }
        let delay = policy.delay_for(failures);
        debug!(delay_ms = delay.as_millis() as u64, "push: reconnecting after delay");
        tokio::time::sleep(delay).await;
    }
    info!(url = %ws_url, "push: engine closed, supervisor stopping");
}

async fn pump(
    ws_url: &Url,
    engine: &EngineHandle,
) -> Result<PumpExit, tokio_tungstenite::tungstenite::Error> {
    let (ws_stream, _) = connect_async(ws_url.as_str()).await?;
    info!(url = %ws_url, "push: connected");
    let (_, mut ws_reader) = ws_stream.split();

    while let Some(msg) = ws_reader.next().await {
        match msg {
            Ok(Message::Text(text)) => match decode_push_frame(&text) {
                Ok(snapshot) => {
                    if engine.push(snapshot).is_err() {
                        return Ok(PumpExit::EngineClosed);
                    }
                }
                Err(err) => warn!("push: dropping undecodable frame: {err}"),
            },
            Ok(Message::Close(frame)) => {
                info!(?frame, "push: server closed connection");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!("push: receive failed: {err}");
                break;
            }
        }
    }
    Ok(PumpExit::Disconnected)
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;

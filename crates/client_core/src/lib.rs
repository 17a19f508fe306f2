use std::sync::Arc;

use shared::domain::ProcedureId;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{info, warn};
use url::Url;

pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod push;
pub mod readings;
pub mod selection;
pub mod store;
pub mod transport;

pub use config::{load_settings, ClientSettings, SettingsOverrides};
pub use engine::{spawn_engine, ClientEvent, CommandOutcome, EngineHandle, EngineView};
pub use error::{CommandError, EngineError, StoreError, TransportError};
pub use ledger::{CommandPhase, OperationFamily};
pub use orchestrator::CommandOrchestrator;
pub use push::{PushChannel, ReconnectPolicy};
pub use transport::{CommandTransport, HttpCommandTransport};

/// Engine, command orchestrator and push channel wired together.
///
/// A store invariant violation reported by the engine triggers a full
/// procedure refresh in the background.
pub struct ControllerClient {
    orchestrator: CommandOrchestrator,
    push: Option<PushChannel>,
    resync_task: JoinHandle<()>,
}

impl ControllerClient {
    /// Starts an engine on the current runtime without a push channel.
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        let orchestrator = CommandOrchestrator::new(transport, spawn_engine());
        let resync_task = spawn_resync_watcher(orchestrator.clone());
        Self {
            orchestrator,
            push: None,
            resync_task,
        }
    }

    /// HTTP commands plus the progress stream, both taken from `settings`.
    pub fn connect(settings: &ClientSettings) -> Result<Self, TransportError> {
        let transport =
            HttpCommandTransport::new(settings.api_base_url.clone(), settings.request_timeout)?;
        let mut client = Self::new(Arc::new(transport));
        client.start_push(settings.ws_url.clone(), settings.reconnect);
        Ok(client)
    }

    /// Replaces any running push channel.
    pub fn start_push(&mut self, ws_url: Url, policy: ReconnectPolicy) {
        info!(url = %ws_url, "client: starting push channel");
        self.push = Some(PushChannel::spawn(
            ws_url,
            policy,
            self.orchestrator.engine().clone(),
        ));
    }

    pub fn commands(&self) -> &CommandOrchestrator {
        &self.orchestrator
    }

    pub fn engine(&self) -> &EngineHandle {
        self.orchestrator.engine()
    }

    pub fn view(&self) -> EngineView {
        self.engine().view()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.engine().subscribe_events()
    }

    pub async fn focus(&self, id: ProcedureId) -> Result<bool, EngineError> {
        self.engine().focus(id).await
    }
}

impl Drop for ControllerClient {
    fn drop(&mut self) {
        self.resync_task.abort();
    }
}

fn spawn_resync_watcher(orchestrator: CommandOrchestrator) -> JoinHandle<()> {
    let mut events = orchestrator.engine().subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::ResyncRequired(reason)) => {
                    info!(%reason, "client: refreshing procedures after invariant violation");
                    if let Err(err) = orchestrator.fetch_procedures().await {
                        warn!("client: resync refresh failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client: event watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

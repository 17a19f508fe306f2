use std::{future::Future, sync::Arc};

use shared::{
    domain::{Procedure, ProcedureId},
    protocol::{ProcedureDraft, SetTemperatureRequest},
};
use tracing::{debug, warn};

use crate::{
    engine::{CommandOutcome, EngineHandle},
    error::{CommandError, TransportError},
    ledger::{AttemptTicket, OperationFamily},
    store::CommandResult,
    transport::CommandTransport,
};

#[derive(Clone)]
pub struct CommandOrchestrator {
    transport: Arc<dyn CommandTransport>,
    engine: EngineHandle,
}

impl CommandOrchestrator {
    pub fn new(transport: Arc<dyn CommandTransport>, engine: EngineHandle) -> Self {
        Self { transport, engine }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub async fn fetch_procedures(&self) -> Result<Vec<Procedure>, CommandError> {
        self.execute(
            OperationFamily::Fetch,
            self.transport.list_procedures(),
            |procedures| CommandOutcome::Refreshed(procedures.clone()),
        )
        .await
    }

    pub async fn create_procedure(&self, draft: ProcedureDraft) -> Result<Procedure, CommandError> {
        let request = async {
            draft.validate()?;
            self.transport.create_procedure(&draft).await
        };
        self.execute(OperationFamily::Create, request, |procedure| {
            CommandOutcome::Applied(CommandResult::Create(procedure.clone()))
        })
        .await
    }

    pub async fn update_procedure(
        &self,
        id: ProcedureId,
        draft: ProcedureDraft,
    ) -> Result<Procedure, CommandError> {
        let request = async {
            draft.validate()?;
            self.transport.update_procedure(&id, &draft).await
        };
        self.execute(OperationFamily::Update, request, |procedure| {
            CommandOutcome::Applied(CommandResult::Update(procedure.clone()))
        })
        .await
    }

    /// The deleted id is taken from the request; the reply carries none.
    pub async fn delete_procedure(&self, id: ProcedureId) -> Result<(), CommandError> {
        self.execute(
            OperationFamily::Delete,
            self.transport.delete_procedure(&id),
            |_| CommandOutcome::Applied(CommandResult::Delete(id.clone())),
        )
        .await
    }

    pub async fn start_procedure(&self, id: ProcedureId) -> Result<Procedure, CommandError> {
        self.execute(
            OperationFamily::Start,
            self.transport.start_procedure(&id),
            |procedure| CommandOutcome::Applied(CommandResult::Start(procedure.clone())),
        )
        .await
    }

    pub async fn stop_procedure(&self) -> Result<Procedure, CommandError> {
        self.execute(
            OperationFamily::Stop,
            self.transport.stop_procedure(),
            |procedure| CommandOutcome::Applied(CommandResult::Stop(procedure.clone())),
        )
        .await
    }

    pub async fn reset_procedure(&self, id: ProcedureId) -> Result<Procedure, CommandError> {
        self.execute(
            OperationFamily::Reset,
            self.transport.reset_procedure(&id),
            |procedure| CommandOutcome::Applied(CommandResult::Reset(procedure.clone())),
        )
        .await
    }

    pub async fn list_ports(&self) -> Result<Vec<String>, CommandError> {
        self.execute(
            OperationFamily::ListPorts,
            self.transport.list_ports(),
            |ports| CommandOutcome::Ports(ports.clone()),
        )
        .await
    }

    pub async fn select_port(&self, port: impl Into<String>) -> Result<(), CommandError> {
        let port = port.into();
        self.execute(
            OperationFamily::SelectPort,
            self.transport.select_port(&port),
            |_| CommandOutcome::PortSelected(port.clone()),
        )
        .await
    }

    /// Sends a manual setpoint. The live reading only changes once the push
    /// channel reports it.
    pub async fn set_temperature(&self, celsius: f64) -> Result<(), CommandError> {
        let request = async {
            SetTemperatureRequest {
                temperature: celsius,
            }
            .validate()?;
            self.transport.set_temperature(celsius).await
        };
        self.execute(OperationFamily::SetTemperature, request, |_| {
            CommandOutcome::Acknowledged
        })
        .await
    }

    async fn execute<T, Fut>(
        &self,
        family: OperationFamily,
        request: Fut,
        outcome: impl FnOnce(&T) -> CommandOutcome,
    ) -> Result<T, CommandError>
    where
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let ticket = self.engine.begin(family).await?;
        let mut attempt = OpenAttempt {
            engine: &self.engine,
            ticket: Some(ticket),
        };
        debug!(
            family = family.as_str(),
            attempt = ticket.attempt,
            "orchestrator: request sent"
        );
        let result = request.await;
        attempt.ticket = None;
        match result {
            Ok(value) => match self.engine.settle(ticket, outcome(&value)).await? {
                None => Ok(value),
                Some(message) => Err(CommandError::Rejected(message)),
            },
            Err(err) => {
                let message = failure_message(family, &err);
                self.engine
                    .settle(ticket, CommandOutcome::Failed(message))
                    .await?;
                Err(err.into())
            }
        }
    }
}

/// Settles an attempt whose caller stopped waiting before the reply arrived.
struct OpenAttempt<'a> {
    engine: &'a EngineHandle,
    ticket: Option<AttemptTicket>,
}

impl Drop for OpenAttempt<'_> {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        warn!(
            family = ticket.family.as_str(),
            attempt = ticket.attempt,
            "orchestrator: request abandoned before completion"
        );
        let message = format!("{}: request cancelled", ticket.family.default_failure_message());
        let _ = self
            .engine
            .settle_detached(ticket, CommandOutcome::Failed(message));
    }
}

/// The backend's own message when it sent one, otherwise the family default
/// followed by the error.
pub fn failure_message(family: OperationFamily, err: &TransportError) -> String {
    match err.server_message() {
        Some(message) if !message.trim().is_empty() => message.to_string(),
        _ => format!("{}: {err}", family.default_failure_message()),
    }
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;

//! Single-writer engine task.
//!
//! The store, the command ledger and the serial-port state live inside one
//! spawned task. Everything else talks to it through [`EngineHandle`]: inputs
//! go in over an unbounded channel, snapshots come out over a `watch` channel
//! and change notifications over a `broadcast` channel.

use std::collections::BTreeMap;

use shared::domain::{Procedure, ProcedureId};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::{
    error::{EngineError, StoreError},
    ledger::{AttemptTicket, CommandLedger, CommandPhase, FamilySlot, OperationFamily, Settlement},
    push::PushSnapshot,
    readings::LiveReading,
    store::{Applied, CommandResult, ProcedureStore},
};

const EVENT_CAPACITY: usize = 256;

/// What a settled attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Refreshed(Vec<Procedure>),
    Applied(CommandResult),
    Ports(Vec<String>),
    PortSelected(String),
    /// Success with nothing to apply.
    Acknowledged,
    /// Human-readable failure for the family's error slot.
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerialPortState {
    pub available: Vec<String>,
    pub selected: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ProceduresChanged,
    FocusChanged(Option<ProcedureId>),
    ReadingChanged(LiveReading),
    CommandSettled {
        family: OperationFamily,
        error: Option<String>,
    },
    PortsChanged,
    /// The local model disagreed with the server; a full refresh should follow.
    ResyncRequired(String),
}

/// Cloned snapshot of everything the engine owns.
#[derive(Debug, Clone, Default)]
pub struct EngineView {
    pub procedures: Vec<Procedure>,
    pub focused: Option<ProcedureId>,
    pub reading: LiveReading,
    pub commands: BTreeMap<OperationFamily, FamilySlot>,
    pub ports: SerialPortState,
    pub revision: u64,
}

impl EngineView {
    pub fn get(&self, id: &ProcedureId) -> Option<&Procedure> {
        self.procedures.iter().find(|procedure| &procedure.id == id)
    }

    pub fn current_focus(&self) -> Option<&Procedure> {
        self.focused.as_ref().and_then(|id| self.get(id))
    }

    pub fn running(&self) -> Option<&Procedure> {
        self.procedures.iter().find(|procedure| procedure.is_running())
    }

    pub fn exit_requires_confirmation(&self) -> bool {
        self.current_focus()
            .is_some_and(|procedure| procedure.is_running())
    }

    pub fn is_loading(&self, family: OperationFamily) -> bool {
        self.commands
            .get(&family)
            .is_some_and(FamilySlot::is_loading)
    }

    pub fn phase(&self, family: OperationFamily) -> CommandPhase {
        self.commands
            .get(&family)
            .map(FamilySlot::phase)
            .unwrap_or_default()
    }

    pub fn last_error(&self, family: OperationFamily) -> Option<&str> {
        self.commands.get(&family).and_then(FamilySlot::last_error)
    }
}

#[derive(Debug)]
pub(crate) enum EngineInput {
    Begin {
        family: OperationFamily,
        reply: oneshot::Sender<AttemptTicket>,
    },
    Settle {
        ticket: AttemptTicket,
        outcome: CommandOutcome,
        reply: Option<oneshot::Sender<Option<String>>>,
    },
    Push(PushSnapshot),
    Focus {
        id: ProcedureId,
        reply: oneshot::Sender<bool>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct EngineHandle {
    inputs: mpsc::UnboundedSender<EngineInput>,
    view: watch::Receiver<EngineView>,
    events: broadcast::Sender<ClientEvent>,
}

impl EngineHandle {
    /// Opens an attempt for `family`; the family reports loading until the
    /// returned ticket is settled.
    pub async fn begin(&self, family: OperationFamily) -> Result<AttemptTicket, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineInput::Begin { family, reply })?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Closes the attempt. Returns the failure recorded for it, which is also
    /// set when a successful reply could not be applied.
    pub async fn settle(
        &self,
        ticket: AttemptTicket,
        outcome: CommandOutcome,
    ) -> Result<Option<String>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineInput::Settle {
            ticket,
            outcome,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Settles without waiting; usable from `Drop`.
    pub(crate) fn settle_detached(
        &self,
        ticket: AttemptTicket,
        outcome: CommandOutcome,
    ) -> Result<(), EngineError> {
        self.send(EngineInput::Settle {
            ticket,
            outcome,
            reply: None,
        })
    }

    pub fn push(&self, snapshot: PushSnapshot) -> Result<(), EngineError> {
        self.send(EngineInput::Push(snapshot))
    }

    /// Returns whether `id` exists and is now focused.
    pub async fn focus(&self, id: ProcedureId) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineInput::Focus { id, reply })?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Resolves once every input sent before it has been processed.
    pub async fn flush(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineInput::Flush { reply })?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    pub fn view(&self) -> EngineView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<EngineView> {
        self.view.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inputs.is_closed()
    }

    fn send(&self, input: EngineInput) -> Result<(), EngineError> {
        self.inputs.send(input).map_err(|_| EngineError::Closed)
    }
}

/// Spawns the engine on the current tokio runtime. The task ends once every
/// handle has been dropped.
pub fn spawn_engine() -> EngineHandle {
    let (inputs, rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(EngineView::default());
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    let engine = Engine {
        store: ProcedureStore::new(),
        ledger: CommandLedger::new(),
        ports: SerialPortState::default(),
        view: view_tx,
        events: events.clone(),
        revision: 0,
    };
    tokio::spawn(engine.run(rx));

    EngineHandle {
        inputs,
        view: view_rx,
        events,
    }
}

struct Engine {
    store: ProcedureStore,
    ledger: CommandLedger,
    ports: SerialPortState,
    view: watch::Sender<EngineView>,
    events: broadcast::Sender<ClientEvent>,
    revision: u64,
}

impl Engine {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<EngineInput>) {
        debug!("engine: started");
        while let Some(input) = inputs.recv().await {
            self.handle(input);
        }
        debug!("engine: all handles dropped, stopping");
    }

    fn handle(&mut self, input: EngineInput) {
        match input {
            EngineInput::Begin { family, reply } => {
                let ticket = self.ledger.begin(family);
                debug!(
                    family = family.as_str(),
                    attempt = ticket.attempt,
                    "engine: attempt started"
                );
                self.publish();
                let _ = reply.send(ticket);
            }
            EngineInput::Settle {
                ticket,
                outcome,
                reply,
            } => {
                let failure = self.settle(ticket, outcome);
                self.publish();
                if let Some(reply) = reply {
                    let _ = reply.send(failure);
                }
            }
            EngineInput::Push(snapshot) => {
                if self.apply_push(snapshot) {
                    self.publish();
                }
            }
            EngineInput::Focus { id, reply } => {
                let before = self.store.focused_id().cloned();
                let found = self.store.focus(&id);
                if self.emit_focus_change(before) {
                    self.publish();
                }
                let _ = reply.send(found);
            }
            EngineInput::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn settle(&mut self, ticket: AttemptTicket, outcome: CommandOutcome) -> Option<String> {
        let family = ticket.family;
        let result = match outcome {
            CommandOutcome::Failed(message) => Err(message),
            CommandOutcome::Refreshed(procedures) => {
                let before = self.store.focused_id().cloned();
                match self.store.apply_full_refresh(procedures) {
                    Ok(applied) => {
                        self.emit_procedures_change(applied);
                        self.emit_focus_change(before);
                        Ok(())
                    }
                    Err(err) => {
                        error!(family = family.as_str(), "engine: refresh rejected: {err}");
                        Err(format!("{}: {err}", family.default_failure_message()))
                    }
                }
            }
            CommandOutcome::Applied(result) => {
                self.apply_command_result(result);
                Ok(())
            }
            CommandOutcome::Ports(ports) => {
                if self.ports.available != ports {
                    self.ports.available = ports;
                    let _ = self.events.send(ClientEvent::PortsChanged);
                }
                Ok(())
            }
            CommandOutcome::PortSelected(port) => {
                if self.ports.selected.as_deref() != Some(port.as_str()) {
                    info!(port = %port, "engine: serial port selected");
                    self.ports.selected = Some(port);
                    let _ = self.events.send(ClientEvent::PortsChanged);
                }
                Ok(())
            }
            CommandOutcome::Acknowledged => Ok(()),
        };

        if let Err(message) = &result {
            warn!(
                family = family.as_str(),
                attempt = ticket.attempt,
                "engine: command failed: {message}"
            );
        }
        let error = result.as_ref().err().cloned();
        if self.ledger.settle(ticket, result) == Settlement::Current {
            let _ = self.events.send(ClientEvent::CommandSettled {
                family,
                error: error.clone(),
            });
        }
        error
    }

    fn apply_command_result(&mut self, result: CommandResult) {
        let kind = result.kind();
        let procedure_id = result.procedure_id().clone();
        let before = self.store.focused_id().cloned();
        match self.store.apply_command_result(result) {
            Ok(applied) => {
                info!(
                    kind,
                    procedure_id = %procedure_id,
                    ?applied,
                    "engine: command result applied"
                );
                self.emit_procedures_change(applied);
                self.emit_focus_change(before);
            }
            Err(err) => self.request_resync(kind, err),
        }
    }

    /// Returns whether anything observable changed.
    fn apply_push(&mut self, snapshot: PushSnapshot) -> bool {
        let mut reading_changed = false;
        let reading = self.store.reading_mut();
        if let Some(value) = snapshot.setpoint {
            reading_changed |= reading.set_setpoint(value);
        }
        if let Some(value) = snapshot.actual {
            reading_changed |= reading.set_actual_reading(value);
        }
        if let Some(value) = snapshot.status_label {
            reading_changed |= reading.set_status_label(value);
        }
        if reading_changed {
            let _ = self
                .events
                .send(ClientEvent::ReadingChanged(self.store.reading().clone()));
        }

        let mut procedures_changed = false;
        if let Some(procedure) = snapshot.active_procedure {
            match self.store.apply_stream_snapshot(procedure) {
                Ok(applied) => procedures_changed = self.emit_procedures_change(applied),
                Err(err) => self.request_resync("push", err),
            }
        }
        reading_changed || procedures_changed
    }

    fn request_resync(&self, source: &str, err: StoreError) {
        error!(source, "engine: store invariant violated: {err}");
        let _ = self
            .events
            .send(ClientEvent::ResyncRequired(err.to_string()));
    }

    fn emit_procedures_change(&self, applied: Applied) -> bool {
        if applied != Applied::Changed {
            return false;
        }
        let _ = self.events.send(ClientEvent::ProceduresChanged);
        true
    }

    fn emit_focus_change(&self, before: Option<ProcedureId>) -> bool {
        let after = self.store.focused_id();
        if before.as_ref() == after {
            return false;
        }
        let _ = self.events.send(ClientEvent::FocusChanged(after.cloned()));
        true
    }

    fn publish(&mut self) {
        self.revision += 1;
        self.view.send_replace(EngineView {
            procedures: self.store.list_procedures().to_vec(),
            focused: self.store.focused_id().cloned(),
            reading: self.store.reading().clone(),
            commands: self.ledger.slots().clone(),
            ports: self.ports.clone(),
            revision: self.revision,
        });
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;

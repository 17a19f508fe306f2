use std::collections::BTreeMap;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationFamily {
    Fetch,
    Create,
    Update,
    Delete,
    Start,
    Stop,
    Reset,
    ListPorts,
    SelectPort,
    SetTemperature,
}

impl OperationFamily {
    pub const ALL: [OperationFamily; 10] = [
        OperationFamily::Fetch,
        OperationFamily::Create,
        OperationFamily::Update,
        OperationFamily::Delete,
        OperationFamily::Start,
        OperationFamily::Stop,
        OperationFamily::Reset,
        OperationFamily::ListPorts,
        OperationFamily::SelectPort,
        OperationFamily::SetTemperature,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationFamily::Fetch => "fetch",
            OperationFamily::Create => "create",
            OperationFamily::Update => "update",
            OperationFamily::Delete => "delete",
            OperationFamily::Start => "start",
            OperationFamily::Stop => "stop",
            OperationFamily::Reset => "reset",
            OperationFamily::ListPorts => "list_ports",
            OperationFamily::SelectPort => "select_port",
            OperationFamily::SetTemperature => "set_temperature",
        }
    }

    pub fn default_failure_message(self) -> &'static str {
        match self {
            OperationFamily::Fetch => "Failed to fetch procedures",
            OperationFamily::Create => "Failed to create procedure",
            OperationFamily::Update => "Failed to update procedure",
            OperationFamily::Delete => "Failed to delete procedure",
            OperationFamily::Start => "Failed to start procedure",
            OperationFamily::Stop => "Failed to stop procedure",
            OperationFamily::Reset => "Failed to reset procedure",
            OperationFamily::ListPorts => "Failed to fetch ports",
            OperationFamily::SelectPort => "Failed to select port",
            OperationFamily::SetTemperature => "Failed to set temperature",
        }
    }
}

/// Identifies one invocation of a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTicket {
    pub family: OperationFamily,
    pub attempt: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandPhase {
    #[default]
    Idle,
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The ticket was the family's latest attempt and its outcome is recorded.
    Current,
    /// A newer attempt has started; the error slot belongs to it.
    Superseded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FamilySlot {
    in_flight: usize,
    latest_attempt: u64,
    settled_phase: CommandPhase,
    last_error: Option<String>,
}

impl FamilySlot {
    pub fn is_loading(&self) -> bool {
        self.in_flight > 0
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn phase(&self) -> CommandPhase {
        if self.in_flight > 0 {
            CommandPhase::Pending
        } else {
            self.settled_phase
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandLedger {
    slots: BTreeMap<OperationFamily, FamilySlot>,
    next_attempt: u64,
}

impl CommandLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an attempt and clears the family's previous error.
    pub fn begin(&mut self, family: OperationFamily) -> AttemptTicket {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let slot = self.slots.entry(family).or_default();
        slot.in_flight += 1;
        slot.latest_attempt = attempt;
        slot.last_error = None;
        AttemptTicket { family, attempt }
    }

    pub fn settle(&mut self, ticket: AttemptTicket, outcome: Result<(), String>) -> Settlement {
        let slot = self.slots.entry(ticket.family).or_default();
        slot.in_flight = slot.in_flight.saturating_sub(1);
        if ticket.attempt != slot.latest_attempt {
            debug!(
                family = ticket.family.as_str(),
                attempt = ticket.attempt,
                latest = slot.latest_attempt,
                "ledger: superseded attempt settled"
            );
            return Settlement::Superseded;
        }
        match outcome {
            Ok(()) => {
                slot.settled_phase = CommandPhase::Succeeded;
                slot.last_error = None;
            }
            Err(message) => {
                slot.settled_phase = CommandPhase::Failed;
                slot.last_error = Some(message);
            }
        }
        Settlement::Current
    }

    pub fn slot(&self, family: OperationFamily) -> FamilySlot {
        self.slots.get(&family).cloned().unwrap_or_default()
    }

    pub fn is_loading(&self, family: OperationFamily) -> bool {
        self.slots.get(&family).is_some_and(FamilySlot::is_loading)
    }

    pub fn last_error(&self, family: OperationFamily) -> Option<&str> {
        self.slots.get(&family).and_then(FamilySlot::last_error)
    }

    pub fn any_loading(&self) -> bool {
        self.slots.values().any(FamilySlot::is_loading)
    }

    pub fn slots(&self) -> &BTreeMap<OperationFamily, FamilySlot> {
        &self.slots
    }
}

#[cfg(test)]
#[path = "tests/ledger_tests.rs"]
mod tests;

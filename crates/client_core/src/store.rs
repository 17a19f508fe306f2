use std::collections::HashSet;

use shared::domain::{Procedure, ProcedureId};
use tracing::debug;

use crate::{
    error::{InvariantViolation, StoreError},
    readings::LiveReading,
    selection::Selection,
};

/// Result of a successful command, ready to be applied.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Create(Procedure),
    Update(Procedure),
    Start(Procedure),
    Stop(Procedure),
    Reset(Procedure),
    Delete(ProcedureId),
}

impl CommandResult {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandResult::Create(_) => "create",
            CommandResult::Update(_) => "update",
            CommandResult::Start(_) => "start",
            CommandResult::Stop(_) => "stop",
            CommandResult::Reset(_) => "reset",
            CommandResult::Delete(_) => "delete",
        }
    }

    pub fn procedure_id(&self) -> &ProcedureId {
        match self {
            CommandResult::Create(procedure)
            | CommandResult::Update(procedure)
            | CommandResult::Start(procedure)
            | CommandResult::Stop(procedure)
            | CommandResult::Reset(procedure) => &procedure.id,
            CommandResult::Delete(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    /// The target id is not (or no longer) in the collection.
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct ProcedureStore {
    procedures: Vec<Procedure>,
    selection: Selection,
    reading: LiveReading,
}

impl ProcedureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list_procedures(&self) -> &[Procedure] {
        &self.procedures
    }

    pub fn get(&self, id: &ProcedureId) -> Option<&Procedure> {
        self.procedures.iter().find(|procedure| &procedure.id == id)
    }

    pub fn running(&self) -> Option<&Procedure> {
        self.procedures.iter().find(|procedure| procedure.is_running())
    }

    pub fn focused_id(&self) -> Option<&ProcedureId> {
        self.selection.focused_id()
    }

    pub fn focus(&mut self, id: &ProcedureId) -> bool {
        self.selection.focus(id, &self.procedures)
    }

    pub fn current_focus(&self) -> Option<&Procedure> {
        self.selection.current(&self.procedures)
    }

    pub fn exit_requires_confirmation(&self) -> bool {
        self.selection.exit_requires_confirmation(&self.procedures)
    }

    pub fn reading(&self) -> &LiveReading {
        &self.reading
    }

    pub fn reading_mut(&mut self) -> &mut LiveReading {
        &mut self.reading
    }

    /// Replaces the whole collection. The store is left untouched on error.
    pub fn apply_full_refresh(&mut self, procedures: Vec<Procedure>) -> Result<Applied, StoreError> {
        let running = procedures.iter().filter(|p| p.is_running()).count();
        if running > 1 {
            return Err(StoreError::Refresh { running });
        }
        let mut seen = HashSet::with_capacity(procedures.len());
        for procedure in &procedures {
            ensure_id(procedure)?;
            if !seen.insert(&procedure.id) {
                return Err(InvariantViolation::DuplicateId(procedure.id.clone()).into());
            }
        }

        let changed = self.procedures != procedures;
        self.procedures = procedures;
        let focus_changed = self.selection.after_refresh(&self.procedures);
        Ok(if changed || focus_changed {
            Applied::Changed
        } else {
            Applied::Unchanged
        })
    }

    pub fn apply_command_result(&mut self, result: CommandResult) -> Result<Applied, StoreError> {
        match result {
            CommandResult::Create(procedure) => self.insert(procedure),
            CommandResult::Update(procedure)
            | CommandResult::Start(procedure)
            | CommandResult::Stop(procedure)
            | CommandResult::Reset(procedure) => self.replace(procedure),
            CommandResult::Delete(id) => Ok(self.remove(&id)),
        }
    }

    /// Overwrites a known procedure with pushed progress. Unknown ids are
    /// ignored: only commands introduce new identities.
    pub fn apply_stream_snapshot(&mut self, procedure: Procedure) -> Result<Applied, StoreError> {
        self.replace(procedure)
    }

    fn position(&self, id: &ProcedureId) -> Option<usize> {
        self.procedures.iter().position(|procedure| &procedure.id == id)
    }

    fn insert(&mut self, procedure: Procedure) -> Result<Applied, StoreError> {
        ensure_id(&procedure)?;
        if self.position(&procedure.id).is_some() {
            return Err(InvariantViolation::DuplicateId(procedure.id).into());
        }
        self.ensure_single_running(&procedure, None)?;
        let id = procedure.id.clone();
        self.procedures.push(procedure);
        self.selection.set(id);
        Ok(Applied::Changed)
    }

    fn replace(&mut self, procedure: Procedure) -> Result<Applied, StoreError> {
        ensure_id(&procedure)?;
        let Some(index) = self.position(&procedure.id) else {
            debug!(procedure_id = %procedure.id, "store: ignoring update for unknown procedure");
            return Ok(Applied::Ignored);
        };
        self.ensure_single_running(&procedure, Some(index))?;
        if self.procedures[index] == procedure {
            return Ok(Applied::Unchanged);
        }
        self.procedures[index] = procedure;
        Ok(Applied::Changed)
    }

    fn remove(&mut self, id: &ProcedureId) -> Applied {
        let Some(index) = self.position(id) else {
            debug!(procedure_id = %id, "store: ignoring delete for unknown procedure");
            return Applied::Ignored;
        };
        self.procedures.remove(index);
        self.selection.after_removal(id, &self.procedures);
        Applied::Changed
    }

    fn ensure_single_running(
        &self,
        incoming: &Procedure,
        replacing: Option<usize>,
    ) -> Result<(), InvariantViolation> {
        if !incoming.is_running() {
            return Ok(());
        }
        let other = self
            .procedures
            .iter()
            .enumerate()
            .find(|(index, procedure)| Some(*index) != replacing && procedure.is_running());
        match other {
            Some((_, running)) => Err(InvariantViolation::SecondRunning {
                incoming: incoming.id.clone(),
                running: running.id.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn ensure_id(procedure: &Procedure) -> Result<(), InvariantViolation> {
    if procedure.id.as_str().trim().is_empty() {
        return Err(InvariantViolation::EmptyId);
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;

use shared::domain::{Procedure, ProcedureId};

/// Holds only the focused id; the procedure is resolved by lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    focused: Option<ProcedureId>,
}

impl Selection {
    pub fn focused_id(&self) -> Option<&ProcedureId> {
        self.focused.as_ref()
    }

    /// Focuses `id` if it is present; otherwise leaves the focus untouched.
    pub fn focus(&mut self, id: &ProcedureId, procedures: &[Procedure]) -> bool {
        if !procedures.iter().any(|procedure| &procedure.id == id) {
            return false;
        }
        self.focused = Some(id.clone());
        true
    }

    pub fn current<'a>(&self, procedures: &'a [Procedure]) -> Option<&'a Procedure> {
        let focused = self.focused.as_ref()?;
        procedures.iter().find(|procedure| &procedure.id == focused)
    }

    /// The operator should confirm before leaving while the focused procedure
    /// is executing on hardware.
    pub fn exit_requires_confirmation(&self, procedures: &[Procedure]) -> bool {
        self.current(procedures)
            .is_some_and(|procedure| procedure.is_running())
    }

    pub(crate) fn set(&mut self, id: ProcedureId) {
        self.focused = Some(id);
    }

    /// After a full refresh: keep a focus that still resolves, otherwise fall
    /// back to the first procedure. Returns whether the focus changed.
    pub(crate) fn after_refresh(&mut self, procedures: &[Procedure]) -> bool {
        if self.current(procedures).is_some() {
            return false;
        }
        self.fall_back_to_first(procedures)
    }

    pub(crate) fn after_removal(&mut self, removed: &ProcedureId, procedures: &[Procedure]) -> bool {
        if self.focused.as_ref() != Some(removed) {
            return false;
        }
        self.fall_back_to_first(procedures)
    }

    fn fall_back_to_first(&mut self, procedures: &[Procedure]) -> bool {
        let next = procedures.first().map(|procedure| procedure.id.clone());
        let changed = self.focused != next;
        self.focused = next;
        changed
    }
}

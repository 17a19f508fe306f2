//! JSON shapes exchanged with the controller backend.
//!
//! Records here are deliberately loose: runtime fields may be missing (the list
//! endpoint only returns definitions). Conversion into [`crate::domain`] types
//! applies defaults and validates.

use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{
    validate_step_target, Procedure, ProcedureId, ProcedureStatus, Step, StepStatus,
    ValidationError,
};

/// Manual setpoints accepted by the controller, in °C.
pub const SETPOINT_MIN_CELSIUS: f64 = 0.0;
pub const SETPOINT_MAX_CELSIUS: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub temperature: f64,
    pub duration: u64,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub elapsed_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureRecord {
    pub id: ProcedureId,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub status: ProcedureStatus,
    /// The backend reports `-1` when nothing is executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<i64>,
}

impl TryFrom<ProcedureRecord> for Procedure {
    type Error = ValidationError;

    fn try_from(record: ProcedureRecord) -> Result<Self, Self::Error> {
        let procedure = Procedure {
            id: record.id,
            name: record.name,
            steps: record
                .steps
                .into_iter()
                .map(|step| Step {
                    temperature: step.temperature,
                    duration: step.duration,
                    status: step.status,
                    elapsed_time: step.elapsed_time,
                })
                .collect(),
            status: record.status,
            current_step: record
                .current_step
                .and_then(|index| usize::try_from(index).ok()),
        };
        procedure.validate()?;
        Ok(procedure)
    }
}

impl From<&Procedure> for ProcedureRecord {
    fn from(procedure: &Procedure) -> Self {
        Self {
            id: procedure.id.clone(),
            name: procedure.name.clone(),
            steps: procedure
                .steps
                .iter()
                .map(|step| StepRecord {
                    temperature: step.temperature,
                    duration: step.duration,
                    status: step.status,
                    elapsed_time: step.elapsed_time,
                })
                .collect(),
            status: procedure.status,
            current_step: Some(
                procedure
                    .current_step
                    .and_then(|index| i64::try_from(index).ok())
                    .unwrap_or(-1),
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcedureListResponse {
    #[serde(default)]
    pub procedures: Vec<ProcedureRecord>,
}

/// Reply to every mutating procedure command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure: Option<ProcedureRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDraft {
    pub temperature: f64,
    pub duration: u64,
}

/// Body of create and update requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureDraft {
    pub name: String,
    pub steps: Vec<StepDraft>,
}

impl ProcedureDraft {
    pub fn new(name: impl Into<String>, steps: Vec<StepDraft>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.steps.is_empty() {
            return Err(ValidationError::NoSteps);
        }
        for (index, step) in self.steps.iter().enumerate() {
            validate_step_target(index, step.temperature, step.duration)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerialPortListResponse {
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectPortRequest {
    pub port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetTemperatureRequest {
    pub temperature: f64,
}

impl SetTemperatureRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let value = self.temperature;
        if !value.is_finite() || !(SETPOINT_MIN_CELSIUS..=SETPOINT_MAX_CELSIUS).contains(&value) {
            return Err(ValidationError::SetpointOutOfRange {
                value,
                min: SETPOINT_MIN_CELSIUS,
                max: SETPOINT_MAX_CELSIUS,
            });
        }
        Ok(())
    }
}

/// Frame pushed over the progress WebSocket.
///
/// The reading fields distinguish "absent" (`None`) from an explicit `null`
/// (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub temperature_setpoint: Option<Option<f64>>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub temperature_actual: Option<Option<f64>>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub temperature_status: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_procedure: Option<ProcedureRecord>,
}

fn present_or_null<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcedureId(pub String);

impl ProcedureId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcedureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcedureId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// One stage of a procedure: hold `temperature` (°C) for `duration` seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub temperature: f64,
    pub duration: u64,
    pub status: StepStatus,
    pub elapsed_time: u64,
}

impl Step {
    pub fn queued(temperature: f64, duration: u64) -> Self {
        Self {
            temperature,
            duration,
            status: StepStatus::Queued,
            elapsed_time: 0,
        }
    }

    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        validate_step_target(index, self.temperature, self.duration)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Procedure {
    pub id: ProcedureId,
    pub name: String,
    pub steps: Vec<Step>,
    pub status: ProcedureStatus,
    /// Index of the executing step; `None` unless the procedure is running.
    pub current_step: Option<usize>,
}

impl Procedure {
    pub fn is_running(&self) -> bool {
        self.status == ProcedureStatus::Running
    }

    pub fn active_step(&self) -> Option<&Step> {
        if !self.is_running() {
            return None;
        }
        self.current_step.and_then(|index| self.steps.get(index))
    }

    pub fn total_duration(&self) -> u64 {
        self.steps.iter().map(|step| step.duration).sum()
    }

    /// Checks the identity, step targets and, for running procedures, the
    /// step-status layout around `current_step`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.validate(index)?;
        }
        if !self.is_running() {
            return Ok(());
        }

        let current = self
            .current_step
            .ok_or(ValidationError::MissingCurrentStep)?;
        if current >= self.steps.len() {
            return Err(ValidationError::CurrentStepOutOfRange {
                index: current,
                len: self.steps.len(),
            });
        }
        for (index, step) in self.steps.iter().enumerate() {
            let consistent = match index.cmp(&current) {
                std::cmp::Ordering::Less => step.status.is_finished(),
                std::cmp::Ordering::Equal => step.status == StepStatus::Running,
                std::cmp::Ordering::Greater => step.status == StepStatus::Queued,
            };
            if !consistent {
                return Err(ValidationError::StepLayout {
                    index,
                    current,
                    status: step.status,
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_step_target(
    index: usize,
    temperature: f64,
    duration: u64,
) -> Result<(), ValidationError> {
    if !temperature.is_finite() || temperature < 0.0 {
        return Err(ValidationError::Temperature {
            index,
            value: temperature,
        });
    }
    if duration == 0 {
        return Err(ValidationError::ZeroDuration { index });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("procedure id must not be empty")]
    EmptyId,
    #[error("procedure name must not be empty")]
    EmptyName,
    #[error("procedure must have at least one step")]
    NoSteps,
    #[error("step {index}: temperature {value} must be a finite value >= 0 °C")]
    Temperature { index: usize, value: f64 },
    #[error("step {index}: duration must be greater than zero seconds")]
    ZeroDuration { index: usize },
    #[error("running procedure has no current step")]
    MissingCurrentStep,
    #[error("current step {index} is out of range for {len} steps")]
    CurrentStepOutOfRange { index: usize, len: usize },
    #[error("step {index} has status {status:?} which is inconsistent with current step {current}")]
    StepLayout {
        index: usize,
        current: usize,
        status: StepStatus,
    },
    #[error("setpoint {value} °C is outside {min}..={max} °C")]
    SetpointOutOfRange { value: f64, min: f64, max: f64 },
}

/// Readings are stored exactly as received; range checks are a display concern.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveReading {
    setpoint: Option<f64>,
    actual: Option<f64>,
    status_label: Option<String>,
}

impl LiveReading {
    pub fn setpoint(&self) -> Option<f64> {
        self.setpoint
    }

    pub fn actual(&self) -> Option<f64> {
        self.actual
    }

    pub fn status_label(&self) -> Option<&str> {
        self.status_label.as_deref()
    }

    /// Returns whether the stored value changed.
    pub fn set_setpoint(&mut self, value: Option<f64>) -> bool {
        replace_if_changed(&mut self.setpoint, value)
    }

    pub fn set_actual_reading(&mut self, value: Option<f64>) -> bool {
        replace_if_changed(&mut self.actual, value)
    }

    pub fn set_status_label(&mut self, value: Option<String>) -> bool {
        replace_if_changed(&mut self.status_label, value)
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

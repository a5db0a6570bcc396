//! The decoded state of a PV, accumulated across callbacks.
use std::time::SystemTime;

use crate::{
    alarm::AlarmInfo,
    dbr::{Dbr, DbrBasicType, EpicsTimeStamp, Limit},
    generic::Generic,
};

/// How many data callbacks a record has seen
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    NoUpdate,
    FirstUpdate,
    Update,
}

/// Everything known about a PV from the callbacks received so far
///
/// Static information (units, precision, limits, enumeration strings) arrives
/// with the initial `CTRL` read and is kept when later `TIME` updates, which
/// lack it, are applied on top.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CaRecord {
    pub name: String,
    /// Whether the last callback carried usable data
    pub valid: bool,
    pub process_state: ProcessState,
    pub native_type: Option<DbrBasicType>,
    pub alarm: AlarmInfo,
    pub precision: i16,
    pub units: String,
    pub enum_strings: Vec<String>,
    pub display_limit: Limit,
    pub alarm_limit: Limit,
    pub warning_limit: Limit,
    pub control_limit: Limit,
    pub timestamp: EpicsTimeStamp,
    pub value: Option<Generic>,
}

impl CaRecord {
    pub fn new(name: &str) -> Self {
        CaRecord {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Forget everything received, ready for a fresh channel
    pub fn reset(&mut self) {
        *self = CaRecord::new(&self.name);
    }

    pub fn update_process_state(&mut self) {
        self.process_state = match self.process_state {
            ProcessState::NoUpdate => ProcessState::FirstUpdate,
            ProcessState::FirstUpdate | ProcessState::Update => ProcessState::Update,
        };
    }

    pub fn is_first_update(&self) -> bool {
        self.process_state == ProcessState::FirstUpdate
    }

    /// Merge a decoded DBR into the record and count it as an update
    pub fn apply(&mut self, dbr: Dbr) {
        if let Some(status) = dbr.status() {
            self.alarm = AlarmInfo::new(status.status, status.severity);
        }
        if let Some(timestamp) = dbr.timestamp() {
            self.timestamp = timestamp;
        }
        if let Some(graphics) = dbr.graphics() {
            self.precision = graphics.precision;
            // Units are only sent reliably the first time
            if !graphics.units.is_empty() {
                self.units = graphics.units.clone();
            }
            if !graphics.enum_strings.is_empty() {
                self.enum_strings = graphics.enum_strings.clone();
            }
            self.display_limit = graphics.display_limit;
            self.alarm_limit = graphics.alarm_limit;
            self.warning_limit = graphics.warning_limit;
        }
        if let Some(control) = dbr.control() {
            self.control_limit = control;
        }
        self.value = Some(dbr.take_value());
        self.valid = true;
        self.update_process_state();
    }

    /// Time of the data, or now if the server gave none
    pub fn time_stamp(&self) -> SystemTime {
        if self.timestamp.is_set() {
            self.timestamp.to_system_time()
        } else {
            SystemTime::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alarm::AlarmSeverity,
        dbr::{DbrGraphics, Status},
    };

    #[test]
    fn time_updates_keep_control_metadata() {
        let mut record = CaRecord::new("TEST:PV");
        record.apply(Dbr::Control {
            status: Status::default(),
            graphics: DbrGraphics {
                units: "mm".to_string(),
                precision: 2,
                display_limit: Limit::new(0.0, 10.0),
                ..Default::default()
            },
            control: Limit::new(1.0, 9.0),
            value: Generic::from(1.0f64),
        });
        assert!(record.is_first_update());
        record.apply(Dbr::Time {
            status: Status {
                status: 3,
                severity: 2,
            },
            timestamp: EpicsTimeStamp::new(1000, 0),
            value: Generic::from(2.0f64),
        });
        assert_eq!(record.process_state, ProcessState::Update);
        assert_eq!(record.units, "mm");
        assert_eq!(record.precision, 2);
        assert_eq!(record.display_limit, Limit::new(0.0, 10.0));
        assert_eq!(record.control_limit, Limit::new(1.0, 9.0));
        assert_eq!(record.alarm.severity, AlarmSeverity::Major);
        assert_eq!(record.value, Some(Generic::from(2.0f64)));
        assert_eq!(record.time_stamp(), EpicsTimeStamp::new(1000, 0).to_system_time());

        record.reset();
        assert_eq!(record, CaRecord::new("TEST:PV"));
    }
}

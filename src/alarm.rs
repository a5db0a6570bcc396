//! Alarm status and severity as delivered alongside CA values
use std::fmt;

/// Names of the EPICS alarm conditions, indexed by status code
///
/// A `.STAT` field has all 22 of these states, more than the 16 enumeration
/// strings CA can deliver for an enum field.
pub const ALARM_CONDITION_NAMES: [&str; 22] = [
    "NO_ALARM",
    "READ",
    "WRITE",
    "HIHI",
    "HIGH",
    "LOLO",
    "LOW",
    "STATE",
    "COS",
    "COMM",
    "TIMEOUT",
    "HWLIMIT",
    "CALC",
    "SCAN",
    "LINK",
    "SOFT",
    "BAD_SUB",
    "UDF",
    "DISABLE",
    "SIMM",
    "READ_ACCESS",
    "WRITE_ACCESS",
];

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum AlarmSeverity {
    #[default]
    NoAlarm = 0,
    Minor = 1,
    Major = 2,
    Invalid = 3,
}

impl From<i16> for AlarmSeverity {
    /// Out of range severities are treated as invalid
    fn from(value: i16) -> Self {
        match value {
            0 => AlarmSeverity::NoAlarm,
            1 => AlarmSeverity::Minor,
            2 => AlarmSeverity::Major,
            _ => AlarmSeverity::Invalid,
        }
    }
}

impl fmt::Display for AlarmSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlarmSeverity::NoAlarm => "NO_ALARM",
            AlarmSeverity::Minor => "MINOR",
            AlarmSeverity::Major => "MAJOR",
            AlarmSeverity::Invalid => "INVALID",
        })
    }
}

/// Alarm state of a value, as emitted with every data update
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct AlarmInfo {
    pub status: i16,
    pub severity: AlarmSeverity,
}

impl AlarmInfo {
    pub fn new(status: i16, severity: i16) -> Self {
        AlarmInfo {
            status,
            severity: severity.into(),
        }
    }
    /// The state reported when no usable value could be obtained
    pub fn undefined() -> Self {
        AlarmInfo {
            status: 17,
            severity: AlarmSeverity::Invalid,
        }
    }
    pub fn is_in_alarm(&self) -> bool {
        self.severity != AlarmSeverity::NoAlarm
    }
    /// Name of the alarm condition, if the status code is a known one
    pub fn status_name(&self) -> Option<&'static str> {
        usize::try_from(self.status)
            .ok()
            .and_then(|i| ALARM_CONDITION_NAMES.get(i))
            .copied()
    }
}

impl fmt::Display for AlarmInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_name() {
            Some(name) => write!(f, "{name} ({})", self.severity),
            None => write!(f, "status {} ({})", self.status, self.severity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_names() {
        let alarm = AlarmInfo::new(3, 2);
        assert_eq!(alarm.status_name(), Some("HIHI"));
        assert_eq!(alarm.severity, AlarmSeverity::Major);
        assert!(alarm.is_in_alarm());
        assert_eq!(alarm.to_string(), "HIHI (MAJOR)");
        assert_eq!(AlarmInfo::new(-1, 9).status_name(), None);
        assert!(!AlarmInfo::default().is_in_alarm());
    }
}

//! Decode and encode CA DBR payloads.
//!
//! CA defines its [DBR] kinds as C structures of seven basic value types, each
//! with five categories of attached metadata. Payloads arrive from the native
//! client in network byte order, laid out exactly as the `db_access.h`
//! structures including their RISC alignment padding.
//!
//! The basic types are enumerated in [`DbrBasicType`], and are decoded into a
//! [`Generic`] of the matching kind:
//! - `STRING` ([`Generic::String`]), natively a `[u8; 40]` per element
//! - `SHORT` ([`Generic::Short`])
//! - `FLOAT` ([`Generic::Float`])
//! - `ENUM` ([`Generic::UnsignedShort`]), an index into up to sixteen strings of
//!   at most 26 bytes, delivered with the `GR` and `CTRL` categories
//! - `CHAR` ([`Generic::UnsignedChar`])
//! - `LONG` ([`Generic::Long`])
//! - `DOUBLE` ([`Generic::Double`])
//!
//! The five categories are represented by [`Dbr`]:
//! - [`Dbr::Basic`] - the plain value.
//! - [`Dbr::Status`] - alarm status and severity, plus the value.
//! - [`Dbr::Time`] - all of [`Dbr::Status`], with the record timestamp.
//! - [`Dbr::Graphics`] - status plus display information: units, precision,
//!   display/alarm/warning limits, or the enumeration strings.
//! - [`Dbr::Control`] - all of [`Dbr::Graphics`] plus the control limits.
//!
//! The `CTRL` category is what a widget asks for first, to learn the static
//! information about a PV; `TIME` is what it subscribes with afterwards.
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types
use nom::{
    IResult, Parser,
    bytes::complete::take,
    combinator::map,
    multi::count,
    number::complete::{be_f32, be_f64, be_i16, be_i32, be_u8, be_u16, be_u32},
};
use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

use crate::generic::{Generic, GenericType};

// Constants from EPICS
pub const MAX_STRING_SIZE: usize = 40;
pub const MAX_UNITS_SIZE: usize = 8;
pub const MAX_ENUM_STRING_SIZE: usize = 26;
pub const MAX_ENUM_STATES: usize = 16;
/// Seconds between the UNIX epoch and the EPICS epoch (1990-01-01)
pub const EPICS_EPOCH_OFFSET: u64 = 631_152_000;

/// Encode a String to a fixed-maximum-length byte array
///
/// Problem: We want to convert a string to a byte sequence but never a length >
/// the fixed length of the EPICS field. But we can't convert and truncate
/// because although we don't _expect_ to ever handle non-ASCII it technically
/// isn't guaranteed. So, convert one-character-at-a-time until the length would
/// go over. The result is zero-padded to exactly `max_length`, always leaving
/// room for a terminator.
fn string_to_fixed_length_bytes(value: &str, max_length: usize) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(max_length);
    for c in value.chars() {
        if buffer.len() + c.len_utf8() < max_length {
            let mut char_buffer = [0u8; 4];
            buffer.extend_from_slice(c.encode_utf8(&mut char_buffer).as_bytes());
        } else {
            break;
        }
    }
    buffer.resize(max_length, 0u8);
    buffer
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Short = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl TryFrom<u16> for DbrBasicType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::String as u16 => Ok(Self::String),
            x if x == Self::Short as u16 => Ok(Self::Short),
            x if x == Self::Float as u16 => Ok(Self::Float),
            x if x == Self::Enum as u16 => Ok(Self::Enum),
            x if x == Self::Char as u16 => Ok(Self::Char),
            x if x == Self::Long as u16 => Ok(Self::Long),
            x if x == Self::Double as u16 => Ok(Self::Double),
            _ => Err(()),
        }
    }
}

impl DbrBasicType {
    /// The [`Generic`] kind values of this type decode into
    pub fn generic_type(&self) -> GenericType {
        match self {
            DbrBasicType::String => GenericType::String,
            DbrBasicType::Short => GenericType::Short,
            DbrBasicType::Float => GenericType::Float,
            DbrBasicType::Enum => GenericType::UnsignedShort,
            DbrBasicType::Char => GenericType::UnsignedChar,
            DbrBasicType::Long => GenericType::Long,
            DbrBasicType::Double => GenericType::Double,
        }
    }

    /// The DBR type used to send a [`Generic`] kind, if it has one
    ///
    /// [`GenericType::UnsignedLong`] has no unsigned CA counterpart and must be
    /// converted to [`GenericType::Long`] first.
    pub fn for_generic(kind: GenericType) -> Option<DbrBasicType> {
        Some(match kind {
            GenericType::String => DbrBasicType::String,
            GenericType::Short => DbrBasicType::Short,
            GenericType::UnsignedShort => DbrBasicType::Enum,
            GenericType::UnsignedChar => DbrBasicType::Char,
            GenericType::Long => DbrBasicType::Long,
            GenericType::Float => DbrBasicType::Float,
            GenericType::Double => DbrBasicType::Double,
            GenericType::UnsignedLong | GenericType::Unknown => return None,
        })
    }

    /// The database field type name, as `ca_field_type` reports it
    pub fn field_type_name(&self) -> &'static str {
        match self {
            DbrBasicType::String => "DBF_STRING",
            DbrBasicType::Short => "DBF_SHORT",
            DbrBasicType::Float => "DBF_FLOAT",
            DbrBasicType::Enum => "DBF_ENUM",
            DbrBasicType::Char => "DBF_CHAR",
            DbrBasicType::Long => "DBF_LONG",
            DbrBasicType::Double => "DBF_DOUBLE",
        }
    }

    /// Size of a single element on the wire
    pub fn element_size(&self) -> usize {
        match self {
            DbrBasicType::String => MAX_STRING_SIZE,
            DbrBasicType::Short | DbrBasicType::Enum => 2,
            DbrBasicType::Char => 1,
            DbrBasicType::Float | DbrBasicType::Long => 4,
            DbrBasicType::Double => 8,
        }
    }
}

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
}

impl TryFrom<u16> for DbrCategory {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::Basic as u16 => Ok(Self::Basic),
            x if x == Self::Status as u16 => Ok(Self::Status),
            x if x == Self::Time as u16 => Ok(Self::Time),
            x if x == Self::Graphics as u16 => Ok(Self::Graphics),
            x if x == Self::Control as u16 => Ok(Self::Control),
            _ => Err(()),
        }
    }
}

/// Represent and translate from ID every combination of `DBR_*_*`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

impl DbrType {
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }
}

impl TryFrom<u16> for DbrType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if value >= 35 {
            return Err(());
        }
        Ok(Self {
            basic_type: (value % 7).try_into()?,
            category: (value / 7).try_into()?,
        })
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        value.category as u16 * 7 + value.basic_type as u16
    }
}

impl fmt::Display for DbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let category = match self.category {
            DbrCategory::Basic => "",
            DbrCategory::Status => "STS_",
            DbrCategory::Time => "TIME_",
            DbrCategory::Graphics => "GR_",
            DbrCategory::Control => "CTRL_",
        };
        let name = &self.basic_type.field_type_name()[4..];
        write!(f, "DBR_{category}{name}")
    }
}

/// An EPICS timestamp: seconds since 1990-01-01 plus nanoseconds
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct EpicsTimeStamp {
    pub seconds: u32,
    pub nanoseconds: u32,
}

impl EpicsTimeStamp {
    pub fn new(seconds: u32, nanoseconds: u32) -> Self {
        Self {
            seconds,
            nanoseconds,
        }
    }
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }
    /// Convert from a system time; times before the EPICS epoch clamp to zero
    pub fn from_system_time(time: SystemTime) -> Self {
        let unix = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        let seconds = unix.as_secs().saturating_sub(EPICS_EPOCH_OFFSET);
        Self {
            seconds: u32::try_from(seconds).unwrap_or(u32::MAX),
            nanoseconds: unix.subsec_nanos(),
        }
    }
    pub fn to_system_time(&self) -> SystemTime {
        UNIX_EPOCH
            + Duration::new(
                u64::from(self.seconds) + EPICS_EPOCH_OFFSET,
                self.nanoseconds,
            )
    }
    /// A zero timestamp means the server supplied no time
    pub fn is_set(&self) -> bool {
        self.seconds != 0
    }
}

/// Represent alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

/// A lower/upper pair, as all DBR limits are carried
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Limit {
    pub lower: f64,
    pub upper: f64,
}

impl Limit {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }
}

/// Display information carried by the `GR` and `CTRL` categories
///
/// Limits are widened to f64 whatever the basic type; units, precision and
/// limits are meaningless for `STRING` and `ENUM`, which carry the
/// enumeration strings instead (for `ENUM` only).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DbrGraphics {
    pub units: String,
    pub precision: i16,
    pub display_limit: Limit,
    pub alarm_limit: Limit,
    pub warning_limit: Limit,
    pub enum_strings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbrDecodeError {
    #[error("Unknown DBR type code {0}")]
    UnknownType(u16),
    #[error("Payload of {len} bytes is malformed for {data_type} x {count}")]
    Malformed {
        data_type: DbrType,
        count: usize,
        len: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbrEncodeError {
    #[error("{0} values have no DBR representation")]
    Unrepresentable(GenericType),
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(Generic),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: Generic },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: EpicsTimeStamp,
        value: Generic,
    },
    Graphics {
        status: Status,
        graphics: DbrGraphics,
        value: Generic,
    },
    Control {
        status: Status,
        graphics: DbrGraphics,
        control: Limit,
        value: Generic,
    },
}

type ParseResult<'a, T> = IResult<&'a [u8], T>;

/// Read a NUL-terminated string out of a fixed-size field
fn fixed_string(size: usize, input: &[u8]) -> ParseResult<'_, String> {
    let (input, field) = take(size).parse(input)?;
    let strlen = field.iter().position(|&c| c == 0).unwrap_or(field.len());
    Ok((input, String::from_utf8_lossy(&field[..strlen]).into_owned()))
}

fn string_value(input: &[u8]) -> ParseResult<'_, String> {
    fixed_string(MAX_STRING_SIZE, input)
}

fn enum_string(input: &[u8]) -> ParseResult<'_, String> {
    fixed_string(MAX_ENUM_STRING_SIZE, input)
}

/// Read one limit value of the given basic type, widened to f64
fn limit_value(basic: DbrBasicType, input: &[u8]) -> ParseResult<'_, f64> {
    match basic {
        DbrBasicType::Short => map(be_i16, f64::from).parse(input),
        DbrBasicType::Char => map(be_u8, f64::from).parse(input),
        DbrBasicType::Long => map(be_i32, f64::from).parse(input),
        DbrBasicType::Float => map(be_f32, f64::from).parse(input),
        DbrBasicType::Double => be_f64(input),
        DbrBasicType::String | DbrBasicType::Enum => Ok((input, 0.0)),
    }
}

fn limit_values(basic: DbrBasicType, n: usize, mut input: &[u8]) -> ParseResult<'_, Vec<f64>> {
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        let (rest, v) = limit_value(basic, input)?;
        values.push(v);
        input = rest;
    }
    Ok((input, values))
}

/// Parse the GR/CTRL metadata block that follows status and severity
fn graphics_block(
    basic: DbrBasicType,
    with_control: bool,
    input: &[u8],
) -> ParseResult<'_, (DbrGraphics, Limit)> {
    let mut graphics = DbrGraphics::default();
    match basic {
        DbrBasicType::String => Ok((input, (graphics, Limit::default()))),
        DbrBasicType::Enum => {
            let (input, no_str) = be_i16(input)?;
            let (input, strings) = count(enum_string, MAX_ENUM_STATES).parse(input)?;
            let used = usize::try_from(no_str).unwrap_or(0).min(MAX_ENUM_STATES);
            graphics.enum_strings = strings.into_iter().take(used).collect();
            Ok((input, (graphics, Limit::default())))
        }
        _ => {
            let input = if matches!(basic, DbrBasicType::Float | DbrBasicType::Double) {
                let (input, (precision, _pad)) = (be_i16, be_i16).parse(input)?;
                graphics.precision = precision;
                input
            } else {
                input
            };
            let (input, units) = fixed_string(MAX_UNITS_SIZE, input)?;
            graphics.units = units;
            let n = if with_control { 8 } else { 6 };
            let (input, l) = limit_values(basic, n, input)?;
            graphics.display_limit = Limit::new(l[1], l[0]);
            graphics.alarm_limit = Limit::new(l[5], l[2]);
            graphics.warning_limit = Limit::new(l[4], l[3]);
            let control = if with_control {
                Limit::new(l[7], l[6])
            } else {
                Limit::default()
            };
            let input = if basic == DbrBasicType::Char {
                take(1usize).parse(input)?.0
            } else {
                input
            };
            Ok((input, (graphics, control)))
        }
    }
}

/// Padding between the metadata and the value, for the categories where it
/// is not already consumed as part of the metadata block
fn value_padding(data_type: DbrType) -> usize {
    match (data_type.category, data_type.basic_type) {
        (DbrCategory::Status, DbrBasicType::Char) => 1,
        (DbrCategory::Status, DbrBasicType::Double) => 4,
        (DbrCategory::Time, DbrBasicType::Short) => 2,
        (DbrCategory::Time, DbrBasicType::Enum) => 2,
        (DbrCategory::Time, DbrBasicType::Char) => 3,
        (DbrCategory::Time, DbrBasicType::Double) => 4,
        _ => 0,
    }
}

fn decode_value(basic: DbrBasicType, item_count: usize, data: &[u8]) -> ParseResult<'_, Generic> {
    match basic {
        DbrBasicType::String => map(count(string_value, item_count), Generic::String).parse(data),
        DbrBasicType::Short => map(count(be_i16, item_count), Generic::Short).parse(data),
        DbrBasicType::Float => map(count(be_f32, item_count), Generic::Float).parse(data),
        DbrBasicType::Enum => map(count(be_u16, item_count), Generic::UnsignedShort).parse(data),
        DbrBasicType::Char => map(count(be_u8, item_count), Generic::UnsignedChar).parse(data),
        DbrBasicType::Long => map(count(be_i32, item_count), Generic::Long).parse(data),
        DbrBasicType::Double => map(count(be_f64, item_count), Generic::Double).parse(data),
    }
}

/// Write a single limit in the wire format of the basic type
fn put_limit(buffer: &mut Vec<u8>, basic: DbrBasicType, value: f64) {
    match basic {
        DbrBasicType::Short => buffer.extend_from_slice(&(value as i16).to_be_bytes()),
        DbrBasicType::Char => buffer.push(value as u8),
        DbrBasicType::Long => buffer.extend_from_slice(&(value as i32).to_be_bytes()),
        DbrBasicType::Float => buffer.extend_from_slice(&(value as f32).to_be_bytes()),
        DbrBasicType::Double => buffer.extend_from_slice(&value.to_be_bytes()),
        DbrBasicType::String | DbrBasicType::Enum => (),
    }
}

/// Encode the elements of a value, returning the count written
pub fn encode_value(value: &Generic, buffer: &mut Vec<u8>) -> Result<usize, DbrEncodeError> {
    match value {
        Generic::String(val) => val
            .iter()
            .for_each(|v| buffer.extend(string_to_fixed_length_bytes(v, MAX_STRING_SIZE))),
        Generic::Short(val) => val.iter().for_each(|v| buffer.extend(v.to_be_bytes())),
        Generic::UnsignedShort(val) => val.iter().for_each(|v| buffer.extend(v.to_be_bytes())),
        Generic::UnsignedChar(val) => buffer.extend_from_slice(val),
        Generic::Long(val) => val.iter().for_each(|v| buffer.extend(v.to_be_bytes())),
        Generic::Float(val) => val.iter().for_each(|v| buffer.extend(v.to_be_bytes())),
        Generic::Double(val) => val.iter().for_each(|v| buffer.extend(v.to_be_bytes())),
        Generic::UnsignedLong(_) => return Err(DbrEncodeError::Unrepresentable(value.get_type())),
    }
    Ok(value.array_count())
}

impl Dbr {
    pub fn take_value(self) -> Generic {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    /// Retrieve the [`Generic`] value contained by this DBR
    pub fn value(&self) -> &Generic {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    /// If a DBR type encoding alarm status, fetch that
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Graphics { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
        }
    }
    pub fn timestamp(&self) -> Option<EpicsTimeStamp> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    pub fn graphics(&self) -> Option<&DbrGraphics> {
        match self {
            Dbr::Graphics { graphics, .. } | Dbr::Control { graphics, .. } => Some(graphics),
            _ => None,
        }
    }
    pub fn control(&self) -> Option<Limit> {
        match self {
            Dbr::Control { control, .. } => Some(*control),
            _ => None,
        }
    }
    pub fn category(&self) -> DbrCategory {
        match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Graphics { .. } => DbrCategory::Graphics,
            Dbr::Control { .. } => DbrCategory::Control,
        }
    }
    /// The DBR type this would be sent as, if the value kind has one
    pub fn data_type(&self) -> Option<DbrType> {
        DbrBasicType::for_generic(self.value().get_type())
            .map(|basic| DbrType::new(basic, self.category()))
    }

    /// Decode a payload of `data_count` elements of `data_type`
    pub fn from_bytes(
        data_type: DbrType,
        data_count: usize,
        data: &[u8],
    ) -> Result<Dbr, DbrDecodeError> {
        Self::parse(data_type, data_count, data)
            .map(|(_, dbr)| dbr)
            .map_err(|_| DbrDecodeError::Malformed {
                data_type,
                count: data_count,
                len: data.len(),
            })
    }

    fn parse(data_type: DbrType, data_count: usize, data: &[u8]) -> ParseResult<'_, Dbr> {
        let basic = data_type.basic_type;
        let (data, status) = if data_type.category != DbrCategory::Basic {
            let (d, (status, severity)) = (be_i16, be_i16).parse(data)?;
            (d, Status { status, severity })
        } else {
            (data, Status::default())
        };

        let (data, timestamp) = if data_type.category == DbrCategory::Time {
            let (d, (seconds, nanoseconds)) = (be_u32, be_u32).parse(data)?;
            (d, EpicsTimeStamp::new(seconds, nanoseconds))
        } else {
            (data, EpicsTimeStamp::default())
        };

        let (data, (graphics, control)) = match data_type.category {
            DbrCategory::Graphics => graphics_block(basic, false, data)?,
            DbrCategory::Control => graphics_block(basic, true, data)?,
            _ => (data, (DbrGraphics::default(), Limit::default())),
        };

        // Offset the read buffer to account for metadata padding
        let (data, _) = take(value_padding(data_type)).parse(data)?;
        let (data, value) = decode_value(basic, data_count, data)?;

        Ok((
            data,
            match data_type.category {
                DbrCategory::Basic => Dbr::Basic(value),
                DbrCategory::Status => Dbr::Status { status, value },
                DbrCategory::Time => Dbr::Time {
                    status,
                    timestamp,
                    value,
                },
                DbrCategory::Graphics => Dbr::Graphics {
                    status,
                    graphics,
                    value,
                },
                DbrCategory::Control => Dbr::Control {
                    status,
                    graphics,
                    control,
                    value,
                },
            },
        ))
    }

    /// Encode into the wire layout of its own DBR type
    ///
    /// Returns the element count along with the bytes.
    pub fn to_bytes(&self) -> Result<(usize, Vec<u8>), DbrEncodeError> {
        let value = self.value();
        let data_type = self
            .data_type()
            .ok_or(DbrEncodeError::Unrepresentable(value.get_type()))?;
        let basic = data_type.basic_type;
        let mut buffer = Vec::new();

        if let Some(status) = self.status() {
            buffer.extend_from_slice(&status.status.to_be_bytes());
            buffer.extend_from_slice(&status.severity.to_be_bytes());
        }
        if let Some(timestamp) = self.timestamp() {
            buffer.extend_from_slice(&timestamp.seconds.to_be_bytes());
            buffer.extend_from_slice(&timestamp.nanoseconds.to_be_bytes());
        }
        if let Some(graphics) = self.graphics() {
            match basic {
                DbrBasicType::String => (),
                DbrBasicType::Enum => {
                    let used = graphics.enum_strings.len().min(MAX_ENUM_STATES);
                    buffer.extend_from_slice(&(used as i16).to_be_bytes());
                    for i in 0..MAX_ENUM_STATES {
                        let s = graphics.enum_strings.get(i).map(String::as_str);
                        buffer.extend(string_to_fixed_length_bytes(
                            s.unwrap_or_default(),
                            MAX_ENUM_STRING_SIZE,
                        ));
                    }
                }
                _ => {
                    if matches!(basic, DbrBasicType::Float | DbrBasicType::Double) {
                        buffer.extend_from_slice(&graphics.precision.to_be_bytes());
                        buffer.extend_from_slice(&[0u8; 2]);
                    }
                    buffer.extend(string_to_fixed_length_bytes(&graphics.units, MAX_UNITS_SIZE));
                    let mut limits = vec![
                        graphics.display_limit.upper,
                        graphics.display_limit.lower,
                        graphics.alarm_limit.upper,
                        graphics.warning_limit.upper,
                        graphics.warning_limit.lower,
                        graphics.alarm_limit.lower,
                    ];
                    if let Some(control) = self.control() {
                        limits.extend([control.upper, control.lower]);
                    }
                    for limit in limits {
                        put_limit(&mut buffer, basic, limit);
                    }
                    if basic == DbrBasicType::Char {
                        buffer.push(0);
                    }
                }
            }
        }
        buffer.resize(buffer.len() + value_padding(data_type), 0u8);
        let count = encode_value(value, &mut buffer)?;
        Ok((count, buffer))
    }

    /// Re-express this record in another category, keeping what metadata it has
    pub fn with_category(&self, category: DbrCategory) -> Dbr {
        let value = self.value().clone();
        let status = self.status().unwrap_or_default();
        let graphics = self.graphics().cloned().unwrap_or_default();
        match category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp: self.timestamp().unwrap_or_else(EpicsTimeStamp::now),
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                graphics,
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                graphics,
                control: self.control().unwrap_or_default(),
                value,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_time_long() {
        let example_packet = [
            0x0, 0x3, 0x0, 0x2, 0x0, 0x0, 0x0, 0x64, 0x0, 0x0, 0x0, 0x7, 0x0, 0x0, 0x0, 0x2a,
        ];
        let dbr = Dbr::from_bytes(
            DbrType::new(DbrBasicType::Long, DbrCategory::Time),
            1,
            &example_packet,
        )
        .unwrap();
        assert_eq!(
            dbr,
            Dbr::Time {
                status: Status {
                    status: 3,
                    severity: 2
                },
                timestamp: EpicsTimeStamp::new(100, 7),
                value: Generic::from(42i32),
            }
        );
        let (count, bytes) = dbr.to_bytes().unwrap();
        assert_eq!(count, 1);
        assert_eq!(bytes, example_packet);
    }

    #[test]
    fn time_double_has_padding() {
        let dbr = Dbr::Time {
            status: Status::default(),
            timestamp: EpicsTimeStamp::new(1, 2),
            value: Generic::from(3.14f64),
        };
        let (_, bytes) = dbr.to_bytes().unwrap();
        // status(4) + stamp(8) + RISC pad(4) + value(8)
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[16..], &3.14f64.to_be_bytes());
    }

    #[test]
    fn decode_ctrl_double() {
        let mut data = vec![0x0, 0x0, 0x0, 0x0];
        data.extend(3i16.to_be_bytes());
        data.extend([0, 0]);
        data.extend(b"mm\0\0\0\0\0\0");
        for v in [10.0f64, -10.0, 9.0, 8.0, -8.0, -9.0, 5.0, -5.0] {
            data.extend(v.to_be_bytes());
        }
        data.extend(1.5f64.to_be_bytes());
        data.extend(2.5f64.to_be_bytes());

        let dbr = Dbr::from_bytes(
            DbrType::new(DbrBasicType::Double, DbrCategory::Control),
            2,
            &data,
        )
        .unwrap();
        let graphics = dbr.graphics().unwrap();
        assert_eq!(graphics.units, "mm");
        assert_eq!(graphics.precision, 3);
        assert_eq!(graphics.display_limit, Limit::new(-10.0, 10.0));
        assert_eq!(graphics.alarm_limit, Limit::new(-9.0, 9.0));
        assert_eq!(graphics.warning_limit, Limit::new(-8.0, 8.0));
        assert_eq!(dbr.control(), Some(Limit::new(-5.0, 5.0)));
        assert_eq!(dbr.value(), &Generic::from(vec![1.5f64, 2.5]));
        assert_eq!(dbr.to_bytes().unwrap().1, data);
    }

    #[test]
    fn ctrl_enum_strings() {
        let dbr = Dbr::Control {
            status: Status::default(),
            graphics: DbrGraphics {
                enum_strings: vec!["Off".to_string(), "On".to_string()],
                ..Default::default()
            },
            control: Limit::default(),
            value: Generic::from(1u16),
        };
        let (count, bytes) = dbr.to_bytes().unwrap();
        // status(4) + no_str(2) + 16 * 26 + value(2)
        assert_eq!(bytes.len(), 424);
        let decoded = Dbr::from_bytes(
            DbrType::new(DbrBasicType::Enum, DbrCategory::Control),
            count,
            &bytes,
        )
        .unwrap();
        assert_eq!(decoded.graphics().unwrap().enum_strings, vec!["Off", "On"]);
        assert_eq!(decoded.value().get_unsigned_short().unwrap(), 1);
    }

    #[test]
    fn gr_char_risc_pad() {
        let dbr = Dbr::Graphics {
            status: Status::default(),
            graphics: DbrGraphics {
                units: "V".to_string(),
                display_limit: Limit::new(0.0, 200.0),
                ..Default::default()
            },
            value: Generic::from(vec![1u8, 2, 3]),
        };
        let (_, bytes) = dbr.to_bytes().unwrap();
        // status(4) + units(8) + limits(6) + pad(1) + values(3)
        assert_eq!(bytes.len(), 22);
        let decoded = Dbr::from_bytes(
            DbrType::new(DbrBasicType::Char, DbrCategory::Graphics),
            3,
            &bytes,
        )
        .unwrap();
        assert_eq!(decoded, dbr);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let result = Dbr::from_bytes(
            DbrType::new(DbrBasicType::Double, DbrCategory::Time),
            1,
            &[0u8; 10],
        );
        assert!(matches!(result, Err(DbrDecodeError::Malformed { .. })));
    }

    #[test]
    fn string_values_are_fixed_width() {
        let dbr = Dbr::Basic(Generic::from("a test string"));
        let (_, bytes) = dbr.to_bytes().unwrap();
        assert_eq!(bytes.len(), MAX_STRING_SIZE);
        let long = "x".repeat(60);
        let (_, bytes) = Dbr::Basic(Generic::from(long.as_str())).to_bytes().unwrap();
        let decoded = Dbr::from_bytes(
            DbrType::new(DbrBasicType::String, DbrCategory::Basic),
            1,
            &bytes,
        )
        .unwrap();
        assert_eq!(decoded.value().get_string().unwrap().len(), 39);
    }

    #[test]
    fn type_codes() {
        let t = DbrType::new(DbrBasicType::Double, DbrCategory::Control);
        assert_eq!(u16::from(t), 34);
        assert_eq!(DbrType::try_from(34u16), Ok(t));
        assert_eq!(DbrType::try_from(20u16).unwrap().to_string(), "DBR_TIME_DOUBLE");
        assert!(DbrType::try_from(35u16).is_err());
    }

    #[test]
    fn epics_epoch() {
        let stamp = EpicsTimeStamp::new(10, 500);
        let time = stamp.to_system_time();
        assert_eq!(
            time.duration_since(UNIX_EPOCH).unwrap(),
            Duration::new(631_152_010, 500)
        );
        assert_eq!(EpicsTimeStamp::from_system_time(time), stamp);
    }
}

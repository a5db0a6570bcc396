use num::{FromPrimitive, traits::WrappingAdd};
use std::{env, time::Duration};

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    if let Some(one) = T::from_u8(1) {
        *value = value.wrapping_add(&one);
    }
    id
}

/// Parse a number of seconds, keeping `default` for anything that cannot be
/// a [`Duration`] (unparseable, NaN, infinite or out of range)
fn parse_seconds(value: Option<&str>, default: f32, min: f32) -> f32 {
    value
        .and_then(|v| v.trim().parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.max(min))
        .filter(|v| Duration::try_from_secs_f32(*v).is_ok())
        .unwrap_or(default)
}

/// Seconds to wait for a channel to connect before giving up on it
///
/// Read from `QE_CONNECTION_TIMEOUT`, default 3 seconds.
pub fn get_default_connection_timeout() -> f32 {
    parse_seconds(
        env::var("QE_CONNECTION_TIMEOUT").ok().as_deref(),
        3.0,
        0.01,
    )
}

/// Seconds a discarded callback handle rests before its slot is recycled
///
/// Read from `QE_CAREF_REUSE_GRACE`, default 5 seconds.
pub fn get_default_reuse_grace() -> f32 {
    parse_seconds(env::var("QE_CAREF_REUSE_GRACE").ok().as_deref(), 5.0, 0.0)
}

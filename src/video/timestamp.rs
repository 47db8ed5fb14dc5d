//! Time unit boundary between the seek API, the decoder and presentation.
//!
//! - Seek requests and timeline positions: milliseconds
//! - Demuxer/decoder sample times: microseconds
//! - Surface presentation time: nanoseconds
//!
//! Every step is an exact factor of 1000. Keep conversions in this module so
//! the factor is never applied twice (or not at all) somewhere else.

/// Milliseconds to microseconds.
#[inline]
pub const fn ms_to_us(ms: i64) -> i64 {
    ms * 1000
}

/// Microseconds to milliseconds (floor).
#[inline]
pub const fn us_to_ms(us: i64) -> i64 {
    us.div_euclid(1000)
}

/// Microseconds to nanoseconds.
#[inline]
pub const fn us_to_ns(us: i64) -> i64 {
    us * 1000
}

/// Milliseconds to nanoseconds, via microseconds.
#[inline]
pub const fn ms_to_ns(ms: i64) -> i64 {
    us_to_ns(ms_to_us(ms))
}

/// Frame duration in microseconds for a frame rate, 0 when the rate is unknown.
pub fn frame_duration_us(frame_rate: f64) -> i64 {
    if frame_rate.is_finite() && frame_rate > 0.0 {
        (1_000_000.0 / frame_rate).round() as i64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factor_is_exactly_thousand() {
        assert_eq!(ms_to_us(1500), 1_500_000);
        assert_eq!(us_to_ns(1_500_000), 1_500_000_000);
        assert_eq!(ms_to_ns(1500), 1_500_000_000);
        assert_eq!(us_to_ms(1_500_999), 1500);
    }

    #[test]
    fn test_us_to_ms_floors_negative() {
        assert_eq!(us_to_ms(-1), -1);
        assert_eq!(us_to_ms(-1000), -1);
    }

    #[test]
    fn test_frame_duration() {
        assert_eq!(frame_duration_us(25.0), 40_000);
        assert_eq!(frame_duration_us(30.0), 33_333);
        assert_eq!(frame_duration_us(0.0), 0);
        assert_eq!(frame_duration_us(f64::NAN), 0);
    }
}

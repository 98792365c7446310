//! Compact value encodings used by the option store and program records:
//! the signed 5-second adjustment byte and the 16-bit water-time code.

/// Longest duration a single watering may carry (18 hours).
pub const MAX_WATER_TIME: i64 = 64_800;

/// Water-time code meaning "from sunrise until sunset".
pub const WATER_TIME_SUNRISE_TO_SUNSET: u16 = 65_534;
/// Water-time code meaning "from sunset until the next sunrise".
pub const WATER_TIME_SUNSET_TO_SUNRISE: u16 = 65_535;

const MINUTES_PER_DAY: i64 = 1440;

const SIGNED_SPAN: i64 = 600;
const SIGNED_STEP: i64 = 5;
const SIGNED_ZERO: u8 = 120;
const SIGNED_MAX_BYTE: u8 = 240;

/// The encoded byte for a zero-second adjustment.
pub const ZERO_ADJUSTMENT: u8 = SIGNED_ZERO;

// ---------------------------------------------------------------------------
// Signed adjustment byte
// ---------------------------------------------------------------------------

/// Encode a signed second count in [-600, 600] into a byte in [0, 240].
/// Inputs outside the range saturate.
pub fn encode_signed(seconds: i64) -> u8 {
    let clamped = seconds.clamp(-SIGNED_SPAN, SIGNED_SPAN);
    ((clamped + SIGNED_SPAN) / SIGNED_STEP) as u8
}

/// Inverse of [`encode_signed`]. Bytes above 240 are treated as 240.
pub fn decode_signed(byte: u8) -> i64 {
    (i64::from(byte.min(SIGNED_MAX_BYTE)) - i64::from(SIGNED_ZERO)) * SIGNED_STEP
}

// ---------------------------------------------------------------------------
// Water time
// ---------------------------------------------------------------------------

/// Resolve a program's 16-bit duration code into seconds. The two sentinel
/// codes are computed from the sunrise/sunset minute-of-day values; every
/// other code is a literal second count.
pub fn resolve_water_time(code: u16, sunrise_minute: u16, sunset_minute: u16) -> i64 {
    let sunrise = i64::from(sunrise_minute);
    let sunset = i64::from(sunset_minute);
    match code {
        WATER_TIME_SUNRISE_TO_SUNSET => ((sunset - sunrise) * 60).max(0),
        WATER_TIME_SUNSET_TO_SUNRISE => ((sunrise + MINUTES_PER_DAY - sunset) * 60).max(0),
        literal => i64::from(literal),
    }
}

/// Apply the global water level to a resolved duration.
pub fn weather_adjusted(seconds: i64, water_level: u8, use_weather: bool) -> i64 {
    if use_weather {
        seconds * i64::from(water_level) / 100
    } else {
        seconds
    }
}

/// Scheduled-run scaling: like `weather_adjusted`, but below 20% any result
/// shorter than 10 seconds is dropped entirely.
pub fn scale_water_time(seconds: i64, water_level: u8, use_weather: bool) -> i64 {
    let scaled = weather_adjusted(seconds, water_level, use_weather);
    if use_weather && water_level < 20 && scaled < 10 {
        0
    } else {
        scaled
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Station records and the typed special-station payloads decoded from them.
//!
//! The store keeps a `special_type` tag plus a raw ASCII payload per station.
//! Both are decoded exactly once, when the record is turned into a
//! [`Station`]; the engine only ever sees a [`StationKind`].

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::warn;

pub const STATIONS_PER_BOARD: usize = 8;
pub const MAX_BOARDS: usize = 25;
pub const MAX_STATIONS: usize = MAX_BOARDS * STATIONS_PER_BOARD;

pub type StationId = usize;

const RF_PAYLOAD_LEN: usize = 16;
const REMOTE_PAYLOAD_LEN: usize = 14;
const GPIO_PAYLOAD_LEN: usize = 3;
const DEFAULT_HTTP_PORT: u16 = 80;

pub fn board_of(id: StationId) -> usize {
    id >> 3
}

pub fn offset_of(id: StationId) -> usize {
    id & 7
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationAttributes {
    /// Engage master 1 while this station runs.
    pub use_master1: bool,
    /// Engage master 2 while this station runs.
    pub use_master2: bool,
    pub ignore_sensor1: bool,
    pub ignore_sensor2: bool,
    pub ignore_rain_delay: bool,
    pub disabled: bool,
    pub sequential: bool,
}

impl Default for StationAttributes {
    fn default() -> Self {
        Self {
            use_master1: false,
            use_master2: false,
            ignore_sensor1: false,
            ignore_sensor2: false,
            ignore_rain_delay: false,
            disabled: false,
            sequential: true,
        }
    }
}

impl StationAttributes {
    /// Whether the station engages master slot `slot` (0 or 1).
    pub fn uses_master(&self, slot: usize) -> bool {
        match slot {
            0 => self.use_master1,
            1 => self.use_master2,
            _ => false,
        }
    }

    /// Whether the station ignores sensor `index` (0 or 1).
    pub fn ignores_sensor(&self, index: usize) -> bool {
        match index {
            0 => self.ignore_sensor1,
            1 => self.ignore_sensor2,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Store record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialType {
    #[default]
    Standard,
    Rf,
    Remote,
    Gpio,
    Http,
}

impl SpecialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialType::Standard => "standard",
            SpecialType::Rf => "rf",
            SpecialType::Remote => "remote",
            SpecialType::Gpio => "gpio",
            SpecialType::Http => "http",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(SpecialType::Standard),
            "rf" => Some(SpecialType::Rf),
            "remote" => Some(SpecialType::Remote),
            "gpio" => Some(SpecialType::Gpio),
            "http" => Some(SpecialType::Http),
            _ => None,
        }
    }
}

/// A station as persisted: attributes plus an undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationRecord {
    pub id: StationId,
    pub name: String,
    #[serde(default)]
    pub attributes: StationAttributes,
    #[serde(default)]
    pub special_type: SpecialType,
    #[serde(default)]
    pub payload: String,
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload too short: expected {expected} characters, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("field `{0}` is not valid hex")]
    InvalidHex(&'static str),
    #[error("RF field `{0}` decodes to zero")]
    ZeroRfField(&'static str),
    #[error("invalid port `{0}`")]
    InvalidPort(String),
    #[error("invalid GPIO pin `{0}`")]
    InvalidPin(String),
    #[error("invalid active level `{0}` (expected 0 or 1)")]
    InvalidLevel(char),
}

/// 24-bit on/off codes and the base pulse length in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfCode {
    pub on: u32,
    pub off: u32,
    pub pulse_len: u16,
}

/// Another controller on the network; `station` is its local index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStation {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub station: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioStation {
    pub pin: u8,
    pub active_high: bool,
}

/// A relay switched by plain GET requests. Empty fields are kept as-is;
/// the adapter treats them as "nothing to send".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpStation {
    pub host: String,
    pub port: u16,
    pub on_path: String,
    pub off_path: String,
}

fn hex_field<T>(payload: &str, range: std::ops::Range<usize>, name: &'static str) -> Result<T, PayloadError>
where
    T: TryFrom<u32>,
{
    let raw = payload.get(range).ok_or(PayloadError::InvalidHex(name))?;
    let value = u32::from_str_radix(raw, 16).map_err(|_| PayloadError::InvalidHex(name))?;
    T::try_from(value).map_err(|_| PayloadError::InvalidHex(name))
}

fn require_len(payload: &str, expected: usize) -> Result<(), PayloadError> {
    if payload.len() < expected {
        return Err(PayloadError::TooShort {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

impl RfCode {
    /// `OOOOOOFFFFFFLLLL`: on-code, off-code, pulse length, all hex.
    pub fn parse(payload: &str) -> Result<Self, PayloadError> {
        let payload = payload.trim();
        require_len(payload, RF_PAYLOAD_LEN)?;
        let on: u32 = hex_field(payload, 0..6, "on")?;
        let off: u32 = hex_field(payload, 6..12, "off")?;
        let pulse_len: u16 = hex_field(payload, 12..16, "timing")?;

        if on == 0 {
            return Err(PayloadError::ZeroRfField("on"));
        }
        if off == 0 {
            return Err(PayloadError::ZeroRfField("off"));
        }
        if pulse_len == 0 {
            return Err(PayloadError::ZeroRfField("timing"));
        }
        Ok(Self { on, off, pulse_len })
    }
}

impl RemoteStation {
    /// `IIIIIIIIPPPPSS`: IPv4 address, port, station index, all hex.
    pub fn parse(payload: &str) -> Result<Self, PayloadError> {
        let payload = payload.trim();
        require_len(payload, REMOTE_PAYLOAD_LEN)?;
        let ip: u32 = hex_field(payload, 0..8, "ip")?;
        let port: u16 = hex_field(payload, 8..12, "port")?;
        let station: u8 = hex_field(payload, 12..14, "station")?;
        Ok(Self {
            ip: Ipv4Addr::from(ip),
            port,
            station,
        })
    }
}

impl GpioStation {
    /// `PPL`: two decimal digits of pin number, then `0`/`1` active level.
    pub fn parse(payload: &str) -> Result<Self, PayloadError> {
        let payload = payload.trim();
        require_len(payload, GPIO_PAYLOAD_LEN)?;
        let pin_str = payload.get(0..2).unwrap_or_default();
        let pin: u8 = pin_str
            .parse()
            .map_err(|_| PayloadError::InvalidPin(pin_str.to_string()))?;
        let active_high = match payload.chars().nth(2) {
            Some('1') => true,
            Some('0') => false,
            Some(c) => return Err(PayloadError::InvalidLevel(c)),
            None => return Err(PayloadError::InvalidLevel(' ')),
        };
        Ok(Self { pin, active_high })
    }
}

impl HttpStation {
    /// `host,port,on_path,off_path`. A blank port means 80.
    pub fn parse(payload: &str) -> Result<Self, PayloadError> {
        let mut fields = payload.splitn(4, ',').map(str::trim);
        let host = fields.next().unwrap_or_default().to_string();
        let port_str = fields.next().unwrap_or_default();
        let port = if port_str.is_empty() {
            DEFAULT_HTTP_PORT
        } else {
            port_str
                .parse()
                .map_err(|_| PayloadError::InvalidPort(port_str.to_string()))?
        };
        Ok(Self {
            host,
            port,
            on_path: fields.next().unwrap_or_default().to_string(),
            off_path: fields.next().unwrap_or_default().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Decoded station
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationKind {
    Standard,
    Rf(RfCode),
    Remote(RemoteStation),
    Gpio(GpioStation),
    Http(HttpStation),
    /// Declared special, but the payload did not decode. Switching it is a
    /// no-op; its bit still tracks the intended state.
    Unusable { declared: SpecialType, reason: String },
}

impl StationKind {
    pub fn decode(special_type: SpecialType, payload: &str) -> Result<Self, PayloadError> {
        Ok(match special_type {
            SpecialType::Standard => StationKind::Standard,
            SpecialType::Rf => StationKind::Rf(RfCode::parse(payload)?),
            SpecialType::Remote => StationKind::Remote(RemoteStation::parse(payload)?),
            SpecialType::Gpio => StationKind::Gpio(GpioStation::parse(payload)?),
            SpecialType::Http => StationKind::Http(HttpStation::parse(payload)?),
        })
    }

    pub fn is_special(&self) -> bool {
        !matches!(self, StationKind::Standard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Station {
    pub id: StationId,
    pub name: String,
    pub attributes: StationAttributes,
    pub kind: StationKind,
}

impl Station {
    pub fn standard(id: StationId) -> Self {
        Self {
            id,
            name: format!("S{:02}", id + 1),
            attributes: StationAttributes::default(),
            kind: StationKind::Standard,
        }
    }

    pub fn from_record(record: StationRecord) -> Self {
        let kind = match StationKind::decode(record.special_type, &record.payload) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(
                    station = record.id,
                    special_type = record.special_type.as_str(),
                    "station payload rejected: {e}"
                );
                StationKind::Unusable {
                    declared: record.special_type,
                    reason: e.to_string(),
                }
            }
        };
        Self {
            id: record.id,
            name: record.name,
            attributes: record.attributes,
            kind,
        }
    }
}

/// Build a dense table of `count` stations. Ids without a record get a
/// default standard station; records past `count` are dropped.
pub fn station_table(records: Vec<StationRecord>, count: usize) -> Vec<Station> {
    let mut table: Vec<Station> = (0..count).map(Station::standard).collect();
    for record in records {
        if record.id < count {
            let id = record.id;
            table[id] = Station::from_record(record);
        } else {
            warn!(station = record.id, count, "station record beyond configured boards, ignored");
        }
    }
    table
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: StationId, special_type: SpecialType, payload: &str) -> StationRecord {
        StationRecord {
            id,
            name: format!("Station {id}"),
            attributes: StationAttributes::default(),
            special_type,
            payload: payload.into(),
        }
    }

    // -- board arithmetic ---------------------------------------------------

    #[test]
    fn board_and_offset() {
        assert_eq!((board_of(0), offset_of(0)), (0, 0));
        assert_eq!((board_of(7), offset_of(7)), (0, 7));
        assert_eq!((board_of(8), offset_of(8)), (1, 0));
        assert_eq!((board_of(199), offset_of(199)), (24, 7));
    }

    #[test]
    fn attributes_default_to_sequential() {
        assert!(StationAttributes::default().sequential);
    }

    // -- RF -----------------------------------------------------------------

    #[test]
    fn rf_payload_decodes_three_groups() {
        let code = RfCode::parse("51014C51014301A0").unwrap();
        assert_eq!(code.on, 0x51014C);
        assert_eq!(code.off, 0x510143);
        assert_eq!(code.pulse_len, 0x01A0);
    }

    #[test]
    fn rf_payload_with_zero_group_is_rejected() {
        assert_eq!(
            RfCode::parse("00000051014301A0"),
            Err(PayloadError::ZeroRfField("on"))
        );
        assert_eq!(
            RfCode::parse("51014C0000000100"),
            Err(PayloadError::ZeroRfField("off"))
        );
        assert_eq!(
            RfCode::parse("51014C5101430000"),
            Err(PayloadError::ZeroRfField("timing"))
        );
    }

    #[test]
    fn rf_payload_too_short() {
        assert!(matches!(
            RfCode::parse("51014C"),
            Err(PayloadError::TooShort { expected: 16, actual: 6 })
        ));
    }

    #[test]
    fn rf_payload_bad_hex() {
        assert_eq!(
            RfCode::parse("51014G51014301A0"),
            Err(PayloadError::InvalidHex("on"))
        );
    }

    // -- Remote -------------------------------------------------------------

    #[test]
    fn remote_payload_decodes_address_port_and_index() {
        let r = RemoteStation::parse("C0A8010A00500C").unwrap();
        assert_eq!(r.ip, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(r.port, 80);
        assert_eq!(r.station, 12);
    }

    #[test]
    fn remote_payload_too_short() {
        assert!(RemoteStation::parse("C0A8010A").is_err());
    }

    // -- GPIO ---------------------------------------------------------------

    #[test]
    fn gpio_payload_decodes_pin_and_level() {
        assert_eq!(
            GpioStation::parse("051").unwrap(),
            GpioStation { pin: 5, active_high: true }
        );
        assert_eq!(
            GpioStation::parse("260").unwrap(),
            GpioStation { pin: 26, active_high: false }
        );
    }

    #[test]
    fn gpio_payload_bad_level() {
        assert_eq!(GpioStation::parse("05x"), Err(PayloadError::InvalidLevel('x')));
    }

    // -- HTTP ---------------------------------------------------------------

    #[test]
    fn http_payload_splits_four_fields() {
        let h = HttpStation::parse("relay.local,8080,on?id=1,off?id=1").unwrap();
        assert_eq!(h.host, "relay.local");
        assert_eq!(h.port, 8080);
        assert_eq!(h.on_path, "on?id=1");
        assert_eq!(h.off_path, "off?id=1");
    }

    #[test]
    fn http_payload_keeps_commas_in_last_field() {
        let h = HttpStation::parse("h,80,a,b,c").unwrap();
        assert_eq!(h.off_path, "b,c");
    }

    #[test]
    fn http_payload_missing_fields_are_empty() {
        let h = HttpStation::parse("relay.local").unwrap();
        assert_eq!(h.port, 80);
        assert!(h.on_path.is_empty());
        assert!(h.off_path.is_empty());
    }

    #[test]
    fn http_payload_bad_port() {
        assert!(matches!(
            HttpStation::parse("h,eighty,on,off"),
            Err(PayloadError::InvalidPort(_))
        ));
    }

    // -- store boundary -----------------------------------------------------

    #[test]
    fn malformed_payload_becomes_unusable() {
        let s = Station::from_record(record(3, SpecialType::Rf, "000000000000000"));
        assert!(matches!(
            s.kind,
            StationKind::Unusable { declared: SpecialType::Rf, .. }
        ));
        assert!(s.kind.is_special());
    }

    #[test]
    fn station_table_fills_gaps_and_drops_extras() {
        let records = vec![
            record(1, SpecialType::Gpio, "051"),
            record(9, SpecialType::Standard, ""),
        ];
        let table = station_table(records, 8);
        assert_eq!(table.len(), 8);
        assert_eq!(table[0].name, "S01");
        assert_eq!(table[1].kind, StationKind::Gpio(GpioStation { pin: 5, active_high: true }));
    }

    #[test]
    fn special_type_string_round_trip() {
        for t in [
            SpecialType::Standard,
            SpecialType::Rf,
            SpecialType::Remote,
            SpecialType::Gpio,
            SpecialType::Http,
        ] {
            assert_eq!(SpecialType::parse(t.as_str()), Some(t));
        }
        assert_eq!(SpecialType::parse("zigbee"), None);
    }
}

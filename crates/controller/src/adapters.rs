//! Special-station protocol adapters.
//!
//! RF stations are bit-banged synchronously through [`DigitalIo`]; Remote
//! and HTTP stations become a single GET handed to a [`Dispatcher`], which
//! sends it in the background and never reports back into the tick.

use anyhow::{Context, Result};
use reqwest::Url;
use std::time::Duration;
use tracing::{debug, warn};

use crate::codec::MAX_WATER_TIME;
use crate::station::{HttpStation, RemoteStation, RfCode, MAX_STATIONS};
use crate::valve::{DigitalIo, RF_TX_PIN};

pub const RF_REPEATS: usize = 15;
const RF_CODE_BITS: u32 = 24;
const RF_SYNC_LOW_FACTOR: u32 = 31;

pub const NETWORK_TIMEOUT: Duration = Duration::from_millis(3000);

/// Window sent to a remote controller while auto-refresh keeps re-asserting it.
pub const REMOTE_REFRESH_WINDOW: usize = MAX_STATIONS * 4;

// ---------------------------------------------------------------------------
// RF
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub high_us: u32,
    pub low_us: u32,
}

/// One repetition of a 24-bit code, MSB first, followed by the sync pulse.
pub fn rf_pulse_train(code: u32, pulse_len: u16) -> Vec<Pulse> {
    let l = u32::from(pulse_len);
    let mut train: Vec<Pulse> = (0..RF_CODE_BITS)
        .rev()
        .map(|bit| {
            if code & (1 << bit) != 0 {
                Pulse { high_us: 3 * l, low_us: l }
            } else {
                Pulse { high_us: l, low_us: 3 * l }
            }
        })
        .collect();
    train.push(Pulse {
        high_us: l,
        low_us: RF_SYNC_LOW_FACTOR * l,
    });
    train
}

/// Transmit the on- or off-code. Runs to completion with busy-wait timing.
pub fn rf_send<IO: DigitalIo>(io: &mut IO, rf: &RfCode, on: bool) {
    let code = if on { rf.on } else { rf.off };
    let train = rf_pulse_train(code, rf.pulse_len);
    for _ in 0..RF_REPEATS {
        for pulse in &train {
            io.write_pin(RF_TX_PIN, true);
            io.delay_us(pulse.high_us);
            io.write_pin(RF_TX_PIN, false);
            io.delay_us(pulse.low_us);
        }
    }
}

// ---------------------------------------------------------------------------
// Remote controller
// ---------------------------------------------------------------------------

/// `GET http://ip:port/cm?pw=..&sid=..&en=..&t=..`
pub fn remote_url(target: &RemoteStation, device_key: &str, on: bool, auto_refresh: bool) -> Option<Url> {
    let window = if auto_refresh {
        REMOTE_REFRESH_WINDOW as i64
    } else {
        MAX_WATER_TIME
    };
    let mut url = Url::parse(&format!("http://{}:{}/cm", target.ip, target.port)).ok()?;
    url.query_pairs_mut()
        .append_pair("pw", device_key)
        .append_pair("sid", &target.station.to_string())
        .append_pair("en", if on { "1" } else { "0" })
        .append_pair("t", &window.to_string());
    Some(url)
}

// ---------------------------------------------------------------------------
// Generic HTTP relay
// ---------------------------------------------------------------------------

/// `GET http://host:port/<command>`, or `None` when there is nothing to send.
pub fn http_url(target: &HttpStation, on: bool) -> Option<Url> {
    let command = if on { &target.on_path } else { &target.off_path };
    let command = command.trim().trim_start_matches('/');
    let host = target.host.trim();
    if host.is_empty() || command.is_empty() {
        return None;
    }
    Url::parse(&format!("http://{host}:{}/{command}", target.port)).ok()
}

// ---------------------------------------------------------------------------
// Network dispatch
// ---------------------------------------------------------------------------

/// Fire-and-forget request sink.
pub trait Dispatcher {
    fn get(&self, url: Url);
}

pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(NETWORK_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl Dispatcher for HttpDispatcher {
    fn get(&self, url: Url) {
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.get(url.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %url, "special station request ok");
                }
                Ok(resp) => {
                    warn!(url = %url, status = %resp.status(), "special station request rejected");
                }
                Err(e) => {
                    warn!(url = %url, "special station request failed: {e}");
                }
            }
        });
    }
}

/// Collects URLs instead of sending them.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingDispatcher {
    pub(crate) urls: std::cell::RefCell<Vec<String>>,
}

#[cfg(test)]
impl Dispatcher for RecordingDispatcher {
    fn get(&self, url: Url) {
        self.urls.borrow_mut().push(url.to_string());
    }
}

// ===========================================================================
// Tests
// ===========================================================================

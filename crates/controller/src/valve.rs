//! Digital I/O for the valve boards. The `gpio` feature gates the real rppal
//! driver (74HC595 shift-register chain plus sensor and RF pins); without
//! it, a mock board records every output so the engine can be tested.

use anyhow::Result;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin};

// BCM pin numbers
pub const SR_CLOCK_PIN: u8 = 4;
pub const SR_OUTPUT_ENABLE_PIN: u8 = 17;
pub const SR_LATCH_PIN: u8 = 22;
pub const SR_DATA_PIN: u8 = 27;
pub const SENSOR1_PIN: u8 = 14;
pub const SENSOR2_PIN: u8 = 23;
pub const RF_TX_PIN: u8 = 15;

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

pub trait DigitalIo {
    /// Latch the full station bitmap: `boards[0]` bit 0 is station 0.
    fn shift_out(&mut self, boards: &[u8]);
    fn write_pin(&mut self, pin: u8, high: bool);
    fn read_pin(&mut self, pin: u8) -> bool;

    /// Block for `us` microseconds without yielding.
    fn delay_us(&mut self, us: u32) {
        spin_wait_us(us);
    }
}

pub fn spin_wait_us(us: u32) {
    let deadline = Instant::now() + Duration::from_micros(u64::from(us));
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

// ---------------------------------------------------------------------------
// Real shift-register board (production: requires rppal on a Raspberry Pi)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct ValveBoard {
    gpio: Gpio,
    clock: OutputPin,
    latch: OutputPin,
    data: OutputPin,
    _output_enable: OutputPin,
    inputs: HashMap<u8, InputPin>,
    outputs: HashMap<u8, OutputPin>,
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub(crate) fn new(boards: usize) -> Result<Self> {
        let gpio = Gpio::new()?;
        let clock = gpio.get(SR_CLOCK_PIN)?.into_output_low();
        let latch = gpio.get(SR_LATCH_PIN)?.into_output_low();
        let data = gpio.get(SR_DATA_PIN)?.into_output_low();
        // held high (outputs disabled) until the register is cleared
        let output_enable = gpio.get(SR_OUTPUT_ENABLE_PIN)?.into_output_high();

        let mut inputs = HashMap::new();
        for pin in [SENSOR1_PIN, SENSOR2_PIN] {
            inputs.insert(pin, gpio.get(pin)?.into_input_pullup());
        }
        let mut outputs = HashMap::new();
        outputs.insert(RF_TX_PIN, gpio.get(RF_TX_PIN)?.into_output_low());

        let mut board = Self {
            gpio,
            clock,
            latch,
            data,
            _output_enable: output_enable,
            inputs,
            outputs,
        };
        board.shift_out(&vec![0; boards]);
        board._output_enable.set_low();
        tracing::info!(boards, "valve board initialised");
        Ok(board)
    }
}

#[cfg(feature = "gpio")]
impl DigitalIo for ValveBoard {
    fn shift_out(&mut self, boards: &[u8]) {
        self.latch.set_low();
        // last board first: it ends up furthest down the chain
        for byte in boards.iter().rev() {
            for bit in (0..8).rev() {
                self.clock.set_low();
                if byte & (1 << bit) != 0 {
                    self.data.set_high();
                } else {
                    self.data.set_low();
                }
                self.clock.set_high();
            }
        }
        self.latch.set_high();
    }

    fn write_pin(&mut self, pin: u8, high: bool) {
        if !self.outputs.contains_key(&pin) {
            match self.gpio.get(pin) {
                Ok(p) => {
                    self.outputs.insert(pin, p.into_output());
                }
                Err(e) => {
                    tracing::warn!(pin, "gpio: cannot claim output pin: {e}");
                    return;
                }
            }
        }
        if let Some(p) = self.outputs.get_mut(&pin) {
            if high {
                p.set_high()
            } else {
                p.set_low()
            }
        }
    }

    fn read_pin(&mut self, pin: u8) -> bool {
        match self.inputs.get(&pin) {
            Some(p) => p.is_high(),
            None => {
                tracing::warn!(pin, "gpio: read from unconfigured input");
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock board (development: no hardware, records state)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct ValveBoard {
    /// Last bitmap latched by `shift_out`.
    pub(crate) latched: Vec<u8>,
    pub(crate) pins: HashMap<u8, bool>,
    /// Levels returned by `read_pin`; unset pins read high (pull-up).
    pub(crate) inputs: HashMap<u8, bool>,
    pub(crate) pin_writes: usize,
    pub(crate) delayed_us: u64,
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub(crate) fn new(boards: usize) -> Result<Self> {
        tracing::info!(boards, "[mock-gpio] valve board initialised (no hardware)");
        Ok(Self {
            latched: vec![0; boards],
            pins: HashMap::new(),
            inputs: HashMap::new(),
            pin_writes: 0,
            delayed_us: 0,
        })
    }

    pub(crate) fn is_latched(&self, station: usize) -> bool {
        self.latched
            .get(station >> 3)
            .is_some_and(|b| b & (1 << (station & 7)) != 0)
    }
}

#[cfg(not(feature = "gpio"))]
impl DigitalIo for ValveBoard {
    fn shift_out(&mut self, boards: &[u8]) {
        if boards != self.latched.as_slice() {
            tracing::debug!(?boards, "[mock-gpio] latch");
        }
        self.latched = boards.to_vec();
    }

    fn write_pin(&mut self, pin: u8, high: bool) {
        self.pin_writes += 1;
        self.pins.insert(pin, high);
    }

    fn read_pin(&mut self, pin: u8) -> bool {
        self.inputs.get(&pin).copied().unwrap_or(true)
    }

    fn delay_us(&mut self, us: u32) {
        self.delayed_us += u64::from(us);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

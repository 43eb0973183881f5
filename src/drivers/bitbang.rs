// Asynchronous bit-bang GPIO port (eight pins, one byte per sample)
//
// Every write to the backend is a sequence of samples; each sample is the
// next state of all eight pins. Samples are staged in a small tx buffer so a
// whole SPI byte goes out in one USB packet. A read flushes the buffer first
// so inputs are never sampled ahead of pending outputs.
//
// Sent samples are kept in a short history for the H/L signal chart.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::rc::Rc;

use embedded_hal::digital::{self, ErrorKind, OutputPin, StatefulOutputPin};
use embedded_hal::spi;
use log::{error, warn};

/// Samples buffered before the port sends without being asked to.
pub const TXD_PACKET_MAX: usize = 16;
/// Samples kept for the signal chart.
pub const SIGNAL_LOG_SIZE: usize = 100;
pub const PIN_COUNT: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinDef {
    pub no: u8,
    pub name: &'static str,
    pub direction: Direction,
    pub initial: bool, // outputs only
}

impl PinDef {
    pub const fn output(no: u8, name: &'static str, initial: bool) -> Self {
        Self {
            no,
            name,
            direction: Direction::Output,
            initial,
        }
    }

    pub const fn input(no: u8, name: &'static str) -> Self {
        Self {
            no,
            name,
            direction: Direction::Input,
            initial: false,
        }
    }

    const fn mask(&self) -> u8 {
        1 << self.no
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("can't open an FTDI device after {attempts} attempts")]
    Open { attempts: u32 },
    #[error("short write: {queued} bytes queued, {written} written")]
    ShortWrite { queued: usize, written: usize },
    #[error("device error: {0}")]
    Device(String),
}

impl digital::Error for IoError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

impl spi::Error for IoError {
    fn kind(&self) -> spi::ErrorKind {
        spi::ErrorKind::Other
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("valid pin definition list not supplied")]
    Empty,
    #[error("pin number {0} is out of range")]
    OutOfRange(u8),
    #[error("pin number {0} is not unique")]
    NotUnique(u8),
    #[error("pin {0} does not exist in the port")]
    UnknownPin(u8),
    #[error("pin {pin} ({name}) is not an {expected:?} pin")]
    WrongDirection {
        pin: u8,
        name: &'static str,
        expected: Direction,
    },
    #[error("pins must have unique pin numbers")]
    SharedPin,
    #[error(transparent)]
    Io(#[from] IoError),
}

/// Byte-wide GPIO backend. `write` queues pin samples, `read_pins` returns
/// the instantaneous level of all eight pins.
pub trait BitBangIo {
    fn write(&mut self, samples: &[u8]) -> Result<usize, IoError>;
    fn read_pins(&mut self) -> Result<u8, IoError>;
}

/// Validated pin definitions.
#[derive(Debug, Clone)]
pub struct PinMap {
    pins: Vec<PinDef>,
    output_mask: u8,
    input_mask: u8,
}

impl PinMap {
    pub fn new(pins: Vec<PinDef>) -> Result<Self, PortError> {
        if pins.is_empty() {
            return Err(PortError::Empty);
        }

        let mut active = 0u8;
        let mut outputs = 0u8;
        for (i, pin) in pins.iter().enumerate() {
            if pin.no >= PIN_COUNT {
                return Err(PortError::OutOfRange(pin.no));
            }
            if active & pin.mask() != 0 {
                return Err(PortError::NotUnique(pin.no));
            }
            if pins[..i].iter().any(|p| p.name == pin.name) {
                warn!("port: pin name '{}' is not unique", pin.name);
            }
            active |= pin.mask();
            if pin.direction == Direction::Output {
                outputs |= pin.mask();
            }
        }

        Ok(Self {
            pins,
            output_mask: outputs,
            input_mask: active & !outputs,
        })
    }

    pub fn output_mask(&self) -> u8 {
        self.output_mask
    }

    pub fn input_mask(&self) -> u8 {
        self.input_mask
    }

    pub fn get(&self, no: u8) -> Option<&PinDef> {
        self.pins.iter().find(|p| p.no == no)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PinDef> {
        self.pins.iter()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    fn initial_levels(&self) -> u8 {
        self.pins
            .iter()
            .filter(|p| p.direction == Direction::Output && p.initial)
            .fold(0, |acc, p| acc | p.mask())
    }
}

impl std::fmt::Display for PinMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pins, Output={:08b}, Input={:08b}",
            self.pins.len(),
            self.output_mask,
            self.input_mask
        )
    }
}

pub struct Port<IO> {
    io: IO,
    map: PinMap,
    levels: u8, // outputs as set, inputs as last read
    txd_buf: Vec<u8>,
    history: VecDeque<u8>,
}

pub type SharedPort<IO> = Rc<RefCell<Port<IO>>>;

impl<IO: BitBangIo> Port<IO> {
    /// Takes over the backend and drives every output to its initial level.
    pub fn new(io: IO, map: PinMap) -> Result<Self, PortError> {
        let mut port = Self {
            io,
            levels: map.initial_levels(),
            map,
            txd_buf: Vec::with_capacity(TXD_PACKET_MAX),
            history: VecDeque::with_capacity(SIGNAL_LOG_SIZE),
        };
        port.set_pins(true)?;
        Ok(port)
    }

    pub fn shared(self) -> SharedPort<IO> {
        Rc::new(RefCell::new(self))
    }

    pub fn map(&self) -> &PinMap {
        &self.map
    }

    pub fn io(&self) -> &IO {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    pub fn level(&self, no: u8) -> bool {
        no < PIN_COUNT && self.levels & (1 << no) != 0
    }

    /// Changes the shadow value only; nothing is sent until `set_pins`.
    pub fn set_level(&mut self, no: u8, high: bool) -> Result<(), PortError> {
        let pin = self.map.get(no).ok_or(PortError::UnknownPin(no))?;
        if pin.direction != Direction::Output {
            return Err(PortError::WrongDirection {
                pin: no,
                name: pin.name,
                expected: Direction::Output,
            });
        }
        self.drive(no, high);
        Ok(())
    }

    // For pins whose role was checked when their owner was built. Bits that
    // are not outputs never reach the wire.
    pub(crate) fn drive(&mut self, no: u8, high: bool) {
        let mask = 1u8.checked_shl(u32::from(no)).unwrap_or(0);
        if high {
            self.levels |= mask;
        } else {
            self.levels &= !mask;
        }
    }

    fn output_sample(&self) -> u8 {
        self.levels & self.map.output_mask
    }

    /// Stages the current output levels. With `flush` the staged samples go
    /// out immediately; otherwise they go out once the buffer is full.
    pub fn set_pins(&mut self, flush: bool) -> Result<(), IoError> {
        self.txd_buf.push(self.output_sample());
        if flush || self.txd_buf.len() >= TXD_PACKET_MAX {
            self.flush()?;
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.txd_buf.len()
    }

    pub fn flush(&mut self) -> Result<(), IoError> {
        if self.txd_buf.is_empty() {
            return Ok(());
        }

        for &sample in &self.txd_buf {
            if self.history.len() == SIGNAL_LOG_SIZE {
                self.history.pop_front();
            }
            self.history.push_back(sample);
        }

        let queued = self.txd_buf.len();
        let result = self.io.write(&self.txd_buf);
        // cleared whatever the outcome; a half-sent clock train can't be resumed
        self.txd_buf.clear();

        match result? {
            written if written == queued => Ok(()),
            written => {
                error!("port: wrote {} of {} samples", written, queued);
                Err(IoError::ShortWrite { queued, written })
            }
        }
    }

    /// Sends pending outputs, then samples the input pins.
    pub fn get_pins(&mut self) -> Result<(), IoError> {
        self.flush()?;
        let raw = self.io.read_pins()?;
        let inputs = self.map.input_mask;
        self.levels = (self.levels & !inputs) | (raw & inputs);
        Ok(())
    }

    pub fn history(&self) -> impl Iterator<Item = u8> + '_ {
        self.history.iter().copied()
    }

    /// One row per pin, `H`/`L` per recorded sample. Clears the history.
    pub fn signal_chart(&mut self) -> String {
        let mut out = String::new();
        for pin in self.map.iter() {
            let _ = write!(out, "{:>7} ", pin.name);
            for &sample in &self.history {
                out.push(if sample & pin.mask() != 0 { 'H' } else { 'L' });
            }
            out.push('\n');
        }
        self.history.clear();
        out
    }
}

/// Output pin bound to a shared port. Every change is sent immediately,
/// which is what chip-select and reset lines need.
pub struct PortPin<IO> {
    port: SharedPort<IO>,
    no: u8,
}

impl<IO: BitBangIo> PortPin<IO> {
    pub fn new(port: &SharedPort<IO>, no: u8) -> Result<Self, PortError> {
        {
            let p = port.borrow();
            let pin = p.map.get(no).ok_or(PortError::UnknownPin(no))?;
            if pin.direction != Direction::Output {
                return Err(PortError::WrongDirection {
                    pin: no,
                    name: pin.name,
                    expected: Direction::Output,
                });
            }
        }
        Ok(Self {
            port: Rc::clone(port),
            no,
        })
    }

    pub fn number(&self) -> u8 {
        self.no
    }

    fn drive(&mut self, high: bool) -> Result<(), IoError> {
        let mut port = self.port.borrow_mut();
        port.drive(self.no, high);
        port.set_pins(true)
    }
}

impl<IO> digital::ErrorType for PortPin<IO> {
    type Error = IoError;
}

impl<IO: BitBangIo> OutputPin for PortPin<IO> {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.drive(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.drive(true)
    }
}

impl<IO: BitBangIo> StatefulOutputPin for PortPin<IO> {
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.port.borrow().level(self.no))
    }

    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.port.borrow().level(self.no))
    }
}

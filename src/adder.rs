//! Transfer adapter for the relay adder
//!
//! Operand A and B go out on port A and port B of the operand expander; the
//! relay outputs come back on the result expander, bits 0-7 on port A and the
//! carry on bit 0 of port B. The relays pull their outputs low when active, so
//! the result inputs run with inverted polarity.

use std::fmt;
use std::time::{Duration, Instant};

use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::{self, SpiDevice};
use log::{info, warn};

use crate::drivers::mcp23s17::{self, Mcp23s17, PortConfig, Register, Side};

/// 9-bit adder output: 8-bit sum plus carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sum(u16);

impl Sum {
    pub const MAX: u16 = 0x1FF;

    pub const fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    /// What a working adder returns for `a + b`.
    pub const fn of(a: u8, b: u8) -> Self {
        Self(a as u16 + b as u16)
    }

    const fn from_ports(low: u8, high: u8) -> Self {
        Self((((high & 1) as u16) << 8) | low as u16)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    pub const fn carry(self) -> bool {
        self.0 & 0x100 != 0
    }

    pub const fn low_byte(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn binary(self) -> String {
        format!("{:09b}", self.0)
    }
}

impl fmt::Display for Sum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleConfig {
    /// Give up after this many result reads.
    pub max_reads: u8,
    /// Consecutive identical reads that count as settled.
    pub stable_reads: u8,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            max_reads: 20,
            stable_reads: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdderConfig {
    pub operand_dev: u8,
    pub result_dev: u8,
    /// Read OLAT back after loading the operands.
    pub verify_writes: bool,
    pub settle: SettleConfig,
}

impl Default for AdderConfig {
    fn default() -> Self {
        Self {
            operand_dev: 0,
            result_dev: 1,
            verify_writes: true,
            settle: SettleConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommunicationError<E> {
    #[error("bus error: {0}")]
    Bus(#[from] E),
    #[error("device {dev} did not respond: {register} wrote {wrote:#04x}, read {read:#04x}")]
    NoResponse {
        dev: u8,
        register: &'static str,
        wrote: u8,
        read: u8,
    },
    #[error("result has stray bits above bit 8: port B reads {high:#010b}")]
    MalformedResult { high: u8 },
    #[error("result did not settle within {reads} reads")]
    Unsettled { reads: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub at: Duration,
    pub value: Sum,
}

/// Result of a sampled transfer, with every read taken on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub value: Sum,
    pub samples: Vec<Sample>,
}

impl Settled {
    /// At most `rows` samples spread evenly over the trace.
    pub fn snapshot_rows(&self, rows: usize) -> Vec<Sample> {
        let n = self.samples.len();
        if rows == 0 || n == 0 {
            return Vec::new();
        }
        if n <= rows {
            return self.samples.clone();
        }
        (0..rows).map(|r| self.samples[r * n / rows]).collect()
    }
}

pub struct RelayAdder<SPI, RST> {
    mcp: Mcp23s17<SPI, RST>,
    config: AdderConfig,
}

pub type AdderError<SPI, RST> = CommunicationError<
    mcp23s17::Error<<SPI as spi::ErrorType>::Error, <RST as digital::ErrorType>::Error>,
>;

type AdderResult<T, SPI, RST> = Result<T, AdderError<SPI, RST>>;

impl<SPI, RST> RelayAdder<SPI, RST>
where
    SPI: SpiDevice,
    RST: OutputPin,
{
    pub fn new(mcp: Mcp23s17<SPI, RST>, config: AdderConfig) -> Self {
        Self { mcp, config }
    }

    pub fn config(&self) -> &AdderConfig {
        &self.config
    }

    pub fn expander(&mut self) -> &mut Mcp23s17<SPI, RST> {
        &mut self.mcp
    }

    /// Resets both expanders and sets up the operand outputs and the
    /// active-low result inputs.
    pub fn init(&mut self) -> AdderResult<(), SPI, RST> {
        let AdderConfig {
            operand_dev,
            result_dev,
            ..
        } = self.config;

        self.mcp.init()?;
        for dev in [operand_dev, result_dev] {
            match self.mcp.probe(dev) {
                Ok(()) => {}
                Err(mcp23s17::Error::NotDetected { dev, found }) => {
                    return Err(CommunicationError::NoResponse {
                        dev,
                        register: Register::Iocon.name(),
                        wrote: mcp23s17::iocon::INIT,
                        read: found,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        for side in [Side::A, Side::B] {
            self.mcp.configure(operand_dev, side, PortConfig::OUTPUTS)?;
            self.mcp.configure(result_dev, side, PortConfig::ACTIVE_LOW_INPUTS)?;
        }

        info!(
            "adder: operands on device {}, result on device {}",
            operand_dev, result_dev
        );
        Ok(())
    }

    /// Drives both operand ports to zero.
    pub fn clear(&mut self) -> AdderResult<(), SPI, RST> {
        self.load(0, 0)
    }

    /// One transfer: load the operands, read the result once.
    pub fn add(&mut self, a: u8, b: u8) -> AdderResult<Sum, SPI, RST> {
        self.load(a, b)?;
        let sum = self.read_result()?;
        info!("adder: {} + {} -> {} ({})", a, b, sum, sum.binary());
        Ok(sum)
    }

    /// Loads the operands, then keeps reading until the relays stop moving.
    pub fn add_settled(&mut self, a: u8, b: u8) -> AdderResult<Settled, SPI, RST> {
        let SettleConfig {
            max_reads,
            stable_reads,
        } = self.config.settle;
        let stable_reads = usize::from(stable_reads.max(1));

        self.load(a, b)?;
        let start = Instant::now();
        let mut samples: Vec<Sample> = Vec::with_capacity(usize::from(max_reads));

        for _ in 0..max_reads {
            let t1 = start.elapsed();
            let value = self.read_result()?;
            let t2 = start.elapsed();
            samples.push(Sample {
                at: (t1 + t2) / 2,
                value,
            });

            if samples.len() >= stable_reads {
                let tail = &samples[samples.len() - stable_reads..];
                if tail.iter().all(|s| s.value == value) {
                    info!(
                        "adder: {} + {} settled at {} after {} reads",
                        a,
                        b,
                        value,
                        samples.len()
                    );
                    return Ok(Settled { value, samples });
                }
            }
        }

        warn!("adder: {} + {} still moving after {} reads", a, b, max_reads);
        Err(CommunicationError::Unsettled { reads: max_reads })
    }

    fn load(&mut self, a: u8, b: u8) -> AdderResult<(), SPI, RST> {
        let dev = self.config.operand_dev;
        self.mcp.write(dev, Register::Gpio, Side::A, a)?;
        self.mcp.write(dev, Register::Gpio, Side::B, b)?;

        if self.config.verify_writes {
            for (side, wrote) in [(Side::A, a), (Side::B, b)] {
                let read = self.mcp.read(dev, Register::Olat, side)?;
                if read != wrote {
                    return Err(CommunicationError::NoResponse {
                        dev,
                        register: Register::Olat.name(),
                        wrote,
                        read,
                    });
                }
            }
        }
        Ok(())
    }

    fn read_result(&mut self) -> AdderResult<Sum, SPI, RST> {
        let dev = self.config.result_dev;
        let low = self.mcp.read(dev, Register::Gpio, Side::A)?;
        let high = self.mcp.read(dev, Register::Gpio, Side::B)?;
        if high & !1 != 0 {
            return Err(CommunicationError::MalformedResult { high });
        }
        Ok(Sum::from_ports(low, high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_bits() {
        let s = Sum::of(255, 1);
        assert_eq!(s.value(), 256);
        assert!(s.carry());
        assert_eq!(s.low_byte(), 0);
        assert_eq!(s.binary(), "100000000");

        let s = Sum::of(10, 20);
        assert_eq!(s.value(), 30);
        assert!(!s.carry());
        assert_eq!(s.low_byte(), 30);
        assert_eq!(s.binary(), "000011110");

        assert_eq!(Sum::of(255, 255).value(), 510);
        assert!(Sum::new(512).is_none());
    }

    #[test]
    fn from_ports_uses_bit_zero_of_high() {
        assert_eq!(Sum::from_ports(0x2A, 0x01).value(), 0x12A);
        assert_eq!(Sum::from_ports(0x2A, 0x00).value(), 0x02A);
    }

    fn trace(values: &[u16]) -> Settled {
        let samples: Vec<Sample> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| Sample {
                at: Duration::from_millis(i as u64),
                value: Sum::new(v).unwrap(),
            })
            .collect();
        Settled {
            value: samples.last().unwrap().value,
            samples,
        }
    }

    #[test]
    fn snapshot_rows_short_trace_is_kept() {
        let s = trace(&[1, 2, 3]);
        assert_eq!(s.snapshot_rows(10), s.samples);
        assert!(s.snapshot_rows(0).is_empty());
    }

    #[test]
    fn snapshot_rows_spread_long_trace() {
        let values: Vec<u16> = (0..20).collect();
        let rows = trace(&values).snapshot_rows(10);
        let picked: Vec<u16> = rows.iter().map(|s| s.value.value()).collect();
        assert_eq!(picked, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);

        let values: Vec<u16> = (0..15).collect();
        let rows = trace(&values).snapshot_rows(10);
        let picked: Vec<u16> = rows.iter().map(|s| s.value.value()).collect();
        assert_eq!(picked, vec![0, 1, 3, 4, 6, 7, 9, 10, 12, 13]);
    }
}

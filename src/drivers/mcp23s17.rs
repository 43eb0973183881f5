// MCP23S17 16-bit SPI port expander (board-independent)
//
// Several devices share one chip select and one active-low reset line and
// are told apart by their A2..A0 hardware address pins. After reset HAEN=0,
// so every device answers to address 0; the first IOCON write is therefore
// a broadcast that switches all of them to split banks with HAEN=1.

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::{Operation, SpiDevice};
use log::info;

const OPCODE_WRITE: u8 = 0x40;
const OPCODE_READ: u8 = 0x41;

pub mod iocon {
    pub const BANK: u8 = 0x80;
    pub const SEQOP: u8 = 0x20;
    pub const HAEN: u8 = 0x08;

    /// Split banks, hardware addressing.
    pub const INIT: u8 = BANK | HAEN;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

/// IOCON.BANK: 0 interleaves A/B registers, 1 puts all B registers at 0x10+.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bank {
    #[default]
    Paired,
    Split,
}

impl Bank {
    pub const fn from_iocon(iocon: u8) -> Self {
        if iocon & iocon::BANK != 0 {
            Bank::Split
        } else {
            Bank::Paired
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Iodir = 0,
    Ipol,
    Gpinten,
    Defval,
    Intcon,
    Iocon,
    Gppu,
    Intf,
    Intcap,
    Gpio,
    Olat,
}

impl Register {
    pub const ALL: [Register; 11] = [
        Register::Iodir,
        Register::Ipol,
        Register::Gpinten,
        Register::Defval,
        Register::Intcon,
        Register::Iocon,
        Register::Gppu,
        Register::Intf,
        Register::Intcap,
        Register::Gpio,
        Register::Olat,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Register::Iodir => "IODIR",
            Register::Ipol => "IPOL",
            Register::Gpinten => "GPINTEN",
            Register::Defval => "DEFVAL",
            Register::Intcon => "INTCON",
            Register::Iocon => "IOCON",
            Register::Gppu => "GPPU",
            Register::Intf => "INTF",
            Register::Intcap => "INTCAP",
            Register::Gpio => "GPIO",
            Register::Olat => "OLAT",
        }
    }

    pub const fn address(self, side: Side, bank: Bank) -> u8 {
        let index = self as u8;
        let side = match side {
            Side::A => 0,
            Side::B => 1,
        };
        match bank {
            Bank::Paired => index * 2 + side,
            Bank::Split => side * 0x10 + index,
        }
    }

    pub fn decode(addr: u8, bank: Bank) -> Option<(Register, Side)> {
        let (index, side) = match bank {
            Bank::Paired => (addr / 2, if addr % 2 == 0 { Side::A } else { Side::B }),
            Bank::Split if addr >= 0x10 => (addr - 0x10, Side::B),
            Bank::Split => (addr, Side::A),
        };
        Register::ALL.get(index as usize).map(|&r| (r, side))
    }
}

impl core::fmt::Display for Register {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Direction, pull-up and polarity for one 8-bit port. A set bit in
/// `inputs` makes the pin an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    pub inputs: u8,
    pub pullups: u8,
    pub inverted: u8,
}

impl PortConfig {
    pub const OUTPUTS: Self = Self {
        inputs: 0x00,
        pullups: 0xFF,
        inverted: 0x00,
    };

    pub const ACTIVE_LOW_INPUTS: Self = Self {
        inputs: 0xFF,
        pullups: 0xFF,
        inverted: 0xFF,
    };
}

#[derive(Debug, thiserror::Error)]
pub enum Error<S, P> {
    #[error("SPI transfer failed: {0:?}")]
    Spi(S),
    #[error("reset line failed: {0:?}")]
    Reset(P),
    #[error("no MCP23S17 at address {dev}: IOCON reads {found:#04x}")]
    NotDetected { dev: u8, found: u8 },
}

pub struct Mcp23s17<SPI, RST> {
    spi: SPI,
    reset: RST,
    bank: Bank,
}

impl<SPI, RST> Mcp23s17<SPI, RST>
where
    SPI: SpiDevice,
    RST: OutputPin,
{
    pub fn new(spi: SPI, reset: RST) -> Self {
        Self {
            spi,
            reset,
            bank: Bank::Paired,
        }
    }

    pub fn bank(&self) -> Bank {
        self.bank
    }

    /// Resets every device on the line and enables hardware addressing.
    pub fn init(&mut self) -> Result<(), Error<SPI::Error, RST::Error>> {
        self.reset_devices()?;
        self.write_register(0, Register::Iocon.address(Side::A, Bank::Paired), iocon::INIT)?;
        self.bank = Bank::from_iocon(iocon::INIT);
        info!("mcp23s17: reset, IOCON={:#04x}", iocon::INIT);
        Ok(())
    }

    /// Hardware reset. Chip select stays inactive between transactions.
    pub fn reset_devices(&mut self) -> Result<(), Error<SPI::Error, RST::Error>> {
        self.reset.set_low().map_err(Error::Reset)?;
        self.reset.set_high().map_err(Error::Reset)?;
        self.bank = Bank::Paired;
        Ok(())
    }

    /// Only bits 0-2 of `dev` and bits 0-4 of `reg` are used.
    pub fn write_register(
        &mut self,
        dev: u8,
        reg: u8,
        data: u8,
    ) -> Result<(), Error<SPI::Error, RST::Error>> {
        self.spi
            .write(&[opcode(OPCODE_WRITE, dev), reg & 0x1f, data])
            .map_err(Error::Spi)
    }

    pub fn read_register(&mut self, dev: u8, reg: u8) -> Result<u8, Error<SPI::Error, RST::Error>> {
        let mut buf = [0u8; 1];
        self.spi
            .transaction(&mut [
                Operation::Write(&[opcode(OPCODE_READ, dev), reg & 0x1f]),
                Operation::Read(&mut buf),
            ])
            .map_err(Error::Spi)?;
        Ok(buf[0])
    }

    pub fn write(
        &mut self,
        dev: u8,
        reg: Register,
        side: Side,
        data: u8,
    ) -> Result<(), Error<SPI::Error, RST::Error>> {
        self.write_register(dev, reg.address(side, self.bank), data)
    }

    pub fn read(
        &mut self,
        dev: u8,
        reg: Register,
        side: Side,
    ) -> Result<u8, Error<SPI::Error, RST::Error>> {
        self.read_register(dev, reg.address(side, self.bank))
    }

    pub fn configure(
        &mut self,
        dev: u8,
        side: Side,
        cfg: PortConfig,
    ) -> Result<(), Error<SPI::Error, RST::Error>> {
        self.write(dev, Register::Iodir, side, cfg.inputs)?;
        self.write(dev, Register::Gppu, side, cfg.pullups)?;
        self.write(dev, Register::Ipol, side, cfg.inverted)
    }

    /// Reads IOCON back; a missing device leaves MISO floating.
    pub fn probe(&mut self, dev: u8) -> Result<(), Error<SPI::Error, RST::Error>> {
        let found = self.read(dev, Register::Iocon, Side::A)?;
        if found != iocon::INIT {
            return Err(Error::NotDetected { dev: dev & 0x7, found });
        }
        Ok(())
    }

    pub fn release(self) -> (SPI, RST) {
        (self.spi, self.reset)
    }
}

const fn opcode(base: u8, dev: u8) -> u8 {
    base | ((dev & 0x7) << 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType as PinErrorType;
    use embedded_hal::spi::ErrorType as SpiErrorType;

    #[test]
    fn split_bank_addresses() {
        assert_eq!(Register::Iodir.address(Side::A, Bank::Split), 0x00);
        assert_eq!(Register::Ipol.address(Side::A, Bank::Split), 0x01);
        assert_eq!(Register::Gppu.address(Side::A, Bank::Split), 0x06);
        assert_eq!(Register::Gpio.address(Side::A, Bank::Split), 0x09);
        assert_eq!(Register::Iodir.address(Side::B, Bank::Split), 0x10);
        assert_eq!(Register::Ipol.address(Side::B, Bank::Split), 0x11);
        assert_eq!(Register::Gppu.address(Side::B, Bank::Split), 0x16);
        assert_eq!(Register::Gpio.address(Side::B, Bank::Split), 0x19);
    }

    #[test]
    fn paired_bank_addresses() {
        assert_eq!(Register::Iocon.address(Side::A, Bank::Paired), 0x0A);
        assert_eq!(Register::Iocon.address(Side::B, Bank::Paired), 0x0B);
        assert_eq!(Register::Gpio.address(Side::B, Bank::Paired), 0x13);
        assert_eq!(Register::Olat.address(Side::B, Bank::Paired), 0x15);
    }

    #[test]
    fn decode_inverts_address() {
        for bank in [Bank::Paired, Bank::Split] {
            for reg in Register::ALL {
                for side in [Side::A, Side::B] {
                    assert_eq!(Register::decode(reg.address(side, bank), bank), Some((reg, side)));
                }
            }
        }
        assert_eq!(Register::decode(0x16, Bank::Paired), None);
        assert_eq!(Register::decode(0x0B, Bank::Split), None);
    }

    // Records every transaction as a flat list of written bytes and answers
    // reads with a fixed byte.
    #[derive(Default)]
    struct FakeSpi {
        frames: Vec<Vec<u8>>,
        reply: u8,
    }

    impl SpiErrorType for FakeSpi {
        type Error = Infallible;
    }

    impl SpiDevice for FakeSpi {
        fn transaction(&mut self, ops: &mut [Operation<'_, u8>]) -> Result<(), Infallible> {
            let mut frame = Vec::new();
            for op in ops.iter_mut() {
                match op {
                    Operation::Write(w) => frame.extend_from_slice(w),
                    Operation::Read(r) => r.fill(self.reply),
                    Operation::Transfer(r, w) => {
                        frame.extend_from_slice(w);
                        r.fill(self.reply);
                    }
                    Operation::TransferInPlace(w) => {
                        frame.extend_from_slice(w);
                        w.fill(self.reply);
                    }
                    Operation::DelayNs(_) => {}
                }
            }
            self.frames.push(frame);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeReset {
        edges: Vec<bool>,
    }

    impl PinErrorType for FakeReset {
        type Error = Infallible;
    }

    impl OutputPin for FakeReset {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.edges.push(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.edges.push(true);
            Ok(())
        }
    }

    #[test]
    fn init_pulses_reset_and_broadcasts_iocon() {
        let mut mcp = Mcp23s17::new(FakeSpi::default(), FakeReset::default());
        mcp.init().unwrap();
        assert_eq!(mcp.bank(), Bank::Split);

        let (spi, reset) = mcp.release();
        assert_eq!(reset.edges, vec![false, true]);
        assert_eq!(spi.frames, vec![vec![0x40, 0x0A, 0x88]]);
    }

    #[test]
    fn opcodes_carry_device_address() {
        let mut mcp = Mcp23s17::new(FakeSpi::default(), FakeReset::default());
        mcp.write_register(1, 0x09, 0x5A).unwrap();
        mcp.write_register(9, 0x3F, 0x00).unwrap(); // masked to dev 1, reg 0x1F
        mcp.read_register(7, 0x19).unwrap();

        let (spi, _) = mcp.release();
        assert_eq!(
            spi.frames,
            vec![vec![0x42, 0x09, 0x5A], vec![0x42, 0x1F, 0x00], vec![0x4F, 0x19]]
        );
    }

    #[test]
    fn configure_writes_direction_pullup_polarity() {
        let mut mcp = Mcp23s17::new(FakeSpi::default(), FakeReset::default());
        mcp.init().unwrap();
        mcp.configure(1, Side::B, PortConfig::ACTIVE_LOW_INPUTS).unwrap();

        let (spi, _) = mcp.release();
        assert_eq!(
            &spi.frames[1..],
            &[vec![0x42, 0x10, 0xFF], vec![0x42, 0x16, 0xFF], vec![0x42, 0x11, 0xFF]]
        );
    }

    #[test]
    fn probe_rejects_floating_bus() {
        let spi = FakeSpi {
            reply: 0xFF,
            ..FakeSpi::default()
        };
        let mut mcp = Mcp23s17::new(spi, FakeReset::default());
        mcp.init().unwrap();
        assert!(matches!(
            mcp.probe(1),
            Err(Error::NotDetected { dev: 1, found: 0xFF })
        ));
    }
}

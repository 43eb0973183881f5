//! Relay adder board support
//!
//! Maps the FT232H bit-bang lines to named signals and assembles the stack:
//! port -> software SPI + /CS -> MCP23S17 pair -> relay adder. Nothing above
//! this module needs to know a GPIO number.

pub mod pins;
pub mod sim;

#[cfg(feature = "ftd2xx")]
pub mod ft232h;

use embedded_hal_bus::spi::{DeviceError, ExclusiveDevice, NoDelay};
use log::info;

use crate::adder::{CommunicationError, RelayAdder};
use crate::config::Settings;
use crate::drivers::bitbang::{BitBangIo, IoError, Port, PortError, PortPin, SharedPort};
use crate::drivers::mcp23s17::{self, Mcp23s17};
use crate::drivers::spi::BitBangSpi;

// Type Aliases
pub type SpiDevice<IO> = ExclusiveDevice<BitBangSpi<IO>, PortPin<IO>, NoDelay>;
pub type Expander<IO> = Mcp23s17<SpiDevice<IO>, PortPin<IO>>;
pub type Adder<IO> = RelayAdder<SpiDevice<IO>, PortPin<IO>>;

pub type BusError = DeviceError<IoError, IoError>;
pub type ExpanderError = mcp23s17::Error<BusError, IoError>;

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("operands and result both on MCP23S17 address {0}")]
    SharedAddress(u8),
    #[error("chip select line: {0}")]
    ChipSelect(IoError),
    #[error(transparent)]
    Adder(#[from] CommunicationError<ExpanderError>),
}

pub struct Board<IO> {
    port: SharedPort<IO>,
    adder: Adder<IO>,
}

impl<IO: BitBangIo> Board<IO> {
    /// Builds the stack on `io` and initializes both expanders.
    pub fn init(io: IO, settings: &Settings) -> Result<Self, BoardError> {
        let mut board = Self::assemble(io, settings)?;
        board.adder.init()?;
        Ok(board)
    }

    fn assemble(io: IO, settings: &Settings) -> Result<Self, BoardError> {
        if settings.operand_dev == settings.result_dev {
            return Err(BoardError::SharedAddress(settings.operand_dev));
        }

        let p = settings.pins;
        let map = pins::pin_map(&p)?;
        info!("board: {}", map);

        let port = Port::new(io, map)?.shared();

        let spi_bus = BitBangSpi::new(&port, p.sck, p.mosi, p.miso)?;
        let cs = PortPin::new(&port, p.cs)?;
        let reset = PortPin::new(&port, p.reset)?;
        let spi_dev = ExclusiveDevice::new_no_delay(spi_bus, cs).map_err(BoardError::ChipSelect)?;

        let adder = RelayAdder::new(Mcp23s17::new(spi_dev, reset), settings.adder_config());
        Ok(Self { port, adder })
    }

    pub fn adder(&mut self) -> &mut Adder<IO> {
        &mut self.adder
    }

    pub fn port(&self) -> &SharedPort<IO> {
        &self.port
    }
}

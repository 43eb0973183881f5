//! ADBUS | Signal  | Dir |  Notes
//! ------+---------+-----+-------------------------------------------
//!   0   | SCK     | out | SPI clock, idles low (mode 0)
//!   1   | STXD    | out | SPI MOSI
//!   2   | SRXD    | in  | SPI MISO, shared by both MCP23S17
//!   3   | /CS     | out | common chip select, active low
//!   5   | /RESET  | out | common MCP23S17 reset, active low
//!
//! MCP23S17 at hardware address 0 drives operand A (GPA) and B (GPB).
//! MCP23S17 at hardware address 1 senses the relay outputs: GPA = sum
//! bits 0-7, GPB0 = carry.

use crate::config::PinAssignment;
use crate::drivers::bitbang::{PinDef, PinMap, PortError};

// ----- SPI Bus -----
pub const SPI_SCK: u8 = 0;
pub const SPI_MOSI: u8 = 1;
pub const SPI_MISO: u8 = 2;

// ----- MCP23S17 control -----
pub const MCP_CS: u8 = 3;
pub const MCP_RESET: u8 = 5;

/// Pin definitions for an assignment. Chip select and reset start
/// inactive (high), the clock idles low.
pub fn pin_map(pins: &PinAssignment) -> Result<PinMap, PortError> {
    PinMap::new(vec![
        PinDef::output(pins.reset, "/RESET", true),
        PinDef::output(pins.cs, "/CS", true),
        PinDef::output(pins.sck, "SCK", false),
        PinDef::output(pins.mosi, "STXD", false),
        PinDef::input(pins.miso, "SRXD"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map() {
        let map = pin_map(&PinAssignment::default()).unwrap();
        assert_eq!(map.output_mask(), 0x2b);
        assert_eq!(map.input_mask(), 0x04);
    }

    #[test]
    fn clashing_assignment_is_rejected() {
        let pins = PinAssignment {
            cs: SPI_SCK,
            ..PinAssignment::default()
        };
        assert!(matches!(pin_map(&pins), Err(PortError::NotUnique(0))));
    }
}

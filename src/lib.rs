// host driver for the relay adder (FT232H bit-bang -> MCP23S17 -> relays)

pub mod adder;
pub mod board;
pub mod config;
pub mod drivers;

pub use adder::{AdderConfig, CommunicationError, RelayAdder, Settled, Sum};
pub use board::{Board, BoardError};
pub use config::Settings;

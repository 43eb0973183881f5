// Hardware drivers, board-independent.
//
// The port and SPI layers only know pin numbers; which pin carries which
// signal is decided in board/.

pub mod bitbang;
pub mod mcp23s17;
pub mod spi;

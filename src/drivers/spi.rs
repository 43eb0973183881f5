// Software SPI master on the bit-bang port
//
// Mode 0 (CPOL=0, CPHA=0), MSB first. Clock idles low; data changes while
// the clock is low and the slave samples on the rising edge. Each bit costs
// two samples (data + SCK low, then SCK high). Samples stay in the port's
// tx buffer until a MISO read or `flush` pushes them out, so a write-only
// byte usually leaves in a single USB packet.

use embedded_hal::spi::{ErrorType, SpiBus};
use log::warn;

use super::bitbang::{BitBangIo, Direction, IoError, PortError, SharedPort};

pub struct BitBangSpi<IO> {
    port: SharedPort<IO>,
    sck: u8,
    mosi: u8,
    miso: u8,
}

impl<IO: BitBangIo> BitBangSpi<IO> {
    /// Checks pin existence, uniqueness and direction, then parks SCK low.
    pub fn new(port: &SharedPort<IO>, sck: u8, mosi: u8, miso: u8) -> Result<Self, PortError> {
        if sck == mosi || sck == miso || mosi == miso {
            return Err(PortError::SharedPin);
        }

        {
            let mut p = port.borrow_mut();
            for (no, expected) in [
                (sck, Direction::Output),
                (mosi, Direction::Output),
                (miso, Direction::Input),
            ] {
                let pin = p.map().get(no).ok_or(PortError::UnknownPin(no))?;
                if pin.direction != expected {
                    return Err(PortError::WrongDirection {
                        pin: no,
                        name: pin.name,
                        expected,
                    });
                }
            }

            p.set_level(sck, false)?;
            p.set_pins(true)?;
        }

        Ok(Self {
            port: port.clone(),
            sck,
            mosi,
            miso,
        })
    }

    /// Clocks one byte out on MOSI; with `sample` also clocks one in from MISO.
    fn shift(&mut self, out: u8, sample: bool) -> Result<u8, IoError> {
        let mut port = self.port.borrow_mut();
        if port.level(self.sck) {
            warn!("spi: clock is not low at start of byte");
            port.drive(self.sck, false);
            port.set_pins(true)?;
        }

        let mut val = 0u8;
        for i in (0..8).rev() {
            port.drive(self.sck, false);
            port.drive(self.mosi, (out >> i) & 1 == 1);
            port.set_pins(false)?;

            if sample {
                // output changes on the falling edge that was just staged
                port.get_pins()?;
                val = (val << 1) | port.level(self.miso) as u8;
            }

            port.drive(self.sck, true);
            port.set_pins(false)?;
        }

        port.drive(self.sck, false);
        port.set_pins(false)?;

        Ok(val)
    }
}

impl<IO> ErrorType for BitBangSpi<IO> {
    type Error = IoError;
}

impl<IO: BitBangIo> SpiBus<u8> for BitBangSpi<IO> {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        for word in words.iter_mut() {
            *word = self.shift(0x00, true)?;
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        for &word in words {
            self.shift(word, false)?;
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        for i in 0..read.len().max(write.len()) {
            let out = write.get(i).copied().unwrap_or(0x00);
            let got = self.shift(out, i < read.len())?;
            if let Some(slot) = read.get_mut(i) {
                *slot = got;
            }
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        for word in words.iter_mut() {
            *word = self.shift(*word, true)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.port.borrow_mut().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::bitbang::tests::DryRun;
    use crate::drivers::bitbang::{PinDef, PinMap, Port};

    const SCK: u8 = 0;
    const MOSI: u8 = 1;
    const MISO: u8 = 2;

    fn port(read_value: u8) -> SharedPort<DryRun> {
        let map = PinMap::new(vec![
            PinDef::output(SCK, "SCK", false),
            PinDef::output(MOSI, "STXD", false),
            PinDef::input(MISO, "SRXD"),
        ])
        .unwrap();
        let io = DryRun {
            read_value,
            ..DryRun::default()
        };
        Port::new(io, map).unwrap().shared()
    }

    // MOSI level sampled on every rising SCK edge
    fn sampled_bits(written: &[u8]) -> Vec<u8> {
        written
            .windows(2)
            .filter(|w| w[0] & (1 << SCK) == 0 && w[1] & (1 << SCK) != 0)
            .map(|w| (w[1] >> MOSI) & 1)
            .collect()
    }

    #[test]
    fn writes_msb_first_in_mode_0() {
        let port = port(0);
        let mut spi = BitBangSpi::new(&port, SCK, MOSI, MISO).unwrap();
        spi.write(&[0xA5]).unwrap();
        spi.flush().unwrap();

        let written = port.borrow().io().written.clone();
        assert_eq!(sampled_bits(&written), vec![1, 0, 1, 0, 0, 1, 0, 1]);
        // clock idles low afterwards
        assert_eq!(written.last().copied().unwrap() & (1 << SCK), 0);
    }

    #[test]
    fn write_only_byte_stays_buffered() {
        let port = port(0);
        let mut spi = BitBangSpi::new(&port, SCK, MOSI, MISO).unwrap();
        let before = port.borrow().io().writes;
        spi.write(&[0x0F]).unwrap();
        // 17 samples: one automatic packet, one sample still pending
        assert_eq!(port.borrow().io().writes, before + 1);
        assert_eq!(port.borrow().pending(), 1);
    }

    #[test]
    fn reads_constant_miso() {
        let mut spi = BitBangSpi::new(&port(1 << MISO), SCK, MOSI, MISO).unwrap();
        let mut buf = [0u8; 2];
        spi.read(&mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0xFF]);

        let mut spi = BitBangSpi::new(&port(!(1 << MISO)), SCK, MOSI, MISO).unwrap();
        spi.read(&mut buf).unwrap();
        assert_eq!(buf, [0x00, 0x00]);
    }

    #[test]
    fn transfer_pads_short_write() {
        let port = port(1 << MISO);
        let mut spi = BitBangSpi::new(&port, SCK, MOSI, MISO).unwrap();
        let mut read = [0u8; 2];
        spi.transfer(&mut read, &[0x80]).unwrap();
        spi.flush().unwrap();
        assert_eq!(read, [0xFF, 0xFF]);
        let bits = sampled_bits(&port.borrow().io().written);
        assert_eq!(bits.len(), 16);
        assert_eq!(bits[0], 1);
        assert!(bits[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn parks_a_high_clock_before_the_byte() {
        let port = port(0);
        let mut spi = BitBangSpi::new(&port, SCK, MOSI, MISO).unwrap();
        {
            let mut p = port.borrow_mut();
            p.set_level(SCK, true).unwrap();
            p.set_pins(true).unwrap();
        }
        let start = port.borrow().io().written.len();

        spi.write(&[0xFF]).unwrap();
        spi.flush().unwrap();

        let written = port.borrow().io().written.clone();
        assert_ne!(written[start - 1] & (1 << SCK), 0);
        assert_eq!(written[start] & (1 << SCK), 0);
        // the parked sample doesn't count as a clock edge
        assert_eq!(sampled_bits(&written[start..]), vec![1; 8]);
    }

    #[test]
    fn checks_pin_roles() {
        let port = port(0);
        assert!(matches!(
            BitBangSpi::new(&port, SCK, SCK, MISO),
            Err(PortError::SharedPin)
        ));
        assert!(matches!(
            BitBangSpi::new(&port, SCK, MISO, MOSI),
            Err(PortError::WrongDirection { pin: 2, .. })
        ));
        assert!(matches!(
            BitBangSpi::new(&port, SCK, MOSI, 6),
            Err(PortError::UnknownPin(6))
        ));
    }
}

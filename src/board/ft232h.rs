// FT232H in asynchronous bit-bang mode through FTDI's D2XX driver
//
// Bring-up follows FTDI AN_135: reset, set the baud rate, reset the bit
// mode, then enter async bit-bang with the output mask. The sample clock
// runs at 16x the baud rate; keeping it under ~1 MHz avoids overrunning
// the write FIFO and reading inputs before queued outputs have appeared.

use std::thread;
use std::time::Duration;

use libftd2xx::{BitMode, FtStatus, Ftdi, FtdiCommon};
use log::{info, warn};

use crate::config::Settings;
use crate::drivers::bitbang::{BitBangIo, IoError};

const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);
const MODE_SWITCH_DELAY: Duration = Duration::from_millis(50);

pub struct Ft232h {
    ftdi: Ftdi,
}

fn device(e: FtStatus) -> IoError {
    IoError::Device(e.to_string())
}

impl Ft232h {
    /// Opens the D2XX device at `settings.device_index`; pins in
    /// `output_mask` become outputs, everything else an input.
    pub fn open(settings: &Settings, output_mask: u8) -> Result<Self, IoError> {
        let attempts = u32::from(settings.open_retries) + 1;
        let index = i32::from(settings.device_index);

        let mut opened = None;
        for attempt in 1..=attempts {
            match Ftdi::with_index(index) {
                Ok(ftdi) => {
                    opened = Some(ftdi);
                    break;
                }
                Err(e) => {
                    warn!("ft232h: open #{} failed: {}", index, e);
                    if attempt < attempts {
                        info!("ft232h: retrying ({}/{})", attempt, attempts - 1);
                        thread::sleep(OPEN_RETRY_DELAY);
                    }
                }
            }
        }
        let mut ftdi = opened.ok_or(IoError::Open { attempts })?;

        ftdi.reset().map_err(device)?;
        ftdi.set_baud_rate(settings.baud_rate).map_err(device)?;
        ftdi.set_bit_mode(0, BitMode::Reset).map_err(device)?;
        ftdi.set_bit_mode(output_mask, BitMode::AsyncBitbang)
            .map_err(device)?;
        thread::sleep(MODE_SWITCH_DELAY);

        info!(
            "ft232h: async bit-bang, {} baud, outputs {:08b}",
            settings.baud_rate, output_mask
        );
        Ok(Self { ftdi })
    }
}

impl BitBangIo for Ft232h {
    fn write(&mut self, samples: &[u8]) -> Result<usize, IoError> {
        self.ftdi.write(samples).map_err(device)
    }

    fn read_pins(&mut self) -> Result<u8, IoError> {
        self.ftdi.bit_mode().map_err(device)
    }
}

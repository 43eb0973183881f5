// Host settings with an optional settings file.
// Text-based key=value format, `#` starts a comment line.
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use log::warn;

use crate::adder::{AdderConfig, SettleConfig};
use crate::board::pins;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read settings file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("can't write settings file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which FT232H GPIO line each signal is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinAssignment {
    pub sck: u8,
    pub mosi: u8,
    pub miso: u8,
    pub cs: u8,
    pub reset: u8,
}

impl Default for PinAssignment {
    fn default() -> Self {
        Self {
            sck: pins::SPI_SCK,
            mosi: pins::SPI_MOSI,
            miso: pins::SPI_MISO,
            cs: pins::MCP_CS,
            reset: pins::MCP_RESET,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub device_index: u8, // D2XX device list index
    pub baud_rate: u32,   // bit-bang sample clock is 16x this
    pub open_retries: u8, // one second apart
    pub pins: PinAssignment,
    pub operand_dev: u8, // MCP23S17 hardware address, 0-7
    pub result_dev: u8,
    pub verify_writes: bool,
    pub settle_reads: u8,
    pub stable_reads: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self::defaults()
    }
}

impl Settings {
    pub const fn defaults() -> Self {
        Self {
            device_index: 0,
            // ~920 kHz sample clock; FTDI suggests staying under 1 MHz
            baud_rate: 57_600,
            open_retries: 5,
            pins: PinAssignment {
                sck: pins::SPI_SCK,
                mosi: pins::SPI_MOSI,
                miso: pins::SPI_MISO,
                cs: pins::MCP_CS,
                reset: pins::MCP_RESET,
            },
            operand_dev: 0,
            result_dev: 1,
            verify_writes: true,
            settle_reads: 20,
            stable_reads: 3,
        }
    }

    fn sanitize(&mut self) {
        self.baud_rate = self.baud_rate.clamp(300, 1_000_000);
        self.open_retries = self.open_retries.min(30);
        for pin in [
            &mut self.pins.sck,
            &mut self.pins.mosi,
            &mut self.pins.miso,
            &mut self.pins.cs,
            &mut self.pins.reset,
        ] {
            *pin = (*pin).min(7);
        }
        self.operand_dev &= 0x7;
        self.result_dev &= 0x7;
        self.settle_reads = self.settle_reads.clamp(1, 200);
        self.stable_reads = self.stable_reads.clamp(1, self.settle_reads);
    }

    pub fn parse(text: &str) -> Self {
        let mut s = Self::defaults();
        parse_settings_txt(text, &mut s);
        s.sanitize();
        s
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.render()).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn render(&self) -> String {
        write_settings_txt(self)
    }

    pub fn adder_config(&self) -> AdderConfig {
        AdderConfig {
            operand_dev: self.operand_dev,
            result_dev: self.result_dev,
            verify_writes: self.verify_writes,
            settle: SettleConfig {
                max_reads: self.settle_reads,
                stable_reads: self.stable_reads,
            },
        }
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, val: &str) -> Option<T> {
    let parsed = val.parse().ok();
    if parsed.is_none() {
        warn!("config: bad value '{}' for {}", val, key);
    }
    parsed
}

fn parse_bool(key: &str, val: &str) -> Option<bool> {
    match val {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("config: bad value '{}' for {}", val, key);
            None
        }
    }
}

fn apply_setting(key: &str, val: &str, s: &mut Settings) {
    match key {
        "device_index" => {
            if let Some(v) = parse_num(key, val) {
                s.device_index = v;
            }
        }
        "baud_rate" => {
            if let Some(v) = parse_num(key, val) {
                s.baud_rate = v;
            }
        }
        "open_retries" => {
            if let Some(v) = parse_num(key, val) {
                s.open_retries = v;
            }
        }
        "pin_sck" => {
            if let Some(v) = parse_num(key, val) {
                s.pins.sck = v;
            }
        }
        "pin_mosi" => {
            if let Some(v) = parse_num(key, val) {
                s.pins.mosi = v;
            }
        }
        "pin_miso" => {
            if let Some(v) = parse_num(key, val) {
                s.pins.miso = v;
            }
        }
        "pin_cs" => {
            if let Some(v) = parse_num(key, val) {
                s.pins.cs = v;
            }
        }
        "pin_reset" => {
            if let Some(v) = parse_num(key, val) {
                s.pins.reset = v;
            }
        }
        "operand_dev" => {
            if let Some(v) = parse_num(key, val) {
                s.operand_dev = v;
            }
        }
        "result_dev" => {
            if let Some(v) = parse_num(key, val) {
                s.result_dev = v;
            }
        }
        "verify_writes" => {
            if let Some(v) = parse_bool(key, val) {
                s.verify_writes = v;
            }
        }
        "settle_reads" => {
            if let Some(v) = parse_num(key, val) {
                s.settle_reads = v;
            }
        }
        "stable_reads" => {
            if let Some(v) = parse_num(key, val) {
                s.stable_reads = v;
            }
        }
        _ => warn!("config: unknown key '{}' ignored", key),
    }
}

fn parse_settings_txt(text: &str, settings: &mut Settings) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            apply_setting(key.trim(), val.trim(), settings);
        }
    }
}

fn write_settings_txt(s: &Settings) -> String {
    let mut out = String::new();
    out.push_str("# relay-adder settings\n");
    out.push_str("# lines starting with # are ignored\n\n");
    let _ = writeln!(out, "device_index={}", s.device_index);
    let _ = writeln!(out, "baud_rate={}", s.baud_rate);
    let _ = writeln!(out, "open_retries={}", s.open_retries);
    out.push_str("\n# FT232H GPIO lines (0-7)\n");
    let _ = writeln!(out, "pin_sck={}", s.pins.sck);
    let _ = writeln!(out, "pin_mosi={}", s.pins.mosi);
    let _ = writeln!(out, "pin_miso={}", s.pins.miso);
    let _ = writeln!(out, "pin_cs={}", s.pins.cs);
    let _ = writeln!(out, "pin_reset={}", s.pins.reset);
    out.push_str("\n# MCP23S17 hardware addresses (0-7)\n");
    let _ = writeln!(out, "operand_dev={}", s.operand_dev);
    let _ = writeln!(out, "result_dev={}", s.result_dev);
    let _ = writeln!(out, "verify_writes={}", s.verify_writes);
    out.push_str("\n# result sampling\n");
    let _ = writeln!(out, "settle_reads={}", s.settle_reads);
    let _ = writeln!(out, "stable_reads={}", s.stable_reads);
    out
}

// Simulated relay adder board behind the bit-bang port
//
// Decodes the raw pin samples the port writes: /RESET and /CS levels, SCK
// edges, MOSI on the rising edge. Frames go to two MCP23S17 register files
// (both bank layouts, HAEN, IPOL, OLAT, sequential addressing). MISO changes
// on the falling SCK edge like the real part. Between the two expanders sits
// the adder: operand port outputs in, active-low relay contacts out.
//
// Faults for testing: relay settling delay, a disconnected board (MISO floats
// high, nothing answers) and stray low contacts on the carry port.

use log::debug;

use crate::config::Settings;
use crate::drivers::bitbang::{BitBangIo, IoError};
use crate::drivers::mcp23s17::{Bank, Register, Side, iocon};

const REGISTER_COUNT: usize = Register::ALL.len();

#[derive(Debug, Clone)]
struct Chip {
    addr: u8,
    regs: [[u8; 2]; REGISTER_COUNT],
}

impl Chip {
    fn new(addr: u8) -> Self {
        let mut chip = Self {
            addr,
            regs: [[0; 2]; REGISTER_COUNT],
        };
        chip.reset();
        chip
    }

    // power-on state: everything input, BANK=0, HAEN=0
    fn reset(&mut self) {
        self.regs = [[0; 2]; REGISTER_COUNT];
        self.regs[Register::Iodir as usize] = [0xFF, 0xFF];
    }

    fn reg(&self, reg: Register, side: Side) -> u8 {
        self.regs[reg as usize][side as usize]
    }

    fn bank(&self) -> Bank {
        Bank::from_iocon(self.reg(Register::Iocon, Side::A))
    }

    fn responds_to(&self, hw: u8) -> bool {
        if self.reg(Register::Iocon, Side::A) & iocon::HAEN != 0 {
            hw == self.addr
        } else {
            hw == 0
        }
    }

    // SEQOP=1 keeps the address pointer on one register
    fn next_addr(&self, addr: u8) -> u8 {
        if self.reg(Register::Iocon, Side::A) & iocon::SEQOP != 0 {
            addr
        } else {
            (addr + 1) & 0x1F
        }
    }

    // Physical pin levels: driven outputs, external levels on inputs.
    fn pins(&self, side: Side, external: u8) -> u8 {
        let inputs = self.reg(Register::Iodir, side);
        (self.reg(Register::Olat, side) & !inputs) | (external & inputs)
    }

    fn read(&self, addr: u8, external: [u8; 2]) -> u8 {
        match Register::decode(addr, self.bank()) {
            Some((Register::Gpio, side)) => {
                let inverted = self.reg(Register::Ipol, side) & self.reg(Register::Iodir, side);
                self.pins(side, external[side as usize]) ^ inverted
            }
            Some((reg, side)) => self.reg(reg, side),
            None => 0,
        }
    }

    fn write(&mut self, addr: u8, value: u8) {
        match Register::decode(addr, self.bank()) {
            // one IOCON shared by both ports
            Some((Register::Iocon, _)) => self.regs[Register::Iocon as usize] = [value; 2],
            Some((Register::Gpio | Register::Olat, side)) => {
                self.regs[Register::Olat as usize][side as usize] = value
            }
            Some((Register::Intf | Register::Intcap, _)) | None => {}
            Some((reg, side)) => self.regs[reg as usize][side as usize] = value,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Frame {
    shift: u8,
    bits: u8,
    bytes: u8,
    opcode: u8,
    addr: u8,
    out: u8,
    out_bits: u8,
}

impl Frame {
    fn valid(&self) -> bool {
        self.bytes > 0 && self.opcode & 0xF0 == 0x40
    }

    fn reading(&self) -> bool {
        self.opcode & 1 == 1
    }

    fn hw(&self) -> u8 {
        (self.opcode >> 1) & 0x7
    }

    fn in_read_data(&self) -> bool {
        self.valid() && self.reading() && self.bytes >= 2
    }
}

#[derive(Debug, Clone, Copy)]
struct Lines {
    sck: u8,
    mosi: u8,
    miso: u8,
    cs: u8,
    reset: u8,
}

pub struct RelayAdderSim {
    lines: Lines,
    operand_dev: u8,
    result_dev: u8,
    chips: Vec<Chip>,
    last: u8,
    frame: Option<Frame>,
    miso: bool,
    connected: bool,
    stray_bits: u8,
    relay_delay: u32,
    remaining: u32,
    target: u16,
    shown: u16,
    latched: u16,
    samples: usize,
}

impl RelayAdderSim {
    pub fn new(settings: &Settings) -> Self {
        let p = settings.pins;
        let mut chips = vec![Chip::new(settings.operand_dev)];
        if settings.result_dev != settings.operand_dev {
            chips.push(Chip::new(settings.result_dev));
        }
        Self {
            lines: Lines {
                sck: 1 << p.sck,
                mosi: 1 << p.mosi,
                miso: 1 << p.miso,
                cs: 1 << p.cs,
                reset: 1 << p.reset,
            },
            operand_dev: settings.operand_dev,
            result_dev: settings.result_dev,
            chips,
            last: 0,
            frame: None,
            miso: true,
            connected: true,
            stray_bits: 0,
            relay_delay: 0,
            remaining: 0,
            target: 0,
            shown: 0,
            latched: 0,
            samples: 0,
        }
    }

    /// Result reads that see bouncing contacts after the operands change.
    pub fn set_relay_delay(&mut self, reads: u32) {
        self.relay_delay = reads;
    }

    /// Pulls carry-port contacts low that no relay drives.
    pub fn set_stray_bits(&mut self, mask: u8) {
        self.stray_bits = mask & !1;
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
        self.miso = true;
    }

    pub fn samples_seen(&self) -> usize {
        self.samples
    }

    /// Register contents of the expander at hardware address `dev`.
    pub fn register(&self, dev: u8, reg: Register, side: Side) -> Option<u8> {
        self.chip(dev).map(|c| c.reg(reg, side))
    }

    /// Levels the operand expander drives into the adder.
    pub fn operands(&self) -> (u8, u8) {
        match self.chip(self.operand_dev) {
            Some(c) => (c.pins(Side::A, 0xFF), c.pins(Side::B, 0xFF)),
            None => (0xFF, 0xFF),
        }
    }

    fn chip(&self, dev: u8) -> Option<&Chip> {
        self.chips.iter().find(|c| c.addr == dev)
    }

    fn clock_in(&mut self, s: u8) {
        self.samples += 1;
        let prev = std::mem::replace(&mut self.last, s);
        if !self.connected {
            return;
        }

        let l = self.lines;
        let rose = |m: u8| prev & m == 0 && s & m != 0;
        let fell = |m: u8| prev & m != 0 && s & m == 0;

        if s & l.reset == 0 {
            if prev & l.reset != 0 {
                debug!("sim: reset asserted");
            }
            self.chips.iter_mut().for_each(Chip::reset);
            self.frame = None;
            self.miso = true;
            return;
        }

        if rose(l.cs) {
            self.frame = None;
            self.miso = true;
            return;
        }
        if fell(l.cs) {
            self.frame = Some(Frame::default());
        }
        if s & l.cs != 0 {
            return;
        }

        if rose(l.sck) {
            self.sck_rise(s & l.mosi != 0);
        } else if fell(l.sck) {
            self.sck_fall();
        }
    }

    fn sck_rise(&mut self, bit: bool) {
        let Some(mut frame) = self.frame else {
            return;
        };

        frame.shift = (frame.shift << 1) | bit as u8;
        frame.bits += 1;
        if frame.in_read_data() {
            frame.out_bits += 1;
        }

        if frame.bits == 8 {
            let byte = frame.shift;
            frame.bits = 0;
            frame.shift = 0;
            match frame.bytes {
                0 => frame.opcode = byte,
                1 => {
                    frame.addr = byte & 0x1F;
                    if frame.valid() && frame.reading() {
                        frame.out = self.read_selected(frame.hw(), frame.addr);
                        frame.out_bits = 0;
                    }
                }
                _ if frame.valid() && !frame.reading() => {
                    self.write_selected(frame.hw(), frame.addr, byte);
                    frame.addr = self.next_addr(frame.hw(), frame.addr);
                }
                _ => {}
            }
            frame.bytes = frame.bytes.saturating_add(1);
        }

        self.frame = Some(frame);
    }

    fn sck_fall(&mut self) {
        let Some(mut frame) = self.frame else {
            return;
        };
        if !frame.in_read_data() {
            return;
        }

        if frame.out_bits >= 8 {
            frame.addr = self.next_addr(frame.hw(), frame.addr);
            frame.out = self.read_selected(frame.hw(), frame.addr);
            frame.out_bits = 0;
        }
        self.miso = (frame.out >> (7 - frame.out_bits)) & 1 == 1;
        self.frame = Some(frame);
    }

    fn next_addr(&self, hw: u8, addr: u8) -> u8 {
        match self.chips.iter().find(|c| c.responds_to(hw)) {
            Some(chip) => chip.next_addr(addr),
            None => (addr + 1) & 0x1F,
        }
    }

    fn read_selected(&mut self, hw: u8, addr: u8) -> u8 {
        let Some(idx) = self.chips.iter().position(|c| c.responds_to(hw)) else {
            return 0xFF; // nobody drives MISO
        };

        let chip_addr = self.chips[idx].addr;
        let external = if chip_addr == self.result_dev {
            let bank = self.chips[idx].bank();
            if Register::decode(addr, bank) == Some((Register::Gpio, Side::A)) {
                self.latch_relays();
            }
            self.relay_contacts()
        } else {
            [0xFF, 0xFF] // pulled up
        };
        self.chips[idx].read(addr, external)
    }

    fn write_selected(&mut self, hw: u8, addr: u8, value: u8) {
        for chip in self.chips.iter_mut().filter(|c| c.responds_to(hw)) {
            chip.write(addr, value);
        }
    }

    // the low-byte read samples the relays; the carry read reuses it
    fn latch_relays(&mut self) {
        let (a, b) = self.operands();
        let target = u16::from(a) + u16::from(b);
        if target != self.target {
            self.target = target;
            self.remaining = self.relay_delay;
        }
        if self.remaining > 0 {
            // contacts still bouncing: one bit off, a different one each read
            self.remaining -= 1;
            self.shown = target ^ (1 << (self.remaining % 9));
        } else {
            self.shown = target;
        }
        self.latched = self.shown;
    }

    // active low: a closed relay pulls its input to ground
    fn relay_contacts(&self) -> [u8; 2] {
        let low = !(self.latched & 0xFF) as u8;
        let carry = ((self.latched >> 8) & 1) as u8;
        [low, !carry & !self.stray_bits]
    }
}

impl BitBangIo for RelayAdderSim {
    fn write(&mut self, samples: &[u8]) -> Result<usize, IoError> {
        for &s in samples {
            self.clock_in(s);
        }
        Ok(samples.len())
    }

    fn read_pins(&mut self) -> Result<u8, IoError> {
        let miso = if self.miso || !self.connected {
            self.lines.miso
        } else {
            0
        };
        Ok((self.last & !self.lines.miso) | miso)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chip_power_on_state() {
        let chip = Chip::new(1);
        assert_eq!(chip.reg(Register::Iodir, Side::A), 0xFF);
        assert_eq!(chip.reg(Register::Iodir, Side::B), 0xFF);
        assert_eq!(chip.bank(), Bank::Paired);
        assert!(chip.responds_to(0));
        assert!(!chip.responds_to(1));
    }

    #[test]
    fn iocon_broadcast_switches_bank_and_addressing() {
        let mut chip = Chip::new(1);
        chip.write(0x0A, iocon::INIT);
        assert_eq!(chip.bank(), Bank::Split);
        assert!(chip.responds_to(1));
        assert!(!chip.responds_to(0));
        assert_eq!(chip.read(0x05, [0; 2]), iocon::INIT);
        assert_eq!(chip.read(0x15, [0; 2]), iocon::INIT);
    }

    #[test]
    fn seqop_holds_the_address_pointer() {
        let mut chip = Chip::new(0);
        chip.write(0x0A, iocon::INIT);
        assert_eq!(chip.next_addr(0x09), 0x0A);
        assert_eq!(chip.next_addr(0x1F), 0x00);
        chip.write(0x05, iocon::INIT | iocon::SEQOP);
        assert_eq!(chip.next_addr(0x09), 0x09);
    }

    #[test]
    fn gpio_reads_outputs_and_inverted_inputs() {
        let mut chip = Chip::new(0);
        chip.write(0x0A, iocon::INIT);
        chip.write(0x00, 0x0F); // low nibble inputs
        chip.write(0x01, 0xFF); // IPOL applies to inputs only
        chip.write(0x09, 0xA0);
        assert_eq!(chip.reg(Register::Olat, Side::A), 0xA0);
        // outputs 0xA0, inputs 0b0101 inverted -> 0b1010
        assert_eq!(chip.read(0x09, [0x05, 0]), 0xAA);
    }

    #[test]
    fn relay_contacts_are_active_low() {
        let mut sim = RelayAdderSim::new(&Settings::defaults());
        sim.latched = 0x123;
        assert_eq!(sim.relay_contacts(), [!0x23, 0xFE]);
        sim.set_stray_bits(0x81);
        assert_eq!(sim.relay_contacts(), [!0x23, 0x7E]);
    }

    #[test]
    fn relay_delay_bounces_before_the_sum() {
        let mut sim = RelayAdderSim::new(&Settings::defaults());
        sim.set_relay_delay(2);
        // operand chip still at power-on: inputs float high -> 0xFF + 0xFF
        sim.latch_relays();
        assert_eq!(sim.latched, 510 ^ 0b10);
        sim.latch_relays();
        assert_eq!(sim.latched, 510 ^ 0b01);
        sim.latch_relays();
        assert_eq!(sim.latched, 510);
        sim.latch_relays();
        assert_eq!(sim.latched, 510);
    }

    #[test]
    fn disconnected_board_floats_miso() {
        let mut sim = RelayAdderSim::new(&Settings::defaults());
        sim.disconnect();
        sim.write(&[0x00, 0x28]).unwrap();
        assert_eq!(sim.read_pins().unwrap(), 0x28 | 0x04);
        assert_eq!(sim.samples_seen(), 2);
    }
}

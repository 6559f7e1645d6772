//! Bit-banged I2C EEPROM (8 KB).
//!
//! The CPU toggles two IO port lines (data = bit 2, clock = bit 3 of register
//! 0x61). Every change is fed to [`Eeprom::write_io`], which decodes the
//! framing edge by edge:
//!
//! - Start: data falls while clock is high
//! - Stop: data rises while clock is high
//! - each clock rise while listening shifts one bit, MSB first; the ninth
//!   rise is the acknowledge slot and hands the byte to the operation state
//!   machine
//!
//! A transaction is `device(0xA0) addr_hi addr_lo data...` for writes, or a
//! repeated start followed by `device(0xA1)` and clocked-out bytes for reads.

use crate::savestate::EepromState;
use log::warn;

/// Backing store size.
pub const EEPROM_SIZE: usize = 8192;
const ADDR_MASK: u16 = (EEPROM_SIZE - 1) as u16;
/// Upper seven bits of the device-select byte.
const DEVICE_CLASS: u8 = 0x50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listen {
    Idle,
    Listening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Device,
    AddrHi,
    AddrLo,
    WriteByte,
    ReadByte,
}

pub struct Eeprom {
    pub data: Vec<u8>,
    last_sda: bool,
    last_scl: bool,
    listen: Listen,
    op: Op,
    /// 8 before the first bit, 0 in the ack slot, -1 once the byte is done.
    bit: i8,
    shift_in: u8,
    shift_out: u8,
    addr: u16,
    /// Set on every committed write; cleared by whoever persists the store.
    pub written: bool,
}

impl Eeprom {
    pub fn new() -> Self {
        Eeprom {
            data: vec![0xFF; EEPROM_SIZE],
            last_sda: true,
            last_scl: true,
            listen: Listen::Idle,
            op: Op::Device,
            bit: 8,
            shift_in: 0,
            shift_out: 0,
            addr: 0,
            written: false,
        }
    }

    /// Bus reset; stored bytes survive.
    pub fn reset(&mut self) {
        self.last_sda = true;
        self.last_scl = true;
        self.listen = Listen::Idle;
        self.op = Op::Device;
        self.bit = 8;
        self.shift_in = 0;
        self.shift_out = 0;
    }

    /// Replace the store contents; short images are padded with 0xFF.
    pub fn load(&mut self, image: &[u8]) {
        let n = image.len().min(EEPROM_SIZE);
        self.data[..n].copy_from_slice(&image[..n]);
        self.data[n..].fill(0xFF);
        self.written = false;
    }

    pub fn address(&self) -> u16 {
        self.addr
    }

    /// Feed the current line levels; acts on edges only.
    pub fn write_io(&mut self, sda: bool, scl: bool) {
        let (old_sda, old_scl) = (self.last_sda, self.last_scl);
        self.last_sda = sda;
        self.last_scl = scl;

        if scl && old_scl {
            if old_sda && !sda {
                // Start (or repeated start): address is kept
                self.listen = Listen::Listening;
                self.op = Op::Device;
                self.bit = 8;
                self.shift_in = 0;
                return;
            }
            if !old_sda && sda {
                self.listen = Listen::Idle;
                return;
            }
        }

        if self.listen == Listen::Listening && scl && !old_scl {
            self.bit -= 1;
            if self.bit >= 0 {
                self.shift_in = (self.shift_in << 1) | sda as u8;
            } else {
                let byte = self.shift_in;
                self.bit = 8;
                self.shift_in = 0;
                self.eeprom_write_byte(byte);
            }
        }
    }

    /// Level the EEPROM drives on the data line (true = released).
    pub fn read_io(&self) -> bool {
        if self.listen != Listen::Listening {
            return true;
        }
        match (self.op, self.bit) {
            (Op::ReadByte, 1..=8) => (self.shift_out >> (self.bit - 1)) & 1 != 0,
            (Op::ReadByte, _) => true,
            // Acknowledge slot
            (_, 0) => false,
            _ => true,
        }
    }

    /// Advance the operation state machine with one completed byte.
    pub fn eeprom_write_byte(&mut self, byte: u8) {
        match self.op {
            Op::Device => {
                if byte >> 1 != DEVICE_CLASS {
                    warn!("eeprom: unexpected device select {:#04x}", byte);
                    self.listen = Listen::Idle;
                    return;
                }
                if byte & 1 != 0 {
                    self.op = Op::ReadByte;
                    self.shift_out = self.data[self.addr as usize];
                } else {
                    self.op = Op::AddrHi;
                }
            }
            Op::AddrHi => {
                self.addr = (((byte & 0x1F) as u16) << 8) | (self.addr & 0x00FF);
                self.op = Op::AddrLo;
            }
            Op::AddrLo => {
                self.addr = (self.addr & 0x1F00) | byte as u16;
                self.op = Op::WriteByte;
            }
            Op::WriteByte => {
                self.data[self.addr as usize] = byte;
                self.addr = (self.addr + 1) & ADDR_MASK;
                self.written = true;
            }
            Op::ReadByte => {
                // Master clocked the byte out and acknowledged
                self.addr = (self.addr + 1) & ADDR_MASK;
                self.shift_out = self.data[self.addr as usize];
            }
        }
    }

    /// Protocol fields only; the store itself is saved separately.
    pub fn save_state(&self) -> EepromState {
        EepromState {
            last_sda: self.last_sda,
            last_scl: self.last_scl,
            listening: self.listen == Listen::Listening,
            op: match self.op {
                Op::Device => 0,
                Op::AddrHi => 1,
                Op::AddrLo => 2,
                Op::WriteByte => 3,
                Op::ReadByte => 4,
            },
            bit: self.bit,
            shift_in: self.shift_in,
            shift_out: self.shift_out,
            addr: self.addr,
        }
    }

    pub fn load_state(&mut self, s: &EepromState) {
        self.last_sda = s.last_sda;
        self.last_scl = s.last_scl;
        self.listen = if s.listening { Listen::Listening } else { Listen::Idle };
        self.op = match s.op {
            1 => Op::AddrHi,
            2 => Op::AddrLo,
            3 => Op::WriteByte,
            4 => Op::ReadByte,
            _ => Op::Device,
        };
        self.bit = s.bit.clamp(-1, 8);
        self.shift_in = s.shift_in;
        self.shift_out = s.shift_out;
        self.addr = s.addr & ADDR_MASK;
    }
}

impl Default for Eeprom {
    fn default() -> Self {
        Self::new()
    }
}

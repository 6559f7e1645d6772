//! General-purpose IO port and keypad.
//!
//! The port (0x60 direction, 0x61 data, 0x62 misc) carries the EEPROM lines
//! on bits 2 and 3. Lines configured as inputs float high, and the data line
//! reads back as the wired-AND of both drivers. The keypad register (0x52)
//! is active low: a pressed key reads as 0.

use super::eeprom::Eeprom;
use crate::irq::{Irq, IrqController};
use crate::savestate::IoState;

pub const STATE_SIZE: usize = 16;

const REG_KEYS: u8 = 0x52;
const REG_DIR: u8 = 0x60;
const REG_DATA: u8 = 0x61;
const REG_MISC: u8 = 0x62;

const PIN_SDA: u8 = 0x04;
const PIN_SCL: u8 = 0x08;

/// Keypad buttons, in register bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    A,
    B,
    C,
    Up,
    Down,
    Left,
    Right,
    Power,
}

impl Key {
    pub const ALL: [Key; 8] =
        [Key::A, Key::B, Key::C, Key::Up, Key::Down, Key::Left, Key::Right, Key::Power];

    fn mask(self) -> u8 {
        1 << self as u8
    }

    pub fn irq(self) -> Irq {
        match self {
            Key::A => Irq::KeyA,
            Key::B => Irq::KeyB,
            Key::C => Irq::KeyC,
            Key::Up => Irq::KeyUp,
            Key::Down => Irq::KeyDown,
            Key::Left => Irq::KeyLeft,
            Key::Right => Irq::KeyRight,
            Key::Power => Irq::KeyPower,
        }
    }
}

pub struct IoPort {
    dir: u8,
    data: u8,
    misc: u8,
    /// Active-low key levels as seen on 0x52.
    keys: u8,
    pub eeprom: Eeprom,
}

impl IoPort {
    pub fn new() -> Self {
        IoPort { dir: 0x32, data: 0x64, misc: 0x00, keys: 0xFF, eeprom: Eeprom::new() }
    }

    pub fn reset(&mut self) {
        self.dir = 0x32;
        self.data = 0x64;
        self.misc = 0x00;
        self.keys = 0xFF;
        self.eeprom.reset();
    }

    fn drive_pins(&mut self) {
        let out = !self.dir | self.data;
        self.eeprom.write_io(out & PIN_SDA != 0, out & PIN_SCL != 0);
    }

    pub fn read(&self, addr: u8) -> Option<u8> {
        match addr {
            REG_KEYS => Some(self.keys),
            REG_DIR => Some(self.dir),
            REG_DATA => {
                let master = self.dir & PIN_SDA == 0 || self.data & PIN_SDA != 0;
                let sda = master && self.eeprom.read_io();
                Some((self.data & !PIN_SDA) | if sda { PIN_SDA } else { 0 })
            }
            REG_MISC => Some(self.misc),
            _ => None,
        }
    }

    pub fn write(&mut self, addr: u8, value: u8) -> bool {
        match addr {
            // Keypad levels come from the host, not the CPU
            REG_KEYS => {}
            REG_DIR => {
                self.dir = value;
                self.drive_pins();
            }
            REG_DATA => {
                self.data = value;
                self.drive_pins();
            }
            REG_MISC => self.misc = value,
            _ => return false,
        }
        true
    }

    /// Update a key level; a press raises the key's interrupt.
    pub fn set_key(&mut self, key: Key, pressed: bool, irq: &mut IrqController) {
        let was_pressed = self.keys & key.mask() == 0;
        if pressed {
            self.keys &= !key.mask();
        } else {
            self.keys |= key.mask();
        }
        if pressed && !was_pressed {
            irq.raise(key.irq());
        }
    }

    pub fn is_pressed(&self, key: Key) -> bool {
        self.keys & key.mask() == 0
    }

    pub fn save_state(&self) -> IoState {
        IoState {
            dir: self.dir,
            data: self.data,
            misc: self.misc,
            keys: self.keys,
            eeprom: self.eeprom.save_state(),
        }
    }

    pub fn load_state(&mut self, s: &IoState) {
        self.dir = s.dir;
        self.data = s.data;
        self.misc = s.misc;
        self.keys = s.keys;
        self.eeprom.load_state(&s.eeprom);
    }
}

impl Default for IoPort {
    fn default() -> Self {
        Self::new()
    }
}

//! Flash multicart controller.
//!
//! Homebrew flash cartridges expose a JEDEC-style command interface on the
//! cartridge bus. Two chips are modelled; both run the same bus-cycle state
//! machine and differ only in ID bytes, sector size, and (for the Lupin board)
//! swapped data-line pairs.
//!
//! Supported sequences (addresses compared on their low 11 bits):
//! - `AA@555 55@2AA 90@555`: enter ID mode (reads return mfr / device / 0)
//! - `AA@555 55@2AA A0@555 dd@addr`: program one byte (AND into the cell)
//! - `AA@555 55@2AA 80@555 AA@555 55@2AA 10@555`: chip erase
//! - `AA@555 55@2AA 80@555 AA@555 55@2AA 30@sector`: sector erase
//! - `AA@555 55@2AA 20@555`: unlock bypass (`A0 dd@addr` programs, `90` exits)
//! - `F0` anywhere: reset to read mode
//!
//! A write to 0x1FFFFF selects a 512 KB bank of a larger backing image.

use crate::savestate::MulticartState;
use log::debug;

/// Bank select register (cartridge address).
pub const BANK_SELECT_ADDR: u32 = 0x1F_FFFF;
const BANK_SHIFT: u32 = 19;

const UNLOCK_ADDR1: u32 = 0x555;
const UNLOCK_ADDR2: u32 = 0x2AA;
const JEDEC_MASK: u32 = 0x7FF;

/// Size of the persisted multicart block.
pub const STATE_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MulticartKind {
    /// Plain mask ROM: writes are ignored.
    #[default]
    Disabled,
    /// AMD-compatible flash, 64 KB sectors.
    Flash,
    /// Lupin board, 128 KB sectors, data lines swapped in pairs.
    Lupin,
}

struct ChipProfile {
    manufacturer: u8,
    device: u8,
    sector_shift: u32,
    scrambled: bool,
}

impl MulticartKind {
    fn profile(self) -> ChipProfile {
        match self {
            MulticartKind::Lupin => ChipProfile {
                manufacturer: 0xC2,
                device: 0x5B,
                sector_shift: 17,
                scrambled: true,
            },
            _ => ChipProfile {
                manufacturer: 0x01,
                device: 0x4F,
                sector_shift: 16,
                scrambled: false,
            },
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            MulticartKind::Disabled => 0,
            MulticartKind::Flash => 1,
            MulticartKind::Lupin => 2,
        }
    }
}

/// Swap every adjacent pair of data bits.
#[inline]
fn swap_pairs(b: u8) -> u8 {
    ((b & 0x55) << 1) | ((b & 0xAA) >> 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    None,
    Program,
    Erase,
}

pub struct Multicart {
    pub kind: MulticartKind,
    rom: Vec<u8>,
    mask: u32,
    bus_cycle: u8,
    command: Command,
    bypass: bool,
    get_id: bool,
    bank_offset: u32,
    /// Most recent erase, as an inclusive-exclusive byte range.
    pub last_erase: Option<(u32, u32)>,
    pub last_program: Option<u32>,
    /// Set whenever the backing image changes.
    pub modified: bool,
}

impl Multicart {
    pub fn new(kind: MulticartKind) -> Self {
        Multicart {
            kind,
            rom: vec![0xFF; 0x2000],
            mask: 0x1FFF,
            bus_cycle: 0,
            command: Command::None,
            bypass: false,
            get_id: false,
            bank_offset: 0,
            last_erase: None,
            last_program: None,
            modified: false,
        }
    }

    /// Install a cartridge image. Its length must be a power of two.
    pub fn set_rom(&mut self, rom: Vec<u8>) {
        debug_assert!(rom.len().is_power_of_two());
        self.mask = (rom.len() as u32).wrapping_sub(1);
        self.rom = rom;
        self.modified = false;
        self.reset();
    }

    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    pub fn rom_mut(&mut self) -> &mut [u8] {
        &mut self.rom
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn bank_offset(&self) -> u32 {
        self.bank_offset
    }

    /// Back to read mode, bank 0.
    pub fn reset(&mut self) {
        self.bus_cycle = 0;
        self.command = Command::None;
        self.bypass = false;
        self.get_id = false;
        self.bank_offset = 0;
        self.last_erase = None;
        self.last_program = None;
    }

    pub fn set_kind(&mut self, kind: MulticartKind) {
        self.kind = kind;
        self.reset();
    }

    fn target(&self, addr: u32) -> u32 {
        addr.wrapping_add(self.bank_offset) & self.mask
    }

    pub fn read(&self, addr: u32) -> u8 {
        if self.get_id {
            let profile = self.kind.profile();
            let id = match addr & 0xFF {
                0 => Some(profile.manufacturer),
                1 => Some(profile.device),
                2 => Some(0x00), // sector protect
                _ => None,
            };
            if let Some(id) = id {
                return if profile.scrambled { swap_pairs(id) } else { id };
            }
        }
        self.rom[self.target(addr) as usize]
    }

    fn idle(&mut self) {
        self.bus_cycle = 0;
        self.command = Command::None;
    }

    pub fn write(&mut self, addr: u32, data: u8) {
        if self.kind == MulticartKind::Disabled {
            return;
        }
        if addr == BANK_SELECT_ADDR {
            self.bank_offset = ((data as u32 & 0x0F) << BANK_SHIFT) & self.mask;
            return;
        }

        let profile = self.kind.profile();
        let cmd = if profile.scrambled { swap_pairs(data) } else { data };
        let jaddr = addr & JEDEC_MASK;

        if cmd == 0xF0 && self.bus_cycle != 5 {
            self.get_id = false;
            self.idle();
            return;
        }

        match self.bus_cycle {
            0 => {
                if self.bypass {
                    match cmd {
                        0xA0 => {
                            self.command = Command::Program;
                            self.bus_cycle = 5;
                        }
                        0x90 => self.bypass = false,
                        _ => {}
                    }
                } else if jaddr == UNLOCK_ADDR1 && cmd == 0xAA {
                    self.bus_cycle = 1;
                }
            }
            1 => {
                if jaddr == UNLOCK_ADDR2 && cmd == 0x55 {
                    self.bus_cycle = 2;
                } else {
                    self.idle();
                }
            }
            2 => {
                if jaddr != UNLOCK_ADDR1 {
                    self.idle();
                    return;
                }
                match cmd {
                    0x90 => {
                        self.get_id = true;
                        self.idle();
                    }
                    0xA0 => {
                        self.command = Command::Program;
                        self.bus_cycle = 5;
                    }
                    0x80 => self.bus_cycle = 3,
                    0x20 => {
                        self.bypass = true;
                        self.idle();
                    }
                    _ => self.idle(),
                }
            }
            3 => {
                if jaddr == UNLOCK_ADDR1 && cmd == 0xAA {
                    self.bus_cycle = 4;
                } else {
                    self.idle();
                }
            }
            4 => {
                if jaddr == UNLOCK_ADDR2 && cmd == 0x55 {
                    self.command = Command::Erase;
                    self.bus_cycle = 5;
                } else {
                    self.idle();
                }
            }
            _ => {
                match self.command {
                    Command::Program => self.program(addr, data),
                    Command::Erase => {
                        if cmd == 0x10 && jaddr == UNLOCK_ADDR1 {
                            self.erase_chip();
                        } else if cmd == 0x30 {
                            self.erase_sector(addr, profile.sector_shift);
                        } else {
                            debug!("multicart: bad erase confirm {:#04x}@{:#x}", cmd, addr);
                        }
                    }
                    Command::None => {}
                }
                self.idle();
            }
        }
    }

    /// Flash cells can only go from 1 to 0.
    fn program(&mut self, addr: u32, data: u8) {
        let t = self.target(addr);
        self.rom[t as usize] &= data;
        self.last_program = Some(t);
        self.modified = true;
    }

    fn erase_chip(&mut self) {
        self.rom.fill(0xFF);
        self.last_erase = Some((0, self.rom.len() as u32));
        self.modified = true;
    }

    fn erase_sector(&mut self, addr: u32, shift: u32) {
        let size = 1u32 << shift;
        let start = self.target(addr) & !(size - 1);
        let end = (start + size).min(self.rom.len() as u32);
        self.rom[start as usize..end as usize].fill(0xFF);
        self.last_erase = Some((start, end));
        self.modified = true;
    }

    pub fn save_state(&self) -> MulticartState {
        MulticartState {
            kind: self.kind.to_byte(),
            bus_cycle: self.bus_cycle,
            command: match self.command {
                Command::None => 0,
                Command::Program => 1,
                Command::Erase => 2,
            },
            bypass: self.bypass,
            get_id: self.get_id,
            bank_offset: self.bank_offset,
        }
    }

    /// Restore the command state; the chip kind stays as configured.
    pub fn load_state(&mut self, s: &MulticartState) {
        self.bus_cycle = s.bus_cycle.min(5);
        self.command = match s.command {
            1 => Command::Program,
            2 => Command::Erase,
            _ => Command::None,
        };
        self.bypass = s.bypass;
        self.get_id = s.get_id;
        self.bank_offset = s.bank_offset & self.mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::savestate::{decode_block, encode_block};

    const SECTOR: usize = 0x1_0000;

    fn flash() -> Multicart {
        let mut mc = Multicart::new(MulticartKind::Flash);
        let rom: Vec<u8> = (0..8 * SECTOR).map(|i| (i % 251) as u8).collect();
        mc.set_rom(rom);
        mc
    }

    fn unlock(mc: &mut Multicart) {
        mc.write(0x555, 0xAA);
        mc.write(0x2AA, 0x55);
    }

    #[test]
    fn test_program_ands_bits() {
        let mut mc = flash();
        let addr = 0x1234u32;
        let original = mc.read(addr);
        unlock(&mut mc);
        mc.write(0x555, 0xA0);
        mc.write(addr, 0xF3);
        unlock(&mut mc);
        mc.write(0x555, 0xA0);
        mc.write(addr, 0x3F);
        assert_eq!(mc.read(addr), original & 0xF3 & 0x3F);
        assert_eq!(mc.last_program, Some(addr));
        assert!(mc.modified);
    }

    #[test]
    fn test_program_never_sets_bits() {
        let mut mc = flash();
        for v in [0x00u8, 0x0F, 0xF0, 0xFF] {
            let before = mc.read(0x40);
            unlock(&mut mc);
            mc.write(0x555, 0xA0);
            mc.write(0x40, v);
            assert_eq!(mc.read(0x40) & !before, 0);
        }
    }

    #[test]
    fn test_sector_erase_end_to_end() {
        let mut mc = flash();
        let before = mc.rom().to_vec();
        unlock(&mut mc);
        mc.write(0x555, 0x80);
        unlock(&mut mc);
        mc.write(0x2_1234, 0x30);
        let rom = mc.rom();
        assert!(rom[2 * SECTOR..3 * SECTOR].iter().all(|&b| b == 0xFF));
        assert_eq!(&rom[..2 * SECTOR], &before[..2 * SECTOR]);
        assert_eq!(&rom[3 * SECTOR..], &before[3 * SECTOR..]);
        assert_eq!(mc.last_erase, Some((0x2_0000, 0x3_0000)));
    }

    #[test]
    fn test_chip_erase() {
        let mut mc = flash();
        unlock(&mut mc);
        mc.write(0x555, 0x80);
        unlock(&mut mc);
        mc.write(0x555, 0x10);
        assert!(mc.rom().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_out_of_sequence_byte_resets() {
        // Every prefix of the erase sequence followed by a stray byte
        let seq: [(u32, u8); 5] = [(0x555, 0xAA), (0x2AA, 0x55), (0x555, 0x80), (0x555, 0xAA), (0x2AA, 0x55)];
        for cut in 1..seq.len() {
            let mut mc = flash();
            for &(a, d) in &seq[..cut] {
                mc.write(a, d);
            }
            mc.write(0x123, 0x42);
            assert_eq!(mc.bus_cycle, 0, "cut at {}", cut);
            assert_eq!(mc.command, Command::None);
            // The next plain write must not commit anything
            let before = mc.rom().to_vec();
            mc.write(0x2_0000, 0x30);
            mc.write(0x555, 0x10);
            assert_eq!(mc.rom(), &before[..]);
        }
    }

    #[test]
    fn test_get_id_and_reset() {
        let mut mc = flash();
        let normal = mc.read(0);
        unlock(&mut mc);
        mc.write(0x555, 0x90);
        assert_eq!(mc.read(0), 0x01);
        assert_eq!(mc.read(1), 0x4F);
        assert_eq!(mc.read(2), 0x00);
        mc.write(0, 0xF0);
        assert_eq!(mc.read(0), normal);
    }

    #[test]
    fn test_lupin_scrambles_commands_and_ids() {
        let mut mc = Multicart::new(MulticartKind::Lupin);
        mc.set_rom(vec![0xFF; 8 * 2 * SECTOR]);
        mc.write(0x555, swap_pairs(0xAA));
        mc.write(0x2AA, swap_pairs(0x55));
        mc.write(0x555, swap_pairs(0x90));
        assert_eq!(swap_pairs(mc.read(0)), 0xC2);
        assert_eq!(swap_pairs(mc.read(1)), 0x5B);
        mc.write(0, swap_pairs(0xF0));

        // 128 KB sector
        mc.write(0x555, swap_pairs(0xAA));
        mc.write(0x2AA, swap_pairs(0x55));
        mc.write(0x555, swap_pairs(0xA0));
        mc.write(0x2_0005, 0x00);
        assert_eq!(mc.read(0x2_0005), 0x00);
        mc.write(0x555, swap_pairs(0xAA));
        mc.write(0x2AA, swap_pairs(0x55));
        mc.write(0x555, swap_pairs(0x80));
        mc.write(0x555, swap_pairs(0xAA));
        mc.write(0x2AA, swap_pairs(0x55));
        mc.write(0x3_0000, swap_pairs(0x30));
        assert_eq!(mc.last_erase, Some((0x2_0000, 0x4_0000)));
        assert_eq!(mc.read(0x2_0005), 0xFF);
    }

    #[test]
    fn test_unlock_bypass() {
        let mut mc = flash();
        unlock(&mut mc);
        mc.write(0x555, 0x20);
        for i in 0..4u32 {
            mc.write(0, 0xA0);
            mc.write(0x100 + i, 0x00);
        }
        assert!((0..4).all(|i| mc.read(0x100 + i) == 0));
        mc.write(0, 0x90);
        mc.write(0, 0xA0);
        mc.write(0x200, 0x00);
        assert_ne!(mc.read(0x200), 0x00);
    }

    #[test]
    fn test_bank_select() {
        let mut mc = Multicart::new(MulticartKind::Flash);
        let mut rom = vec![0u8; 0x20_0000];
        rom[0x08_0010] = 0x77;
        mc.set_rom(rom);
        mc.write(BANK_SELECT_ADDR, 0x01);
        assert_eq!(mc.bank_offset(), 0x08_0000);
        assert_eq!(mc.read(0x10), 0x77);

        let mut plain = Multicart::new(MulticartKind::Disabled);
        plain.set_rom(vec![0u8; 0x20_0000]);
        plain.write(BANK_SELECT_ADDR, 0x01);
        assert_eq!(plain.bank_offset(), 0);
    }

    #[test]
    fn test_disabled_ignores_writes() {
        let mut mc = Multicart::new(MulticartKind::Disabled);
        mc.set_rom(vec![0xFF; 0x1_0000]);
        unlock(&mut mc);
        mc.write(0x555, 0xA0);
        mc.write(0x10, 0x00);
        assert_eq!(mc.read(0x10), 0xFF);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut mc = flash();
        unlock(&mut mc);
        mc.write(0x555, 0x90);
        let blob = encode_block(&mc.save_state()).unwrap();
        assert_eq!(blob.len(), STATE_SIZE);
        let mut other = flash();
        other.load_state(&decode_block(&blob).unwrap());
        assert_eq!(other.read(1), 0x4F);
    }
}

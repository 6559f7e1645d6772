//! Pokemon mini memory map.
//!
//! | Address Range     | Content                                    |
//! |-------------------|--------------------------------------------|
//! | 0x000000–0x000FFF | BIOS (4 KB)                                |
//! | 0x001000–0x001FFF | RAM (4 KB)                                 |
//! | 0x002000–0x0020FF | Hardware registers (handled by `Console`)  |
//! | 0x002100–0x1FFFFF | Cartridge window, routed through the flash |
//!
//! The first part of RAM doubles as PRC memory: the framebuffer at 0x1000,
//! the sprite attribute table at 0x1300 and the tile map at 0x1360.

use crate::error::StateError;
use crate::peripherals::{Multicart, MulticartKind};
use log::info;

pub const BIOS_SIZE: usize = 0x1000;
pub const RAM_BASE: u32 = 0x1000;
pub const RAM_SIZE: usize = 0x1000;
pub const IO_BASE: u32 = 0x2000;
pub const CART_BASE: u32 = 0x2100;
/// CPU address bus width.
pub const ADDR_MASK: u32 = 0x1F_FFFF;
/// Largest cartridge image the address window can expose.
pub const MAX_ROM_SIZE: usize = 0x20_0000;

// PRC areas, as offsets into RAM
pub const FRAMEBUFFER: usize = 0x000;
pub const FRAMEBUFFER_SIZE: usize = 0x300;
pub const SPRITE_TABLE: usize = 0x300;
pub const TILE_MAP: usize = 0x360;
pub const TILE_MAP_SIZE: usize = 0x180;

pub struct Memory {
    pub bios: Vec<u8>,
    pub ram: Vec<u8>,
    pub cart: Multicart,
}

impl Memory {
    pub fn new(kind: MulticartKind) -> Self {
        Memory { bios: vec![0xFF; BIOS_SIZE], ram: vec![0xFF; RAM_SIZE], cart: Multicart::new(kind) }
    }

    /// Hard reset wipes RAM; soft reset leaves it alone.
    pub fn reset(&mut self, hard: bool) {
        if hard {
            self.ram.fill(0xFF);
        }
        self.cart.reset();
    }

    /// Install a BIOS image; anything beyond 4 KB is ignored.
    pub fn load_bios(&mut self, image: &[u8]) {
        let n = image.len().min(BIOS_SIZE);
        self.bios[..n].copy_from_slice(&image[..n]);
        self.bios[n..].fill(0xFF);
    }

    /// Install a cartridge image, padding it with 0xFF up to a power of two.
    pub fn load_rom(&mut self, image: &[u8]) -> Result<(), StateError> {
        if image.len() <= CART_BASE as usize || image.len() > MAX_ROM_SIZE {
            return Err(StateError::RomSize(image.len()));
        }
        let size = image.len().next_power_of_two();
        let mut rom = vec![0xFF; size];
        rom[..image.len()].copy_from_slice(image);
        info!("cartridge loaded: {} bytes, window {} bytes", image.len(), size);
        self.cart.set_rom(rom);
        Ok(())
    }

    /// Bus read outside the register window. Register addresses read as 0.
    pub fn read(&self, addr: u32) -> u8 {
        let addr = addr & ADDR_MASK;
        match addr {
            0x0000..=0x0FFF => self.bios[addr as usize],
            0x1000..=0x1FFF => self.ram[(addr - RAM_BASE) as usize],
            0x2000..=0x20FF => 0,
            _ => self.cart.read(addr),
        }
    }

    pub fn write(&mut self, addr: u32, value: u8) {
        let addr = addr & ADDR_MASK;
        match addr {
            0x0000..=0x0FFF => {}
            0x1000..=0x1FFF => self.ram[(addr - RAM_BASE) as usize] = value,
            0x2000..=0x20FF => {}
            _ => self.cart.write(addr, value),
        }
    }

    pub fn framebuffer(&self) -> &[u8] {
        &self.ram[FRAMEBUFFER..FRAMEBUFFER + FRAMEBUFFER_SIZE]
    }

    pub fn framebuffer_mut(&mut self) -> &mut [u8] {
        &mut self.ram[FRAMEBUFFER..FRAMEBUFFER + FRAMEBUFFER_SIZE]
    }

    /// Four-byte sprite attribute entry: x, y, tile, flags.
    pub fn sprite(&self, index: usize) -> [u8; 4] {
        let base = SPRITE_TABLE + index * 4;
        [self.ram[base], self.ram[base + 1], self.ram[base + 2], self.ram[base + 3]]
    }

    pub fn tile_map(&self) -> &[u8] {
        &self.ram[TILE_MAP..TILE_MAP + TILE_MAP_SIZE]
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new(MulticartKind::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_decode() {
        let mut mem = Memory::default();
        mem.bios[0x10] = 0xAB;
        mem.write(0x1000, 0x12);
        mem.write(0x0010, 0x00);
        assert_eq!(mem.read(0x0010), 0xAB);
        assert_eq!(mem.read(0x1000), 0x12);
        assert_eq!(mem.framebuffer()[0], 0x12);
        assert_eq!(mem.read(0x2080), 0);
    }

    #[test]
    fn test_rom_size_limits() {
        let mut mem = Memory::default();
        assert!(matches!(mem.load_rom(&[0; 0x2100]), Err(StateError::RomSize(0x2100))));
        assert!(mem.load_rom(&vec![0; MAX_ROM_SIZE + 1]).is_err());
        assert!(mem.load_rom(&vec![0x11; 0x3000]).is_ok());
        assert_eq!(mem.cart.rom().len(), 0x4000);
        assert_eq!(mem.read(0x2FFF), 0x11);
        assert_eq!(mem.read(0x3000), 0xFF);
        // The window mirrors a small image
        assert_eq!(mem.read(0x6FFF), 0x11);
    }

    #[test]
    fn test_hard_reset_fills_ram() {
        let mut mem = Memory::default();
        mem.ram.fill(0);
        mem.reset(false);
        assert_eq!(mem.ram[5], 0);
        mem.reset(true);
        assert!(mem.ram.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_sprite_entry() {
        let mut mem = Memory::default();
        mem.ram[SPRITE_TABLE + 8..SPRITE_TABLE + 12].copy_from_slice(&[20, 30, 4, 0x08]);
        assert_eq!(mem.sprite(2), [20, 30, 4, 0x08]);
    }
}

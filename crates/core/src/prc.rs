//! Program Rendering Chip (PRC).
//!
//! The PRC composes the tile-map background and up to 24 sprites into the
//! 1bpp framebuffer in RAM, then copies that framebuffer into the LCD
//! controller. Its timing comes from an 8.24 counter running at 65 counts per
//! 72 Hz frame:
//!
//! | Count  | Action                                                   |
//! |--------|----------------------------------------------------------|
//! | 0x01   | frame start, CPU owns RAM                                |
//! | 0x18   | render background and sprites (once per frame)           |
//! | 0x39   | copy framebuffer to LCD, raise `PrcCopy` (once per frame)|
//! | 0x42   | end of frame, raise `PrcFrame`, restart at 0x01          |
//!
//! The rate register selects a frame divider. Frames skipped by the divider
//! only advance the frame counter in the upper nibble of 0x81.
//!
//! ## Memory layout
//!
//! - tile data: 8 bytes per 8×8 tile, one byte per column, bit 0 at the top
//! - framebuffer (0x1000): 8 pages of 96 column bytes
//! - sprite table (0x1300): 24 × `[x, y, tile, flags]`, positions offset by 16
//! - tile map (0x1360): one tile index per cell, row-major

use crate::color_prc::ColorPrc;
use crate::error::StateError;
use crate::fixed;
use crate::irq::{Irq, IrqController};
use crate::lcd::Lcd;
use crate::memory::{Memory, FRAMEBUFFER_SIZE};
use crate::savestate::PrcState;
use crate::{CLOCK_HZ, SCREEN_HEIGHT, SCREEN_WIDTH};
use bitflags::bitflags;
use log::debug;

pub const STATE_SIZE: usize = 32;

/// Counter increment per CPU cycle: 65 counts × 72 frames per second.
pub const COUNT_RATE: u32 = ((((65 * 72) as u64) << 24) / CLOCK_HZ as u64) as u32;

const RENDER_AT: u32 = 0x18 << 24;
const COPY_AT: u32 = 0x39 << 24;
const FRAME_END: u32 = 0x42 << 24;
const FRAME_START: u32 = 0x01 << 24;

/// CPU cycles lost while the PRC owns the bus for a render.
pub const RENDER_STALL: u32 = 8192;
/// CPU cycles lost during the framebuffer copy.
pub const COPY_STALL: u32 = 2048;

pub const SPRITE_COUNT: usize = 24;

/// Frame counter value (upper nibble of 0x81) that makes a frame active,
/// indexed by bits 1-3 of the rate register. Dividers: 3, 6, 9, 12, 2, 4, 6, 8.
const RATE_MATCH: [u8; 8] = [0x20, 0x50, 0x80, 0xB0, 0x10, 0x30, 0x50, 0x70];

const REG_MODE: u8 = 0x80;
const REG_RATE: u8 = 0x81;
const REG_BG_LO: u8 = 0x82;
const REG_BG_MID: u8 = 0x83;
const REG_BG_HI: u8 = 0x84;
const REG_SCROLL_Y: u8 = 0x85;
const REG_SCROLL_X: u8 = 0x86;
const REG_SPR_LO: u8 = 0x87;
const REG_SPR_MID: u8 = 0x88;
const REG_SPR_HI: u8 = 0x89;
const REG_COUNT: u8 = 0x8A;

bitflags! {
    /// Register 0x80.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrcMode: u8 {
        const INVERT_MAP = 0x01;
        const BACKGROUND = 0x02;
        const SPRITES = 0x04;
        const COPY = 0x08;
        const MAP_SIZE = 0x30;
    }
}

bitflags! {
    /// Fourth byte of a sprite table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpriteFlags: u8 {
        const FLIP_X = 0x01;
        const FLIP_Y = 0x02;
        const INVERT = 0x04;
        const ENABLE = 0x08;
    }
}

/// Tile map layout in tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapGeometry {
    pub width: u8,
    pub height: u8,
}

const GEOMETRIES: [MapGeometry; 4] = [
    MapGeometry { width: 12, height: 16 },
    MapGeometry { width: 16, height: 12 },
    MapGeometry { width: 24, height: 8 },
    MapGeometry { width: 24, height: 16 },
];

impl MapGeometry {
    fn from_mode(mode: PrcMode) -> Self {
        GEOMETRIES[((mode & PrcMode::MAP_SIZE).bits() >> 4) as usize]
    }

    /// Accepts only the four layouts the hardware can select.
    pub fn validate(width: u8, height: u8) -> Result<(usize, Self), StateError> {
        GEOMETRIES
            .iter()
            .position(|g| g.width == width && g.height == height)
            .map(|i| (i, GEOMETRIES[i]))
            .ok_or(StateError::MapGeometry { width, height })
    }

    pub fn max_scroll_x(self) -> usize {
        self.width as usize * 8 - SCREEN_WIDTH
    }

    pub fn max_scroll_y(self) -> usize {
        self.height as usize * 8 - SCREEN_HEIGHT
    }
}

/// One composed pixel and the tile it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub on: bool,
    /// Address of the 8-byte tile that produced the pixel, if any.
    pub tile: Option<u32>,
    /// 4×4 quadrant within the tile: bit 0 = right half, bit 1 = bottom half.
    pub quadrant: u8,
    pub sprite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Cpu,
    Rendered,
    Copied,
}

pub struct Prc {
    mode: PrcMode,
    rate: u8,
    rate_match: u8,
    bg_base: u32,
    spr_base: u32,
    scroll_y: u8,
    scroll_x: u8,
    geometry: MapGeometry,
    counter: u32,
    phase: Phase,
    /// Charge render and copy time to the CPU.
    pub stall_enabled: bool,
    stall: u32,
}

impl Prc {
    pub fn new(stall_enabled: bool) -> Self {
        let mut prc = Prc {
            mode: PrcMode::empty(),
            rate: 0,
            rate_match: 0,
            bg_base: 0,
            spr_base: 0,
            scroll_y: 0,
            scroll_x: 0,
            geometry: GEOMETRIES[0],
            counter: FRAME_START,
            phase: Phase::Cpu,
            stall_enabled,
            stall: 0,
        };
        prc.reset();
        prc
    }

    pub fn reset(&mut self) {
        self.mode = PrcMode::empty();
        self.geometry = GEOMETRIES[0];
        self.set_rate(0x07);
        self.rate &= 0x0F;
        self.bg_base = 0;
        self.spr_base = 0;
        self.scroll_y = 0;
        self.scroll_x = 0;
        self.counter = FRAME_START;
        self.phase = Phase::Cpu;
        self.stall = 0;
    }

    fn set_rate(&mut self, value: u8) {
        self.rate = (self.rate & 0xF0) | (value & 0x0F);
        self.rate_match = RATE_MATCH[((value >> 1) & 7) as usize];
    }

    pub fn mode(&self) -> PrcMode {
        self.mode
    }

    pub fn geometry(&self) -> MapGeometry {
        self.geometry
    }

    /// Effective scroll, clamped to the current layout.
    pub fn scroll(&self) -> (usize, usize) {
        (
            (self.scroll_x as usize).min(self.geometry.max_scroll_x()),
            (self.scroll_y as usize).min(self.geometry.max_scroll_y()),
        )
    }

    pub fn bg_base(&self) -> u32 {
        self.bg_base
    }

    pub fn sprite_base(&self) -> u32 {
        self.spr_base
    }

    /// Whole part of the frame counter, as read from 0x8A.
    pub fn count(&self) -> u8 {
        fixed::whole(self.counter)
    }

    /// Stall cycles accumulated since the last call.
    pub fn take_stall(&mut self) -> u32 {
        std::mem::take(&mut self.stall)
    }

    pub fn read(&self, addr: u8) -> Option<u8> {
        let v = match addr {
            REG_MODE => self.mode.bits(),
            REG_RATE => self.rate,
            REG_BG_LO => self.bg_base as u8,
            REG_BG_MID => (self.bg_base >> 8) as u8,
            REG_BG_HI => (self.bg_base >> 16) as u8,
            REG_SCROLL_Y => self.scroll_y,
            REG_SCROLL_X => self.scroll_x,
            REG_SPR_LO => self.spr_base as u8,
            REG_SPR_MID => (self.spr_base >> 8) as u8,
            REG_SPR_HI => (self.spr_base >> 16) as u8,
            REG_COUNT => self.count(),
            _ => return None,
        };
        Some(v)
    }

    pub fn write(&mut self, addr: u8, value: u8) -> bool {
        match addr {
            REG_MODE => {
                self.mode = PrcMode::from_bits_truncate(value);
                self.geometry = MapGeometry::from_mode(self.mode);
            }
            REG_RATE => self.set_rate(value),
            REG_BG_LO => self.bg_base = (self.bg_base & 0x1F_FF00) | (value & 0xF8) as u32,
            REG_BG_MID => self.bg_base = (self.bg_base & 0x1F_00FF) | (value as u32) << 8,
            REG_BG_HI => self.bg_base = (self.bg_base & 0x00_FFFF) | ((value & 0x1F) as u32) << 16,
            REG_SCROLL_Y => self.scroll_y = value & 0x7F,
            REG_SCROLL_X => self.scroll_x = value & 0x7F,
            REG_SPR_LO => self.spr_base = (self.spr_base & 0x1F_FF00) | (value & 0xC0) as u32,
            REG_SPR_MID => self.spr_base = (self.spr_base & 0x1F_00FF) | (value as u32) << 8,
            REG_SPR_HI => self.spr_base = (self.spr_base & 0x00_FFFF) | ((value & 0x1F) as u32) << 16,
            REG_COUNT => {}
            _ => return false,
        }
        true
    }

    /// Advance the frame counter. Returns true when a 72 Hz frame ended.
    pub fn sync(
        &mut self,
        cycles: u32,
        mem: &mut Memory,
        lcd: &mut Lcd,
        color: &mut ColorPrc,
        irq: &mut IrqController,
    ) -> bool {
        let mut frame_done = false;
        for chunk in fixed::chunks(cycles) {
            self.counter = self.counter.wrapping_add(COUNT_RATE * chunk);

            if self.rate & 0xF0 < self.rate_match {
                // Frame skipped by the divider
                if self.counter >= FRAME_END {
                    self.counter = FRAME_START;
                    self.phase = Phase::Cpu;
                    self.rate = self.rate.wrapping_add(0x10);
                    frame_done = true;
                }
                continue;
            }

            if self.phase == Phase::Cpu && self.counter >= RENDER_AT {
                self.phase = Phase::Rendered;
                if self.mode.intersects(PrcMode::BACKGROUND | PrcMode::SPRITES) {
                    self.charge(RENDER_STALL);
                    if color.syncs_framebuffer() {
                        self.render(mem);
                    }
                    if color.is_active() {
                        if color.syncs_prc() {
                            color.render(self, mem);
                        } else {
                            color.skip_frame();
                        }
                    }
                } else if color.is_active() {
                    color.skip_frame();
                }
            }

            if self.phase == Phase::Rendered && self.counter >= COPY_AT {
                self.phase = Phase::Copied;
                if self.mode.intersects(PrcMode::BACKGROUND | PrcMode::SPRITES | PrcMode::COPY) {
                    self.charge(COPY_STALL);
                    if color.syncs_lcd() {
                        lcd.write_framebuffer(mem.framebuffer());
                    }
                    irq.raise(Irq::PrcCopy);
                }
            }

            if self.counter >= FRAME_END {
                self.counter = FRAME_START;
                self.phase = Phase::Cpu;
                self.rate &= 0x0F;
                irq.raise(Irq::PrcFrame);
                frame_done = true;
            }
        }
        frame_done
    }

    fn charge(&mut self, cycles: u32) {
        if self.stall_enabled {
            self.stall += cycles;
        }
    }

    /// Render background and sprites into the RAM framebuffer.
    pub fn render(&self, mem: &mut Memory) {
        let mut fb = [0u8; FRAMEBUFFER_SIZE];
        self.compose(mem, |x, y, frag| {
            let byte = &mut fb[(y / 8) * SCREEN_WIDTH + x];
            let bit = 1 << (y & 7);
            if frag.on {
                *byte |= bit;
            } else {
                *byte &= !bit;
            }
        });
        mem.framebuffer_mut().copy_from_slice(&fb);
    }

    /// Walk the visible screen, background first, then sprites 23 down to 0.
    /// Later calls for the same pixel overwrite earlier ones.
    pub fn compose(&self, mem: &Memory, mut put: impl FnMut(usize, usize, Fragment)) {
        let (sx, sy) = self.scroll();
        let width = self.geometry.width as usize;
        let map = mem.tile_map();
        let background = self.mode.contains(PrcMode::BACKGROUND);
        let invert = self.mode.contains(PrcMode::INVERT_MAP);

        for y in 0..SCREEN_HEIGHT {
            let my = y + sy;
            for x in 0..SCREEN_WIDTH {
                if !background {
                    put(x, y, Fragment { on: false, tile: None, quadrant: 0, sprite: false });
                    continue;
                }
                let mx = x + sx;
                let index = map[(my / 8) * width + mx / 8] as u32;
                let tile = self.bg_base + index * 8;
                let column = mem.read(tile + (mx & 7) as u32);
                let on = (column >> (my & 7)) & 1 != 0;
                put(
                    x,
                    y,
                    Fragment { on: on ^ invert, tile: Some(tile), quadrant: quadrant(mx, my), sprite: false },
                );
            }
        }

        if self.mode.contains(PrcMode::SPRITES) {
            for index in (0..SPRITE_COUNT).rev() {
                self.compose_sprite(mem, index, &mut put);
            }
        }
    }

    fn compose_sprite(&self, mem: &Memory, index: usize, put: &mut impl FnMut(usize, usize, Fragment)) {
        let [x, y, tile, flags] = mem.sprite(index);
        let flags = SpriteFlags::from_bits_truncate(flags);
        if !flags.contains(SpriteFlags::ENABLE) {
            return;
        }
        let left = (x & 0x7F) as i32 - 16;
        let top = (y & 0x7F) as i32 - 16;
        let base = self.spr_base + tile as u32 * 64;

        for dy in 0..16 {
            let py = top + dy;
            if !(0..SCREEN_HEIGHT as i32).contains(&py) {
                continue;
            }
            let fy = (if flags.contains(SpriteFlags::FLIP_Y) { 15 - dy } else { dy }) as usize;
            for dx in 0..16 {
                let px = left + dx;
                if !(0..SCREEN_WIDTH as i32).contains(&px) {
                    continue;
                }
                let fx = (if flags.contains(SpriteFlags::FLIP_X) { 15 - dx } else { dx }) as usize;
                // Quadrant tiles: mask at +0/+1/+4/+5, data two tiles later
                let mask_tile = (fx / 8) * 4 + fy / 8;
                let column = (fx & 7) as u32;
                let row = fy & 7;
                let mask = mem.read(base + mask_tile as u32 * 8 + column);
                if (mask >> row) & 1 != 0 {
                    continue;
                }
                let data_addr = base + (mask_tile as u32 + 2) * 8;
                let on = (mem.read(data_addr + column) >> row) & 1 != 0;
                put(
                    px as usize,
                    py as usize,
                    Fragment {
                        on: on ^ flags.contains(SpriteFlags::INVERT),
                        tile: Some(data_addr),
                        quadrant: quadrant(fx, fy),
                        sprite: true,
                    },
                );
            }
        }
    }

    pub fn save_state(&self) -> PrcState {
        PrcState {
            mode: self.mode.bits(),
            rate: self.rate,
            bg_base: self.bg_base,
            spr_base: self.spr_base,
            scroll_y: self.scroll_y,
            scroll_x: self.scroll_x,
            map_width: self.geometry.width,
            map_height: self.geometry.height,
            counter: self.counter,
            phase: match self.phase {
                Phase::Cpu => 0,
                Phase::Rendered => 1,
                Phase::Copied => 2,
            },
            stall: self.stall,
        }
    }

    /// Apply a saved state. An unknown map geometry leaves the PRC untouched.
    pub fn load_state(&mut self, s: &PrcState) -> Result<(), StateError> {
        let (layout, geometry) = MapGeometry::validate(s.map_width, s.map_height)?;
        let mode = PrcMode::from_bits_truncate(s.mode);
        self.geometry = geometry;
        // The stored layout wins over stale mode bits
        self.mode = (mode - PrcMode::MAP_SIZE) | PrcMode::from_bits_truncate((layout as u8) << 4);
        self.set_rate(s.rate);
        self.rate = s.rate;
        self.bg_base = s.bg_base & 0x1F_FFF8;
        self.spr_base = s.spr_base & 0x1F_FFC0;
        self.scroll_y = s.scroll_y & 0x7F;
        self.scroll_x = s.scroll_x & 0x7F;
        self.counter = s.counter;
        self.phase = match s.phase {
            1 => Phase::Rendered,
            2 => Phase::Copied,
            _ => Phase::Cpu,
        };
        self.stall = s.stall;
        debug!("prc state restored: mode {:?}, count {:#04x}", self.mode, self.count());
        Ok(())
    }
}

impl Default for Prc {
    fn default() -> Self {
        Self::new(false)
    }
}

fn quadrant(x: usize, y: usize) -> u8 {
    (((y & 4) >> 1) | ((x & 4) >> 2)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color_prc::ColorControl;
    use crate::memory::{RAM_BASE, SPRITE_TABLE, TILE_MAP};
    use crate::peripherals::MulticartKind;
    use crate::savestate::{decode_block, encode_block};

    /// Cycles from frame start to frame end.
    fn frame_cycles() -> u32 {
        (FRAME_END - FRAME_START).div_ceil(COUNT_RATE)
    }

    struct Rig {
        prc: Prc,
        mem: Memory,
        lcd: Lcd,
        color: ColorPrc,
        irq: IrqController,
    }

    impl Rig {
        fn new() -> Self {
            let mut mem = Memory::new(MulticartKind::Disabled);
            mem.bios.fill(0);
            mem.ram.fill(0);
            let mut irq = IrqController::new();
            for a in 0x27..=0x2A {
                irq.write(a, 0xFF);
            }
            Rig { prc: Prc::new(false), mem, lcd: Lcd::new(), color: ColorPrc::default(), irq }
        }

        /// Unlock the color extension and set its control register.
        fn color_control(&mut self, control: ColorControl) {
            self.color.write(0xF0, 0xCA);
            self.color.write(0xF0, 0x53);
            self.color.write(0xF1, control.bits());
        }

        fn run(&mut self, cycles: u32) -> bool {
            self.prc.sync(cycles, &mut self.mem, &mut self.lcd, &mut self.color, &mut self.irq)
        }

        fn pixel(&self, x: usize, y: usize) -> bool {
            self.mem.framebuffer()[(y / 8) * SCREEN_WIDTH + x] >> (y & 7) & 1 != 0
        }
    }

    #[test]
    fn test_count_rate() {
        assert_eq!(COUNT_RATE, 19_629);
        // One frame lasts about 4 MHz / 72
        let frame = frame_cycles();
        assert!((55_500..55_600).contains(&frame), "{}", frame);
    }

    #[test]
    fn test_map_geometry_and_scroll_clamp() {
        let mut prc = Prc::default();
        assert_eq!(prc.geometry(), MapGeometry { width: 12, height: 16 });
        prc.write(REG_SCROLL_X, 0x7F);
        prc.write(REG_SCROLL_Y, 0x7F);
        assert_eq!(prc.scroll(), (0, 64));
        prc.write(REG_MODE, 0x20);
        assert_eq!(prc.geometry(), MapGeometry { width: 24, height: 8 });
        assert_eq!(prc.scroll(), (96, 0));
        assert_eq!(prc.read(REG_SCROLL_X), Some(0x7F));
    }

    #[test]
    fn test_base_registers_masked() {
        let mut prc = Prc::default();
        prc.write(REG_BG_LO, 0xFF);
        prc.write(REG_BG_MID, 0x12);
        prc.write(REG_BG_HI, 0xFF);
        assert_eq!(prc.bg_base(), 0x1F_12F8);
        prc.write(REG_SPR_LO, 0xFF);
        assert_eq!(prc.sprite_base(), 0xC0);
        assert_eq!(prc.read(REG_SPR_LO), Some(0xC0));
    }

    #[test]
    fn test_frame_phases_raise_irqs_once() {
        let mut rig = Rig::new();
        rig.prc.write(REG_MODE, (PrcMode::BACKGROUND | PrcMode::COPY).bits());
        rig.prc.write(REG_RATE, 0x08); // divide by 2
        // First frame is skipped by the divider
        assert!(rig.run(frame_cycles()));
        assert!(!rig.irq.is_active(Irq::PrcCopy));
        assert!(!rig.irq.is_active(Irq::PrcFrame));
        assert_eq!(rig.prc.read(REG_RATE).unwrap() & 0xF0, 0x10);

        let mut frames = 0;
        for _ in 0..frame_cycles() / 64 + 1 {
            if rig.run(64) {
                frames += 1;
            }
        }
        assert_eq!(frames, 1);
        assert!(rig.irq.is_active(Irq::PrcCopy));
        assert!(rig.irq.is_active(Irq::PrcFrame));
        assert_eq!(rig.prc.read(REG_RATE).unwrap() & 0xF0, 0x00);
    }

    #[test]
    fn test_disabled_prc_never_copies() {
        let mut rig = Rig::new();
        rig.prc.write(REG_RATE, 0x08);
        for _ in 0..3 {
            rig.run(frame_cycles());
        }
        assert!(!rig.irq.is_active(Irq::PrcCopy));
        assert!(rig.irq.is_active(Irq::PrcFrame));
    }

    #[test]
    fn test_background_render() {
        let mut rig = Rig::new();
        // Tile 1 in BIOS: column 0 fully set, column 1 only top pixel
        rig.mem.bios[8] = 0xFF;
        rig.mem.bios[9] = 0x01;
        rig.mem.ram[TILE_MAP] = 1;
        rig.prc.write(REG_MODE, PrcMode::BACKGROUND.bits());
        rig.prc.render(&mut rig.mem);
        assert!((0..8).all(|y| rig.pixel(0, y)));
        assert!(rig.pixel(1, 0));
        assert!(!rig.pixel(1, 1));
        assert!(!rig.pixel(8, 0));

        rig.prc.write(REG_MODE, (PrcMode::BACKGROUND | PrcMode::INVERT_MAP).bits());
        rig.prc.render(&mut rig.mem);
        assert!(!rig.pixel(0, 0));
        assert!(rig.pixel(8, 0));
    }

    #[test]
    fn test_background_scroll() {
        let mut rig = Rig::new();
        rig.mem.bios[8] = 0xFF;
        // Map is 12 wide: cell (row 1, col 0)
        rig.mem.ram[TILE_MAP + 12] = 1;
        rig.prc.write(REG_MODE, PrcMode::BACKGROUND.bits());
        rig.prc.write(REG_SCROLL_Y, 8);
        rig.prc.render(&mut rig.mem);
        assert!(rig.pixel(0, 0));
        assert!(!rig.pixel(0, 8));
    }

    fn place_sprite(mem: &mut Memory, index: usize, x: u8, y: u8, tile: u8, flags: SpriteFlags) {
        let e = SPRITE_TABLE + index * 4;
        mem.ram[e..e + 4].copy_from_slice(&[x, y, tile, flags.bits()]);
    }

    #[test]
    fn test_sprite_mask_and_flip() {
        let mut rig = Rig::new();
        rig.prc.write(REG_SPR_MID, 0x08); // sprite tiles at 0x800 in BIOS
        let base = 0x800 + 64; // sprite tile 1
        // Top-left quadrant: opaque column 0, data on at row 0 only
        for i in 0..64 {
            rig.mem.bios[base + i] = 0xFF;
        }
        rig.mem.bios[base] = 0x00; // mask tile 0, column 0 opaque
        rig.mem.bios[base + 16] = 0x01; // data tile 2, column 0
        place_sprite(&mut rig.mem, 0, 16, 16, 1, SpriteFlags::ENABLE);
        rig.prc.write(REG_MODE, PrcMode::SPRITES.bits());
        rig.prc.render(&mut rig.mem);
        assert!(rig.pixel(0, 0));
        assert!(!rig.pixel(0, 1));
        assert!(!rig.pixel(1, 0));

        place_sprite(&mut rig.mem, 0, 16, 16, 1, SpriteFlags::ENABLE | SpriteFlags::FLIP_X);
        rig.prc.render(&mut rig.mem);
        assert!(!rig.pixel(0, 0));
        assert!(rig.pixel(15, 0));

        place_sprite(&mut rig.mem, 0, 16, 16, 1, SpriteFlags::ENABLE | SpriteFlags::FLIP_Y);
        rig.prc.render(&mut rig.mem);
        assert!(rig.pixel(0, 15));
        assert!(!rig.pixel(0, 14));
    }

    #[test]
    fn test_lower_sprite_index_draws_on_top() {
        let mut rig = Rig::new();
        rig.prc.write(REG_SPR_MID, 0x08);
        // Sprite tile 0: all opaque, all off. Sprite tile 1: all opaque, all on.
        for i in 0..64 {
            rig.mem.bios[0x840 + i] = if (i / 8) % 4 >= 2 { 0xFF } else { 0x00 };
        }
        place_sprite(&mut rig.mem, 0, 16, 16, 0, SpriteFlags::ENABLE);
        place_sprite(&mut rig.mem, 5, 16, 16, 1, SpriteFlags::ENABLE);
        rig.prc.write(REG_MODE, PrcMode::SPRITES.bits());
        rig.prc.render(&mut rig.mem);
        assert!(!rig.pixel(3, 3));
        // Disable the front sprite and the back one shows through
        place_sprite(&mut rig.mem, 0, 16, 16, 0, SpriteFlags::empty());
        rig.prc.render(&mut rig.mem);
        assert!(rig.pixel(3, 3));
    }

    #[test]
    fn test_copy_reaches_lcd() {
        let mut rig = Rig::new();
        rig.prc.write(REG_MODE, PrcMode::COPY.bits());
        rig.prc.write(REG_RATE, 0x08);
        rig.mem.write(RAM_BASE, 0xFF);
        rig.lcd.write_ctrl(0xAF);
        rig.run(frame_cycles());
        rig.run(frame_cycles());
        rig.lcd.render();
        assert_eq!(rig.lcd.digital[0], 1);
        assert_eq!(rig.lcd.digital[SCREEN_WIDTH * 7], 1);
    }

    #[test]
    fn test_stall_accounting() {
        let mut rig = Rig::new();
        rig.prc.stall_enabled = true;
        rig.prc.write(REG_MODE, (PrcMode::BACKGROUND | PrcMode::COPY).bits());
        rig.prc.write(REG_RATE, 0x08);
        rig.run(frame_cycles());
        assert_eq!(rig.prc.take_stall(), 0);
        rig.run(frame_cycles());
        assert_eq!(rig.prc.take_stall(), RENDER_STALL + COPY_STALL);
        assert_eq!(rig.prc.take_stall(), 0);
    }

    #[test]
    fn test_framebuffer_sync_bit_gates_render() {
        let mut rig = Rig::new();
        rig.mem.bios[..8].fill(0xFF);
        rig.prc.write(REG_MODE, PrcMode::BACKGROUND.bits());
        rig.prc.write(REG_RATE, 0x08);
        rig.color_control(ColorControl::SYNC_LCD | ColorControl::SYNC_PRC);
        rig.run(frame_cycles());
        rig.run(frame_cycles());
        assert!(rig.mem.framebuffer().iter().all(|&b| b == 0));

        rig.color.write(0xF1, (ColorControl::SYNC_FRAMEBUFFER | ColorControl::SYNC_LCD).bits());
        rig.run(frame_cycles());
        rig.run(frame_cycles());
        assert!(rig.pixel(0, 0));
        assert!(rig.pixel(95, 63));
    }

    #[test]
    fn test_lcd_sync_bit_gates_copy() {
        let mut rig = Rig::new();
        rig.prc.write(REG_MODE, PrcMode::COPY.bits());
        rig.prc.write(REG_RATE, 0x08);
        rig.mem.write(RAM_BASE, 0xFF);
        rig.lcd.write_ctrl(0xAF);
        rig.color_control(ColorControl::SYNC_FRAMEBUFFER | ColorControl::SYNC_PRC);
        rig.run(frame_cycles());
        rig.run(frame_cycles());
        rig.lcd.render();
        assert!(rig.irq.is_active(Irq::PrcCopy));
        assert_eq!(rig.lcd.digital[0], 0);

        rig.color.write(0xF1, ColorControl::SYNC_LCD.bits());
        rig.run(frame_cycles());
        rig.run(frame_cycles());
        rig.lcd.render();
        assert_eq!(rig.lcd.digital[0], 1);
    }

    #[test]
    fn test_prc_sync_bit_gates_color_plane() {
        let mut rig = Rig::new();
        rig.mem.bios[..8].fill(0xFF);
        rig.prc.write(REG_MODE, PrcMode::BACKGROUND.bits());
        rig.prc.write(REG_RATE, 0x08);
        // Post-increment; the renderer reads the page the CPU does not see
        rig.color_control(ColorControl::from_bits_truncate(0x01) | ColorControl::SYNC_FRAMEBUFFER);
        rig.color.write(0xF3, 0x20);
        rig.color.write(0xF2, 0x00);
        rig.color.write(0xF4, 0x11);
        rig.color.write(0xF4, 0x22);
        rig.run(frame_cycles());
        rig.run(frame_cycles());
        assert!(rig.pixel(0, 0));
        assert!(rig.color.plane.iter().all(|&c| c == 0));
        assert_eq!(rig.color.read(0xF7), Some((1 << 1) | 1));

        rig.color.write(0xF1, (ColorControl::SYNC_FRAMEBUFFER | ColorControl::SYNC_PRC).bits());
        rig.run(frame_cycles());
        rig.run(frame_cycles());
        assert!(rig.color.plane.iter().all(|&c| c == 0x22));
    }

    #[test]
    fn test_state_roundtrip_and_geometry_check() {
        let mut prc = Prc::default();
        prc.write(REG_MODE, 0x36);
        prc.write(REG_SCROLL_X, 40);
        let blob = encode_block(&prc.save_state()).unwrap();
        assert_eq!(blob.len(), STATE_SIZE);
        let mut other = Prc::default();
        other.load_state(&decode_block(&blob).unwrap()).unwrap();
        assert_eq!(other.geometry(), MapGeometry { width: 24, height: 16 });
        assert_eq!(other.read(REG_MODE), Some(0x36));
        assert_eq!(other.scroll(), (40, 0));

        let bad = PrcState { map_width: 13, ..prc.save_state() };
        assert!(matches!(
            other.load_state(&bad),
            Err(StateError::MapGeometry { width: 13, height: 16 })
        ));
        assert_eq!(other.read(REG_MODE), Some(0x36));
    }
}

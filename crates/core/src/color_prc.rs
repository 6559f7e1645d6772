//! Color PRC extension.
//!
//! An unofficial add-on that gives every tile a pair of colors (one for
//! clear pixels, one for set pixels) and renders a 96×64 plane of 8-bit color
//! indices alongside the monochrome framebuffer.
//!
//! ## Registers
//!
//! | Addr | Function                                               |
//! |------|--------------------------------------------------------|
//! | 0xF0 | unlock: write 0xCA then 0x53                           |
//! | 0xF1 | control: access mode, sync bits, CVRAM page            |
//! | 0xF2 | CVRAM address low                                      |
//! | 0xF3 | CVRAM address high (6 bits)                            |
//! | 0xF4 | CVRAM data port, auto-advancing per access mode        |
//! | 0xF5 | default color index (0-3)                              |
//! | 0xF6 | default color value                                    |
//! | 0xF7 | status: bit 0 unlocked, bits 1-7 frame counter         |
//!
//! Until the unlock handshake completes every register reads as open bus,
//! and touching any register other than 0xF0 abandons a half-done handshake.
//!
//! While unlocked, the sync bits of 0xF1 choose which paths still run each
//! frame: 0x10 renders the monochrome framebuffer, 0x20 copies it to the LCD
//! and 0x40 renders the color plane along with the PRC. A locked extension
//! leaves every path on.
//!
//! ## Color sources
//!
//! Tile colors come from, in order of preference: the 8 KB CVRAM page not
//! selected for CPU access (while unlocked), a color map loaded from a `MINc`
//! stream, or the four default colors (background clear/set, sprite
//! clear/set). `Color8` stores 2 bytes per tile, `Color4` stores 2 bytes for
//! each 4×4 quadrant.

use crate::error::StateError;
use crate::memory::Memory;
use crate::prc::{Fragment, Prc};
use crate::savestate::ColorPrcState;
use crate::{SCREEN_HEIGHT, SCREEN_WIDTH};
use bitflags::bitflags;
use log::{debug, info, warn};

pub const CVRAM_SIZE: usize = 0x4000;
const PAGE_SIZE: usize = 0x2000;
const CVRAM_MASK: u16 = (CVRAM_SIZE - 1) as u16;
pub const STATE_SIZE: usize = CVRAM_SIZE + 32;

const UNLOCK_FIRST: u8 = 0xCA;
const UNLOCK_SECOND: u8 = 0x53;

const REG_UNLOCK: u8 = 0xF0;
const REG_CONTROL: u8 = 0xF1;
const REG_ADDR_LO: u8 = 0xF2;
const REG_ADDR_HI: u8 = 0xF3;
const REG_DATA: u8 = 0xF4;
const REG_DEFAULT_INDEX: u8 = 0xF5;
const REG_DEFAULT_VALUE: u8 = 0xF6;
const REG_STATUS: u8 = 0xF7;

const MINC_MAGIC: &[u8; 4] = b"MINc";
const MINC_HEADER: usize = 32;
/// A 2 MB cartridge holds at most this many 8-byte tiles.
const MAX_MAP_TILES: u32 = 262_144;
/// Palette fix-up for maps written before the current palette existed.
const LEGACY_REMAP: [u8; 16] = [0, 1, 2, 4, 5, 6, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

const DEFAULT_COLORS: [u8; 4] = [0x00, 0xFF, 0x00, 0xFF];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorFormat {
    #[default]
    Color8,
    Color4,
}

impl ColorFormat {
    pub fn bytes_per_tile(self) -> usize {
        match self {
            ColorFormat::Color8 => 2,
            ColorFormat::Color4 => 8,
        }
    }
}

bitflags! {
    /// Register 0xF1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ColorControl: u8 {
        const ACCESS = 0x03;
        const SYNC_FRAMEBUFFER = 0x10;
        const SYNC_LCD = 0x20;
        const SYNC_PRC = 0x40;
        const PAGE = 0x80;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Fixed,
    PostIncrement,
    PostDecrement,
    PreIncrement,
}

impl AccessMode {
    fn from_control(control: ColorControl) -> Self {
        match (control & ColorControl::ACCESS).bits() {
            0 => AccessMode::Fixed,
            1 => AccessMode::PostIncrement,
            2 => AccessMode::PostDecrement,
            _ => AccessMode::PreIncrement,
        }
    }
}

/// Host-supplied per-tile colors.
#[derive(Debug, Clone)]
struct ColorMap {
    data: Vec<u8>,
    /// Byte offset of the first entry, in map units.
    offset: usize,
    format: ColorFormat,
}

pub struct ColorPrc {
    cvram: Vec<u8>,
    awaiting_second: bool,
    unlocked: bool,
    control: ColorControl,
    addr: u16,
    default_index: u8,
    defaults: [u8; 4],
    frame: u8,
    /// Layout assumed for CVRAM when no color map is loaded.
    pub format: ColorFormat,
    /// Keep the previous plane for temporal blending by the host.
    pub high_color: bool,
    map: Option<ColorMap>,
    pub plane: Vec<u8>,
    pub previous: Vec<u8>,
}

impl ColorPrc {
    pub fn new(format: ColorFormat, high_color: bool) -> Self {
        ColorPrc {
            cvram: vec![0; CVRAM_SIZE],
            awaiting_second: false,
            unlocked: false,
            control: ColorControl::empty(),
            addr: 0,
            default_index: 0,
            defaults: DEFAULT_COLORS,
            frame: 0,
            format,
            high_color,
            map: None,
            plane: vec![0; SCREEN_WIDTH * SCREEN_HEIGHT],
            previous: vec![0; SCREEN_WIDTH * SCREEN_HEIGHT],
        }
    }

    /// Relock the extension. CVRAM is cleared on a hard reset only.
    pub fn reset(&mut self, hard: bool) {
        self.awaiting_second = false;
        self.unlocked = false;
        self.control = ColorControl::empty();
        self.addr = 0;
        self.default_index = 0;
        self.defaults = DEFAULT_COLORS;
        self.frame = 0;
        if hard {
            self.cvram.fill(0);
            self.plane.fill(0);
            self.previous.fill(0);
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// True when a color plane should be produced each frame.
    pub fn is_active(&self) -> bool {
        self.unlocked || self.map.is_some()
    }

    fn syncs(&self, bit: ColorControl) -> bool {
        !self.unlocked || self.control.contains(bit)
    }

    pub fn syncs_framebuffer(&self) -> bool {
        self.syncs(ColorControl::SYNC_FRAMEBUFFER)
    }

    pub fn syncs_lcd(&self) -> bool {
        self.syncs(ColorControl::SYNC_LCD)
    }

    pub fn syncs_prc(&self) -> bool {
        self.syncs(ColorControl::SYNC_PRC)
    }

    pub fn access_mode(&self) -> AccessMode {
        AccessMode::from_control(self.control)
    }

    fn page_xor(&self) -> u16 {
        if self.control.contains(ColorControl::PAGE) {
            PAGE_SIZE as u16
        } else {
            0
        }
    }

    /// Physical CVRAM index for a CPU-visible address.
    fn cvram_index(&self, addr: u16) -> usize {
        ((addr ^ self.page_xor()) & CVRAM_MASK) as usize
    }

    /// Address for the next data-port access, advancing per access mode.
    fn next_data_addr(&mut self) -> usize {
        let addr = match self.access_mode() {
            AccessMode::Fixed => self.addr,
            AccessMode::PostIncrement => {
                let a = self.addr;
                self.addr = (a + 1) & CVRAM_MASK;
                a
            }
            AccessMode::PostDecrement => {
                let a = self.addr;
                self.addr = a.wrapping_sub(1) & CVRAM_MASK;
                a
            }
            AccessMode::PreIncrement => {
                self.addr = (self.addr + 1) & CVRAM_MASK;
                self.addr
            }
        };
        self.cvram_index(addr)
    }

    fn status(&self) -> u8 {
        (self.frame << 1) | self.unlocked as u8
    }

    pub fn read(&mut self, addr: u8) -> Option<u8> {
        if !(REG_UNLOCK..=REG_STATUS).contains(&addr) {
            return None;
        }
        if !self.unlocked {
            if addr == REG_DATA {
                warn!("color prc: CVRAM read while locked");
            }
            self.awaiting_second = false;
            return None;
        }
        let v = match addr {
            REG_UNLOCK => 0x01,
            REG_CONTROL => self.control.bits(),
            REG_ADDR_LO => self.addr as u8,
            REG_ADDR_HI => (self.addr >> 8) as u8,
            REG_DATA => {
                let i = self.next_data_addr();
                self.cvram[i]
            }
            REG_DEFAULT_INDEX => self.default_index,
            REG_DEFAULT_VALUE => self.defaults[self.default_index as usize],
            _ => self.status(),
        };
        Some(v)
    }

    pub fn write(&mut self, addr: u8, value: u8) -> bool {
        if addr == REG_UNLOCK {
            self.unlock_step(value);
            return true;
        }
        if !(REG_CONTROL..=REG_STATUS).contains(&addr) {
            return false;
        }
        if !self.unlocked {
            if addr == REG_DATA {
                warn!("color prc: CVRAM write {:#04x} while locked", value);
            }
            self.awaiting_second = false;
            return true;
        }
        match addr {
            REG_CONTROL => self.control = ColorControl::from_bits_truncate(value),
            REG_ADDR_LO => self.addr = (self.addr & 0x3F00) | value as u16,
            REG_ADDR_HI => self.addr = (self.addr & 0x00FF) | ((value & 0x3F) as u16) << 8,
            REG_DATA => {
                let i = self.next_data_addr();
                self.cvram[i] = value;
            }
            REG_DEFAULT_INDEX => self.default_index = value & 3,
            REG_DEFAULT_VALUE => self.defaults[self.default_index as usize] = value,
            _ => {}
        }
        true
    }

    fn unlock_step(&mut self, value: u8) {
        if self.awaiting_second && value == UNLOCK_SECOND {
            if !self.unlocked {
                debug!("color prc unlocked");
            }
            self.unlocked = true;
            self.awaiting_second = false;
        } else {
            self.awaiting_second = value == UNLOCK_FIRST;
        }
    }

    // ─── Color maps ─────────────────────────────────────────────────────

    /// Parse a `MINc` color information stream.
    ///
    /// Header: magic, version (must be 1), format (0 = Color8, 1 = Color4),
    /// flags, one reserved byte, then little-endian tile count and tile
    /// offset, then 16 reserved bytes. Missing map bytes read as zero.
    pub fn load_color_info(&mut self, data: &[u8]) -> Result<(), StateError> {
        if data.len() < MINC_HEADER {
            return Err(StateError::ColorInfo("truncated header"));
        }
        if &data[0..4] != MINC_MAGIC {
            return Err(StateError::ColorInfo("bad magic"));
        }
        if data[4] != 0x01 {
            return Err(StateError::ColorInfo("unsupported version"));
        }
        let format = match data[5] {
            0 => ColorFormat::Color8,
            1 => ColorFormat::Color4,
            _ => return Err(StateError::ColorInfo("unknown color format")),
        };
        let flags = data[6];
        let tiles = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let offset = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
        if tiles > MAX_MAP_TILES || offset > MAX_MAP_TILES {
            return Err(StateError::ColorInfo("map larger than any cartridge"));
        }
        let body = &data[MINC_HEADER..];
        if body.is_empty() {
            return Err(StateError::ColorInfo("no map data"));
        }

        let bpt = format.bytes_per_tile();
        let mut map = vec![0u8; tiles as usize * bpt];
        let n = map.len().min(body.len());
        map[..n].copy_from_slice(&body[..n]);
        if flags & 1 == 0 {
            for b in map.iter_mut() {
                *b = LEGACY_REMAP[(*b & 0x0F) as usize] | (*b & 0xF0);
            }
        }
        info!("color map loaded: {} tiles ({:?}) at tile offset {}", tiles, format, offset);
        self.map = Some(ColorMap { data: map, offset: offset as usize * bpt, format });
        Ok(())
    }

    pub fn clear_color_info(&mut self) {
        self.map = None;
    }

    /// Format in effect for the next render.
    pub fn active_format(&self) -> ColorFormat {
        match &self.map {
            Some(map) if !self.unlocked => map.format,
            _ => self.format,
        }
    }

    fn lookup(&self, index: usize) -> Option<u8> {
        if self.unlocked {
            let front = PAGE_SIZE - self.page_xor() as usize;
            return (index < PAGE_SIZE).then(|| self.cvram[front + index]);
        }
        let map = self.map.as_ref()?;
        let i = index.checked_sub(map.offset)?;
        map.data.get(i).copied()
    }

    /// Color index for one composed pixel.
    pub fn color_of(&self, frag: &Fragment) -> u8 {
        let slot = (frag.sprite as usize) * 2 + frag.on as usize;
        let Some(tile) = frag.tile else {
            return self.defaults[slot];
        };
        let tile = (tile >> 3) as usize;
        let index = match self.active_format() {
            ColorFormat::Color8 => tile * 2 + frag.on as usize,
            ColorFormat::Color4 => tile * 8 + frag.quadrant as usize * 2 + frag.on as usize,
        };
        self.lookup(index).unwrap_or(self.defaults[slot])
    }

    // ─── Rendering ──────────────────────────────────────────────────────

    pub fn render(&mut self, prc: &Prc, mem: &Memory) {
        if self.high_color {
            self.previous.copy_from_slice(&self.plane);
        }
        let mut plane = std::mem::take(&mut self.plane);
        prc.compose(mem, |x, y, frag| plane[y * SCREEN_WIDTH + x] = self.color_of(&frag));
        self.plane = plane;
        self.frame = self.frame.wrapping_add(1);
    }

    /// Frame bookkeeping when the PRC has nothing to render.
    pub fn skip_frame(&mut self) {
        self.frame = self.frame.wrapping_add(1);
    }

    // ─── Save state ─────────────────────────────────────────────────────

    pub fn save_state(&self) -> ColorPrcState {
        ColorPrcState {
            cvram: self.cvram.clone(),
            awaiting_second: self.awaiting_second,
            unlocked: self.unlocked,
            control: self.control.bits(),
            addr: self.addr,
            default_index: self.default_index,
            defaults: self.defaults,
            frame: self.frame,
        }
    }

    pub fn load_state(&mut self, s: &ColorPrcState) {
        let n = s.cvram.len().min(CVRAM_SIZE);
        self.cvram[..n].copy_from_slice(&s.cvram[..n]);
        self.awaiting_second = s.awaiting_second;
        self.unlocked = s.unlocked;
        self.control = ColorControl::from_bits_truncate(s.control);
        self.addr = s.addr & CVRAM_MASK;
        self.default_index = s.default_index & 3;
        self.defaults = s.defaults;
        self.frame = s.frame;
    }
}

impl Default for ColorPrc {
    fn default() -> Self {
        Self::new(ColorFormat::Color8, false)
    }
}

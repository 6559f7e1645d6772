//! SED1565-style LCD controller.
//!
//! Processes command and data bytes written to registers 0xFE (control) and
//! 0xFF (data) to maintain the controller's internal 132-column display RAM.
//! Eight full pages plus a one-bit icon row are addressable; page numbers
//! 8-15 all alias the icon row.
//!
//! Once per frame the RAM is expanded into a 96×64 digital raster, which is
//! then blended into an analog intensity raster to model pixel ghosting.
//! Intensities are darkness levels: 0 is a blank pixel, 255 fully dark.

use crate::savestate::LcdState;
use crate::{SCREEN_HEIGHT, SCREEN_WIDTH};
use log::debug;

/// Columns of display RAM.
pub const LCD_COLUMNS: usize = 132;
/// Pages of display RAM, the last one being the icon row.
pub const LCD_PAGES: usize = 9;
const ICON_PAGE: usize = 8;
const MAX_COLUMN: u8 = (LCD_COLUMNS - 1) as u8;

const PIXELS: usize = SCREEN_WIDTH * SCREEN_HEIGHT;

/// Dirty count reported after a change that affects every pixel.
pub const DIRTY_FULL: u32 = (SCREEN_WIDTH * SCREEN_HEIGHT / 8) as u32;

/// Size of the persisted LCD block.
pub const STATE_SIZE: usize = LCD_COLUMNS * LCD_PAGES + PIXELS + 32;

/// Off/on darkness for each 6-bit contrast level.
const CONTRAST_CURVE: [(u8, u8); 64] = [
    (0, 64), (0, 70), (0, 76), (0, 82),
    (0, 88), (0, 94), (0, 100), (0, 106),
    (0, 112), (0, 118), (0, 124), (0, 130),
    (0, 136), (0, 142), (0, 148), (0, 154),
    (0, 160), (0, 166), (0, 172), (0, 178),
    (0, 184), (0, 190), (0, 196), (0, 202),
    (0, 208), (0, 214), (0, 220), (0, 226),
    (0, 232), (0, 238), (0, 244), (0, 250),
    (0, 255), (6, 255), (12, 255), (18, 255),
    (24, 255), (30, 255), (36, 255), (42, 255),
    (48, 255), (54, 255), (60, 255), (66, 255),
    (72, 255), (78, 255), (84, 255), (90, 255),
    (96, 255), (102, 255), (108, 255), (114, 255),
    (120, 255), (126, 255), (132, 255), (138, 255),
    (144, 255), (150, 255), (156, 255), (162, 255),
    (168, 255), (174, 255), (180, 255), (186, 255),
];

/// Levels forced by the max-contrast override.
const MAX_CONTRAST_LEVELS: (u8, u8) = (240, 255);

const DEFAULT_CONTRAST: u8 = 0x20;

/// Number of set bits in each 4-bit decay window.
const POPCOUNT4: [u8; 16] = [0, 1, 1, 2, 1, 2, 2, 3, 1, 2, 2, 3, 2, 3, 3, 4];

/// How many past frames contribute to a pixel's shade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LcdMode {
    /// Four-frame window, five shades.
    #[default]
    Analog,
    /// Two-frame window, three shades.
    ThreeShades,
    /// Current frame only.
    TwoShades,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdState {
    Ready,
    SetContrast,
}

pub struct Lcd {
    vram: [[u8; LCD_COLUMNS]; LCD_PAGES],
    column: u8,
    page: u8,
    start_line: u8,
    contrast: u8,
    max_contrast: bool,
    segment_reverse: bool,
    row_reverse: bool,
    set_all: bool,
    invert: bool,
    display_on: bool,
    rmw: bool,
    rmw_column: u8,
    cmd_state: CmdState,
    /// Darkness of an off pixel at the current contrast.
    pub off_level: u8,
    /// Darkness of an on pixel at the current contrast.
    pub on_level: u8,
    pub mode: LcdMode,
    /// One byte per pixel, 0 or 1.
    pub digital: Vec<u8>,
    /// Darkness per pixel after decay.
    pub analog: Vec<u8>,
    history: Vec<u8>,
    /// Changed display bytes since the front end last looked.
    pub dirty: u32,
}

impl Lcd {
    pub fn new() -> Self {
        let mut lcd = Lcd {
            vram: [[0; LCD_COLUMNS]; LCD_PAGES],
            column: 0,
            page: 0,
            start_line: 0,
            contrast: DEFAULT_CONTRAST,
            max_contrast: false,
            segment_reverse: false,
            row_reverse: false,
            set_all: false,
            invert: false,
            display_on: false,
            rmw: false,
            rmw_column: 0,
            cmd_state: CmdState::Ready,
            off_level: 0,
            on_level: 0,
            mode: LcdMode::Analog,
            digital: vec![0; PIXELS],
            analog: vec![0; PIXELS],
            history: vec![0; PIXELS],
            dirty: 0,
        };
        lcd.set_contrast(DEFAULT_CONTRAST);
        lcd
    }

    /// Power-on state. Display RAM is only cleared on a hard reset.
    pub fn reset(&mut self, hard: bool) {
        let mode = self.mode;
        if hard {
            *self = Lcd::new();
            self.mode = mode;
        } else {
            self.soft_reset();
        }
    }

    /// Controller reset command: registers only, RAM untouched.
    fn soft_reset(&mut self) {
        self.column = 0;
        self.page = 0;
        self.start_line = 0;
        self.segment_reverse = false;
        self.row_reverse = false;
        self.set_all = false;
        self.invert = false;
        self.rmw = false;
        self.max_contrast = false;
        self.cmd_state = CmdState::Ready;
        self.set_contrast(DEFAULT_CONTRAST);
    }

    pub fn contrast(&self) -> u8 {
        self.contrast
    }

    pub fn display_on(&self) -> bool {
        self.display_on
    }

    pub fn column(&self) -> u8 {
        self.column
    }

    /// Set the 6-bit contrast and recompute the off/on levels.
    pub fn set_contrast(&mut self, level: u8) {
        self.contrast = level & 0x3F;
        let (off, on) = if self.max_contrast {
            MAX_CONTRAST_LEVELS
        } else {
            CONTRAST_CURVE[self.contrast as usize]
        };
        self.off_level = off;
        self.on_level = on;
        self.dirty = self.dirty.max(DIRTY_FULL);
    }

    fn vram_row(page: u8) -> usize {
        (page as usize).min(ICON_PAGE)
    }

    fn advance_column(&mut self) {
        if self.column < MAX_COLUMN {
            self.column += 1;
        }
    }

    // ─── Register interface ─────────────────────────────────────────────

    /// Status byte: bit6 set for normal segment direction, bit5 set while the
    /// display is off.
    pub fn read_ctrl(&self) -> u8 {
        let mut status = 0;
        if !self.segment_reverse {
            status |= 0x40;
        }
        if !self.display_on {
            status |= 0x20;
        }
        status
    }

    pub fn write_ctrl(&mut self, byte: u8) {
        if self.cmd_state == CmdState::SetContrast {
            self.cmd_state = CmdState::Ready;
            self.set_contrast(byte);
            return;
        }

        match byte {
            0x00..=0x0F => {
                self.column = ((self.column & 0xF0) | byte).min(MAX_COLUMN);
            }
            0x10..=0x1F => {
                self.column = (((byte & 0x0F) << 4) | (self.column & 0x0F)).min(MAX_COLUMN);
            }
            0x20..=0x2F | 0xA8..=0xAB => {
                // Power control / resistor ratio / duty: no visible effect
                debug!("lcd: ignored command {:#04x}", byte);
            }
            0x40..=0x7F => {
                self.start_line = byte & 0x3F;
                self.dirty = self.dirty.max(DIRTY_FULL);
            }
            0x81 => self.cmd_state = CmdState::SetContrast,
            0xA0 => self.segment_reverse = false,
            0xA1 => self.segment_reverse = true,
            0xA2 | 0xA3 => {
                self.max_contrast = byte == 0xA3;
                self.set_contrast(self.contrast);
            }
            0xA4 | 0xA5 => {
                self.set_all = byte == 0xA5;
                self.dirty = self.dirty.max(DIRTY_FULL);
            }
            0xA6 | 0xA7 => {
                self.invert = byte == 0xA7;
                self.dirty = self.dirty.max(DIRTY_FULL);
            }
            0xAE | 0xAF => {
                self.display_on = byte == 0xAF;
                self.dirty = self.dirty.max(DIRTY_FULL);
            }
            0xB0..=0xBF => self.page = byte & 0x0F,
            0xC0..=0xC7 => self.row_reverse = false,
            0xC8..=0xCF => self.row_reverse = true,
            0xE0 => {
                self.rmw = true;
                self.rmw_column = self.column;
            }
            0xEE => {
                self.rmw = false;
                self.column = self.rmw_column;
            }
            0xE2 => self.soft_reset(),
            0xE3 => {} // NOP
            _ => debug!("lcd: undefined command {:#04x}", byte),
        }
    }

    pub fn read_data(&mut self) -> u8 {
        let row = Self::vram_row(self.page);
        let mut value = self.vram[row][self.column as usize];
        if row == ICON_PAGE {
            value &= 1;
        }
        if !self.rmw {
            self.advance_column();
        }
        value
    }

    pub fn write_data(&mut self, byte: u8) {
        let row = Self::vram_row(self.page);
        let value = if row == ICON_PAGE { byte & 1 } else { byte };
        self.vram[row][self.column as usize] = value;
        self.advance_column();
        self.dirty += 1;
    }

    /// Store a composed 96-column, 8-page frame straight into display RAM.
    pub fn write_framebuffer(&mut self, fb: &[u8]) {
        for (page, src) in fb.chunks(SCREEN_WIDTH).take(ICON_PAGE).enumerate() {
            self.vram[page][..src.len()].copy_from_slice(src);
        }
        self.dirty = self.dirty.max(DIRTY_FULL);
    }

    /// Icon segments as a bit field (bit n = column n of the icon row).
    pub fn icons(&self) -> u8 {
        self.vram[ICON_PAGE][..8]
            .iter()
            .enumerate()
            .fold(0, |acc, (i, &b)| acc | ((b & 1) << i))
    }

    pub fn take_dirty(&mut self) -> u32 {
        std::mem::take(&mut self.dirty)
    }

    // ─── Raster ─────────────────────────────────────────────────────────

    /// Expand display RAM into the 96×64 digital raster.
    pub fn render(&mut self) {
        for y in 0..SCREEN_HEIGHT {
            let line = if self.row_reverse { SCREEN_HEIGHT - 1 - y } else { y };
            let ram_row = (line + self.start_line as usize) & 63;
            let (page, bit) = (ram_row >> 3, ram_row & 7);
            for x in 0..SCREEN_WIDTH {
                let col = if self.segment_reverse { LCD_COLUMNS - 1 - x } else { x };
                let mut on = (self.vram[page][col] >> bit) & 1 != 0;
                on ^= self.invert;
                on |= self.set_all;
                on &= self.display_on;
                self.digital[y * SCREEN_WIDTH + x] = on as u8;
            }
        }
    }

    /// Shift every pixel's history and turn it into a darkness level.
    pub fn decay(&mut self) {
        let (off, on) = (self.off_level as u32, self.on_level as u32);
        let range = on as i32 - off as i32;
        for i in 0..PIXELS {
            let h = (self.history[i] >> 1) | (self.digital[i] << 7);
            self.history[i] = h;
            let (lit, steps) = match self.mode {
                LcdMode::Analog => (POPCOUNT4[(h >> 4) as usize] as i32, 4),
                LcdMode::ThreeShades => (POPCOUNT4[(h >> 6) as usize] as i32, 2),
                LcdMode::TwoShades => ((h >> 7) as i32, 1),
            };
            self.analog[i] = (off as i32 + range * lit / steps) as u8;
        }
    }

    // ─── Save state ─────────────────────────────────────────────────────

    pub fn save_state(&self) -> LcdState {
        LcdState {
            vram: self.vram.concat(),
            history: self.history.clone(),
            column: self.column,
            page: self.page,
            start_line: self.start_line,
            contrast: self.contrast,
            max_contrast: self.max_contrast,
            segment_reverse: self.segment_reverse,
            row_reverse: self.row_reverse,
            set_all: self.set_all,
            invert: self.invert,
            display_on: self.display_on,
            rmw: self.rmw,
            rmw_column: self.rmw_column,
            contrast_pending: self.cmd_state == CmdState::SetContrast,
        }
    }

    pub fn load_state(&mut self, s: &LcdState) {
        for (page, src) in self.vram.iter_mut().zip(s.vram.chunks(LCD_COLUMNS)) {
            page[..src.len()].copy_from_slice(src);
        }
        let n = s.history.len().min(PIXELS);
        self.history[..n].copy_from_slice(&s.history[..n]);
        self.column = s.column.min(MAX_COLUMN);
        self.page = s.page & 0x0F;
        self.start_line = s.start_line & 0x3F;
        self.max_contrast = s.max_contrast;
        self.segment_reverse = s.segment_reverse;
        self.row_reverse = s.row_reverse;
        self.set_all = s.set_all;
        self.invert = s.invert;
        self.display_on = s.display_on;
        self.rmw = s.rmw;
        self.rmw_column = s.rmw_column.min(MAX_COLUMN);
        self.cmd_state = if s.contrast_pending { CmdState::SetContrast } else { CmdState::Ready };
        self.set_contrast(s.contrast);
        self.render();
    }
}

impl Default for Lcd {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::savestate::{decode_block, encode_block};

    fn set_column(lcd: &mut Lcd, col: u8) {
        lcd.write_ctrl(0x10 | (col >> 4));
        lcd.write_ctrl(col & 0x0F);
    }

    #[test]
    fn test_column_set_and_clamp() {
        let mut lcd = Lcd::new();
        set_column(&mut lcd, 0x25);
        assert_eq!(lcd.column(), 0x25);
        // 0xFF exceeds the RAM width
        lcd.write_ctrl(0x1F);
        lcd.write_ctrl(0x0F);
        assert_eq!(lcd.column(), 131);
        for _ in 0..10 {
            lcd.write_data(0);
        }
        assert_eq!(lcd.column(), 131);
    }

    #[test]
    fn test_column_never_exceeds_max() {
        let mut lcd = Lcd::new();
        for hi in 0x10..=0x1F {
            for lo in 0x00..=0x0F {
                lcd.write_ctrl(hi);
                lcd.write_ctrl(lo);
                assert!(lcd.column() <= 131);
                lcd.write_data(0xAA);
                lcd.read_data();
                assert!(lcd.column() <= 131);
            }
        }
    }

    #[test]
    fn test_data_roundtrip_and_increment() {
        let mut lcd = Lcd::new();
        lcd.write_ctrl(0xB3);
        set_column(&mut lcd, 10);
        lcd.write_data(0x5A);
        lcd.write_data(0xA5);
        set_column(&mut lcd, 10);
        assert_eq!(lcd.read_data(), 0x5A);
        assert_eq!(lcd.read_data(), 0xA5);
    }

    #[test]
    fn test_icon_page_is_one_bit() {
        let mut lcd = Lcd::new();
        lcd.write_ctrl(0xBC); // aliases the icon row
        set_column(&mut lcd, 3);
        lcd.write_data(0xFF);
        set_column(&mut lcd, 3);
        lcd.write_ctrl(0xB8);
        assert_eq!(lcd.read_data(), 0x01);
        assert_eq!(lcd.icons(), 0x08);
    }

    #[test]
    fn test_read_modify_write() {
        let mut lcd = Lcd::new();
        set_column(&mut lcd, 20);
        lcd.write_ctrl(0xE0);
        let v = lcd.read_data();
        lcd.write_data(v | 1);
        let v = lcd.read_data();
        lcd.write_data(v | 2);
        lcd.write_ctrl(0xEE);
        assert_eq!(lcd.column(), 20);
        assert_eq!(lcd.read_data(), 1);
        assert_eq!(lcd.read_data(), 2);
    }

    #[test]
    fn test_contrast_latch() {
        let mut lcd = Lcd::new();
        lcd.write_ctrl(0x81);
        lcd.write_ctrl(0xFF); // applied as contrast, not as a command
        assert_eq!(lcd.contrast(), 0x3F);
        assert_eq!((lcd.off_level, lcd.on_level), CONTRAST_CURVE[0x3F]);
        lcd.write_ctrl(0xA3);
        assert_eq!((lcd.off_level, lcd.on_level), (240, 255));
        lcd.write_ctrl(0xA2);
        assert_eq!((lcd.off_level, lcd.on_level), CONTRAST_CURVE[0x3F]);
    }

    #[test]
    fn test_status_and_noop_commands() {
        let mut lcd = Lcd::new();
        assert_eq!(lcd.read_ctrl(), 0x60);
        lcd.write_ctrl(0xAF);
        assert_eq!(lcd.read_ctrl(), 0x40);
        lcd.write_ctrl(0xA1);
        assert_eq!(lcd.read_ctrl(), 0x00);
        let col = lcd.column();
        for cmd in [0x20u8, 0x24, 0x2F, 0xA8, 0xAB, 0xE3] {
            lcd.write_ctrl(cmd);
        }
        assert_eq!(lcd.column(), col);
        assert_eq!(lcd.read_ctrl(), 0x00);
    }

    #[test]
    fn test_render_start_line_and_invert() {
        let mut lcd = Lcd::new();
        lcd.write_ctrl(0xAF);
        lcd.write_ctrl(0xB0);
        set_column(&mut lcd, 0);
        lcd.write_data(0x01); // pixel (0, 0)
        lcd.render();
        assert_eq!(lcd.digital[0], 1);

        lcd.write_ctrl(0x41); // start line 1: RAM row 0 wraps to the bottom
        lcd.render();
        assert_eq!(lcd.digital[0], 0);
        assert_eq!(lcd.digital[63 * SCREEN_WIDTH], 1);

        lcd.write_ctrl(0x40);
        lcd.write_ctrl(0xC8);
        lcd.render();
        assert_eq!(lcd.digital[63 * SCREEN_WIDTH], 1);

        lcd.write_ctrl(0xC0);
        lcd.write_ctrl(0xA7);
        lcd.render();
        assert_eq!(lcd.digital[0], 0);
        assert_eq!(lcd.digital[1], 1);

        lcd.write_ctrl(0xAE);
        lcd.render();
        assert!(lcd.digital.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_decay_converges_to_contrast_levels() {
        let mut lcd = Lcd::new();
        lcd.write_ctrl(0xAF);
        lcd.write_ctrl(0x81);
        lcd.write_ctrl(0x30);
        let fb = [0xFFu8; SCREEN_WIDTH * 8];
        lcd.write_framebuffer(&fb);
        lcd.render();
        lcd.decay();
        assert!(lcd.analog[0] < lcd.on_level);
        for _ in 0..8 {
            lcd.decay();
        }
        assert_eq!(lcd.analog[0], lcd.on_level);

        lcd.write_framebuffer(&[0u8; SCREEN_WIDTH * 8]);
        lcd.render();
        for _ in 0..8 {
            lcd.decay();
        }
        assert_eq!(lcd.analog[0], lcd.off_level);
    }

    #[test]
    fn test_decay_shade_steps() {
        let mut lcd = Lcd::new();
        lcd.write_ctrl(0xAF);
        lcd.write_framebuffer(&[0xFFu8; SCREEN_WIDTH * 8]);
        lcd.render();
        let (off, on) = (lcd.off_level as i32, lcd.on_level as i32);
        lcd.decay();
        assert_eq!(lcd.analog[0] as i32, off + (on - off) / 4);

        let mut two = Lcd::new();
        two.mode = LcdMode::TwoShades;
        two.write_ctrl(0xAF);
        two.write_framebuffer(&[0xFFu8; SCREEN_WIDTH * 8]);
        two.render();
        two.decay();
        assert_eq!(two.analog[0], two.on_level);
    }

    #[test]
    fn test_soft_reset_keeps_ram() {
        let mut lcd = Lcd::new();
        set_column(&mut lcd, 5);
        lcd.write_data(0x77);
        lcd.write_ctrl(0xE2);
        assert_eq!(lcd.column(), 0);
        set_column(&mut lcd, 5);
        assert_eq!(lcd.read_data(), 0x77);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut lcd = Lcd::new();
        lcd.write_ctrl(0xAF);
        lcd.write_ctrl(0xB2);
        set_column(&mut lcd, 40);
        lcd.write_data(0x3C);
        let blob = encode_block(&lcd.save_state()).unwrap();
        assert_eq!(blob.len(), STATE_SIZE);
        let mut other = Lcd::new();
        other.load_state(&decode_block(&blob).unwrap());
        assert!(other.display_on());
        other.write_ctrl(0xB2);
        set_column(&mut other, 40);
        assert_eq!(other.read_data(), 0x3C);
    }
}

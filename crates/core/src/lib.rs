//! # pokemini-core
//!
//! Peripheral emulation core for the Pokemon mini handheld.
//!
//! The CPU itself lives outside this crate: a host drives [`Console`] by
//! issuing bus reads and writes and reporting how many cycles each
//! instruction took. Every peripheral advances in lock step with those
//! cycles, using 8.24 fixed-point counters derived from the 4 MHz clock.
//!
//! ## Architecture
//!
//! - [`Console`]: Top-level machine that wires the bus, register window and peripherals
//! - [`Config`]: Host-selected options (LCD shading, audio engine, multicart, color)
//! - [`irq::IrqController`]: Priority groups, enables and pending flags for 26 vectors
//! - [`peripherals`]: Timers, IO port and keypad, EEPROM, cartridge flash
//! - [`memory::Memory`]: BIOS, RAM and the cartridge window
//! - [`prc::Prc`]: Program Rendering Chip (tile map, sprites, framebuffer copy)
//! - [`color_prc::ColorPrc`]: Color PRC extension with its own CVRAM
//! - [`lcd::Lcd`]: LCD controller with multi-frame shading
//! - [`audio::Audio`]: Timer 3 driven tone synthesis and sample FIFO
//! - [`savestate`]: Tagged, compressed machine snapshots
//!
//! ## Register window
//!
//! Addresses 0x2000-0x20FF are hardware registers. Each access is routed to
//! the owning peripheral. The system control (0x00-0x02) and battery (0x10)
//! registers are plain storage loaded from the power-on image on a hard
//! reset; every other unowned address reads back as open bus.

pub mod audio;
pub mod audio_buffer;
pub mod color_prc;
pub mod error;
pub mod fixed;
pub mod irq;
pub mod lcd;
pub mod memory;
pub mod peripherals;
pub mod prc;
pub mod savestate;

pub use audio::{Audio, AudioEngine};
pub use color_prc::{ColorFormat, ColorPrc};
pub use error::StateError;
pub use irq::{Irq, IrqController};
pub use lcd::{Lcd, LcdMode};
pub use memory::Memory;
pub use peripherals::{IoPort, Key, MulticartKind, Timers};
pub use prc::Prc;
pub use savestate::SaveState;

use log::{debug, info, trace};
use memory::{ADDR_MASK, CART_BASE, IO_BASE, RAM_SIZE};
use savestate::{check_size, AudioState, ColorPrcState, IoState, IrqState, LcdState, MulticartState, PrcState, TimersState};
use std::path::Path;

/// CPU clock frequency: 4 MHz
pub const CLOCK_HZ: u32 = 4_000_000;

/// LCD width in pixels
pub const SCREEN_WIDTH: usize = 96;
/// LCD height in pixels
pub const SCREEN_HEIGHT: usize = 64;

/// Size of the hardware register window.
pub const IO_SIZE: usize = 256;

/// Power-on contents of the register window.
const RESET_IMAGE: [u8; IO_SIZE] = reset_image();

const fn reset_image() -> [u8; IO_SIZE] {
    let mut r = [0x00; IO_SIZE];
    // System control
    r[0x00] = 0x7F;
    r[0x01] = 0x20;
    r[0x02] = 0x5C;
    // Battery status
    r[0x10] = 0x08;
    r
}

/// Host options, fixed for the lifetime of a [`Console`].
#[derive(Debug, Clone)]
pub struct Config {
    pub lcd_mode: LcdMode,
    pub audio_engine: AudioEngine,
    pub piezo_filter: bool,
    /// Charge PRC render and copy time to the CPU.
    pub prc_stall: bool,
    pub multicart: MulticartKind,
    pub color_format: ColorFormat,
    pub high_color: bool,
    /// Audio FIFO capacity in samples, rounded up to a power of two.
    pub fifo_size: usize,
    pub fifo_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lcd_mode: LcdMode::Analog,
            audio_engine: AudioEngine::Emulated,
            piezo_filter: true,
            prc_stall: true,
            multicart: MulticartKind::Disabled,
            color_format: ColorFormat::Color8,
            high_color: false,
            fifo_size: 8192,
            fifo_threshold: 4096,
        }
    }
}

/// Main Pokemon mini machine combining all peripherals
pub struct Console {
    pub irq: IrqController,
    pub timers: Timers,
    pub io: IoPort,
    pub mem: Memory,
    pub lcd: Lcd,
    pub prc: Prc,
    pub color: ColorPrc,
    pub audio: Audio,
    /// Backing store for the storage-only registers.
    regs: [u8; IO_SIZE],
    /// Last value seen on the data bus.
    open_bus: u8,
    /// Set when the PRC finishes a 72 Hz frame; cleared by `run_frame`.
    pub frame_ready: bool,
}

impl Console {
    /// Create a machine in power-on state.
    pub fn new(config: &Config) -> Self {
        let mut lcd = Lcd::new();
        lcd.mode = config.lcd_mode;
        let mut console = Console {
            irq: IrqController::new(),
            timers: Timers::new(),
            io: IoPort::new(),
            mem: Memory::new(config.multicart),
            lcd,
            prc: Prc::new(config.prc_stall),
            color: ColorPrc::new(config.color_format, config.high_color),
            audio: Audio::new(
                config.audio_engine,
                config.piezo_filter,
                config.fifo_size,
                config.fifo_threshold,
            ),
            regs: RESET_IMAGE,
            open_bus: 0,
            frame_ready: false,
        };
        console.reset(true);
        console
    }

    /// Reset every peripheral. A soft reset keeps RAM, CVRAM, the EEPROM and
    /// the storage registers.
    pub fn reset(&mut self, hard: bool) {
        if hard {
            self.regs = RESET_IMAGE;
        }
        self.irq.reset();
        self.timers.reset(hard);
        self.io.reset();
        self.mem.reset(hard);
        self.lcd.reset(hard);
        self.prc.reset();
        self.color.reset(hard);
        self.audio.reset();
        self.open_bus = 0;
        self.frame_ready = false;
        debug!("console {} reset", if hard { "hard" } else { "soft" });
    }

    // ─── Media ──────────────────────────────────────────────────────────

    pub fn load_bios(&mut self, image: &[u8]) {
        self.mem.load_bios(image);
    }

    pub fn load_rom(&mut self, image: &[u8]) -> Result<(), StateError> {
        self.mem.load_rom(image)
    }

    /// Cartridge contents, including any flash writes made by the game.
    pub fn rom(&self) -> &[u8] {
        self.mem.cart.rom()
    }

    /// Load the 8 KB EEPROM store; short images are padded with 0xFF.
    pub fn load_eeprom(&mut self, data: &[u8]) {
        self.io.eeprom.load(data);
        self.io.eeprom.written = false;
    }

    pub fn save_eeprom(&self) -> Vec<u8> {
        self.io.eeprom.data.clone()
    }

    /// True once since the last call if the game committed an EEPROM byte.
    pub fn take_eeprom_written(&mut self) -> bool {
        std::mem::take(&mut self.io.eeprom.written)
    }

    pub fn load_color_info(&mut self, data: &[u8]) -> Result<(), StateError> {
        self.color.load_color_info(data)
    }

    // ─── Bus ────────────────────────────────────────────────────────────

    pub fn read(&mut self, addr: u32) -> u8 {
        let addr = addr & ADDR_MASK;
        let value = if (IO_BASE..CART_BASE).contains(&addr) {
            self.read_reg((addr - IO_BASE) as u8)
        } else {
            self.mem.read(addr)
        };
        self.open_bus = value;
        value
    }

    pub fn write(&mut self, addr: u32, value: u8) {
        let addr = addr & ADDR_MASK;
        self.open_bus = value;
        if (IO_BASE..CART_BASE).contains(&addr) {
            self.write_reg((addr - IO_BASE) as u8, value);
        } else {
            self.mem.write(addr, value);
        }
    }

    /// Read a hardware register by its offset in the register window.
    pub fn read_reg(&mut self, reg: u8) -> u8 {
        let value = match reg {
            0x08..=0x0B | 0x18..=0x1D | 0x30..=0x4F => self.timers.read(reg),
            0x20..=0x2A => self.irq.read(reg),
            0x52 | 0x60..=0x62 => self.io.read(reg),
            0x70 | 0x71 => self.audio.read(reg),
            0x80..=0x8F => self.prc.read(reg),
            // Locked color registers float
            0xF0..=0xF7 => return self.color.read(reg).unwrap_or(self.open_bus),
            0xFE => Some(self.lcd.read_ctrl()),
            0xFF => Some(self.lcd.read_data()),
            0x00..=0x02 | 0x10 => Some(self.regs[reg as usize]),
            _ => None,
        };
        value.unwrap_or(self.open_bus)
    }

    pub fn write_reg(&mut self, reg: u8, value: u8) {
        let handled = match reg {
            0x08..=0x0B | 0x18..=0x1D | 0x30..=0x4F => self.timers.write(reg, value),
            0x20..=0x2A => self.irq.write(reg, value),
            0x52 | 0x60..=0x62 => self.io.write(reg, value),
            0x70 | 0x71 => self.audio.write(reg, value),
            0x80..=0x8F => self.prc.write(reg, value),
            0xF0..=0xF7 => self.color.write(reg, value),
            0xFE => {
                self.lcd.write_ctrl(value);
                true
            }
            0xFF => {
                self.lcd.write_data(value);
                true
            }
            0x00..=0x02 | 0x10 => {
                self.regs[reg as usize] = value;
                true
            }
            _ => false,
        };
        if !handled {
            trace!("register {:#04x} <- {:#04x} dropped", reg, value);
        }
    }

    // ─── Scheduling ─────────────────────────────────────────────────────

    /// Advance all peripherals by `cycles` CPU cycles.
    ///
    /// PRC work charged to the CPU is run off immediately, so the return
    /// value can exceed `cycles`.
    pub fn sync(&mut self, cycles: u32) -> u32 {
        let mut spent = 0;
        let mut pending = cycles;
        while pending > 0 {
            for chunk in fixed::chunks(pending) {
                self.timers.sync(chunk, &mut self.irq);
                let timer3 = self.timers.timer3_snapshot();
                self.audio.sync(chunk, &timer3);
                let frame_done =
                    self.prc.sync(chunk, &mut self.mem, &mut self.lcd, &mut self.color, &mut self.irq);
                if frame_done {
                    self.end_frame();
                }
            }
            spent += pending;
            pending = self.prc.take_stall();
        }
        spent
    }

    fn end_frame(&mut self) {
        self.lcd.render();
        self.lcd.decay();
        self.frame_ready = true;
    }

    /// Run CPU steps until the PRC ends a frame. Returns cycles consumed.
    ///
    /// `step` executes one instruction (or interrupt entry) and returns its
    /// cycle count.
    pub fn run_frame(&mut self, mut step: impl FnMut(&mut Console) -> u32) -> u64 {
        self.frame_ready = false;
        let mut total = 0u64;
        while !self.frame_ready {
            let cycles = step(self).max(1);
            total += self.sync(cycles) as u64;
        }
        total
    }

    /// Vector the CPU should service before its next instruction.
    pub fn poll_interrupt(&self) -> Option<u8> {
        self.irq.poll()
    }

    /// Mirror the CPU's interrupt-enable flag and mask level.
    pub fn set_cpu_interrupt_mask(&mut self, enable: bool, level: u8) {
        self.irq.set_master_enable(enable);
        self.irq.set_mask_level(level);
    }

    /// Set key state (true = pressed)
    pub fn set_key(&mut self, key: Key, pressed: bool) {
        self.io.set_key(key, pressed, &mut self.irq);
    }

    /// Fill `out` with audio. Returns the number of samples written.
    pub fn audio_samples(&mut self, out: &mut [i16]) -> usize {
        if self.audio.engine == AudioEngine::Generated {
            self.audio.generate(out);
            out.len()
        } else {
            self.audio.fifo.read_into(out)
        }
    }

    // ─── Save state ─────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Result<SaveState, StateError> {
        let mut state = SaveState { ram: self.mem.ram.clone(), io: self.regs.to_vec(), blocks: Vec::new() };
        state.push_block(&self.irq.save_state())?;
        state.push_block(&self.timers.save_state())?;
        state.push_block(&self.io.save_state())?;
        state.push_block(&self.prc.save_state())?;
        state.push_block(&self.color.save_state())?;
        state.push_block(&self.lcd.save_state())?;
        state.push_block(&self.audio.save_state())?;
        state.push_block(&self.mem.cart.save_state())?;
        Ok(state)
    }

    /// Restore a snapshot. Every block is decoded and checked before
    /// anything changes.
    pub fn restore(&mut self, state: &SaveState) -> Result<(), StateError> {
        check_size("RAM", &state.ram, RAM_SIZE)?;
        check_size("IO", &state.io, IO_SIZE)?;
        let irq: IrqState = state.read_block()?;
        let timers: TimersState = state.read_block()?;
        let io: IoState = state.read_block()?;
        let prc: PrcState = state.read_block()?;
        let color: ColorPrcState = state.read_block()?;
        let lcd: LcdState = state.read_block()?;
        let audio: AudioState = state.read_block()?;
        let cart: MulticartState = state.read_block()?;

        self.prc.load_state(&prc)?;
        self.mem.ram.copy_from_slice(&state.ram);
        self.regs.copy_from_slice(&state.io);
        self.irq.load_state(&irq);
        self.timers.load_state(&timers);
        self.io.load_state(&io);
        self.color.load_state(&color);
        self.lcd.load_state(&lcd);
        self.audio.load_state(&audio);
        self.mem.cart.load_state(&cart);
        self.frame_ready = false;
        Ok(())
    }

    pub fn save_state(&self) -> Result<Vec<u8>, StateError> {
        savestate::encode(&self.snapshot()?)
    }

    pub fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        let state = savestate::decode(data)?;
        self.restore(&state)
    }

    pub fn save_state_file(&self, path: &Path) -> Result<(), StateError> {
        savestate::save_to_file(&self.snapshot()?, path)
    }

    pub fn load_state_file(&mut self, path: &Path) -> Result<(), StateError> {
        let state = savestate::load_from_file(path)?;
        self.restore(&state)?;
        info!("state restored from {}", path.display());
        Ok(())
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

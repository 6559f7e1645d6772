//! Timer bank: three dual 8/16-bit decrementing timers, the 256 Hz timer and
//! the seconds counter.
//!
//! Each timer owns two 8.24 counters (A = lo, B = hi) clocked from one of two
//! oscillators through a 3-bit prescaler. In word mode the halves chain into
//! one 16-bit down counter clocked by the lo half's rate. Timer 3 also has a
//! 16-bit pivot that raises its own interrupt when the count drops past it;
//! in 8-bit mode only the pivot's hi byte is compared with the hi half (the
//! audio synthesizer uses timer 3 as its tone generator).
//!
//! ## Register map
//!
//! | Addr | Register |
//! |------|----------|
//! | 0x08 | seconds control (bit0 run, bit1 reset) |
//! | 0x09-0x0B | seconds count, 24-bit |
//! | 0x18/0x19 | timer 1 scale / oscillator select (0x19 bit5 osc1 enable, bit4 osc2 enable) |
//! | 0x1A/0x1B | timer 2 scale / oscillator select |
//! | 0x1C/0x1D | timer 3 scale / oscillator select |
//! | base+0 | control lo (bit1 reload, bit2 run, bit7 word mode) |
//! | base+1 | control hi (bit1 reload, bit2 run) |
//! | base+2/3 | preset lo/hi |
//! | base+4/5 | pivot lo/hi |
//! | base+6/7 | count lo/hi (read only) |
//! | 0x40 | 256 Hz control (bit0 run, bit1 reset) |
//! | 0x41 | 256 Hz count |
//!
//! Timer bases: 0x30, 0x38 and 0x48.

use crate::fixed::{self, decrement_reloading, reload_value, whole, wrapping_decrement_underflowed, ONE};
use crate::irq::{Irq, IrqController};
use crate::savestate::{TimerState, TimersState};

/// Size of the persisted timer block.
pub const STATE_SIZE: usize = 128;

/// CPU cycles per 256 Hz tick.
pub const HZ256_PERIOD: u32 = 15_625;
/// CPU cycles per seconds-counter tick.
pub const SECOND_PERIOD: u32 = 4_000_000;

// ─── Rate tables ────────────────────────────────────────────────────────────

/// Oscillator 1 (2 MHz) decrement per CPU cycle, indexed by the 4-bit scale
/// field. Bit 3 clear means the prescaler is off.
pub const OSC1_RATES: [u32; 16] = [
    0, 0, 0, 0, 0, 0, 0, 0,
    0x40_0000, // /2
    0x10_0000, // /8
    0x04_0000, // /32
    0x02_0000, // /64
    0x01_0000, // /128
    0x00_8000, // /256
    0x00_2000, // /1024
    0x00_0800, // /4096
];

/// Oscillator 2 (32768 Hz) decrement per CPU cycle.
pub const OSC2_RATES: [u32; 16] = [
    0, 0, 0, 0, 0, 0, 0, 0,
    137_439, // /1
    68_719,  // /2
    34_360,  // /4
    17_180,  // /8
    8_590,   // /16
    4_295,   // /32
    2_147,   // /64
    1_074,   // /128
];

const CTRL_RELOAD: u8 = 0x02;
const CTRL_RUN: u8 = 0x04;
const CTRL_WORD: u8 = 0x80;

const OSC1_ENABLE: u8 = 0x20;
const OSC2_ENABLE: u8 = 0x10;

/// What the audio synthesizer needs to know about timer 3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer3Snapshot {
    pub count: u16,
    pub preset: u16,
    pub pivot: u16,
    /// Decrement per CPU cycle of the counter feeding the output (8.24).
    pub rate: u32,
    pub running: bool,
}

impl Timer3Snapshot {
    /// Counter steps per second.
    pub fn count_freq(&self) -> u32 {
        ((self.rate as u64 * crate::CLOCK_HZ as u64) >> 24) as u32
    }
}

// ─── Single timer ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Timer {
    hi_irq: Irq,
    /// Timer 3 has no lo-underflow vector.
    lo_irq: Option<Irq>,
    a: u32,
    b: u32,
    preset_a: u8,
    preset_b: u8,
    pivot: u16,
    rate_a: u32,
    rate_b: u32,
    ctrl_lo: u8,
    ctrl_hi: u8,
    scale: u8,
    osc: u8,
}

impl Timer {
    fn new(hi_irq: Irq, lo_irq: Option<Irq>) -> Self {
        let mut t = Timer {
            hi_irq,
            lo_irq,
            a: 0,
            b: 0,
            preset_a: 0xFF,
            preset_b: 0xFF,
            pivot: 0,
            rate_a: 0,
            rate_b: 0,
            ctrl_lo: 0,
            ctrl_hi: 0,
            scale: 0,
            osc: 0,
        };
        t.reload_a();
        t.reload_b();
        t
    }

    pub fn word_mode(&self) -> bool {
        self.ctrl_lo & CTRL_WORD != 0
    }

    fn run_a(&self) -> bool {
        self.ctrl_lo & CTRL_RUN != 0
    }

    fn run_b(&self) -> bool {
        self.ctrl_hi & CTRL_RUN != 0
    }

    fn reload_a(&mut self) {
        self.a = reload_value(self.preset_a);
    }

    fn reload_b(&mut self) {
        self.b = reload_value(self.preset_b);
    }

    /// Composed 16-bit count (hi byte from B, lo byte from A).
    pub fn count(&self) -> u16 {
        ((whole(self.b) as u16) << 8) | whole(self.a) as u16
    }

    pub fn preset(&self) -> u16 {
        ((self.preset_b as u16) << 8) | self.preset_a as u16
    }

    /// Count and pivot as the pivot comparator sees them: all 16 bits in
    /// word mode, the hi half alone otherwise.
    fn pivot_compare(&self) -> (u16, u16) {
        if self.word_mode() {
            (self.count(), self.pivot)
        } else {
            (whole(self.b) as u16, self.pivot >> 8)
        }
    }

    fn update_rates(&mut self, osc_enable: u8) {
        let rate = |nibble: u8, use_osc2: bool| -> u32 {
            if use_osc2 {
                if osc_enable & OSC2_ENABLE == 0 { 0 } else { OSC2_RATES[nibble as usize] }
            } else if osc_enable & OSC1_ENABLE == 0 {
                0
            } else {
                OSC1_RATES[nibble as usize]
            }
        };
        self.rate_a = rate(self.scale & 0x0F, self.osc & 1 != 0);
        self.rate_b = rate(self.scale >> 4, self.osc & 2 != 0);
    }

    /// 16-bit chained decrement. Returns the number of full underflows.
    fn step_word(&mut self, mut amount: u32) -> u32 {
        let mut fired = 0;
        loop {
            let before = self.a;
            let after = before.wrapping_sub(amount);
            if !wrapping_decrement_underflowed(before, after) {
                self.a = after;
                return fired;
            }
            amount -= before + 1;
            if whole(self.b) == 0 {
                fired += 1;
                self.reload_a();
                self.reload_b();
            } else {
                self.b -= ONE;
                self.a = u32::MAX;
            }
        }
    }

    fn sync(&mut self, cycles: u32, irq: &mut IrqController) {
        if self.word_mode() {
            if self.run_a() && self.rate_a != 0 && self.step_word(self.rate_a * cycles) > 0 {
                irq.raise(self.hi_irq);
            }
            return;
        }
        if self.run_a() && self.rate_a != 0 {
            let reload = reload_value(self.preset_a);
            if decrement_reloading(&mut self.a, self.rate_a * cycles, reload) > 0 {
                if let Some(lo) = self.lo_irq {
                    irq.raise(lo);
                }
            }
        }
        if self.run_b() && self.rate_b != 0 {
            let reload = reload_value(self.preset_b);
            if decrement_reloading(&mut self.b, self.rate_b * cycles, reload) > 0 {
                irq.raise(self.hi_irq);
            }
        }
    }

    fn write(&mut self, offset: u8, value: u8) {
        match offset {
            0 => {
                if value & CTRL_RELOAD != 0 {
                    self.reload_a();
                    if value & CTRL_WORD != 0 {
                        self.reload_b();
                    }
                }
                self.ctrl_lo = value & !CTRL_RELOAD;
            }
            1 => {
                if value & CTRL_RELOAD != 0 {
                    self.reload_b();
                }
                self.ctrl_hi = value & !CTRL_RELOAD;
            }
            2 => self.preset_a = value,
            3 => self.preset_b = value,
            4 => self.pivot = (self.pivot & 0xFF00) | value as u16,
            5 => self.pivot = (self.pivot & 0x00FF) | ((value as u16) << 8),
            _ => {} // count registers are read only
        }
    }

    fn read(&self, offset: u8) -> u8 {
        match offset {
            0 => self.ctrl_lo,
            1 => self.ctrl_hi,
            2 => self.preset_a,
            3 => self.preset_b,
            4 => self.pivot as u8,
            5 => (self.pivot >> 8) as u8,
            6 => whole(self.a),
            _ => whole(self.b),
        }
    }

    fn save_state(&self) -> TimerState {
        TimerState {
            a: self.a,
            b: self.b,
            preset_a: self.preset_a,
            preset_b: self.preset_b,
            pivot: self.pivot,
            ctrl_lo: self.ctrl_lo,
            ctrl_hi: self.ctrl_hi,
            scale: self.scale,
            osc: self.osc,
        }
    }

    fn load_state(&mut self, s: &TimerState) {
        self.a = s.a;
        self.b = s.b;
        self.preset_a = s.preset_a;
        self.preset_b = s.preset_b;
        self.pivot = s.pivot;
        self.ctrl_lo = s.ctrl_lo & !CTRL_RELOAD;
        self.ctrl_hi = s.ctrl_hi & !CTRL_RELOAD;
        self.scale = s.scale;
        self.osc = s.osc & 0x03;
    }
}

// ─── Bank ───────────────────────────────────────────────────────────────────

pub struct Timers {
    pub timers: [Timer; 3],
    /// Global oscillator enables (register 0x19 bits 4-5).
    osc_enable: u8,
    hz256_ctrl: u8,
    hz256_count: u8,
    hz256_cycles: u32,
    sec_ctrl: u8,
    sec_cycles: u32,
    seconds: u32,
}

impl Timers {
    pub fn new() -> Self {
        Timers {
            timers: [
                Timer::new(Irq::Timer1Hi, Some(Irq::Timer1Lo)),
                Timer::new(Irq::Timer2Hi, Some(Irq::Timer2Lo)),
                Timer::new(Irq::Timer3Hi, None),
            ],
            osc_enable: 0,
            hz256_ctrl: 0,
            hz256_count: 0,
            hz256_cycles: HZ256_PERIOD - 1,
            sec_ctrl: 0x01,
            sec_cycles: SECOND_PERIOD - 1,
            seconds: 0,
        }
    }

    /// Hard reset keeps nothing; the seconds counter survives a soft reset.
    pub fn reset(&mut self, hard: bool) {
        let (sec_ctrl, sec_cycles, seconds) = (self.sec_ctrl, self.sec_cycles, self.seconds);
        *self = Timers::new();
        if !hard {
            self.sec_ctrl = sec_ctrl;
            self.sec_cycles = sec_cycles;
            self.seconds = seconds;
        }
    }

    fn timer_index(addr: u8) -> Option<(usize, u8)> {
        match addr {
            0x30..=0x37 => Some((0, addr - 0x30)),
            0x38..=0x3F => Some((1, addr - 0x38)),
            0x48..=0x4F => Some((2, addr - 0x48)),
            _ => None,
        }
    }

    fn update_rates(&mut self) {
        let osc_enable = self.osc_enable;
        for t in self.timers.iter_mut() {
            t.update_rates(osc_enable);
        }
    }

    pub fn write(&mut self, addr: u8, value: u8) -> bool {
        if let Some((i, offset)) = Self::timer_index(addr) {
            self.timers[i].write(offset, value);
            return true;
        }
        match addr {
            0x08 => {
                if value & 0x02 != 0 {
                    self.seconds = 0;
                    self.sec_cycles = SECOND_PERIOD - 1;
                }
                self.sec_ctrl = value & 0x01;
            }
            0x09..=0x0B => {} // read only
            0x18 | 0x1A | 0x1C => {
                self.timers[((addr - 0x18) >> 1) as usize].scale = value;
                self.update_rates();
            }
            0x19 | 0x1B | 0x1D => {
                self.timers[((addr - 0x19) >> 1) as usize].osc = value & 0x03;
                if addr == 0x19 {
                    self.osc_enable = value & (OSC1_ENABLE | OSC2_ENABLE);
                }
                self.update_rates();
            }
            0x40 => {
                if value & 0x02 != 0 {
                    self.hz256_count = 0;
                    self.hz256_cycles = HZ256_PERIOD - 1;
                }
                self.hz256_ctrl = value & 0x01;
            }
            0x41 => {} // read only
            _ => return false,
        }
        true
    }

    pub fn read(&self, addr: u8) -> Option<u8> {
        if let Some((i, offset)) = Self::timer_index(addr) {
            return Some(self.timers[i].read(offset));
        }
        let v = match addr {
            0x08 => self.sec_ctrl,
            0x09 => self.seconds as u8,
            0x0A => (self.seconds >> 8) as u8,
            0x0B => (self.seconds >> 16) as u8,
            0x18 | 0x1A | 0x1C => self.timers[((addr - 0x18) >> 1) as usize].scale,
            0x19 => self.timers[0].osc | self.osc_enable,
            0x1B | 0x1D => self.timers[((addr - 0x19) >> 1) as usize].osc,
            0x40 => self.hz256_ctrl,
            0x41 => self.hz256_count,
            _ => return None,
        };
        Some(v)
    }

    /// Advance every running counter by `cycles` CPU cycles.
    pub fn sync(&mut self, cycles: u32, irq: &mut IrqController) {
        for chunk in fixed::chunks(cycles) {
            for t in self.timers[..2].iter_mut() {
                t.sync(chunk, irq);
            }
            let t3 = &mut self.timers[2];
            let (before, pivot) = t3.pivot_compare();
            t3.sync(chunk, irq);
            let (after, _) = t3.pivot_compare();
            if before > pivot && after <= pivot {
                irq.raise(Irq::Timer3Pivot);
            }
        }

        if self.hz256_ctrl & 0x01 != 0 {
            let ticks = decrement_reloading(&mut self.hz256_cycles, cycles, HZ256_PERIOD - 1);
            for _ in 0..ticks {
                self.tick_256hz(irq);
            }
        }

        if self.sec_ctrl & 0x01 != 0 {
            let ticks = decrement_reloading(&mut self.sec_cycles, cycles, SECOND_PERIOD - 1);
            self.seconds = (self.seconds + ticks) & 0xFF_FFFF;
        }
    }

    fn tick_256hz(&mut self, irq: &mut IrqController) {
        self.hz256_count = self.hz256_count.wrapping_add(1);
        let c = self.hz256_count;
        if c % 8 == 0 {
            irq.raise(Irq::Hz32);
        }
        if c % 32 == 0 {
            irq.raise(Irq::Hz8);
        }
        if c % 128 == 0 {
            irq.raise(Irq::Hz2);
        }
        if c == 0 {
            irq.raise(Irq::Hz1);
        }
    }

    pub fn timer3_snapshot(&self) -> Timer3Snapshot {
        let t = &self.timers[2];
        let word = t.word_mode();
        let (count, pivot) = t.pivot_compare();
        Timer3Snapshot {
            count,
            preset: if word { t.preset() } else { t.preset_b as u16 },
            pivot,
            rate: if word { t.rate_a } else { t.rate_b },
            running: if word { t.run_a() } else { t.run_b() },
        }
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    /// Preload the seconds counter, e.g. from host wall time.
    pub fn set_seconds(&mut self, seconds: u32) {
        self.seconds = seconds & 0xFF_FFFF;
    }

    pub fn save_state(&self) -> TimersState {
        TimersState {
            timers: std::array::from_fn(|i| self.timers[i].save_state()),
            osc_enable: self.osc_enable,
            hz256_ctrl: self.hz256_ctrl,
            hz256_count: self.hz256_count,
            hz256_cycles: self.hz256_cycles,
            sec_ctrl: self.sec_ctrl,
            sec_cycles: self.sec_cycles,
            seconds: self.seconds,
        }
    }

    pub fn load_state(&mut self, s: &TimersState) {
        for (t, ts) in self.timers.iter_mut().zip(s.timers.iter()) {
            t.load_state(ts);
        }
        self.osc_enable = s.osc_enable & (OSC1_ENABLE | OSC2_ENABLE);
        self.hz256_ctrl = s.hz256_ctrl & 0x01;
        self.hz256_count = s.hz256_count;
        self.hz256_cycles = s.hz256_cycles % HZ256_PERIOD;
        self.sec_ctrl = s.sec_ctrl & 0x01;
        self.sec_cycles = s.sec_cycles % SECOND_PERIOD;
        self.seconds = s.seconds & 0xFF_FFFF;
        self.update_rates();
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

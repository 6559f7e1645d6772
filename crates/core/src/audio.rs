//! Audio synthesizer.
//!
//! The hardware has no sound chip: timer 3 drives the piezo directly, high
//! while its count is at or below the pivot. The synthesizer turns that into
//! samples at 44.1 kHz using one of several engines:
//!
//! - [`AudioEngine::Direct`]: samples the timer output level as is.
//! - [`AudioEngine::Emulated`]: derives frequency and duty cycle from the
//!   timer configuration and free-runs an oscillator, which is alias-free for
//!   tones the direct sampler would miss.
//! - [`AudioEngine::DirectPwm`]: direct output blended with the duty-cycle
//!   level, so PWM volume ramps come out at the intended loudness.
//! - [`AudioEngine::Generated`]: nothing is produced during sync; the front
//!   end pulls emulated samples on demand with [`Audio::generate`].
//!
//! Registers: 0x70 control (stored), 0x71 volume (bits 0-1).

use crate::audio_buffer::{PiezoFilter, SampleFifo};
use crate::fixed::{self, decrement_reloading, ONE};
use crate::peripherals::Timer3Snapshot;
use crate::savestate::AudioState;

/// Logical output rate.
pub const SAMPLE_RATE: u32 = 44_100;

/// Sample counter decrement per CPU cycle (SAMPLE_RATE / CLOCK_HZ in 8.24).
const SAMPLE_STEP: u32 = (((SAMPLE_RATE as u64) << 24) / crate::CLOCK_HZ as u64) as u32;

/// Volume register to output level.
const VOLUME_LEVELS: [i16; 4] = [0, 0x2000, 0x2000, 0x4000];

/// Below this the emulated engine is silent.
const MIN_TONE_HZ: u32 = 50;
/// At or above this the emulated engine outputs the PWM average.
const MAX_TONE_HZ: u32 = 20_000;

/// Size of the persisted audio block.
pub const STATE_SIZE: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioEngine {
    Disabled,
    Generated,
    Direct,
    #[default]
    Emulated,
    DirectPwm,
}

pub struct Audio {
    pub engine: AudioEngine,
    /// Run samples through the piezo filter.
    pub piezo: bool,
    filter: PiezoFilter,
    pub fifo: SampleFifo,
    control: u8,
    volume_reg: u8,
    volume: i16,
    sample_counter: u32,
    /// Duty cycle of the timer 3 output in Q16.
    pwm_mult: u32,
    phase: u32,
    /// Timer 3 state seen by the last sync, used by the generated engine.
    last_timer: Timer3Snapshot,
}

impl Audio {
    pub fn new(engine: AudioEngine, piezo: bool, fifo_size: usize, fifo_threshold: usize) -> Self {
        Audio {
            engine,
            piezo,
            filter: PiezoFilter::new(),
            fifo: SampleFifo::new(fifo_size, fifo_threshold),
            control: 0,
            volume_reg: 0,
            volume: 0,
            sample_counter: ONE - 1,
            pwm_mult: 0,
            phase: 0,
            last_timer: Timer3Snapshot::default(),
        }
    }

    pub fn reset(&mut self) {
        self.control = 0;
        self.volume_reg = 0;
        self.volume = 0;
        self.sample_counter = ONE - 1;
        self.pwm_mult = 0;
        self.phase = 0;
        self.filter.reset();
        self.fifo.clear();
    }

    /// Change engine; the FIFO is flushed so stale samples are not replayed.
    pub fn set_engine(&mut self, engine: AudioEngine) {
        if engine != self.engine {
            self.engine = engine;
            self.fifo.clear();
            self.phase = 0;
        }
    }

    pub fn volume(&self) -> i16 {
        self.volume
    }

    pub fn samples_available(&self) -> usize {
        self.fifo.samples_available()
    }

    pub fn read(&self, addr: u8) -> Option<u8> {
        match addr {
            0x70 => Some(self.control),
            0x71 => Some(self.volume_reg),
            _ => None,
        }
    }

    pub fn write(&mut self, addr: u8, value: u8) -> bool {
        match addr {
            0x70 => self.control = value,
            0x71 => {
                self.volume_reg = value;
                self.volume = VOLUME_LEVELS[(value & 3) as usize];
            }
            _ => return false,
        }
        true
    }

    // ─── Engines ────────────────────────────────────────────────────────

    fn direct(&self, t: &Timer3Snapshot) -> i16 {
        if t.running && t.count <= t.pivot {
            self.volume
        } else {
            0
        }
    }

    /// Output-high fraction of a timer period, Q16.
    fn duty(t: &Timer3Snapshot) -> u32 {
        let period = t.preset as u32 + 1;
        let high = (t.pivot as u32 + 1).min(period);
        (high << 16) / period
    }

    fn tone_hz(t: &Timer3Snapshot) -> u32 {
        t.count_freq() / (t.preset as u32 + 1)
    }

    fn emulated(&mut self, t: &Timer3Snapshot) -> i16 {
        if !t.running {
            return 0;
        }
        let freq = Self::tone_hz(t);
        let duty = Self::duty(t);
        if freq < MIN_TONE_HZ {
            return 0;
        }
        if freq >= MAX_TONE_HZ {
            return ((self.volume as i32 * duty as i32) >> 16) as i16;
        }
        let step = (((freq as u64) << 32) / SAMPLE_RATE as u64) as u32;
        let high = self.phase < ((duty as u64) << 16).min(u32::MAX as u64) as u32;
        self.phase = self.phase.wrapping_add(step);
        if high { self.volume } else { 0 }
    }

    fn direct_pwm(&mut self, t: &Timer3Snapshot) -> i16 {
        self.pwm_mult = if t.running { Self::duty(t) } else { 0 };
        let dc = (self.volume as i32 * self.pwm_mult as i32) >> 16;
        ((self.direct(t) as i32 + dc) / 2) as i16
    }

    fn sample(&mut self, t: &Timer3Snapshot) -> i16 {
        let raw = match self.engine {
            AudioEngine::Direct => self.direct(t),
            AudioEngine::DirectPwm => self.direct_pwm(t),
            AudioEngine::Emulated | AudioEngine::Generated => self.emulated(t),
            AudioEngine::Disabled => 0,
        };
        if self.piezo { self.filter.process(raw) } else { raw }
    }

    // ─── Sync ───────────────────────────────────────────────────────────

    /// Advance the sample clock, pushing one sample per elapsed tick.
    pub fn sync(&mut self, cycles: u32, timer3: &Timer3Snapshot) {
        self.last_timer = *timer3;
        match self.engine {
            AudioEngine::Disabled | AudioEngine::Generated => return,
            _ => {}
        }
        for chunk in fixed::chunks(cycles) {
            let ticks = decrement_reloading(&mut self.sample_counter, SAMPLE_STEP * chunk, ONE - 1);
            for _ in 0..ticks {
                let s = self.sample(timer3);
                self.fifo.push(s);
            }
        }
    }

    /// Pull samples straight from the emulated oscillator.
    pub fn generate(&mut self, out: &mut [i16]) {
        let t = self.last_timer;
        for slot in out.iter_mut() {
            *slot = self.sample(&t);
        }
    }

    pub fn save_state(&self) -> AudioState {
        AudioState {
            control: self.control,
            volume_reg: self.volume_reg,
            sample_counter: self.sample_counter,
            pwm_mult: self.pwm_mult,
            phase: self.phase,
            filter: self.filter.state_words(),
        }
    }

    /// Restore registers and filter; queued samples are dropped.
    pub fn load_state(&mut self, s: &AudioState) {
        self.write(0x70, s.control);
        self.write(0x71, s.volume_reg);
        self.sample_counter = s.sample_counter & (ONE - 1);
        self.pwm_mult = s.pwm_mult;
        self.phase = s.phase;
        self.filter.set_state_words(&s.filter);
        self.fifo.clear();
    }
}

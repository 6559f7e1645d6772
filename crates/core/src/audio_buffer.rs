//! Audio output buffering and post-processing.
//!
//! ## Sample FIFO
//!
//! [`SampleFifo`] is a power-of-two ring of signed 16-bit samples filled by
//! the synthesizer during `sync` and drained by the front end. When full, new
//! samples are dropped; nothing already queued is ever overwritten. The
//! threshold gives the scheduling loop a backpressure hint: once
//! [`SampleFifo::samples_available`] reaches it the loop may idle.
//!
//! ## Piezo filter
//!
//! [`PiezoFilter`] models the speaker:
//!
//! 1. **High-pass ×3**: the piezo element is capacitive and cannot hold a DC
//!    level, so square waves decay toward zero between edges.
//! 2. **Gain**: makes up for the level lost in the high-pass chain.
//! 3. **Low-pass ×3**: rounds off switching spikes.
//!
//! Every stage is a one-pole IIR with Q15 integer coefficients, so output is
//! bit-identical across hosts.

// ─── Constants ──────────────────────────────────────────────────────────────

/// Smallest FIFO the core will allocate.
const MIN_FIFO: usize = 64;

/// High-pass pole (≈0.972 in Q15).
const HPF_COEF: i32 = 31_850;
/// Low-pass smoothing factor (≈0.55 in Q15).
const LPF_COEF: i32 = 18_022;
/// Gain applied between the two filter chains, in Q8.
const FILTER_GAIN: i32 = 3 << 8;

// ─── FIFO ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SampleFifo {
    buf: Vec<i16>,
    mask: usize,
    read: usize,
    write: usize,
    len: usize,
    /// Fill level at which the producer should be throttled.
    pub threshold: usize,
}

impl SampleFifo {
    /// Create a FIFO holding at least `size` samples.
    pub fn new(size: usize, threshold: usize) -> Self {
        let size = size.max(MIN_FIFO).next_power_of_two();
        SampleFifo {
            buf: vec![0; size],
            mask: size - 1,
            read: 0,
            write: 0,
            len: 0,
            threshold: threshold.min(size),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn samples_available(&self) -> usize {
        self.len
    }

    /// True once the fill level has reached the threshold.
    pub fn is_saturated(&self) -> bool {
        self.len >= self.threshold
    }

    /// Queue one sample. Returns false if the FIFO was full and it was dropped.
    pub fn push(&mut self, sample: i16) -> bool {
        if self.len == self.buf.len() {
            return false;
        }
        self.buf[self.write] = sample;
        self.write = (self.write + 1) & self.mask;
        self.len += 1;
        true
    }

    pub fn pop(&mut self) -> Option<i16> {
        if self.len == 0 {
            return None;
        }
        let s = self.buf[self.read];
        self.read = (self.read + 1) & self.mask;
        self.len -= 1;
        Some(s)
    }

    /// Drain up to `out.len()` samples; returns how many were written.
    pub fn read_into(&mut self, out: &mut [i16]) -> usize {
        let mut n = 0;
        for slot in out.iter_mut() {
            match self.pop() {
                Some(s) => {
                    *slot = s;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.len = 0;
    }
}

// ─── One-pole stages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct HighPass {
    prev_in: i32,
    prev_out: i32,
}

impl HighPass {
    #[inline]
    fn process(&mut self, x: i32) -> i32 {
        let y = ((HPF_COEF as i64 * (self.prev_out + x - self.prev_in) as i64) >> 15) as i32;
        self.prev_in = x;
        self.prev_out = y;
        y
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LowPass {
    prev_out: i32,
}

impl LowPass {
    #[inline]
    fn process(&mut self, x: i32) -> i32 {
        let y = self.prev_out + ((LPF_COEF * (x - self.prev_out)) >> 15);
        self.prev_out = y;
        y
    }
}

// ─── Piezo filter ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PiezoFilter {
    hp: [HighPass; 3],
    lp: [LowPass; 3],
}

impl PiezoFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn process(&mut self, sample: i16) -> i16 {
        let mut x = sample as i32;
        for stage in self.hp.iter_mut() {
            x = stage.process(x);
        }
        x = ((x * FILTER_GAIN) >> 8).clamp(i16::MIN as i32, i16::MAX as i32);
        for stage in self.lp.iter_mut() {
            x = stage.process(x);
        }
        x.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }

    /// Internal state as 12 words, in stage order.
    pub fn state_words(&self) -> [i32; 12] {
        let mut out = [0; 12];
        for (i, hp) in self.hp.iter().enumerate() {
            out[i * 2] = hp.prev_in;
            out[i * 2 + 1] = hp.prev_out;
        }
        for (i, lp) in self.lp.iter().enumerate() {
            out[6 + i] = lp.prev_out;
        }
        out
    }

    pub fn set_state_words(&mut self, words: &[i32; 12]) {
        for (i, hp) in self.hp.iter_mut().enumerate() {
            hp.prev_in = words[i * 2];
            hp.prev_out = words[i * 2 + 1];
        }
        for (i, lp) in self.lp.iter_mut().enumerate() {
            lp.prev_out = words[6 + i];
        }
    }
}

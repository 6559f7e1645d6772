//! 8.24 fixed-point counter helpers shared by every cycle-driven peripheral.
//!
//! A counter is a `u32` whose top byte is the settled integer value and whose
//! low 24 bits accumulate sub-cycle fractions. Peripherals decrement (or, for
//! the PRC, increment) it by `rate × cycles` on every sync.

/// One whole step in 8.24 units.
pub const ONE: u32 = 1 << 24;

/// Largest cycle delta fed to a rate multiplication in one go.
///
/// The fastest rate in any table is `0x40_0000` (2 MHz against a 4 MHz
/// clock), so 256 cycles keep the product inside 32 bits.
pub const MAX_CHUNK: u32 = 256;

/// True when `after = before - delta` wrapped past zero.
///
/// A decrement that wraps produces a value *larger* than where it started.
/// This is the only underflow test used by the core; exact zero is not an
/// underflow, one step below it is.
#[inline]
pub fn wrapping_decrement_underflowed(before: u32, after: u32) -> bool {
    after > before
}

/// Settled integer component of an 8.24 counter.
#[inline]
pub fn whole(counter: u32) -> u8 {
    (counter >> 24) as u8
}

/// Counter value that yields exactly `preset + 1` whole periods before
/// wrapping: the integer part is the preset, the fraction is saturated.
#[inline]
pub fn reload_value(preset: u8) -> u32 {
    ((preset as u32) << 24) | 0x00FF_FFFF
}

/// Decrement `counter` by `amount`, reloading from `reload` on every wrap.
///
/// Returns how many times the counter underflowed. Each wrap consumes
/// `before + 1` units and restarts the counter at `reload`, so a period is
/// exactly `reload + 1` units regardless of how large `amount` is.
pub fn decrement_reloading(counter: &mut u32, mut amount: u32, reload: u32) -> u32 {
    let mut fired = 0;
    loop {
        let before = *counter;
        let after = before.wrapping_sub(amount);
        if !wrapping_decrement_underflowed(before, after) {
            *counter = after;
            return fired;
        }
        fired += 1;
        // Units left once the counter has stepped from 0 to -1.
        amount -= before + 1;
        *counter = reload;
    }
}

/// Split `cycles` into chunks no larger than [`MAX_CHUNK`].
pub fn chunks(cycles: u32) -> impl Iterator<Item = u32> {
    let full = cycles / MAX_CHUNK;
    let rest = cycles % MAX_CHUNK;
    std::iter::repeat(MAX_CHUNK)
        .take(full as usize)
        .chain(std::iter::once(rest).filter(|&r| r != 0))
}

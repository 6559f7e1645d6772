//! Interrupt controller.
//!
//! Four 8-bit active registers (one per source group), four matching enable
//! registers and three priority registers holding 2-bit group priorities.
//!
//! ## Register map
//!
//! | Addr | Name | Contents |
//! |------|------|----------|
//! | 0x20 | PRI1 | PRC (7-6), Timer 2 (5-4), Timer 1 (3-2), Timer 3 (1-0) |
//! | 0x21 | PRI2 | 256 Hz (7-6), cartridge (5-4), IR/shock (3-2), keys A..Left (1-0) |
//! | 0x22 | PRI3 | keys Right and Power (1-0) |
//! | 0x23-0x26 | ENA1-4 | per-source enable, same bit layout as ACT |
//! | 0x27-0x2A | ACT1-4 | pending flags; CPU writes 1 to clear |
//!
//! Peripherals raise sources; the controller never clears a pending bit by
//! itself. Dispatch picks at most one vector per poll, walking the groups in
//! fixed vector order.

use crate::savestate::IrqState;
use log::trace;

/// Size of the persisted interrupt block.
pub const STATE_SIZE: usize = 16;

/// Interrupt sources, numbered by their CPU vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Irq {
    PrcCopy = 0x03,
    PrcFrame = 0x04,
    Timer2Hi = 0x05,
    Timer2Lo = 0x06,
    Timer1Hi = 0x07,
    Timer1Lo = 0x08,
    Timer3Hi = 0x09,
    Timer3Pivot = 0x0A,
    Hz32 = 0x0B,
    Hz8 = 0x0C,
    Hz2 = 0x0D,
    Hz1 = 0x0E,
    Cartridge0 = 0x0F,
    Cartridge1 = 0x10,
    Cartridge2 = 0x11,
    Cartridge3 = 0x12,
    IrReceive = 0x13,
    Shock = 0x14,
    KeyA = 0x15,
    KeyB = 0x16,
    KeyC = 0x17,
    KeyUp = 0x18,
    KeyDown = 0x19,
    KeyLeft = 0x1A,
    KeyRight = 0x1B,
    KeyPower = 0x1C,
}

impl Irq {
    pub fn vector(self) -> u8 {
        self as u8
    }

    /// Active/enable register index (0..4) and bit mask for this source.
    pub fn location(self) -> (usize, u8) {
        location(self as u8)
    }
}

fn location(vector: u8) -> (usize, u8) {
    match vector {
        0x03..=0x0A => (0, 0x80 >> (vector - 0x03)),
        0x0B..=0x0E => (1, 0x20 >> (vector - 0x0B)),
        0x15..=0x1C => (2, 0x80 >> (vector - 0x15)),
        _ => (3, 0x80 >> (vector.wrapping_sub(0x0F) & 7)),
    }
}

/// One priority group: a contiguous vector range sharing a 2-bit priority.
struct Group {
    first: u8,
    last: u8,
    pri_reg: usize,
    pri_shift: u8,
}

/// Groups in hardware scan order.
const GROUPS: [Group; 9] = [
    Group { first: 0x03, last: 0x04, pri_reg: 0, pri_shift: 6 },
    Group { first: 0x05, last: 0x06, pri_reg: 0, pri_shift: 4 },
    Group { first: 0x07, last: 0x08, pri_reg: 0, pri_shift: 2 },
    Group { first: 0x09, last: 0x0A, pri_reg: 0, pri_shift: 0 },
    Group { first: 0x0B, last: 0x0E, pri_reg: 1, pri_shift: 6 },
    Group { first: 0x0F, last: 0x12, pri_reg: 1, pri_shift: 4 },
    Group { first: 0x13, last: 0x14, pri_reg: 1, pri_shift: 2 },
    Group { first: 0x15, last: 0x1A, pri_reg: 1, pri_shift: 0 },
    Group { first: 0x1B, last: 0x1C, pri_reg: 2, pri_shift: 0 },
];

pub struct IrqController {
    priority: [u8; 3],
    enable: [u8; 4],
    active: [u8; 4],
    master_enable: bool,
    /// CPU interrupt mask level; groups need a priority above it.
    mask_level: u8,
    /// Last vector chosen by dispatch, if any.
    pending: Option<u8>,
}

impl IrqController {
    pub fn new() -> Self {
        let mut irq = IrqController {
            priority: [0; 3],
            enable: [0; 4],
            active: [0; 4],
            master_enable: true,
            mask_level: 0,
            pending: None,
        };
        irq.reset();
        irq
    }

    /// Load the power-on register image.
    pub fn reset(&mut self) {
        self.priority = [0x00, 0x30, 0x02];
        self.enable = [0x00, 0x02, 0x00, 0x00];
        self.active = [0x40, 0x00, 0xC0, 0x40];
        self.master_enable = true;
        self.mask_level = 0;
        self.pending = self.dispatch();
    }

    /// Latch a source as pending. Raising an already pending source is a no-op.
    pub fn raise(&mut self, irq: Irq) {
        let (reg, bit) = irq.location();
        if self.active[reg] & bit != 0 {
            return;
        }
        self.active[reg] |= bit;
        self.pending = self.dispatch();
    }

    pub fn is_active(&self, irq: Irq) -> bool {
        let (reg, bit) = irq.location();
        self.active[reg] & bit != 0
    }

    pub fn set_master_enable(&mut self, enable: bool) {
        self.master_enable = enable;
        self.pending = self.dispatch();
    }

    /// CPU interrupt mask level (0..=3).
    pub fn set_mask_level(&mut self, level: u8) {
        self.mask_level = level & 3;
        self.pending = self.dispatch();
    }

    /// Vector the CPU should take before its next fetch.
    pub fn poll(&self) -> Option<u8> {
        self.pending
    }

    fn group_priority(&self, g: &Group) -> u8 {
        (self.priority[g.pri_reg] >> g.pri_shift) & 3
    }

    /// Pick the highest ranked enabled+active source, without clearing it.
    fn dispatch(&self) -> Option<u8> {
        if !self.master_enable {
            return None;
        }
        for g in GROUPS.iter() {
            if self.group_priority(g) <= self.mask_level {
                continue;
            }
            for v in g.first..=g.last {
                let (reg, bit) = location(v);
                if self.enable[reg] & self.active[reg] & bit != 0 {
                    trace!("irq dispatch vector {:#04x}", v);
                    return Some(v);
                }
            }
        }
        None
    }

    pub fn read(&self, addr: u8) -> Option<u8> {
        match addr {
            0x20..=0x22 => Some(self.priority[(addr - 0x20) as usize]),
            0x23..=0x26 => Some(self.enable[(addr - 0x23) as usize]),
            0x27..=0x2A => Some(self.active[(addr - 0x27) as usize]),
            _ => None,
        }
    }

    pub fn write(&mut self, addr: u8, value: u8) -> bool {
        match addr {
            0x20..=0x22 => self.priority[(addr - 0x20) as usize] = value,
            0x23..=0x26 => self.enable[(addr - 0x23) as usize] = value,
            // Write-1-to-clear
            0x27..=0x2A => self.active[(addr - 0x27) as usize] &= !value,
            _ => return false,
        }
        self.pending = self.dispatch();
        true
    }

    pub fn save_state(&self) -> IrqState {
        IrqState {
            priority: self.priority,
            enable: self.enable,
            active: self.active,
            master_enable: self.master_enable,
            mask_level: self.mask_level,
        }
    }

    pub fn load_state(&mut self, s: &IrqState) {
        self.priority = s.priority;
        self.enable = s.enable;
        self.active = s.active;
        self.master_enable = s.master_enable;
        self.mask_level = s.mask_level & 3;
        self.pending = self.dispatch();
    }
}

impl Default for IrqController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::savestate::{decode_block, encode_block};

    fn cleared() -> IrqController {
        let mut irq = IrqController::new();
        for a in 0x20..=0x26 {
            irq.write(a, 0);
        }
        for a in 0x27..=0x2A {
            irq.write(a, 0xFF);
        }
        irq
    }

    #[test]
    fn test_locations() {
        assert_eq!(Irq::PrcCopy.location(), (0, 0x80));
        assert_eq!(Irq::Timer3Pivot.location(), (0, 0x01));
        assert_eq!(Irq::Hz32.location(), (1, 0x20));
        assert_eq!(Irq::Hz1.location(), (1, 0x04));
        assert_eq!(Irq::Cartridge0.location(), (3, 0x80));
        assert_eq!(Irq::Shock.location(), (3, 0x04));
        assert_eq!(Irq::KeyA.location(), (2, 0x80));
        assert_eq!(Irq::KeyPower.location(), (2, 0x01));
    }

    #[test]
    fn test_raise_sets_active_without_dispatch_when_disabled() {
        let mut irq = cleared();
        irq.raise(Irq::Timer1Hi);
        assert!(irq.is_active(Irq::Timer1Hi));
        assert_eq!(irq.read(0x27), Some(0x08));
        assert_eq!(irq.poll(), None); // not enabled, priority 0
    }

    #[test]
    fn test_dispatch_requires_priority_and_enable() {
        let mut irq = cleared();
        irq.raise(Irq::Timer1Hi);
        irq.write(0x23, 0x10); // timer 2 lo, not timer 1 hi
        irq.write(0x20, 0x0C);
        assert_eq!(irq.poll(), None);
        irq.write(0x20, 0x00);
        irq.write(0x23, 0x08);
        assert_eq!(irq.poll(), None);
        irq.write(0x20, 0x0C); // T1 priority 3
        assert_eq!(irq.poll(), Some(0x07));
    }

    #[test]
    fn test_priority_order_independent_of_raise_order() {
        let mut irq = cleared();
        irq.write(0x20, 0xFF);
        irq.write(0x21, 0xFF);
        irq.write(0x23, 0xFF);
        irq.write(0x24, 0xFF);
        irq.raise(Irq::Hz1);
        irq.raise(Irq::Timer3Hi);
        assert_eq!(irq.poll(), Some(Irq::Timer3Hi.vector()));

        let mut irq2 = cleared();
        irq2.write(0x20, 0xFF);
        irq2.write(0x21, 0xFF);
        irq2.write(0x23, 0xFF);
        irq2.write(0x24, 0xFF);
        irq2.raise(Irq::Timer3Hi);
        irq2.raise(Irq::Hz1);
        assert_eq!(irq2.poll(), Some(Irq::Timer3Hi.vector()));
    }

    #[test]
    fn test_msb_first_within_group() {
        let mut irq = cleared();
        irq.write(0x20, 0x0C);
        irq.write(0x23, 0x0C);
        irq.raise(Irq::Timer1Lo);
        assert_eq!(irq.poll(), Some(0x08));
        irq.raise(Irq::Timer1Hi);
        assert_eq!(irq.poll(), Some(0x07));
    }

    #[test]
    fn test_write_one_to_clear() {
        let mut irq = cleared();
        irq.raise(Irq::PrcCopy);
        irq.raise(Irq::PrcFrame);
        irq.write(0x27, 0x80);
        assert!(!irq.is_active(Irq::PrcCopy));
        assert!(irq.is_active(Irq::PrcFrame));
        // Writing 0 never clears
        irq.write(0x27, 0x00);
        assert!(irq.is_active(Irq::PrcFrame));
    }

    #[test]
    fn test_master_disable_preserves_pending() {
        let mut irq = cleared();
        irq.write(0x20, 0xC0);
        irq.write(0x23, 0x80);
        irq.set_master_enable(false);
        irq.raise(Irq::PrcCopy);
        assert_eq!(irq.poll(), None);
        assert!(irq.is_active(Irq::PrcCopy));
        irq.set_master_enable(true);
        assert_eq!(irq.poll(), Some(0x03));
    }

    #[test]
    fn test_mask_level_blocks_lower_priorities() {
        let mut irq = cleared();
        irq.write(0x20, 0x40); // PRC priority 1
        irq.write(0x23, 0x80);
        irq.raise(Irq::PrcCopy);
        irq.set_mask_level(1);
        assert_eq!(irq.poll(), None);
        irq.set_mask_level(0);
        assert_eq!(irq.poll(), Some(0x03));
    }

    #[test]
    fn test_raise_is_idempotent() {
        let mut irq = cleared();
        irq.raise(Irq::KeyA);
        let before = irq.read(0x29);
        irq.raise(Irq::KeyA);
        assert_eq!(irq.read(0x29), before);
    }

    #[test]
    fn test_state_roundtrip_restores_dispatch() {
        let mut irq = cleared();
        irq.write(0x22, 0x03);
        irq.write(0x25, 0x01);
        irq.raise(Irq::KeyPower);
        let blob = encode_block(&irq.save_state()).unwrap();
        assert_eq!(blob.len(), STATE_SIZE);
        let mut other = IrqController::new();
        other.load_state(&decode_block(&blob).unwrap());
        assert_eq!(other.poll(), Some(0x1C));
        assert!(decode_block::<IrqState>(&blob[..8]).is_err());
    }
}

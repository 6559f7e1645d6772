//! Pokemon mini on-board peripherals.
//!
//! - [`Timers`]: three general-purpose 8/16-bit timers, the 256 Hz timer and
//!   the seconds counter
//! - [`Multicart`]: cartridge flash with JEDEC command decoding and bank select
//! - [`Eeprom`]: 8 KB save EEPROM bit-banged over the IO port
//! - [`IoPort`]: IO port register file and keypad

pub mod eeprom;
pub mod io;
pub mod multicart;
pub mod timers;

pub use eeprom::Eeprom;
pub use io::{IoPort, Key};
pub use multicart::{Multicart, MulticartKind};
pub use timers::{Timer3Snapshot, Timers};

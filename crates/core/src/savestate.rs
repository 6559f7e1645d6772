//! Save state support.
//!
//! Every peripheral captures itself into one of the state structs below and
//! is persisted as a fixed-size bincode block (little-endian, fixed-width
//! integers) padded to a hardware constant. A block whose size differs, or
//! whose contents cannot be applied, is rejected before any component is
//! touched.
//!
//! The blocks, together with raw RAM and register images, are wrapped in a
//! container file:
//!
//! ```text
//! +------------------+
//! | Magic "PMES"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```

use crate::error::StateError;
use crate::prc::MapGeometry;
use crate::{audio, color_prc, irq, lcd, peripherals, prc};
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Magic bytes identifying a save state file.
const MAGIC: &[u8; 4] = b"PMES";
/// Current save state format version.
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8;

// ─── Block encoding ─────────────────────────────────────────────────────────

/// A component state persisted as one tagged, fixed-size block.
pub trait Block: Serialize + DeserializeOwned {
    const TAG: &'static str;
    const SIZE: usize;

    /// Reject contents that decode but cannot be applied.
    fn validate(&self) -> Result<(), StateError> {
        Ok(())
    }
}

/// Serialize a component state, zero padded to its block size.
pub fn encode_block<T: Block>(state: &T) -> Result<Vec<u8>, StateError> {
    let mut data = bincode::serialize(state)?;
    if data.len() > T::SIZE {
        return Err(StateError::BlockSize { tag: T::TAG, expected: T::SIZE, actual: data.len() });
    }
    data.resize(T::SIZE, 0);
    Ok(data)
}

/// Parse and validate a block without applying it.
pub fn decode_block<T: Block>(data: &[u8]) -> Result<T, StateError> {
    check_size(T::TAG, data, T::SIZE)?;
    let state: T = bincode::deserialize(data)?;
    state.validate()?;
    Ok(state)
}

/// Reject a buffer whose length differs from the component's constant.
pub fn check_size(tag: &'static str, data: &[u8], expected: usize) -> Result<(), StateError> {
    if data.len() != expected {
        return Err(StateError::BlockSize { tag, expected, actual: data.len() });
    }
    Ok(())
}

// ─── Component states ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrqState {
    pub priority: [u8; 3],
    pub enable: [u8; 4],
    pub active: [u8; 4],
    pub master_enable: bool,
    pub mask_level: u8,
}

impl Block for IrqState {
    const TAG: &'static str = "IRQ-";
    const SIZE: usize = irq::STATE_SIZE;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerState {
    pub a: u32,
    pub b: u32,
    pub preset_a: u8,
    pub preset_b: u8,
    pub pivot: u16,
    pub ctrl_lo: u8,
    pub ctrl_hi: u8,
    pub scale: u8,
    pub osc: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimersState {
    pub timers: [TimerState; 3],
    pub osc_enable: u8,
    pub hz256_ctrl: u8,
    pub hz256_count: u8,
    pub hz256_cycles: u32,
    pub sec_ctrl: u8,
    pub sec_cycles: u32,
    pub seconds: u32,
}

impl Block for TimersState {
    const TAG: &'static str = "TMR-";
    const SIZE: usize = peripherals::timers::STATE_SIZE;
}

/// EEPROM protocol fields; the 8 KB store is persisted by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EepromState {
    pub last_sda: bool,
    pub last_scl: bool,
    pub listening: bool,
    /// 0 device, 1 address hi, 2 address lo, 3 write, 4 read
    pub op: u8,
    pub bit: i8,
    pub shift_in: u8,
    pub shift_out: u8,
    pub addr: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoState {
    pub dir: u8,
    pub data: u8,
    pub misc: u8,
    pub keys: u8,
    pub eeprom: EepromState,
}

impl Block for IoState {
    const TAG: &'static str = "PIO-";
    const SIZE: usize = peripherals::io::STATE_SIZE;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrcState {
    pub mode: u8,
    pub rate: u8,
    pub bg_base: u32,
    pub spr_base: u32,
    pub scroll_y: u8,
    pub scroll_x: u8,
    pub map_width: u8,
    pub map_height: u8,
    pub counter: u32,
    /// 0 CPU, 1 rendered, 2 copied
    pub phase: u8,
    pub stall: u32,
}

impl Block for PrcState {
    const TAG: &'static str = "PRC-";
    const SIZE: usize = prc::STATE_SIZE;

    fn validate(&self) -> Result<(), StateError> {
        MapGeometry::validate(self.map_width, self.map_height).map(|_| ())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorPrcState {
    pub cvram: Vec<u8>,
    pub awaiting_second: bool,
    pub unlocked: bool,
    pub control: u8,
    pub addr: u16,
    pub default_index: u8,
    pub defaults: [u8; 4],
    pub frame: u8,
}

impl Block for ColorPrcState {
    const TAG: &'static str = "CPM-";
    const SIZE: usize = color_prc::STATE_SIZE;

    fn validate(&self) -> Result<(), StateError> {
        check_size(Self::TAG, &self.cvram, color_prc::CVRAM_SIZE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcdState {
    /// Display RAM, page after page.
    pub vram: Vec<u8>,
    pub history: Vec<u8>,
    pub column: u8,
    pub page: u8,
    pub start_line: u8,
    pub contrast: u8,
    pub max_contrast: bool,
    pub segment_reverse: bool,
    pub row_reverse: bool,
    pub set_all: bool,
    pub invert: bool,
    pub display_on: bool,
    pub rmw: bool,
    pub rmw_column: u8,
    pub contrast_pending: bool,
}

impl Block for LcdState {
    const TAG: &'static str = "LCD-";
    const SIZE: usize = lcd::STATE_SIZE;

    fn validate(&self) -> Result<(), StateError> {
        check_size(Self::TAG, &self.vram, lcd::LCD_COLUMNS * lcd::LCD_PAGES)?;
        check_size(Self::TAG, &self.history, crate::SCREEN_WIDTH * crate::SCREEN_HEIGHT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioState {
    pub control: u8,
    pub volume_reg: u8,
    pub sample_counter: u32,
    pub pwm_mult: u32,
    pub phase: u32,
    pub filter: [i32; 12],
}

impl Block for AudioState {
    const TAG: &'static str = "AUD-";
    const SIZE: usize = audio::STATE_SIZE;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticartState {
    pub kind: u8,
    pub bus_cycle: u8,
    /// 0 none, 1 program, 2 erase
    pub command: u8,
    pub bypass: bool,
    pub get_id: bool,
    pub bank_offset: u32,
}

impl Block for MulticartState {
    const TAG: &'static str = "MCT-";
    const SIZE: usize = peripherals::multicart::STATE_SIZE;
}

// ─── Container ──────────────────────────────────────────────────────────────

/// One tagged component block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateBlock {
    pub tag: [u8; 4],
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveState {
    /// 4 KB work RAM, including the PRC framebuffer area.
    pub ram: Vec<u8>,
    /// 256-byte register image.
    pub io: Vec<u8>,
    pub blocks: Vec<StateBlock>,
}

impl SaveState {
    pub fn push(&mut self, tag: &[u8; 4], data: Vec<u8>) {
        self.blocks.push(StateBlock { tag: *tag, data });
    }

    /// Encode a component state and append it under its tag.
    pub fn push_block<T: Block>(&mut self, state: &T) -> Result<(), StateError> {
        let mut tag = [0u8; 4];
        for (dst, src) in tag.iter_mut().zip(T::TAG.bytes()) {
            *dst = src;
        }
        self.push(&tag, encode_block(state)?);
        Ok(())
    }

    /// Find and decode a component state.
    pub fn read_block<T: Block>(&self) -> Result<T, StateError> {
        decode_block(self.block(T::TAG)?)
    }

    /// Find a block by tag, failing if absent.
    pub fn block(&self, tag: &'static str) -> Result<&[u8], StateError> {
        self.blocks
            .iter()
            .find(|b| b.tag == tag.as_bytes())
            .map(|b| b.data.as_slice())
            .ok_or(StateError::MissingBlock(tag))
    }
}

/// Encode a save state with header and deflate compression.
pub fn encode(state: &SaveState) -> Result<Vec<u8>, StateError> {
    let payload = bincode::serialize(state)?;
    let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decode a save state, verifying magic and version.
pub fn decode(data: &[u8]) -> Result<SaveState, StateError> {
    if data.len() < HEADER_LEN {
        return Err(StateError::Truncated);
    }
    if &data[0..4] != MAGIC {
        return Err(StateError::BadMagic);
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != FORMAT_VERSION {
        return Err(StateError::UnsupportedVersion { found: version, expected: FORMAT_VERSION });
    }
    let decompressed = miniz_oxide::inflate::decompress_to_vec(&data[HEADER_LEN..])
        .map_err(|e| StateError::Decompress(format!("{:?}", e)))?;
    Ok(bincode::deserialize(&decompressed)?)
}

pub fn save_to_file(state: &SaveState, path: &Path) -> Result<(), StateError> {
    let out = encode(state)?;
    std::fs::write(path, &out)?;
    info!("saved state to {}", path.display());
    Ok(())
}

pub fn load_from_file(path: &Path) -> Result<SaveState, StateError> {
    let data = std::fs::read(path)?;
    let state = decode(&data)?;
    info!("loaded state from {}", path.display());
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn irq_state() -> IrqState {
        IrqState {
            priority: [0x0C, 0, 0],
            enable: [0x08, 0, 0, 0],
            active: [0x40, 0, 0, 0],
            master_enable: true,
            mask_level: 2,
        }
    }

    #[test]
    fn test_block_is_padded_little_endian() {
        let blob = encode_block(&AudioState {
            control: 1,
            volume_reg: 3,
            sample_counter: 0x0403_0201,
            pwm_mult: 0,
            phase: 0,
            filter: [0; 12],
        })
        .unwrap();
        assert_eq!(blob.len(), audio::STATE_SIZE);
        assert_eq!(&blob[..6], &[1, 3, 1, 2, 3, 4]);
        assert!(blob[62..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_rejects_wrong_size() {
        let blob = encode_block(&irq_state()).unwrap();
        match decode_block::<IrqState>(&blob[..9]) {
            Err(StateError::BlockSize { tag: "IRQ-", expected: 16, actual: 9 }) => {}
            other => panic!("unexpected {:?}", other.err()),
        }
    }

    #[test]
    fn test_decode_rejects_bad_contents() {
        let mut blob = encode_block(&irq_state()).unwrap();
        // master_enable must be 0 or 1
        blob[11] = 7;
        assert!(matches!(decode_block::<IrqState>(&blob), Err(StateError::Codec(_))));
    }

    #[test]
    fn test_prc_block_checks_geometry() {
        let state = PrcState {
            mode: 0,
            rate: 0,
            bg_base: 0,
            spr_base: 0,
            scroll_y: 0,
            scroll_x: 0,
            map_width: 12,
            map_height: 16,
            counter: 0,
            phase: 0,
            stall: 0,
        };
        let blob = encode_block(&state).unwrap();
        assert!(decode_block::<PrcState>(&blob).is_ok());
        let blob = encode_block(&PrcState { map_width: 13, ..state }).unwrap();
        assert!(matches!(
            decode_block::<PrcState>(&blob),
            Err(StateError::MapGeometry { width: 13, height: 16 })
        ));
    }

    #[test]
    fn test_block_through_container() {
        let mut st = SaveState::default();
        st.push_block(&irq_state()).unwrap();
        assert_eq!(&st.blocks[0].tag, b"IRQ-");
        let back: IrqState = st.read_block().unwrap();
        assert_eq!(back.enable, [0x08, 0, 0, 0]);
        assert!(matches!(st.read_block::<TimersState>(), Err(StateError::MissingBlock("TMR-"))));
    }

    #[test]
    fn test_container_roundtrip() {
        let mut st = SaveState { ram: vec![0xAB; 4096], io: vec![0; 256], blocks: Vec::new() };
        st.push(b"TMR-", vec![1, 2, 3]);
        let bytes = encode(&st).unwrap();
        assert_eq!(&bytes[0..4], b"PMES");
        let back = decode(&bytes).unwrap();
        assert_eq!(back.ram, st.ram);
        assert_eq!(back.block("TMR-").unwrap(), &[1, 2, 3]);
        assert!(matches!(back.block("LCD-"), Err(StateError::MissingBlock("LCD-"))));
    }

    #[test]
    fn test_decode_rejects_bad_header() {
        assert!(matches!(decode(b"PM"), Err(StateError::Truncated)));
        assert!(matches!(decode(b"XXXX\x01\0\0\0"), Err(StateError::BadMagic)));
        assert!(matches!(
            decode(b"PMES\x09\0\0\0"),
            Err(StateError::UnsupportedVersion { found: 9, .. })
        ));
    }
}

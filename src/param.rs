//! Parameter store: durable configuration (device number, servo
//! calibration) persisted to flash with sequence number + CRC.
//!
//! Grounded in `original_source/boards/rdk-bdc24/qs-bdc24/param.c`: a fixed
//! record, a default constant, load-latest-valid-or-default, and a save
//! that never clobbers the previous block until the new one validates.

use defmt::Format;

/// Current device number range, per CAN_MSGID_DEVNO_M (6 bits).
pub const DEVICE_NUMBER_MAX: u8 = 63;

pub const PARAM_BLOCK_VERSION: u8 = 1;

/// Firmware version word, reported by the firmware-version API and the CAN
/// auto-responding slot (`LM_API_FIRMVER`).
pub const FIRMWARE_VERSION: u32 = 1;

/// Hardware version byte, reported by `LM_API_HWVER`.
pub const HARDWARE_VERSION: u8 = 0;

pub const SERVO_DEFAULT_NEUTRAL_WIDTH: u32 = 1500; // us-equivalent ticks
pub const SERVO_DEFAULT_MIN_WIDTH: u32 = 750;
pub const SERVO_DEFAULT_MAX_WIDTH: u32 = 2250;

/// The persisted record, `<= 64` bytes on the wire per spec.md §6. The
/// in-memory copy additionally carries no sequence/CRC fields since those
/// only matter for the flash encoding produced by `encode`/parsed by
/// `decode`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub struct ParamBlock {
    pub version: u8,
    pub device_number: u8,
    pub servo_negative_width: u32,
    pub servo_neutral_width: u32,
    pub servo_positive_width: u32,
}

impl Default for ParamBlock {
    fn default() -> Self {
        Self {
            version: PARAM_BLOCK_VERSION,
            device_number: 1,
            servo_negative_width: SERVO_DEFAULT_NEUTRAL_WIDTH - SERVO_DEFAULT_MIN_WIDTH,
            servo_neutral_width: SERVO_DEFAULT_NEUTRAL_WIDTH,
            servo_positive_width: SERVO_DEFAULT_MAX_WIDTH - SERVO_DEFAULT_NEUTRAL_WIDTH,
        }
    }
}

/// On-flash encoded size: 1 (seq) + 1 (crc) + 1 (version) + 1 (devno) +
/// 3*4 (servo widths) + 48 (reserved) = 64 bytes, matching param.h's
/// `tParameters` layout and spec.md §6's "<= 64 bytes" record.
pub const ENCODED_LEN: usize = 64;

impl ParamBlock {
    fn encode_body(&self) -> [u8; ENCODED_LEN] {
        let mut buf = [0u8; ENCODED_LEN];
        // buf[0] = sequence number, buf[1] = crc; filled in by the store.
        buf[2] = self.version;
        buf[3] = self.device_number;
        buf[4..8].copy_from_slice(&self.servo_negative_width.to_le_bytes());
        buf[8..12].copy_from_slice(&self.servo_neutral_width.to_le_bytes());
        buf[12..16].copy_from_slice(&self.servo_positive_width.to_le_bytes());
        buf
    }

    fn decode_body(buf: &[u8; ENCODED_LEN]) -> Self {
        Self {
            version: buf[2],
            device_number: buf[3],
            servo_negative_width: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            servo_neutral_width: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            servo_positive_width: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

/// CRC-8/MAXIM over the body (everything but the sequence and CRC bytes
/// themselves), matching the style of a small embedded CRC rather than
/// pulling in a CRC crate for one field.
fn crc8(buf: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in buf {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x8c
            } else {
                crc >> 1
            };
        }
    }
    crc
}

#[derive(Debug, Format)]
pub enum ParamError {
    /// The backing flash write failed; the prior valid block is untouched.
    WriteFailed,
}

/// Abstracts the durable store behind a trait, per the design note calling
/// for `load() -> Option<Block>` / `save(&Block) -> Result<()>`; a flash
/// ring backs it on target, an in-memory ring backs it under `host-test`.
pub trait ParamStore {
    fn load(&mut self) -> Option<ParamBlock>;
    fn save(&mut self, block: &ParamBlock) -> Result<(), ParamError>;
}

/// Two-slot ring: `slots[i]` holds `(sequence, encoded)`. `load` returns the
/// highest-sequence slot whose CRC validates and whose version is
/// recognized; `save` writes into the *other* slot so the previous valid
/// block survives a failed or interrupted write.
pub struct RingParamStore<const N: usize = 2> {
    slots: [Option<(u8, [u8; ENCODED_LEN])>; N],
    next_write: usize,
    next_sequence: u8,
    /// When set, the next `save` call fails without touching `slots`, to
    /// exercise the "flash write failure leaves prior block intact"
    /// contract in tests.
    #[cfg(any(test, feature = "host-test"))]
    pub fail_next_write: bool,
}

impl<const N: usize> Default for RingParamStore<N> {
    fn default() -> Self {
        Self {
            slots: [None; N],
            next_write: 0,
            next_sequence: 1,
            #[cfg(any(test, feature = "host-test"))]
            fail_next_write: false,
        }
    }
}

impl<const N: usize> RingParamStore<N> {
    pub fn new() -> Self {
        Self::default()
    }

    fn most_recent_valid(&self) -> Option<(usize, u8, ParamBlock)> {
        let mut best: Option<(usize, u8, ParamBlock)> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some((seq, encoded)) = slot else { continue };
            let body = &encoded[2..];
            if crc8(body) != encoded[1] {
                continue;
            }
            let block = ParamBlock::decode_body(encoded);
            if block.version != PARAM_BLOCK_VERSION {
                continue;
            }
            let newer = match &best {
                None => true,
                Some((_, best_seq, _)) => seq.wrapping_sub(*best_seq) < 0x80 && seq != best_seq,
            };
            if newer {
                best = Some((idx, *seq, block));
            }
        }
        best
    }
}

impl<const N: usize> ParamStore for RingParamStore<N> {
    fn load(&mut self) -> Option<ParamBlock> {
        self.most_recent_valid().map(|(_, _, block)| block)
    }

    fn save(&mut self, block: &ParamBlock) -> Result<(), ParamError> {
        #[cfg(any(test, feature = "host-test"))]
        if self.fail_next_write {
            self.fail_next_write = false;
            return Err(ParamError::WriteFailed);
        }

        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        if self.next_sequence == 0 {
            self.next_sequence = 1;
        }

        let mut encoded = block.encode_body();
        encoded[0] = seq;
        encoded[1] = crc8(&encoded[2..]);

        // Write into the slot the current valid copy does NOT occupy, so a
        // torn write never destroys the last good block.
        let avoid = self.most_recent_valid().map(|(idx, _, _)| idx);
        let target = if Some(self.next_write) == avoid {
            (self.next_write + 1) % N
        } else {
            self.next_write
        };
        self.slots[target] = Some((seq, encoded));
        self.next_write = (target + 1) % N;

        Ok(())
    }
}

/// Owns the live, in-memory parameter block plus the backing store. Callers
/// mutate fields through `block_mut` and call `save` explicitly, matching
/// `ParamSave()`'s "every field change does not necessarily persist"
/// semantics from spec.md §3.
pub struct Params<S: ParamStore> {
    store: S,
    block: ParamBlock,
}

impl<S: ParamStore> Params<S> {
    pub fn new(mut store: S) -> Self {
        let block = store.load().unwrap_or_default();
        Self { store, block }
    }

    pub fn block(&self) -> &ParamBlock {
        &self.block
    }

    pub fn block_mut(&mut self) -> &mut ParamBlock {
        &mut self.block
    }

    pub fn save(&mut self) -> Result<(), ParamError> {
        self.store.save(&self.block)
    }

    pub fn reset_to_defaults(&mut self) {
        self.block = ParamBlock::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_with_no_flash_returns_defaults_without_writing() {
        let mut store = RingParamStore::<2>::new();
        assert!(store.load().is_none());
        let params = Params::new(store);
        assert_eq!(*params.block(), ParamBlock::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = RingParamStore::<2>::new();
        let mut params = Params::new(store);
        params.block_mut().device_number = 42;
        params.save().unwrap();

        // Simulate a power cycle: construct a fresh `Params` from whatever
        // the store now holds.
        let loaded = params.store.load().unwrap();
        assert_eq!(loaded.device_number, 42);
    }

    #[test]
    fn failed_write_preserves_prior_block() {
        let mut store = RingParamStore::<2>::new();
        let mut block = ParamBlock::default();
        block.device_number = 7;
        store.save(&block).unwrap();

        store.fail_next_write = true;
        let mut bad = block;
        bad.device_number = 99;
        assert!(store.save(&bad).is_err());

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.device_number, 7);
    }

    #[test]
    fn repeated_saves_pick_the_latest_sequence() {
        let mut store = RingParamStore::<2>::new();
        for n in 1..=5u8 {
            let mut block = ParamBlock::default();
            block.device_number = n;
            store.save(&block).unwrap();
        }
        assert_eq!(store.load().unwrap().device_number, 5);
    }

    #[test]
    fn corrupted_crc_is_rejected_as_invalid() {
        let mut store = RingParamStore::<2>::new();
        let mut good = ParamBlock::default();
        good.device_number = 3;
        store.save(&good).unwrap();

        // Corrupt the just-written slot's CRC directly.
        let valid_idx = (store.next_write + 1) % 2;
        if let Some((_, encoded)) = &mut store.slots[valid_idx] {
            encoded[1] ^= 0xff;
        }

        assert!(store.load().is_none());
    }
}

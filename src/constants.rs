//! Timing and sizing constants for the FDS drive emulation.
//!
//! Values match the NESDev FDS reference and the STM32 donor firmware this
//! core was ported from; see `DESIGN.md` for the mapping.

// **** disk-side geometry ****

/// Largest physical side this core can hold in memory, in bytes. Matches the
/// largest legal FDS side image (enough for every licensed and unlicensed
/// title observed in the wild).
pub const MAX_SIDE_SIZE: usize = 65500;

/// Fixed-capacity block index size; avoids dynamic allocation of the offset
/// table in the real-time write path.
pub const MAX_BLOCKS: usize = 1024;

/// Length, in bytes, of the gap (all-zero run + `0x80` terminator) preceding
/// the first block on a side.
pub const FIRST_GAP_BYTES: usize = 3537;

/// Length, in bytes, of the gap preceding every block after the first.
pub const NEXT_GAP_BYTES: usize = 122;

/// Byte length of the disk-info block body (block 0), including its leading
/// `0x01` type tag.
pub const DISK_INFO_BODY_LEN: usize = 56;

/// Byte length of the file-count block body (block 1), including its
/// leading `0x02` type tag.
pub const FILE_COUNT_BODY_LEN: usize = 2;

/// Byte length of a file-header block body, including its leading `0x03`
/// type tag.
pub const FILE_HEADER_BODY_LEN: usize = 16;

/// Offset, within a file-header body, of the little-endian 16-bit file size
/// that governs the following file-data block's length.
pub const FILE_HEADER_SIZE_FIELD_OFFSET: usize = 0x0D;

/// Number of trailing CRC bytes appended after every block body.
pub const CRC_LEN: usize = 2;

pub const BLOCK_TYPE_DISK_INFO: u8 = 0x01;
pub const BLOCK_TYPE_FILE_COUNT: u8 = 0x02;
pub const BLOCK_TYPE_FILE_HEADER: u8 = 0x03;
pub const BLOCK_TYPE_FILE_DATA: u8 = 0x04;

/// Gap terminator byte that ends every leading gap.
pub const GAP_TERMINATOR: u8 = 0x80;

/// Signature that must occupy bytes 1..15 of the disk-info block body.
pub const DISK_INFO_SIGNATURE: &[u8; 14] = b"*NINTENDO-HVC*";

// **** read modulator ****

/// Width, in PWM ticks, of the impulse emitted on a low-to-high transition
/// of the modulated read line (the actual pulse is one tick shorter).
pub const READ_IMPULSE_LENGTH: u8 = 32;

/// Once the head runs this many bytes past `used_space`, turbo rewind treats
/// the rest of the side as unreadable and immediately rewinds.
pub const NOT_READY_BYTES: usize = 16;

// **** write demodulator ****

/// Pulses shorter than this are the short (~10us) bucket.
pub const THRESHOLD_1: u16 = 150;

/// Pulses shorter than this (but not `THRESHOLD_1`) are the medium (~15us)
/// bucket; everything at or above is the long (~20us) bucket.
pub const THRESHOLD_2: u16 = 200;

/// Leading pulses discarded at the start of `WritingGap` before the gap
/// terminator's start bit is recognised.
pub const WRITE_GAP_SKIP_BITS: u16 = 50;

/// Consecutive short pulses in `WritingStopping` that indicate an
/// unlicensed title chaining a second block without toggling `WRITE`.
pub const MULTI_WRITE_UNLICENSED_BITS: u16 = 100;

// **** drive state machine timing ****

/// Delay, in milliseconds, the drive holds `READY` deasserted after a cold
/// read-start under `RewindSpeed::Turbo` (or any head-not-at-zero start).
pub const NOT_READY_TIME_MS: u32 = 150;

/// Same delay under `RewindSpeed::Original` (longer, to imitate the
/// mechanical drive's slower rewind).
pub const NOT_READY_TIME_ORIGINAL_MS: u32 = 2000;

/// Default autosave idle delay a [`crate::hal::Settings`] implementation may
/// return from [`crate::hal::Settings::autosave_delay_ms`].
pub const DEFAULT_AUTOSAVE_DELAY_MS: u32 = 2000;

/// Minimum rate at which host firmware must call
/// [`crate::drive::Drive::check_pins`] even absent a pin edge.
pub const CHECK_PINS_MIN_HZ: u32 = 10;

// **** `.fds` file format ****

/// Optional fwNES-style header prefix on a `.fds` file.
pub const ROM_HEADER_SIZE: u64 = 16;

/// Byte length of one side's worth of block bodies in the on-disk file
/// (gaps and CRC bytes are not stored on disk).
pub const ROM_SIDE_SIZE: u64 = 65500;

//! The block-oriented image model for one loaded disk side.
//!
//! Block ordering and types are implicit in position: block 0 is the disk
//! info block, block 1 the file-count block, and every pair after that
//! alternates file-header / file-data. See `DESIGN.md` for how this maps to
//! `original_source/FdsKey/Core/Src/fdsemu.c`.

use crate::constants::*;
use crate::crc::crc;
use crate::drive::HeadCursor;
use crate::{DriveError, Result};
use byteorder::{ByteOrder, LittleEndian};

#[cfg(all(feature = "alloc", not(feature = "std")))]
use alloc::boxed::Box;
#[cfg(all(feature = "alloc", feature = "std"))]
use std::boxed::Box;

/// Largest path we keep around for save-back identification. Generous
/// enough for any realistic SD-card path without requiring `alloc`.
pub const MAX_FILENAME_LEN: usize = 128;

#[cfg(feature = "alloc")]
type RawStorage = Box<[u8; MAX_SIDE_SIZE]>;
#[cfg(not(feature = "alloc"))]
type RawStorage = [u8; MAX_SIDE_SIZE];

#[cfg(feature = "alloc")]
fn new_raw_storage() -> RawStorage {
    Box::new([0u8; MAX_SIDE_SIZE])
}
#[cfg(not(feature = "alloc"))]
fn new_raw_storage() -> RawStorage {
    [0u8; MAX_SIDE_SIZE]
}

/// Fallible counterpart of `new_raw_storage`, used wherever an allocation
/// failure must surface as `DriveError::OutOfMemory` (§4.7 step 5) instead
/// of aborting the process.
#[cfg(feature = "alloc")]
fn try_new_raw_storage() -> Result<RawStorage> {
    #[cfg(not(feature = "std"))]
    use alloc::vec::Vec;
    #[cfg(feature = "std")]
    use std::vec::Vec;

    let mut v = Vec::new();
    v.try_reserve_exact(MAX_SIDE_SIZE)
        .map_err(|_| DriveError::OutOfMemory)?;
    v.resize(MAX_SIDE_SIZE, 0);
    v.into_boxed_slice()
        .try_into()
        .map_err(|_| DriveError::OutOfMemory)
}
#[cfg(not(feature = "alloc"))]
fn try_new_raw_storage() -> Result<RawStorage> {
    Ok([0u8; MAX_SIDE_SIZE])
}

/// The leading-gap length for block `i`: longer before the very first
/// block, uniform thereafter.
pub fn gap_length(i: usize) -> usize {
    if i == 0 {
        FIRST_GAP_BYTES
    } else {
        NEXT_GAP_BYTES
    }
}

/// The canonical block-type tag for block `i`, by position: `1, 2, 3, 4, 3,
/// 4, …`.
pub fn expected_block_type(i: usize) -> u8 {
    match i {
        0 => BLOCK_TYPE_DISK_INFO,
        1 => BLOCK_TYPE_FILE_COUNT,
        _ if i % 2 == 0 => BLOCK_TYPE_FILE_HEADER,
        _ => BLOCK_TYPE_FILE_DATA,
    }
}

/// One loaded side of an FDS image: the on-wire byte buffer plus the block
/// index over it.
pub struct DiskSide {
    pub(crate) raw: RawStorage,
    pub(crate) block_offsets: [usize; MAX_BLOCKS],
    pub(crate) block_count: usize,
    pub(crate) used_space: usize,
    pub(crate) changed: bool,
    readonly: bool,
    side_index: u8,
    filename: [u8; MAX_FILENAME_LEN],
    filename_len: usize,
}

impl DiskSide {
    /// Creates an empty side (all gap/CRC invariants vacuously hold since
    /// `block_count == 0`). `storage::load_side` is the usual way a
    /// populated one comes into being.
    pub fn empty(readonly: bool, side_index: u8, filename: &[u8]) -> Self {
        let mut side = DiskSide {
            raw: new_raw_storage(),
            block_offsets: [0; MAX_BLOCKS],
            block_count: 0,
            used_space: 0,
            changed: false,
            readonly,
            side_index,
            filename: [0; MAX_FILENAME_LEN],
            filename_len: 0,
        };
        side.set_filename(filename);
        side
    }

    /// Fallible counterpart of `empty`, used by `storage::load_side` so a
    /// failure to allocate `raw` surfaces as `DriveError::OutOfMemory`
    /// rather than aborting.
    pub(crate) fn try_empty(readonly: bool, side_index: u8, filename: &[u8]) -> Result<Self> {
        let mut side = DiskSide {
            raw: try_new_raw_storage()?,
            block_offsets: [0; MAX_BLOCKS],
            block_count: 0,
            used_space: 0,
            changed: false,
            readonly,
            side_index,
            filename: [0; MAX_FILENAME_LEN],
            filename_len: 0,
        };
        side.set_filename(filename);
        Ok(side)
    }

    fn set_filename(&mut self, filename: &[u8]) {
        let len = filename.len().min(MAX_FILENAME_LEN);
        self.filename[..len].copy_from_slice(&filename[..len]);
        self.filename_len = len;
    }

    pub fn filename(&self) -> &[u8] {
        &self.filename[..self.filename_len]
    }

    pub fn side_index(&self) -> u8 {
        self.side_index
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw[..]
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.raw[..]
    }

    pub fn used_space(&self) -> usize {
        self.used_space
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn block_offset(&self, i: usize) -> Option<usize> {
        if i < self.block_count {
            Some(self.block_offsets[i])
        } else {
            None
        }
    }

    /// The canonical byte length of block `i`: 56/2/16 bytes for the first
    /// three block kinds, or `1 + length_from_prev_header` for file-data
    /// blocks, plus the requested gap and CRC.
    pub fn block_size(&self, i: usize, include_gap: bool, include_crc: bool) -> u16 {
        let body_len: usize = if i == 0 {
            DISK_INFO_BODY_LEN
        } else if i == 1 {
            FILE_COUNT_BODY_LEN
        } else if i % 2 == 0 {
            FILE_HEADER_BODY_LEN
        } else {
            let prev_gap = gap_length(i - 1);
            let len_offset = self.block_offsets[i - 1] + prev_gap + FILE_HEADER_SIZE_FIELD_OFFSET;
            let length = LittleEndian::read_u16(&self.raw[len_offset..len_offset + 2]) as usize;
            1 + length
        };
        let gap = if include_gap { gap_length(i) } else { 0 };
        let crc_len = if include_crc { CRC_LEN } else { 0 };
        (gap + body_len + crc_len) as u16
    }

    /// Finds the block containing `byte_pos`, walking the offset table.
    pub fn locate_block(&self, byte_pos: usize) -> Option<usize> {
        for i in 0..self.block_count {
            if byte_pos < self.block_offsets[i] + self.block_size(i, true, true) as usize {
                return Some(i);
            }
        }
        None
    }

    /// Body bytes of block `i` (gap and CRC excluded).
    pub fn block_body(&self, i: usize) -> Option<&[u8]> {
        if i >= self.block_count {
            return None;
        }
        let body_start = self.block_offsets[i] + gap_length(i);
        let body_len = self.block_size(i, false, false) as usize;
        Some(&self.raw[body_start..body_start + body_len])
    }

    /// Recomputes the CRC over block `i`'s body and compares it with the
    /// two trailing bytes actually stored after it. Used by `save()` (§4.7
    /// step 2) and available standalone for diagnostics.
    pub fn verify_block_crc(&self, i: usize) -> Result<bool> {
        let body = self.block_body(i).ok_or(DriveError::InvalidState)?;
        let crc_start = self.block_offsets[i] + gap_length(i) + body.len();
        let stored = LittleEndian::read_u16(&self.raw[crc_start..crc_start + CRC_LEN]);
        Ok(crc(body) == stored)
    }

    /// The block containing the current head position, if any.
    pub fn current_block(&self, current_byte: usize) -> Option<usize> {
        self.locate_block(current_byte)
    }

    /// §4.5: snaps the head to the start of the block that contains (or
    /// would contain) `cursor.current_byte`, extending the block table with
    /// a fresh block if the head is past every existing one, and rewrites
    /// that block's leading gap. Called on every write start and on every
    /// unlicensed chained write.
    ///
    /// Returns `Err(DriveError::RomTooLarge)` if the resulting layout no
    /// longer fits in `raw` (the caller must fall back to a full stop), or
    /// `Err(DriveError::InvalidLayout)` if the computed block end would
    /// wrap before its start — see `DESIGN.md`'s Open Question decision.
    pub fn reset_writing(&mut self, cursor: &mut HeadCursor) -> Result<()> {
        let mut target_block = self.block_count;
        for i in 0..self.block_count {
            if cursor.current_byte < self.block_offsets[i] + self.block_size(i, true, true) as usize
            {
                target_block = i;
                break;
            }
        }
        if target_block == self.block_count {
            if self.block_count >= MAX_BLOCKS {
                return Err(DriveError::RomTooLarge);
            }
            let new_offset = if self.block_count == 0 {
                0
            } else {
                self.block_offsets[self.block_count - 1]
                    + self.block_size(self.block_count - 1, true, true) as usize
            };
            self.block_offsets[self.block_count] = new_offset;
            self.block_count += 1;
        }

        let last = self.block_count - 1;
        self.used_space = self.block_offsets[last] + self.block_size(last, true, true) as usize;
        if self.used_space > MAX_SIDE_SIZE {
            self.block_count -= 1;
            return Err(DriveError::RomTooLarge);
        }

        let gap = gap_length(target_block);
        let start = self.block_offsets[target_block];
        let end =
            (start + gap + self.block_size(target_block, false, true) as usize) % MAX_SIDE_SIZE;
        if end < start {
            return Err(DriveError::InvalidLayout);
        }
        cursor.current_byte = start;
        cursor.current_block_end = end;

        if target_block + 1 < self.block_count && end != self.block_offsets[target_block + 1] {
            let from = self.block_offsets[target_block + 1];
            self.block_count = target_block + 1;
            self.raw[from..].fill(0);
        }

        let gap_start = cursor.current_byte;
        self.raw[gap_start..gap_start + gap - 1].fill(0);
        self.raw[gap_start + gap - 1] = GAP_TERMINATOR;
        cursor.current_byte += gap;
        cursor.write_gap_skip = 0;
        self.changed = true;

        Ok(())
    }
}

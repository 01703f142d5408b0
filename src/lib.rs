#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(non_snake_case)]

//! Core of a Famicom Disk System (FDS) drive emulator.
//!
//! This crate models the part of an FDS-emulating microcontroller that has
//! nothing to do with any particular board: the on-wire disk-side image, the
//! MFM-like read modulator and write demodulator, the drive state machine,
//! and the `.fds` storage bridge. Timers, PWM, DMA, GPIO and the host
//! filesystem are named capabilities ([`hal`]) that the surrounding firmware
//! supplies; this crate never touches a register directly.

#[cfg(all(feature = "alloc", not(feature = "std")))]
extern crate alloc;

pub mod constants;
pub mod crc;
pub mod demodulator;
pub mod drive;
pub mod hal;
pub mod image;
pub mod modulator;
pub mod storage;

use core::fmt;

/// The error type for this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveError {
    /// The drive was asked to do something that isn't legal in its current
    /// [`drive::DriveState`].
    InvalidState,
    /// The loaded side's on-wire layout is internally inconsistent in a way
    /// that must never happen for well-formed data (see §9 of the design
    /// notes: `current_block_end < current_byte`).
    InvalidLayout,
    /// `.fds` file size, or an embedded block's framing, doesn't match any
    /// supported layout.
    InvalidRom,
    /// The file is a structurally valid `.fds` image but larger than
    /// `MAX_SIDE_SIZE` can hold.
    RomTooLarge,
    /// The disk-side buffer could not be allocated (§4.7 step 5), or a path
    /// or filename overflowed its fixed-capacity on-stack buffer.
    OutOfMemory,
    /// `save()` was called on a side that was loaded read-only.
    ReadOnly,
    /// A block's trailing CRC does not match the CRC computed over its body.
    WrongCrc,
    /// No side is currently loaded.
    NoSideLoaded,
    /// Passthrough error from the storage collaborator (§6, `Storage`/
    /// `StorageOpener`).
    Io(StorageError),
}

/// Filesystem-level failure, surfaced verbatim from the storage collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    DiskErr,
    Denied,
    NoFile,
    NoPath,
    Exist,
    NotReady,
    WriteProtected,
    InvalidName,
    Other,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::DiskErr => write!(f, "a hard error occurred in the storage layer"),
            StorageError::Denied => write!(f, "access denied"),
            StorageError::NoFile => write!(f, "no such file"),
            StorageError::NoPath => write!(f, "no such path"),
            StorageError::Exist => write!(f, "file already exists"),
            StorageError::NotReady => write!(f, "storage medium not ready"),
            StorageError::WriteProtected => write!(f, "storage medium is write protected"),
            StorageError::InvalidName => write!(f, "invalid path name"),
            StorageError::Other => write!(f, "storage error"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for StorageError {}

impl From<StorageError> for DriveError {
    fn from(e: StorageError) -> Self {
        DriveError::Io(e)
    }
}

/// The result type for this crate.
pub type Result<T> = core::result::Result<T, DriveError>;

#[rustfmt::skip]
impl fmt::Display for DriveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveError::InvalidState   => write!(f, "operation not permitted in the current drive state"),
            DriveError::InvalidLayout  => write!(f, "disk-side layout invariant violated"),
            DriveError::InvalidRom     => write!(f, "not a valid FDS image"),
            DriveError::RomTooLarge    => write!(f, "FDS image is larger than a side can hold"),
            DriveError::OutOfMemory    => write!(f, "out of memory: could not allocate the disk-side buffer or path"),
            DriveError::ReadOnly       => write!(f, "side is loaded read-only"),
            DriveError::WrongCrc       => write!(f, "block CRC mismatch, refusing to save"),
            DriveError::NoSideLoaded   => write!(f, "no disk side is loaded"),
            DriveError::Io(e)          => write!(f, "storage error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DriveError {}

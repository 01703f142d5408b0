//! The `.fds` file bridge: turns a stored ROM image into a [`DiskSide`] and
//! back. Grounded on `fdsemu.c: fds_load_side` and `fds_save`; the storage
//! capability itself follows `rustBoot`'s `fs::controller::FsController`
//! pattern of a small trait over whatever filesystem the host actually has.

use crate::constants::*;
use crate::crc::crc;
use crate::hal::{BackupPolicy, MotorPins, Settings};
use crate::image::{gap_length, DiskSide};
use crate::{DriveError, Result, StorageError};
use log::{info, warn};

/// One open file handle, as returned by a [`StorageOpener`].
pub trait StorageFile {
    fn len(&mut self) -> core::result::Result<u64, StorageError>;
    /// Seeks to an absolute byte offset from the start of the file.
    fn seek(&mut self, offset: u64) -> core::result::Result<(), StorageError>;
    /// Reads up to `buf.len()` bytes, returning the number actually read.
    /// `Ok(0)` means end of file, matching `std::io::Read::read`.
    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, StorageError>;
    fn write_all(&mut self, buf: &[u8]) -> core::result::Result<(), StorageError>;
}

/// The filesystem capability this crate needs: open, create, check
/// existence, and make directories, all addressed by byte-string paths so
/// a `no_std` host isn't forced to carry `alloc::string::String`.
pub trait StorageOpener {
    type File: StorageFile;
    fn open_read(&mut self, path: &[u8]) -> core::result::Result<Self::File, StorageError>;
    /// Opens for writing without truncating — matches FatFs's `FA_WRITE`,
    /// which `fds_save` relies on to preserve an existing fwNES header.
    fn open_write(&mut self, path: &[u8]) -> core::result::Result<Self::File, StorageError>;
    /// Creates a new file, failing if one already exists.
    fn create_new(&mut self, path: &[u8]) -> core::result::Result<Self::File, StorageError>;
    fn exists(&mut self, path: &[u8]) -> core::result::Result<bool, StorageError>;
    /// Creates every path component that doesn't already exist. Idempotent:
    /// an already-existing directory is not an error (matches `fds_save`'s
    /// tolerance of FatFs's `FR_EXIST`).
    fn mkdir_all(&mut self, path: &[u8]) -> core::result::Result<(), StorageError>;
}

const PATH_BUF_CAP: usize = 192;

/// A fixed-capacity byte-string path builder, so path assembly (EverDrive
/// redirection, `.bak` suffixing) doesn't require `alloc`.
struct PathBuf {
    buf: [u8; PATH_BUF_CAP],
    len: usize,
}

impl PathBuf {
    fn new() -> Self {
        PathBuf {
            buf: [0; PATH_BUF_CAP],
            len: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if self.len + bytes.len() > PATH_BUF_CAP {
            return Err(DriveError::OutOfMemory);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Strips any leading directory components (`\` or `/`), matching
/// `fds_load_side`'s backwards scan for the last path separator.
fn basename(path: &[u8]) -> &[u8] {
    let mut start = 0;
    for (i, &b) in path.iter().enumerate() {
        if b == b'\\' || b == b'/' {
            start = i + 1;
        }
    }
    &path[start..]
}

fn everdrive_path(path: &[u8], suffix: &[u8]) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    out.push(b"EDN8\\gamedata\\")?;
    out.push(basename(path))?;
    out.push(suffix)?;
    Ok(out)
}

/// §4.7: loads `path`'s side `side_index` into a fresh [`DiskSide`],
/// tolerating a truncated trailing block once the file-count block has
/// established how many blocks a complete side should have.
pub fn load_side<O: StorageOpener>(
    opener: &mut O,
    path: &[u8],
    side_index: u8,
    readonly: bool,
    pins: &mut impl MotorPins,
    settings: &impl Settings,
) -> Result<DiskSide> {
    pins.set_ready(false);
    pins.set_media_set(true);
    pins.set_writable(!readonly);

    let result = load_side_inner(opener, path, side_index, readonly, settings);
    match &result {
        Ok(side) => info!("loaded side {} of {:?}, {} blocks", side_index, path, side.block_count()),
        Err(e) => {
            warn!("failed to load side {} of {:?}: {:?}", side_index, path, e);
            // Mirrors `fds_close(0)` on every failure path in `fds_load_side`.
            pins.set_media_set(false);
            pins.set_writable(false);
            pins.set_ready(false);
        }
    }
    result
}

fn load_side_inner<O: StorageOpener>(
    opener: &mut O,
    path: &[u8],
    side_index: u8,
    readonly: bool,
    settings: &impl Settings,
) -> Result<DiskSide> {
    let mut load_path = PathBuf::new();
    load_path.push(path)?;
    if settings.backup_original() == BackupPolicy::Everdrive {
        let everdrive = everdrive_path(path, b"\\bram.srm")?;
        if opener.exists(everdrive.as_bytes())? {
            load_path = everdrive;
        }
    }

    let mut file = opener.open_read(load_path.as_bytes())?;
    let file_size = file.len()?;
    if file_size % ROM_SIDE_SIZE != 0 && file_size % ROM_SIDE_SIZE != ROM_HEADER_SIZE {
        return Err(DriveError::InvalidRom);
    }
    let header_present = file_size % ROM_SIDE_SIZE == ROM_HEADER_SIZE;
    let seek_to =
        (if header_present { ROM_HEADER_SIZE } else { 0 }) + (side_index as u64) * ROM_SIDE_SIZE;
    file.seek(seek_to)?;

    let mut side = DiskSide::try_empty(readonly, side_index, path)?;
    let mut min_blocks: usize = 0;

    loop {
        if side.block_count == 2 {
            let off = side.block_offsets[1] + gap_length(1) + 1;
            min_blocks = side.raw()[off] as usize * 2 + 2;
        }
        let bi = side.block_count;
        side.block_offsets[bi] = side.used_space;
        let gap = gap_length(bi);
        if side.used_space + gap > MAX_SIDE_SIZE {
            if bi + 1 < min_blocks {
                return Err(DriveError::RomTooLarge);
            }
            break;
        }
        let gap_start = side.used_space;
        side.raw_mut()[gap_start..gap_start + gap - 1].fill(0);
        side.raw_mut()[gap_start + gap - 1] = GAP_TERMINATOR;
        side.used_space += gap;

        let block_type = crate::image::expected_block_type(bi);
        let block_size = side.block_size(bi, false, false) as usize;

        if side.used_space + block_size + CRC_LEN > MAX_SIDE_SIZE {
            if bi + 1 < min_blocks {
                return Err(DriveError::RomTooLarge);
            }
            side.raw_mut()[side.used_space - 1] = 0;
            side.used_space -= gap;
            break;
        }

        let body_start = side.used_space;
        let n = file.read(&mut side.raw_mut()[body_start..body_start + block_size])?;
        if n != block_size {
            if bi + 1 < min_blocks {
                return Err(DriveError::InvalidRom);
            }
            info!("side truncated after block {}, keeping what was read", bi);
            side.raw_mut()[side.used_space - 1] = 0;
            side.used_space -= gap;
            break;
        }
        if side.raw()[body_start] != block_type {
            if bi + 1 < min_blocks {
                return Err(DriveError::InvalidRom);
            }
            side.raw_mut()[side.used_space - 1] = 0;
            side.used_space -= gap;
            break;
        }
        if bi == 0 {
            let sig = &side.raw()[body_start + 1..body_start + 1 + DISK_INFO_SIGNATURE.len()];
            if sig != DISK_INFO_SIGNATURE {
                return Err(DriveError::InvalidRom);
            }
        }

        let checksum = crc(&side.raw()[body_start..body_start + block_size]);
        side.used_space += block_size;
        side.raw_mut()[side.used_space] = (checksum & 0xFF) as u8;
        side.raw_mut()[side.used_space + 1] = (checksum >> 8) as u8;
        side.used_space += CRC_LEN;
        side.block_count += 1;
    }

    Ok(side)
}

fn copy_file<O: StorageOpener>(
    opener: &mut O,
    source_path: &[u8],
    dest_path: &[u8],
    skip_header_if_present: bool,
) -> Result<()> {
    let mut src = opener.open_read(source_path)?;
    let mut dst = opener.create_new(dest_path)?;
    if skip_header_if_present {
        let size = src.len()?;
        if size % ROM_SIDE_SIZE == ROM_HEADER_SIZE {
            src.seek(ROM_HEADER_SIZE)?;
        }
    }
    let mut buf = [0u8; 4096];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
    }
    Ok(())
}

/// §4.7 (save half): writes every changed block back to storage, honouring
/// the configured [`BackupPolicy`]. A no-op if the side isn't dirty.
pub fn save<O: StorageOpener>(
    side: &mut DiskSide,
    opener: &mut O,
    settings: &impl Settings,
) -> Result<()> {
    if !side.changed() {
        return Ok(());
    }
    if side.readonly() {
        warn!("refusing to save a read-only side");
        return Err(DriveError::ReadOnly);
    }

    for i in 0..side.block_count() {
        if !side.verify_block_crc(i)? {
            warn!("block {} failed CRC verification, aborting save", i);
            return Err(DriveError::WrongCrc);
        }
    }

    let filename = side.filename();
    let mut target = PathBuf::new();
    target.push(filename)?;

    match settings.backup_original() {
        BackupPolicy::None => {}
        BackupPolicy::RewriteBackup => {
            let mut backup = PathBuf::new();
            backup.push(filename)?;
            backup.push(b".bak")?;
            if !opener.exists(backup.as_bytes())? {
                copy_file(opener, filename, backup.as_bytes(), false)?;
            }
        }
        BackupPolicy::Everdrive => {
            opener.mkdir_all(b"EDN8\\gamedata")?;
            let mut dir = PathBuf::new();
            dir.push(b"EDN8\\gamedata\\")?;
            dir.push(basename(filename))?;
            opener.mkdir_all(dir.as_bytes())?;
            let everdrive = everdrive_path(filename, b"\\bram.srm")?;
            if !opener.exists(everdrive.as_bytes())? {
                copy_file(opener, filename, everdrive.as_bytes(), true)?;
            }
            target = everdrive;
        }
    }

    let mut file = opener.open_write(target.as_bytes())?;
    let header_offset = file.len()? % ROM_SIDE_SIZE;
    let seek_to = header_offset + (side.side_index() as u64) * ROM_SIDE_SIZE;
    file.seek(seek_to)?;
    for i in 0..side.block_count() {
        let body = side.block_body(i).ok_or(DriveError::InvalidState)?;
        file.write_all(body)?;
    }

    side.changed = false;
    info!("saved {:?} side {}", side.filename(), side.side_index());
    Ok(())
}

#[cfg(any(test, feature = "std"))]
pub mod test_doubles {
    //! An in-memory [`StorageOpener`] for this crate's own tests and for
    //! host test suites exercising [`crate::storage::load_side`]/[`save`]
    //! without a real filesystem.

    use super::{StorageError, StorageFile, StorageOpener};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use std::vec::Vec;

    type Files = Rc<RefCell<HashMap<Vec<u8>, Vec<u8>>>>;

    #[derive(Default, Clone)]
    pub struct MemStorageOpener {
        files: Files,
    }

    impl MemStorageOpener {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, path: &[u8], data: &[u8]) {
            self.files.borrow_mut().insert(path.to_vec(), data.to_vec());
        }

        pub fn contents(&self, path: &[u8]) -> Option<Vec<u8>> {
            self.files.borrow().get(path).cloned()
        }
    }

    pub struct MemFile {
        files: Files,
        path: Vec<u8>,
        pos: usize,
    }

    impl StorageFile for MemFile {
        fn len(&mut self) -> core::result::Result<u64, StorageError> {
            Ok(self
                .files
                .borrow()
                .get(&self.path)
                .map(|v| v.len() as u64)
                .unwrap_or(0))
        }

        fn seek(&mut self, offset: u64) -> core::result::Result<(), StorageError> {
            self.pos = offset as usize;
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, StorageError> {
            let files = self.files.borrow();
            let data = files.get(&self.path).ok_or(StorageError::NoFile)?;
            if self.pos >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - self.pos);
            buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn write_all(&mut self, buf: &[u8]) -> core::result::Result<(), StorageError> {
            let mut files = self.files.borrow_mut();
            let data = files.entry(self.path.clone()).or_insert_with(Vec::new);
            let end = self.pos + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[self.pos..end].copy_from_slice(buf);
            self.pos = end;
            Ok(())
        }
    }

    impl StorageOpener for MemStorageOpener {
        type File = MemFile;

        fn open_read(&mut self, path: &[u8]) -> core::result::Result<Self::File, StorageError> {
            if !self.files.borrow().contains_key(path) {
                return Err(StorageError::NoFile);
            }
            Ok(MemFile {
                files: self.files.clone(),
                path: path.to_vec(),
                pos: 0,
            })
        }

        fn open_write(&mut self, path: &[u8]) -> core::result::Result<Self::File, StorageError> {
            self.files
                .borrow_mut()
                .entry(path.to_vec())
                .or_insert_with(Vec::new);
            Ok(MemFile {
                files: self.files.clone(),
                path: path.to_vec(),
                pos: 0,
            })
        }

        fn create_new(&mut self, path: &[u8]) -> core::result::Result<Self::File, StorageError> {
            if self.files.borrow().contains_key(path) {
                return Err(StorageError::Exist);
            }
            self.files.borrow_mut().insert(path.to_vec(), Vec::new());
            Ok(MemFile {
                files: self.files.clone(),
                path: path.to_vec(),
                pos: 0,
            })
        }

        fn exists(&mut self, path: &[u8]) -> core::result::Result<bool, StorageError> {
            Ok(self.files.borrow().contains_key(path))
        }

        fn mkdir_all(&mut self, _path: &[u8]) -> core::result::Result<(), StorageError> {
            Ok(())
        }
    }
}

#[cfg(feature = "std")]
pub use fs::FsStorageOpener;

#[cfg(feature = "std")]
mod fs {
    //! A [`super::StorageOpener`] backed by `std::fs`, for hosts that run
    //! this crate on top of an OS filesystem instead of bare SD-card/FatFs
    //! access.

    use super::{StorageError, StorageFile, StorageOpener};
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::string::String;

    pub struct FsStorageOpener;

    pub struct FsFile(File);

    fn to_path(bytes: &[u8]) -> core::result::Result<String, StorageError> {
        let s = core::str::from_utf8(bytes).map_err(|_| StorageError::InvalidName)?;
        Ok(s.replace('\\', "/"))
    }

    fn map_io_err(e: std::io::Error) -> StorageError {
        use std::io::ErrorKind::*;
        match e.kind() {
            NotFound => StorageError::NoFile,
            PermissionDenied => StorageError::Denied,
            AlreadyExists => StorageError::Exist,
            _ => StorageError::Other,
        }
    }

    impl StorageFile for FsFile {
        fn len(&mut self) -> core::result::Result<u64, StorageError> {
            self.0.metadata().map(|m| m.len()).map_err(map_io_err)
        }

        fn seek(&mut self, offset: u64) -> core::result::Result<(), StorageError> {
            self.0
                .seek(SeekFrom::Start(offset))
                .map(|_| ())
                .map_err(map_io_err)
        }

        fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, StorageError> {
            self.0.read(buf).map_err(map_io_err)
        }

        fn write_all(&mut self, buf: &[u8]) -> core::result::Result<(), StorageError> {
            self.0.write_all(buf).map_err(map_io_err)
        }
    }

    impl StorageOpener for FsStorageOpener {
        type File = FsFile;

        fn open_read(&mut self, path: &[u8]) -> core::result::Result<Self::File, StorageError> {
            File::open(to_path(path)?).map(FsFile).map_err(map_io_err)
        }

        fn open_write(&mut self, path: &[u8]) -> core::result::Result<Self::File, StorageError> {
            OpenOptions::new()
                .write(true)
                .create(true)
                .open(to_path(path)?)
                .map(FsFile)
                .map_err(map_io_err)
        }

        fn create_new(&mut self, path: &[u8]) -> core::result::Result<Self::File, StorageError> {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(to_path(path)?)
                .map(FsFile)
                .map_err(map_io_err)
        }

        fn exists(&mut self, path: &[u8]) -> core::result::Result<bool, StorageError> {
            Ok(std::path::Path::new(&to_path(path)?).exists())
        }

        fn mkdir_all(&mut self, path: &[u8]) -> core::result::Result<(), StorageError> {
            std::fs::create_dir_all(to_path(path)?).map_err(map_io_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_doubles::MemStorageOpener;
    use super::*;
    use crate::hal::test_doubles::{FakePins, FakeSettings};
    use crate::hal::RewindSpeed;

    fn build_one_file_rom() -> Vec<u8> {
        let mut body0 = [0u8; DISK_INFO_BODY_LEN];
        body0[0] = BLOCK_TYPE_DISK_INFO;
        body0[1..15].copy_from_slice(DISK_INFO_SIGNATURE);
        let c0 = crc(&body0);

        let body1 = [BLOCK_TYPE_FILE_COUNT, 0x01];
        let c1 = crc(&body1);

        let mut body2 = [0u8; FILE_HEADER_BODY_LEN];
        body2[0] = BLOCK_TYPE_FILE_HEADER;
        body2[FILE_HEADER_SIZE_FIELD_OFFSET] = 4;
        body2[FILE_HEADER_SIZE_FIELD_OFFSET + 1] = 0;
        let c2 = crc(&body2);

        let body3 = [BLOCK_TYPE_FILE_DATA, 0xAA, 0xBB, 0xCC, 0xDD];
        let c3 = crc(&body3);

        let mut rom = Vec::new();
        rom.extend_from_slice(&body0);
        rom.extend_from_slice(&c0.to_le_bytes());
        rom.extend_from_slice(&body1);
        rom.extend_from_slice(&c1.to_le_bytes());
        rom.extend_from_slice(&body2);
        rom.extend_from_slice(&c2.to_le_bytes());
        rom.extend_from_slice(&body3);
        rom.extend_from_slice(&c3.to_le_bytes());
        rom
    }

    #[test]
    fn loads_a_well_formed_single_file_side() {
        let opener = MemStorageOpener::new();
        opener.seed(b"game.fds", &build_one_file_rom());
        let mut opener = opener;
        let mut pins = FakePins::default();
        let settings = FakeSettings::default();
        let side =
            load_side(&mut opener, b"game.fds", 0, false, &mut pins, &settings).unwrap();
        assert_eq!(side.block_count(), 4);
        assert!(pins.writable.get());
        assert!(pins.media_set.get());
        assert!(!pins.ready.get());
        for i in 0..4 {
            assert!(side.verify_block_crc(i).unwrap());
        }
    }

    #[test]
    fn rejects_a_file_whose_size_is_not_a_multiple_of_the_side_size() {
        let opener = MemStorageOpener::new();
        opener.seed(b"bad.fds", &[0u8; 123]);
        let mut opener = opener;
        let mut pins = FakePins::default();
        let settings = FakeSettings::default();
        let result = load_side(&mut opener, b"bad.fds", 0, false, &mut pins, &settings);
        assert!(matches!(result, Err(DriveError::InvalidRom)));
    }

    #[test]
    fn save_is_a_no_op_on_an_unchanged_side() {
        let opener = MemStorageOpener::new();
        opener.seed(b"game.fds", &build_one_file_rom());
        let mut opener = opener;
        let mut pins = FakePins::default();
        let settings = FakeSettings::default();
        let mut side =
            load_side(&mut opener, b"game.fds", 0, false, &mut pins, &settings).unwrap();
        assert!(!side.changed());
        save(&mut side, &mut opener, &settings).unwrap();
        assert_eq!(
            opener.contents(b"game.fds").unwrap(),
            build_one_file_rom()
        );
    }

    #[test]
    fn save_refuses_a_readonly_side() {
        let opener = MemStorageOpener::new();
        opener.seed(b"game.fds", &build_one_file_rom());
        let mut opener = opener;
        let mut pins = FakePins::default();
        let settings = FakeSettings::default();
        let mut side =
            load_side(&mut opener, b"game.fds", 0, true, &mut pins, &settings).unwrap();
        side.changed = true;
        let result = save(&mut side, &mut opener, &settings);
        assert!(matches!(result, Err(DriveError::ReadOnly)));
    }

    #[test]
    fn everdrive_backup_policy_copies_the_original_once_then_redirects_saves() {
        let opener = MemStorageOpener::new();
        opener.seed(b"game.fds", &build_one_file_rom());
        let mut opener = opener;
        let mut pins = FakePins::default();
        let settings = FakeSettings {
            backup_original: crate::hal::BackupPolicy::Everdrive,
            ..FakeSettings::default()
        };
        let mut side =
            load_side(&mut opener, b"game.fds", 0, false, &mut pins, &settings).unwrap();
        side.changed = true;
        save(&mut side, &mut opener, &settings).unwrap();
        assert!(opener
            .contents(b"EDN8\\gamedata\\game.fds\\bram.srm")
            .is_some());
        assert_eq!(
            opener.contents(b"game.fds").unwrap(),
            build_one_file_rom()
        );
        assert!(!side.changed());
    }

    #[test]
    fn rewrite_backup_policy_keeps_a_bak_copy_alongside_the_original() {
        let opener = MemStorageOpener::new();
        opener.seed(b"game.fds", &build_one_file_rom());
        let mut opener = opener;
        let mut pins = FakePins::default();
        let settings = FakeSettings {
            backup_original: crate::hal::BackupPolicy::RewriteBackup,
            ..FakeSettings::default()
        };
        let mut side =
            load_side(&mut opener, b"game.fds", 0, false, &mut pins, &settings).unwrap();
        side.changed = true;
        save(&mut side, &mut opener, &settings).unwrap();
        assert_eq!(
            opener.contents(b"game.fds.bak").unwrap(),
            build_one_file_rom()
        );
    }

    #[test]
    fn wrong_crc_blocks_a_save() {
        let opener = MemStorageOpener::new();
        opener.seed(b"game.fds", &build_one_file_rom());
        let mut opener = opener;
        let mut pins = FakePins::default();
        let settings = FakeSettings::default();
        let mut side =
            load_side(&mut opener, b"game.fds", 0, false, &mut pins, &settings).unwrap();
        let body_start = side.block_offsets[3] + gap_length(3) + 1;
        side.raw_mut()[body_start] ^= 0xFF;
        side.changed = true;
        let result = save(&mut side, &mut opener, &settings);
        assert!(matches!(result, Err(DriveError::WrongCrc)));
    }

    #[test]
    fn rewind_policy_is_unused_by_storage_but_accepted_for_symmetry_with_the_load_signature() {
        // load_side/save never branch on rewind_speed themselves; this just
        // documents that Turbo settings don't change storage behaviour.
        let opener = MemStorageOpener::new();
        opener.seed(b"game.fds", &build_one_file_rom());
        let mut opener = opener;
        let mut pins = FakePins::default();
        let settings = FakeSettings {
            rewind_speed: RewindSpeed::Turbo,
            ..FakeSettings::default()
        };
        let side = load_side(&mut opener, b"game.fds", 0, false, &mut pins, &settings).unwrap();
        assert_eq!(side.block_count(), 4);
    }
}

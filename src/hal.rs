//! Named hardware capabilities the drive core consumes but does not own.
//!
//! Grounded on `rustBoot`'s `flashapi::FlashApi` (a minimal trait a flash
//! driver implements so the bootloader core stays hardware-agnostic) and its
//! `fs::controller::TimeSource` (the same pattern for a clock).

/// The four GPIO signals the host drives or reads, per §6 of the design
/// document. All directions are named for what they mean, not their
/// electrical polarity — every one of these pins is active-low on the real
/// hardware, and re-deriving that at each call site would be error-prone, so
/// implementations translate polarity once, here.
pub trait MotorPins {
    /// `true` while the host is asserting `SCAN_MEDIA` (motor on).
    fn scan_media_active(&self) -> bool;
    /// `true` while the host is driving `WRITE` high (read mode); `false`
    /// means the host wants to write.
    fn write_mode(&self) -> bool;
    /// Assert or deassert `READY`.
    fn set_ready(&mut self, asserted: bool);
    /// Assert or deassert `MEDIA_SET` (a disk side is loaded).
    fn set_media_set(&mut self, asserted: bool);
    /// Assert or deassert `WRITABLE_MEDIA` (the loaded side isn't readonly).
    fn set_writable(&mut self, asserted: bool);
}

/// A free-running millisecond clock. Wraps are tolerated the same way pulse
/// subtraction tolerates 16-bit wrap in the write demodulator.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// How aggressively the drive snaps the head back to byte 0, and whether
/// (and how) a successful save keeps a backup of the original file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindSpeed {
    /// Imitate the mechanical drive's slower rewind.
    Original,
    /// Snap the head to 0 as soon as it runs past used space.
    Turbo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPolicy {
    /// Overwrite the loaded file in place.
    None,
    /// Keep a `<filename>.bak` copy of the pre-save file.
    RewriteBackup,
    /// Redirect saves to an EverDrive-style `EDN8\gamedata\<name>\bram.srm`
    /// path, copying the original ROM there first if it doesn't exist yet.
    Everdrive,
}

/// The settings store: a handful of policy knobs owned by firmware outside
/// this crate (e.g. a flash-backed config struct or an EEPROM page).
pub trait Settings {
    fn rewind_speed(&self) -> RewindSpeed;
    fn backup_original(&self) -> BackupPolicy;
    /// How long the drive must sit idle with unsaved changes before
    /// `check_pins` escalates to `DriveState::SavePending`. Authoritative —
    /// see `DESIGN.md`'s Open Question decision on the autosave timer.
    fn autosave_delay_ms(&self) -> u32;
}

#[cfg(any(test, feature = "std"))]
pub mod test_doubles {
    //! In-memory stand-ins used by this crate's own tests, and usable by
    //! host test suites that exercise [`crate::drive::Drive`] without real
    //! hardware.

    use super::*;
    use core::cell::Cell;

    /// A [`MotorPins`] double driven by setting fields directly.
    #[derive(Debug, Default)]
    pub struct FakePins {
        pub scan_media_active: bool,
        pub write_mode: bool,
        pub ready: Cell<bool>,
        pub media_set: Cell<bool>,
        pub writable: Cell<bool>,
    }

    impl MotorPins for FakePins {
        fn scan_media_active(&self) -> bool {
            self.scan_media_active
        }
        fn write_mode(&self) -> bool {
            self.write_mode
        }
        fn set_ready(&mut self, asserted: bool) {
            self.ready.set(asserted);
        }
        fn set_media_set(&mut self, asserted: bool) {
            self.media_set.set(asserted);
        }
        fn set_writable(&mut self, asserted: bool) {
            self.writable.set(asserted);
        }
    }

    /// A [`Clock`] double with a manually-advanced counter.
    #[derive(Debug, Default)]
    pub struct FakeClock {
        pub now_ms: Cell<u32>,
    }

    impl FakeClock {
        pub fn advance(&self, delta_ms: u32) {
            self.now_ms.set(self.now_ms.get().wrapping_add(delta_ms));
        }
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> u32 {
            self.now_ms.get()
        }
    }

    /// A [`Settings`] double with fixed policy values.
    #[derive(Debug, Clone, Copy)]
    pub struct FakeSettings {
        pub rewind_speed: RewindSpeed,
        pub backup_original: BackupPolicy,
        pub autosave_delay_ms: u32,
    }

    impl Default for FakeSettings {
        fn default() -> Self {
            FakeSettings {
                rewind_speed: RewindSpeed::Original,
                backup_original: BackupPolicy::None,
                autosave_delay_ms: crate::constants::DEFAULT_AUTOSAVE_DELAY_MS,
            }
        }
    }

    impl Settings for FakeSettings {
        fn rewind_speed(&self) -> RewindSpeed {
            self.rewind_speed
        }
        fn backup_original(&self) -> BackupPolicy {
            self.backup_original
        }
        fn autosave_delay_ms(&self) -> u32 {
            self.autosave_delay_ms
        }
    }
}

//! The drive state machine: reacts to `SCAN_MEDIA`/`WRITE` edges and to
//! periodic polling, sequencing ready-delay, read, write and idle-save
//! states. Grounded on `fdsemu.c: fds_check_pins` for the transition table
//! and on `rustBoot`'s habit (`update/update_flash.rs`) of carrying a
//! capability-generic driver struct rather than a bag of free functions.

use crate::constants::*;
use crate::demodulator;
use crate::hal::{Clock, MotorPins, RewindSpeed, Settings};
use crate::image::DiskSide;
use crate::modulator;
use crate::storage::StorageOpener;
use crate::Result;
use log::{info, warn};

/// All states the emulated drive can be in. See §3/§4.6 of the design
/// document for the full transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Off,
    Idle,
    Reading,
    ReadWaitReady,
    ReadWaitReadyTimer,
    WritingGap,
    Writing,
    WritingStopping,
    SavePending,
}

/// The single physical head's position and the handful of carrier/pulse
/// bookkeeping fields the modulator and demodulator thread through it.
/// Reading interprets `current_bit` over `[0, 16)` (two carrier
/// half-periods per data bit); writing interprets it over `[0, 8)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadCursor {
    pub current_byte: usize,
    pub current_bit: u8,
    pub clock: u8,
    pub last_value: u8,
    pub write_carrier: u8,
    pub current_block_end: usize,
    pub write_gap_skip: u16,
    pub last_write_impulse: u16,
}

/// The drive: one loaded (or absent) [`DiskSide`], the state machine, the
/// head cursor, and the capabilities ([`MotorPins`], [`Clock`],
/// [`Settings`]) it was built with.
///
/// `Drive` owns no interrupt context of its own — see §5.1 of the design
/// document. The host calls [`Drive::on_read_dma_half`] /
/// [`Drive::on_read_dma_full`] from its outbound-PWM-DMA callbacks,
/// [`Drive::on_write_pulse`] for every captured write-line pulse, and
/// [`Drive::check_pins`] on every `SCAN_MEDIA`/`WRITE` edge and at ≥ 10 Hz.
pub struct Drive<P, C, S> {
    pub pins: P,
    pub clock: C,
    pub settings: S,
    side: Option<DiskSide>,
    state: DriveState,
    cursor: HeadCursor,
    not_ready_time: u32,
    last_action_time: u32,
}

impl<P: MotorPins, C: Clock, S: Settings> Drive<P, C, S> {
    pub fn new(pins: P, clock: C, settings: S) -> Self {
        Drive {
            pins,
            clock,
            settings,
            side: None,
            state: DriveState::Off,
            cursor: HeadCursor::default(),
            not_ready_time: 0,
            last_action_time: 0,
        }
    }

    pub fn state(&self) -> DriveState {
        self.state
    }

    pub fn side(&self) -> Option<&DiskSide> {
        self.side.as_ref()
    }

    pub fn side_mut(&mut self) -> Option<&mut DiskSide> {
        self.side.as_mut()
    }

    /// Installs a freshly loaded side (see [`crate::storage::load_side`]),
    /// matching §4.7 step 8: resume at `ReadWaitReadyTimer` if the motor is
    /// already spinning under turbo rewind, else `Idle`.
    pub fn install_side(&mut self, side: DiskSide) {
        self.side = Some(side);
        self.cursor = HeadCursor::default();
        if self.pins.scan_media_active() && self.settings.rewind_speed() == RewindSpeed::Turbo {
            self.state = DriveState::ReadWaitReadyTimer;
        } else {
            self.state = DriveState::Idle;
        }
        self.check_pins();
    }

    /// Takes the loaded side back out, e.g. so the caller can hand it to
    /// [`crate::storage::save`] without fighting the borrow checker.
    pub fn take_side(&mut self) -> Option<DiskSide> {
        self.side.take()
    }

    /// Loads a side from `path` via `opener` and installs it (§4.7).
    pub fn load_side<O: StorageOpener>(
        &mut self,
        opener: &mut O,
        path: &[u8],
        side_index: u8,
        readonly: bool,
    ) -> Result<()> {
        let side = crate::storage::load_side(
            opener,
            path,
            side_index,
            readonly,
            &mut self.pins,
            &self.settings,
        )?;
        self.install_side(side);
        Ok(())
    }

    pub fn head_position(&self) -> usize {
        self.cursor.current_byte
    }

    pub fn current_block(&self) -> Option<usize> {
        self.side.as_ref().and_then(|s| s.current_block(self.cursor.current_byte))
    }

    pub fn max_size(&self) -> usize {
        MAX_SIDE_SIZE
    }

    // ---- outbound (read) DMA callbacks, §4.3/§5 ----

    pub fn on_read_dma_half(&mut self, buf: &mut [u8]) {
        self.fill_read_buffer(buf);
    }

    pub fn on_read_dma_full(&mut self, buf: &mut [u8]) {
        self.fill_read_buffer(buf);
    }

    fn fill_read_buffer(&mut self, buf: &mut [u8]) {
        let side = match &self.side {
            Some(s) => s,
            None => return,
        };
        modulator::fill_read_buffer(
            side,
            &mut self.cursor,
            &mut self.state,
            &mut self.not_ready_time,
            &mut self.pins,
            &self.clock,
            &self.settings,
            buf,
        );
    }

    // ---- inbound (write) DMA callback, §4.4/§5 ----

    pub fn on_write_dma_half(&mut self, buf: &[u16]) {
        self.parse_write_buffer(buf);
    }

    pub fn on_write_dma_full(&mut self, buf: &[u16]) {
        self.parse_write_buffer(buf);
    }

    fn parse_write_buffer(&mut self, buf: &[u16]) {
        for &timestamp in buf {
            let pulse = timestamp.wrapping_sub(self.cursor.last_write_impulse);
            self.cursor.last_write_impulse = timestamp;
            self.on_write_pulse(pulse);
        }
    }

    fn on_write_pulse(&mut self, pulse: u16) {
        let side = match &mut self.side {
            Some(s) => s,
            None => return,
        };
        demodulator::on_pulse(
            side,
            &mut self.cursor,
            &mut self.state,
            &mut self.pins,
            pulse,
        );
    }

    // ---- state machine, §4.6 ----

    /// Call on every `SCAN_MEDIA`/`WRITE` edge, and at least at
    /// [`crate::constants::CHECK_PINS_MIN_HZ`].
    pub fn check_pins(&mut self) {
        if self.pins.scan_media_active() {
            self.check_pins_motor_on();
            self.last_action_time = self.clock.now_ms();
        } else {
            self.check_pins_motor_off();
        }
    }

    fn check_pins_motor_off(&mut self) {
        match self.state {
            DriveState::Off | DriveState::Writing => {
                // Let the write DMA drain; the caller's own buffer
                // draining will naturally stop once the host releases the
                // motor and `WRITING_STOPPING` takes over.
            }
            DriveState::Idle => {
                let changed = self.side.as_ref().map(DiskSide::changed).unwrap_or(false);
                let idle_for = self.clock.now_ms().wrapping_sub(self.last_action_time);
                if changed && idle_for > self.settings.autosave_delay_ms() {
                    info!("autosave delay elapsed, requesting save");
                    self.state = DriveState::SavePending;
                }
            }
            DriveState::SavePending => {
                let changed = self.side.as_ref().map(DiskSide::changed).unwrap_or(false);
                if !changed {
                    self.state = DriveState::Idle;
                }
            }
            _ => {
                self.stop();
                if self.settings.rewind_speed() == RewindSpeed::Turbo {
                    modulator::reset_reading(&mut self.cursor, &self.settings);
                }
            }
        }
    }

    fn check_pins_motor_on(&mut self) {
        if self.state == DriveState::SavePending {
            let changed = self.side.as_ref().map(DiskSide::changed).unwrap_or(false);
            if !changed {
                self.state = DriveState::Idle;
            }
        }
        if self.pins.write_mode() {
            self.check_pins_read_mode();
        } else {
            self.check_pins_write_mode();
        }
    }

    fn check_pins_read_mode(&mut self) {
        match self.state {
            DriveState::Idle => {
                if self.settings.rewind_speed() == RewindSpeed::Turbo
                    || self.cursor.current_byte == 0
                {
                    self.not_ready_time = self.clock.now_ms();
                    self.state = DriveState::ReadWaitReadyTimer;
                    modulator::reset_reading(&mut self.cursor, &self.settings);
                } else {
                    self.start_reading();
                    self.state = DriveState::ReadWaitReady;
                }
            }
            DriveState::ReadWaitReadyTimer => {
                let timeout = if self.settings.rewind_speed() == RewindSpeed::Original {
                    NOT_READY_TIME_ORIGINAL_MS
                } else {
                    NOT_READY_TIME_MS
                };
                if self.clock.now_ms().wrapping_sub(self.not_ready_time) >= timeout {
                    self.pins.set_ready(true);
                    self.start_reading();
                }
            }
            DriveState::WritingStopping => {
                self.stop_writing();
                self.start_reading();
            }
            _ => {}
        }
    }

    fn check_pins_write_mode(&mut self) {
        match self.state {
            DriveState::Idle
            | DriveState::Reading
            | DriveState::ReadWaitReady
            | DriveState::ReadWaitReadyTimer => {
                self.stop_reading();
                self.start_writing();
            }
            _ => {}
        }
    }

    // ---- start/stop helpers, §4.3/§4.4/§4.6 ----

    fn start_reading(&mut self) {
        self.cursor.current_bit = 0;
        self.state = DriveState::Reading;
    }

    fn stop_reading(&mut self) {
        // Aborting the outbound DMA/PWM channel is the caller's
        // responsibility; `fill_read_buffer` is already a no-op once
        // `state` leaves `Reading`/`ReadWaitReady`.
    }

    fn start_writing(&mut self) {
        let side = match &mut self.side {
            Some(s) => s,
            None => return,
        };
        demodulator::start_writing(side, &mut self.cursor, &mut self.state, &mut self.pins);
    }

    fn stop_writing(&mut self) {
        // As with `stop_reading`, aborting the inbound capture DMA is the
        // caller's job; ceasing to call `on_write_dma_*` is sufficient.
    }

    /// Full stop, safe to call from any state: aborts both channels
    /// (conceptually — see `stop_reading`/`stop_writing`), deasserts
    /// `READY`, and forces `Idle`.
    pub fn stop(&mut self) {
        self.stop_reading();
        self.stop_writing();
        self.pins.set_ready(false);
        self.state = DriveState::Idle;
    }

    /// Tears the drive down entirely: deasserts `MEDIA_SET`/`WRITABLE_MEDIA`,
    /// optionally saves the loaded side via `opener` first, stops, and
    /// drops the side. Matches `fdsemu.c: fds_close`.
    pub fn close<O: StorageOpener>(&mut self, opener: &mut O, save_first: bool) -> Result<()> {
        self.pins.set_media_set(false);
        self.pins.set_writable(false);
        if save_first {
            if let Some(side) = &mut self.side {
                if let Err(e) = crate::storage::save(side, opener, &self.settings) {
                    warn!("save on close failed: {:?}", e);
                    self.stop();
                    self.state = DriveState::Off;
                    self.side = None;
                    return Err(e);
                }
            }
        }
        self.stop();
        self.state = DriveState::Off;
        self.side = None;
        Ok(())
    }
}

//! The read modulator: turns the raw side bytes into the PWM impulse train
//! the host samples as FM-encoded data, half a carrier period at a time.
//! Grounded on `fdsemu.c: fds_dma_fill_read_buffer` and `fds_reset_reading`.

use crate::constants::*;
use crate::drive::{DriveState, HeadCursor};
use crate::hal::{Clock, MotorPins, RewindSpeed, Settings};
use crate::image::DiskSide;

/// Resets the read cursor's carrier/bit state. Under
/// [`RewindSpeed::Turbo`] this also snaps the head back to byte 0 — the
/// "instant rewind" behaviour; under [`RewindSpeed::Original`] the head is
/// left where it was, so reading resumes from the same spot once `READY`
/// comes back.
pub fn reset_reading(cursor: &mut HeadCursor, settings: &impl Settings) {
    cursor.clock = 0;
    if settings.rewind_speed() == RewindSpeed::Turbo {
        cursor.current_byte = 0;
    }
    cursor.current_bit = 0;
    cursor.last_value = 0;
}

/// Advances the read cursor by one carrier half-period, producing one PWM
/// pulse width. A pulse is emitted only on a low-to-high transition of the
/// demodulated value (carrier XOR data bit), matching the MFM-like line
/// code described in §4.2.
fn step_half_period(
    side: &DiskSide,
    cursor: &mut HeadCursor,
    state: &mut DriveState,
    not_ready_time: &mut u32,
    pins: &mut impl MotorPins,
    clock: &impl Clock,
    settings: &impl Settings,
) -> u8 {
    cursor.clock ^= 1;
    let bit = (side.raw()[cursor.current_byte] >> (cursor.current_bit / 2)) & 1;
    let value = bit ^ cursor.clock;
    let pulse = if value != 0 && cursor.last_value == 0 {
        READ_IMPULSE_LENGTH - 1
    } else {
        0
    };
    cursor.last_value = value;
    cursor.current_bit += 1;
    if cursor.current_bit > 15 {
        cursor.current_bit = 0;
        cursor.current_byte = (cursor.current_byte + 1) % MAX_SIDE_SIZE;
        let turbo = settings.rewind_speed() == RewindSpeed::Turbo;
        if cursor.current_byte == 0
            || (turbo && cursor.current_byte > side.used_space() + NOT_READY_BYTES)
        {
            pins.set_ready(false);
            *not_ready_time = clock.now_ms();
            *state = DriveState::ReadWaitReadyTimer;
            reset_reading(cursor, settings);
        }
    }
    pulse
}

/// Fills `buf` with one pulse width per entry, matching one DMA half- or
/// full-buffer's worth of the outbound PWM channel. A no-op in every state
/// other than `Reading`/`ReadWaitReady`, so the caller can keep driving the
/// DMA callback unconditionally.
pub fn fill_read_buffer(
    side: &DiskSide,
    cursor: &mut HeadCursor,
    state: &mut DriveState,
    not_ready_time: &mut u32,
    pins: &mut impl MotorPins,
    clock: &impl Clock,
    settings: &impl Settings,
    buf: &mut [u8],
) {
    if !matches!(*state, DriveState::Reading | DriveState::ReadWaitReady) {
        return;
    }
    for slot in buf.iter_mut() {
        *slot = step_half_period(side, cursor, state, not_ready_time, pins, clock, settings);
        if !matches!(*state, DriveState::Reading | DriveState::ReadWaitReady) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::test_doubles::{FakeClock, FakePins};
    use crate::image::gap_length;

    fn side_with_pattern() -> DiskSide {
        let mut side = DiskSide::empty(false, 0, b"game.fds");
        let gap = gap_length(0);
        side.raw_mut()[..gap].fill(0xFF);
        side.block_offsets[0] = 0;
        side.block_count = 1;
        side.used_space = gap + DISK_INFO_BODY_LEN + CRC_LEN;
        side
    }

    struct FixedRewind(RewindSpeed);
    impl Settings for FixedRewind {
        fn rewind_speed(&self) -> RewindSpeed {
            self.0
        }
        fn backup_original(&self) -> crate::hal::BackupPolicy {
            crate::hal::BackupPolicy::None
        }
        fn autosave_delay_ms(&self) -> u32 {
            DEFAULT_AUTOSAVE_DELAY_MS
        }
    }

    #[test]
    fn no_pulses_emitted_outside_reading_states() {
        let side = side_with_pattern();
        let mut cursor = HeadCursor::default();
        let mut state = DriveState::Idle;
        let mut not_ready_time = 0u32;
        let mut pins = FakePins::default();
        let clock = FakeClock::default();
        let settings = FixedRewind(RewindSpeed::Original);
        let mut buf = [0xAAu8; 4];
        fill_read_buffer(
            &side,
            &mut cursor,
            &mut state,
            &mut not_ready_time,
            &mut pins,
            &clock,
            &settings,
            &mut buf,
        );
        assert_eq!(buf, [0xAA; 4]);
    }

    #[test]
    fn turbo_rewind_snaps_current_byte_to_zero_on_reset() {
        let mut cursor = HeadCursor {
            current_byte: 1234,
            ..Default::default()
        };
        reset_reading(&mut cursor, &FixedRewind(RewindSpeed::Turbo));
        assert_eq!(cursor.current_byte, 0);
    }

    #[test]
    fn original_rewind_keeps_current_byte_on_reset() {
        let mut cursor = HeadCursor {
            current_byte: 1234,
            ..Default::default()
        };
        reset_reading(&mut cursor, &FixedRewind(RewindSpeed::Original));
        assert_eq!(cursor.current_byte, 1234);
    }

    #[test]
    fn wrapping_past_the_end_of_the_side_re_arms_the_ready_timer() {
        let side = side_with_pattern();
        let mut cursor = HeadCursor {
            current_byte: MAX_SIDE_SIZE - 1,
            current_bit: 15,
            ..Default::default()
        };
        let mut state = DriveState::Reading;
        let mut not_ready_time = 0u32;
        let mut pins = FakePins::default();
        let clock = FakeClock::default();
        clock.advance(500);
        let settings = FixedRewind(RewindSpeed::Original);
        let mut buf = [0u8; 1];
        fill_read_buffer(
            &side,
            &mut cursor,
            &mut state,
            &mut not_ready_time,
            &mut pins,
            &clock,
            &settings,
            &mut buf,
        );
        assert_eq!(state, DriveState::ReadWaitReadyTimer);
        assert_eq!(cursor.current_byte, 0);
        assert!(!pins.ready.get());
        assert_eq!(not_ready_time, 500);
    }
}

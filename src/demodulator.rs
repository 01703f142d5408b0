//! The write demodulator: decodes captured pulse widths back into bits and
//! drives the `WritingGap` / `Writing` / `WritingStopping` half of the
//! state machine. Grounded on `fdsemu.c: fds_write_bit` for the bucket
//! table and block-end handling, and `fds_reset_writing` (exposed here via
//! `DiskSide::reset_writing`) for (re)synchronising to a block boundary.

use crate::constants::*;
use crate::drive::{DriveState, HeadCursor};
use crate::hal::MotorPins;
use crate::image::DiskSide;
use log::warn;

/// Up to two bits a single pulse can demodulate into, and the carrier state
/// to carry into the next pulse.
struct Emission {
    bits: [u8; 2],
    bit_count: u8,
    new_carrier: u8,
}

/// Classifies `pulse` into the short/medium/long bucket and looks up the
/// data bit(s) it encodes given the current write carrier phase. Returns
/// `None` for the one combination (carrier high, long pulse) that cannot
/// occur on a well-formed stream.
fn demodulate(write_carrier: u8, pulse: u16) -> Option<Emission> {
    let bucket: u8 = if pulse < THRESHOLD_1 {
        2
    } else if pulse < THRESHOLD_2 {
        3
    } else {
        4
    };
    match write_carrier | bucket {
        0x82 => Some(Emission {
            bits: [0, 0],
            bit_count: 1,
            new_carrier: 0x80,
        }),
        0x83 => Some(Emission {
            bits: [1, 0],
            bit_count: 1,
            new_carrier: 0,
        }),
        0x02 => Some(Emission {
            bits: [1, 0],
            bit_count: 1,
            new_carrier: 0,
        }),
        0x03 => Some(Emission {
            bits: [0, 0],
            bit_count: 2,
            new_carrier: 0x80,
        }),
        0x04 => Some(Emission {
            bits: [0, 1],
            bit_count: 2,
            new_carrier: 0,
        }),
        _ => None,
    }
}

/// Shifts `bit` into the current byte MSB-first, advancing the cursor by
/// one bit position. Returns `true` once a full byte has been written.
fn write_bit(side: &mut DiskSide, cursor: &mut HeadCursor, bit: u8) -> bool {
    let cb = cursor.current_byte;
    let raw = side.raw_mut();
    raw[cb] = (raw[cb] >> 1) | (bit << 7);
    cursor.current_bit += 1;
    if cursor.current_bit > 7 {
        cursor.current_bit = 0;
        cursor.current_byte = (cursor.current_byte + 1) % MAX_SIDE_SIZE;
        true
    } else {
        false
    }
}

/// §4.4: once a byte boundary is crossed, decides whether the block (and
/// possibly the whole write) is over.
fn handle_block_boundary(
    side: &DiskSide,
    cursor: &mut HeadCursor,
    state: &mut DriveState,
    pins: &mut impl MotorPins,
) -> bool {
    let _ = side;
    if cursor.current_byte < cursor.current_block_end {
        return false;
    }
    if !pins.scan_media_active() {
        *state = DriveState::Idle;
        pins.set_ready(false);
    } else if pins.write_mode() {
        *state = DriveState::Reading;
        cursor.current_bit = 0;
    } else {
        *state = DriveState::WritingStopping;
        cursor.write_gap_skip = 0;
    }
    true
}

/// §4.5, as seen from the write path: re-synchronises to a block boundary,
/// falling back to a full stop if the layout no longer fits or wraps.
fn reset_writing_and_transition(
    side: &mut DiskSide,
    cursor: &mut HeadCursor,
    state: &mut DriveState,
    pins: &mut impl MotorPins,
) {
    *state = DriveState::WritingGap;
    if let Err(e) = side.reset_writing(cursor) {
        warn!("write aborted, disk side layout no longer fits: {:?}", e);
        *state = DriveState::Idle;
        pins.set_ready(false);
    }
}

/// Entry point for `check_pins_write_mode`'s `stop_reading(); start_writing()`
/// transition.
pub fn start_writing(
    side: &mut DiskSide,
    cursor: &mut HeadCursor,
    state: &mut DriveState,
    pins: &mut impl MotorPins,
) {
    reset_writing_and_transition(side, cursor, state, pins);
}

fn on_pulse_writing_stopping(
    side: &mut DiskSide,
    cursor: &mut HeadCursor,
    state: &mut DriveState,
    pins: &mut impl MotorPins,
    pulse: u16,
) {
    if pulse < THRESHOLD_1 {
        cursor.write_gap_skip += 1;
    } else {
        cursor.write_gap_skip = 0;
    }
    if cursor.write_gap_skip >= MULTI_WRITE_UNLICENSED_BITS {
        reset_writing_and_transition(side, cursor, state, pins);
    }
}

fn on_pulse_writing_gap(cursor: &mut HeadCursor, state: &mut DriveState, pulse: u16) {
    if cursor.write_gap_skip < WRITE_GAP_SKIP_BITS {
        cursor.write_gap_skip += 1;
    } else if pulse >= THRESHOLD_1 {
        cursor.write_carrier = 0;
        cursor.current_bit = 0;
        *state = DriveState::Writing;
    }
}

fn on_pulse_writing(
    side: &mut DiskSide,
    cursor: &mut HeadCursor,
    state: &mut DriveState,
    pins: &mut impl MotorPins,
    pulse: u16,
) {
    let emission = match demodulate(cursor.write_carrier, pulse) {
        Some(e) => e,
        None => return,
    };
    cursor.write_carrier = emission.new_carrier;
    for i in 0..emission.bit_count {
        let bit = emission.bits[i as usize];
        let crossed = write_bit(side, cursor, bit);
        if crossed && handle_block_boundary(side, cursor, state, pins) {
            return;
        }
    }
}

/// Dispatches one captured pulse width according to the current state.
/// A pulse arriving in any state other than the three below corresponds to
/// `fdsemu.c`'s default case (`fds_stop_writing()`), which in this crate is
/// the caller's responsibility (see `Drive::stop_writing`) and is a no-op
/// here.
pub fn on_pulse(
    side: &mut DiskSide,
    cursor: &mut HeadCursor,
    state: &mut DriveState,
    pins: &mut impl MotorPins,
    pulse: u16,
) {
    match *state {
        DriveState::WritingStopping => {
            on_pulse_writing_stopping(side, cursor, state, pins, pulse)
        }
        DriveState::WritingGap => on_pulse_writing_gap(cursor, state, pulse),
        DriveState::Writing => on_pulse_writing(side, cursor, state, pins, pulse),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::test_doubles::FakePins;
    use crate::image::gap_length;

    fn side_with_one_block() -> DiskSide {
        let mut side = DiskSide::empty(false, 0, b"game.fds");
        let gap = gap_length(0);
        side.raw_mut()[..gap - 1].fill(0);
        side.raw_mut()[gap - 1] = GAP_TERMINATOR;
        side.block_offsets[0] = 0;
        side.block_count = 1;
        side.used_space = gap + DISK_INFO_BODY_LEN + CRC_LEN;
        side
    }

    #[test]
    fn writing_gap_ignores_the_first_skip_bits_pulses_then_locks_carrier() {
        let mut cursor = HeadCursor::default();
        let mut state = DriveState::WritingGap;
        for _ in 0..WRITE_GAP_SKIP_BITS {
            on_pulse_writing_gap(&mut cursor, &mut state, THRESHOLD_2);
        }
        assert_eq!(state, DriveState::WritingGap);
        on_pulse_writing_gap(&mut cursor, &mut state, THRESHOLD_2);
        assert_eq!(state, DriveState::Writing);
        assert_eq!(cursor.write_carrier, 0);
    }

    #[test]
    fn writing_stopping_triggers_a_chained_write_after_enough_short_pulses() {
        let mut side = side_with_one_block();
        let mut cursor = HeadCursor {
            current_byte: side.used_space(),
            ..Default::default()
        };
        let mut state = DriveState::WritingStopping;
        let mut pins = FakePins::default();
        for _ in 0..MULTI_WRITE_UNLICENSED_BITS - 1 {
            on_pulse(&mut side, &mut cursor, &mut state, &mut pins, THRESHOLD_1 - 1);
        }
        assert_eq!(state, DriveState::WritingStopping);
        on_pulse(&mut side, &mut cursor, &mut state, &mut pins, THRESHOLD_1 - 1);
        assert_eq!(state, DriveState::WritingGap);
        assert_eq!(side.block_count(), 2);
    }

    #[test]
    fn a_long_pulse_in_writing_stopping_resets_the_skip_counter() {
        let mut side = side_with_one_block();
        let mut cursor = HeadCursor::default();
        let mut state = DriveState::WritingStopping;
        let mut pins = FakePins::default();
        for _ in 0..10 {
            on_pulse(&mut side, &mut cursor, &mut state, &mut pins, THRESHOLD_1 - 1);
        }
        on_pulse(&mut side, &mut cursor, &mut state, &mut pins, THRESHOLD_2);
        assert_eq!(cursor.write_gap_skip, 0);
        assert_eq!(state, DriveState::WritingStopping);
    }

    #[test]
    fn reaching_the_block_end_with_scan_media_deasserted_stops_the_drive() {
        let mut side = side_with_one_block();
        let body_len = side.block_size(0, false, false) as usize;
        let mut cursor = HeadCursor {
            current_byte: gap_length(0),
            current_bit: 7,
            write_carrier: 0x80,
            current_block_end: gap_length(0) + body_len,
            ..Default::default()
        };
        // Advance to one bit shy of the block end.
        cursor.current_byte = cursor.current_block_end - 1;
        let mut state = DriveState::Writing;
        let mut pins = FakePins {
            scan_media_active: false,
            ..Default::default()
        };
        on_pulse_writing(&mut side, &mut cursor, &mut state, &mut pins, THRESHOLD_1);
        assert_eq!(state, DriveState::Idle);
        assert!(!pins.ready.get());
    }
}

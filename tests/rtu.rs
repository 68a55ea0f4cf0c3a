// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU engine scenarios driven through a scripted serial stream.

#![cfg(feature = "rtu")]

mod common;

use std::{cell::Cell, rc::Rc};

use common::*;
use modbus_master::prelude::*;

/// Reference CRC used to fabricate response frames in the tests.
fn crc_frame(body: &[u8]) -> Vec<u8> {
    let mut crc = 0xFFFFu16;
    for &byte in body {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            let odd = crc & 1 != 0;
            crc >>= 1;
            if odd {
                crc ^= 0xA001;
            }
        }
    }
    let mut frame = body.to_vec();
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn master_with(
    config: RtuConfig,
) -> (RtuMaster<MockSerial, MockClock>, MockSerial, MockClock) {
    let serial = MockSerial::default();
    let clock = MockClock::default();
    let mut master = RtuMaster::with_clock(serial.clone(), clock.clone());
    master.begin(config);
    // Let the initial inter-frame silence elapse.
    clock.advance_ms(10);
    (master, serial, clock)
}

fn master() -> (RtuMaster<MockSerial, MockClock>, MockSerial, MockClock) {
    master_with(RtuConfig::default())
}

#[test]
fn read_holding_register_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (mut master, serial, _clock) = master();
    let value = Rc::new(Cell::new(0u16));
    let seen = Rc::clone(&value);
    master.read_holding_register::<u16>(1u8, 0x0000, move |pdu| {
        assert_eq!(pdu.status(), Ok(()));
        assert_eq!(pdu.function(), Some(0x03));
        assert_eq!(pdu.count::<u16>(), 1);
        seen.set(pdu.value::<u16>(0).unwrap());
    });
    master.tick();
    assert_eq!(
        serial.take_tx(),
        [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
    );
    serial.respond(&[0x01, 0x03, 0x02, 0x12, 0x34, 0xB5, 0x33]);
    master.tick();
    assert_eq!(value.get(), 0x1234);
}

#[test]
fn exception_response_is_decoded() {
    let (mut master, serial, _clock) = master();
    let recorder = Recorder::default();
    master.read_holding_register::<u16>(1u8, 0x0000, recorder.callback());
    master.tick();
    serial.take_tx();
    serial.respond(&[0x01, 0x83, 0x02, 0xC0, 0xF1]);
    master.tick();
    assert_eq!(recorder.len(), 1);
    assert_eq!(
        recorder.last().error,
        Some(Error::Exception(Exception::IllegalDataAddress))
    );
    assert!(recorder.last().data.is_empty());
}

#[test]
fn broadcast_write_completes_without_response() {
    let (mut master, serial, clock) = master();
    let recorder = Recorder::default();
    master.write_single_coil(0u8, 0x0005, true, recorder.callback());
    master.tick();
    let frame = serial.take_tx();
    assert_eq!(frame.len(), 8);
    assert_eq!(&frame[..6], &[0x00, 0x05, 0x00, 0x05, 0xFF, 0x00]);
    // Success is delivered right away, no receive is attempted.
    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.last().error, None);
    assert_eq!(recorder.last().slave, 0);

    // The next request still honors the turnaround silence.
    master.write_single_coil(1u8, 0x0005, false, recorder.callback());
    master.tick();
    assert!(serial.take_tx().is_empty());
    clock.advance_ms(2);
    master.tick();
    assert_eq!(serial.take_tx().len(), 8);
}

#[test]
fn broadcast_read_is_rejected_synchronously() {
    let (mut master, serial, _clock) = master();
    let recorder = Recorder::default();
    master.read_coil(0u8, 0x0000, recorder.callback());
    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.last().error, Some(Error::InvalidSlave));
    master.read_exception_status(0u8, recorder.callback());
    master.diagnostics(0u8, 0x0000, 0x1234, recorder.callback());
    assert_eq!(recorder.len(), 3);
    assert_eq!(recorder.at(1).error, Some(Error::InvalidSlave));
    assert_eq!(recorder.at(2).error, Some(Error::InvalidSlave));
    // Nothing was written to the wire.
    master.tick();
    assert!(serial.take_tx().is_empty());
}

#[test]
fn reserved_slave_id_is_rejected() {
    let (mut master, _serial, _clock) = master();
    let recorder = Recorder::default();
    master.write_single_coil(248u8, 0, true, recorder.callback());
    assert_eq!(recorder.last().error, Some(Error::InvalidSlave));
    master.read_coils(SlaveSet::new(), 0, 1, recorder.callback());
    assert_eq!(recorder.last().error, Some(Error::InvalidSlave));
}

#[test]
fn crc_failure_recovers_after_silence() {
    let (mut master, serial, clock) = master();
    let recorder = Recorder::default();
    master.read_holding_register::<u16>(1u8, 0x0000, recorder.callback());
    master.tick();
    serial.take_tx();
    serial.respond(&[0x01, 0x03, 0x02, 0x12, 0x34, 0xFF, 0xFF]);
    master.tick();
    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.last().error, Some(Error::Crc));

    // Back to idle, but transmission waits for a frame timeout of
    // silence since the last received byte.
    master.read_holding_register::<u16>(1u8, 0x0000, recorder.callback());
    master.tick();
    assert!(serial.take_tx().is_empty());
    clock.advance_ms(2);
    master.tick();
    assert_eq!(serial.take_tx().len(), 8);
}

#[test]
fn response_from_wrong_slave_fails_and_resyncs() {
    let (mut master, serial, clock) = master_with(RtuConfig {
        pdu_size: 8,
        ..RtuConfig::default()
    });
    let recorder = Recorder::default();
    master.read_holding_register::<u16>(1u8, 0x0000, recorder.callback());
    master.tick();
    serial.take_tx();
    // A 15 byte burst from the wrong slave overflows the 11 byte
    // frame buffer, so stale bytes remain after the failure.
    serial.respond(&[0x02; 15]);
    master.tick();
    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.last().error, Some(Error::InvalidSlave));

    // The engine clears the buffer until the line has been silent
    // for a full frame timeout.
    master.read_holding_register::<u16>(1u8, 0x0000, recorder.callback());
    master.tick();
    assert!(serial.take_tx().is_empty());
    clock.advance_ms(2);
    master.tick(); // buffer clear -> idle
    master.tick(); // idle -> transmit
    assert_eq!(serial.take_tx().len(), 8);
}

#[test]
fn response_timeout_fires() {
    let (mut master, serial, clock) = master();
    let recorder = Recorder::default();
    master.read_holding_register::<u16>(1u8, 0x0000, recorder.callback());
    master.tick();
    serial.take_tx();
    master.tick();
    assert_eq!(recorder.len(), 0);
    clock.advance_ms(3000);
    master.tick();
    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.last().error, Some(Error::ResponseTimeout));
}

#[test]
fn byte_timeout_aborts_a_stalled_frame() {
    let (mut master, serial, clock) = master();
    let recorder = Recorder::default();
    master.read_holding_register::<u16>(1u8, 0x0000, recorder.callback());
    master.tick();
    serial.take_tx();
    serial.respond(&[0x01, 0x03]);
    master.tick();
    assert_eq!(recorder.len(), 0);
    // Default byte timeout at 115200 baud is 750 us.
    clock.advance_us(800);
    master.tick();
    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.last().error, Some(Error::ResponseTimeout));
}

#[test]
fn multi_slave_rotation_with_repeat_cycle() {
    let (mut master, serial, clock) = master();
    let recorder = Recorder::default();
    let mut slaves: SlaveSet = [1, 2, 3].into_iter().collect();
    slaves.set_delay(0);
    slaves.set_repeat_delay(Some(1000));
    master.read_holding_register::<u16>(&slaves, 0x0000, recorder.callback());

    for slave in [1u8, 2, 3] {
        master.tick();
        let frame = serial.take_tx();
        assert_eq!(frame[0], slave, "request went to the wrong slave");
        serial.respond(&crc_frame(&[slave, 0x03, 0x02, 0x00, slave]));
        master.tick();
        assert_eq!(recorder.len(), usize::from(slave));
        assert_eq!(recorder.last().slave, slave);
        assert_eq!(recorder.last().error, None);
        clock.advance_ms(2);
    }

    // The cycle completed; the next round is spaced by the repeat
    // delay.
    master.tick();
    assert!(serial.take_tx().is_empty());
    clock.advance_ms(1000);
    master.tick();
    let frame = serial.take_tx();
    assert_eq!(frame[0], 1);
}

#[test]
fn rotation_ends_without_repeat_delay() {
    let (mut master, serial, clock) = master();
    let recorder = Recorder::default();
    let slaves: SlaveSet = [1, 2].into_iter().collect();
    master.read_holding_register::<u16>(&slaves, 0x0000, recorder.callback());

    for slave in [1u8, 2] {
        master.tick();
        assert_eq!(serial.take_tx()[0], slave);
        serial.respond(&crc_frame(&[slave, 0x03, 0x02, 0x00, 0x01]));
        master.tick();
        clock.advance_ms(2);
    }
    assert_eq!(recorder.len(), 2);

    // The ADU was released; nothing further is transmitted.
    clock.advance_ms(2000);
    master.tick();
    master.tick();
    assert!(serial.take_tx().is_empty());
}

#[test]
fn pool_exhaustion_is_reported() {
    let (mut master, _serial, _clock) = master_with(RtuConfig {
        queue_size: 1,
        ..RtuConfig::default()
    });
    let recorder = Recorder::default();
    master.read_holding_register::<u16>(1u8, 0x0000, recorder.callback());
    assert_eq!(recorder.len(), 0);
    master.read_holding_register::<u16>(2u8, 0x0000, recorder.callback());
    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.last().error, Some(Error::NoFreeAdu));
    assert_eq!(recorder.last().slave, 2);
}

#[test]
fn build_errors_are_delivered_synchronously() {
    let (mut master, serial, _clock) = master();
    let recorder = Recorder::default();
    master.read_coils(1u8, 0x0000, 2001, recorder.callback());
    assert_eq!(recorder.last().error, Some(Error::TooManyData));
    master.read_coils(1u8, 0x0000, 0, recorder.callback());
    assert_eq!(recorder.last().error, Some(Error::TooFewData));
    master.tick();
    assert!(serial.take_tx().is_empty());
}

#[test]
fn rs485_direction_lines_frame_the_transmission() {
    let (mut master, serial, _clock) = master_with(RtuConfig {
        driver_enable: true,
        receiver_enable: true,
        ..RtuConfig::default()
    });
    master.write_single_coil(1u8, 0, true, |_| {});
    master.tick();
    let state = serial.0.borrow();
    // Released at begin(), asserted before the write, released after
    // the flush.
    assert_eq!(state.driver_enable, [false, true, false]);
    assert_eq!(state.receiver_enable, [false, true, false]);
    assert!(state.flushes >= 2);
}

#[test]
fn teardown_discards_pending_requests() {
    let (mut master, serial, clock) = master();
    let recorder = Recorder::default();
    master.read_holding_register::<u16>(1u8, 0x0000, recorder.callback());
    master.tick();
    serial.take_tx();
    master.end();
    serial.respond(&[0x01, 0x03, 0x02, 0x12, 0x34, 0xB5, 0x33]);
    clock.advance_ms(5000);
    master.tick();
    assert_eq!(recorder.len(), 0, "teardown must not invoke callbacks");

    // A fresh begin() behaves like a new instance.
    master.begin(RtuConfig::default());
    clock.advance_ms(10);
    master.read_holding_register::<u16>(1u8, 0x0000, recorder.callback());
    master.tick();
    assert_eq!(
        serial.take_tx(),
        [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
    );
}

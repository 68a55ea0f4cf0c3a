// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tick-driven Modbus RTU master.
//!
//! The engine owns the serial stream and a fixed pool of ADUs sized
//! like the pending queue. Each tick advances a four-state machine:
//! idle (transmit the next ready request once the line has been
//! silent for a frame timeout), receive (accumulate the response and
//! verify the echoed slave id), head-checked (complete the frame,
//! verify CRC, validate, deliver), and buffer-clear (swallow stale
//! bytes until the line is silent again). The head-checked stage runs
//! in the same tick as the receive stage unless the latter terminated
//! the transaction.

use crate::{
    client::{next_repeat, Target, Transport},
    codec::{self, crc},
    error::Error,
    frame::{
        rtu::{RtuAdu, CRC_LEN, HEADER_LEN},
        Callback, Pdu,
    },
    io::{elapsed, Clock, SerialStream, SystemClock},
    queue::AduQueue,
    slave::{SlaveSet, BROADCAST},
};

/// Default response timeout (time between the transmission and the
/// first response byte) in microseconds.
const DEFAULT_RESPONSE_TIMEOUT_US: u64 = 3_000 * 1_000;

/// UART frame formats supported for timeout derivation. The
/// discriminant encodes data bits, parity, and stop bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum UartMode {
    /// 8 data bits, no parity, 1 stop bit.
    #[default]
    Mode8N1 = 0x06,
    /// 8 data bits, even parity, 1 stop bit.
    Mode8E1 = 0x26,
    /// 8 data bits, odd parity, 1 stop bit.
    Mode8O1 = 0x36,
    /// 8 data bits, no parity, 2 stop bits.
    Mode8N2 = 0x0E,
    /// 8 data bits, even parity, 2 stop bits.
    Mode8E2 = 0x2E,
}

impl UartMode {
    fn data_bits(self) -> u32 {
        5 + ((self as u8 as u32) >> 1 & 0x03)
    }

    fn parity_bits(self) -> u32 {
        (self as u8 as u32) >> 5 & 0x03
    }

    fn stop_bits(self) -> u32 {
        1 + ((self as u8 as u32) >> 3 & 0x01)
    }

    /// Bits per character on the wire, including the start bit.
    fn char_bits(self) -> u32 {
        1 + self.data_bits() + self.parity_bits() + self.stop_bits()
    }
}

/// RTU engine configuration.
#[derive(Debug, Clone)]
pub struct RtuConfig {
    /// Per-ADU buffer capacity in bytes, clamped to 8..=253.
    pub pdu_size: usize,
    /// Capacity of the ADU pool and of the pending queue.
    pub queue_size: usize,
    /// Baud rate used to derive the byte and frame timeouts.
    pub baud: u32,
    /// UART frame format used to derive the byte and frame timeouts.
    pub mode: UartMode,
    /// Drive the RS-485 driver-enable line around transmissions.
    pub driver_enable: bool,
    /// Drive the RS-485 receiver-enable line around transmissions.
    pub receiver_enable: bool,
    /// Overrides the derived inter-frame silence, in microseconds.
    pub frame_timeout_us: Option<u64>,
    /// Overrides the derived inter-character timeout, in microseconds.
    pub byte_timeout_us: Option<u64>,
    /// Overrides the default response timeout, in microseconds.
    pub response_timeout_us: Option<u64>,
}

impl Default for RtuConfig {
    fn default() -> Self {
        Self {
            pdu_size: crate::frame::MAX_PDU_SIZE,
            queue_size: 5,
            baud: 115_200,
            mode: UartMode::Mode8N1,
            driver_enable: false,
            receiver_enable: false,
            frame_timeout_us: None,
            byte_timeout_us: None,
            response_timeout_us: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Receive,
    HeadChecked,
    BufferClear,
}

/// Modbus RTU master over a [`SerialStream`].
///
/// Requests are issued through the [`Client`](crate::client::Client)
/// methods; progress requires the host to call
/// [`tick`](Transport::tick) periodically.
#[derive(Debug)]
pub struct RtuMaster<S, C = SystemClock> {
    stream: S,
    clock: C,
    pool: Vec<RtuAdu>,
    queue: AduQueue,
    state: State,
    current: Option<usize>,
    exception_frame: bool,
    last_byte_at_us: u64,
    byte_timeout_us: u64,
    frame_timeout_us: u64,
    response_timeout_us: u64,
    driver_enable: bool,
    receiver_enable: bool,
}

impl<S: SerialStream> RtuMaster<S> {
    /// Creates an engine over `stream` with the system clock.
    /// [`begin`](Self::begin) must be called before issuing requests.
    pub fn new(stream: S) -> Self {
        Self::with_clock(stream, SystemClock::default())
    }
}

impl<S: SerialStream, C: Clock> RtuMaster<S, C> {
    /// Creates an engine over `stream` driven by a custom clock.
    pub fn with_clock(stream: S, clock: C) -> Self {
        Self {
            stream,
            clock,
            pool: Vec::new(),
            queue: AduQueue::with_capacity(1),
            state: State::Idle,
            current: None,
            exception_frame: false,
            last_byte_at_us: 0,
            byte_timeout_us: 750,
            frame_timeout_us: 1750,
            response_timeout_us: DEFAULT_RESPONSE_TIMEOUT_US,
            driver_enable: false,
            receiver_enable: false,
        }
    }

    /// (Re-)initializes the engine: allocates the ADU pool, derives
    /// the timeouts, releases the RS-485 lines, and discards stale
    /// input. Afterwards the engine is indistinguishable from a fresh
    /// instance.
    pub fn begin(&mut self, config: RtuConfig) {
        let queue_size = config.queue_size.max(1);
        self.pool = (0..queue_size)
            .map(|_| RtuAdu::with_capacity(config.pdu_size))
            .collect();
        self.queue = AduQueue::with_capacity(queue_size);
        self.state = State::Idle;
        self.current = None;
        self.exception_frame = false;

        let (byte_timeout, frame_timeout) = derive_timeouts(config.baud, config.mode);
        self.byte_timeout_us = config.byte_timeout_us.unwrap_or(byte_timeout);
        self.frame_timeout_us = config.frame_timeout_us.unwrap_or(frame_timeout);
        self.response_timeout_us = config
            .response_timeout_us
            .unwrap_or(DEFAULT_RESPONSE_TIMEOUT_US);
        self.driver_enable = config.driver_enable;
        self.receiver_enable = config.receiver_enable;

        self.stream.flush();
        if self.driver_enable {
            self.stream.set_driver_enable(false);
        }
        if self.receiver_enable {
            self.stream.set_receiver_enable(false);
        }
        self.drain_stream();
        self.last_byte_at_us = 0;
    }

    /// Tears the engine down: flushes the queue and releases every
    /// ADU without invoking callbacks.
    pub fn end(&mut self) {
        self.queue.clear();
        for adu in &mut self.pool {
            adu.clear();
        }
        self.state = State::Idle;
        self.current = None;
        self.exception_frame = false;
    }

    /// Inter-frame silence in microseconds.
    pub fn frame_timeout_us(&self) -> u64 {
        self.frame_timeout_us
    }

    pub fn set_frame_timeout_us(&mut self, timeout_us: u64) {
        self.frame_timeout_us = timeout_us;
    }

    /// Inter-character timeout in microseconds.
    pub fn byte_timeout_us(&self) -> u64 {
        self.byte_timeout_us
    }

    pub fn set_byte_timeout_us(&mut self, timeout_us: u64) {
        self.byte_timeout_us = timeout_us;
    }

    /// Response timeout in microseconds.
    pub fn response_timeout_us(&self) -> u64 {
        self.response_timeout_us
    }

    pub fn set_response_timeout_us(&mut self, timeout_us: u64) {
        self.response_timeout_us = timeout_us;
    }

    fn run_tick(&mut self) {
        match self.state {
            State::BufferClear => self.tick_buffer_clear(),
            State::Idle => self.tick_idle(),
            // The head-checked stage always runs in the same tick as
            // the receive stage unless the latter terminated the
            // transaction.
            State::Receive => {
                if self.tick_receive() {
                    self.tick_head_checked();
                }
            }
            State::HeadChecked => self.tick_head_checked(),
        }
    }

    fn tick_buffer_clear(&mut self) {
        if self.stream.available() > 0 {
            self.drain_stream();
            self.last_byte_at_us = self.clock.now_us();
        } else if elapsed(
            self.clock.now_us(),
            self.last_byte_at_us,
            self.frame_timeout_us,
        ) {
            self.state = State::Idle;
        }
    }

    fn tick_idle(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        // The silence requirement also spaces the frame after a
        // broadcast, whose callback has long been delivered.
        let now_us = self.clock.now_us();
        if !elapsed(now_us, self.last_byte_at_us, self.frame_timeout_us) {
            return;
        }
        let now_ms = self.clock.now_ms();
        let pool = &self.pool;
        let Some(index) = self.queue.read_ready(now_ms, |i| {
            (pool[i].pdu.queued_at_ms, u64::from(pool[i].pdu.delay_to_send_ms))
        }) else {
            return;
        };
        self.transmit(index);
        if self.pool[index].pdu.slave == BROADCAST {
            // No response follows a broadcast. The transmission above
            // re-armed the silence deadline, so the next request
            // still honors the turnaround gap.
            self.complete(index, Ok(()));
            return;
        }
        self.pool[index].response_len = 0;
        self.exception_frame = false;
        self.current = Some(index);
        self.state = State::Receive;
    }

    /// Receive stage. Returns whether the head-checked stage should
    /// run in this tick.
    fn tick_receive(&mut self) -> bool {
        let Some(index) = self.current else {
            self.state = State::Idle;
            return false;
        };
        if self.stream.available() == 0 {
            if elapsed(
                self.clock.now_us(),
                self.last_byte_at_us,
                self.response_timeout_us,
            ) {
                self.fail_current(Error::ResponseTimeout);
                return false;
            }
            return true;
        }
        self.receive_into(index);
        if self.pool[index].response_len >= 2 {
            let received_slave = self.pool[index].rx_frame[0];
            let expected_slave = self.pool[index].pdu.slave;
            if received_slave != expected_slave {
                log::warn!(
                    "Response from slave {received_slave} while waiting for slave {expected_slave}"
                );
                self.fail_current(Error::InvalidSlave);
                return false;
            }
            let function = self.pool[index].pdu.response_head[0];
            if self.pool[index].rx_frame[1] == function | 0x80 {
                self.exception_frame = true;
            }
            self.state = State::HeadChecked;
        }
        true
    }

    fn tick_head_checked(&mut self) {
        let Some(index) = self.current else {
            self.state = State::Idle;
            return;
        };
        if self.stream.available() > 0 {
            self.receive_into(index);
        }
        let received = self.pool[index].response_len;
        let expected = self.pool[index].expected_frame_len();
        if received == expected || (self.exception_frame && received == 5) {
            if !crc::check_crc(&self.pool[index].rx_frame[..received]) {
                log::warn!("CRC mismatch in response from slave {}", self.pool[index].pdu.slave);
                self.fail_current(Error::Crc);
                return;
            }
            let pdu_len = received - HEADER_LEN - CRC_LEN;
            let adu = &mut self.pool[index];
            adu.pdu.rx.clear();
            let frame_pdu = &adu.rx_frame[HEADER_LEN..HEADER_LEN + pdu_len];
            adu.pdu.rx.extend_from_slice(frame_pdu);
            let result = codec::validate_response(&mut adu.pdu);
            self.state = State::Idle;
            self.current = None;
            self.exception_frame = false;
            self.complete(index, result);
        } else if received != 0
            && elapsed(self.clock.now_us(), self.last_byte_at_us, self.byte_timeout_us)
        {
            self.fail_current(Error::ResponseTimeout);
        }
    }

    fn transmit(&mut self, index: usize) {
        if self.driver_enable {
            self.stream.set_driver_enable(true);
        }
        if self.receiver_enable {
            self.stream.set_receiver_enable(true);
        }
        self.stream.write(&self.pool[index].tx_frame);
        self.stream.flush();
        if self.driver_enable {
            self.stream.set_driver_enable(false);
        }
        if self.receiver_enable {
            self.stream.set_receiver_enable(false);
        }
        self.last_byte_at_us = self.clock.now_us();
    }

    fn receive_into(&mut self, index: usize) {
        let adu = &mut self.pool[index];
        let remaining = adu.rx_remaining();
        if remaining == 0 {
            // Frame buffer exhausted: discard the excess and let the
            // timeout path close the transaction.
            self.drain_stream();
            self.last_byte_at_us = self.clock.now_us();
            return;
        }
        let len = adu.response_len;
        let read = self.stream.read(&mut adu.rx_frame[len..len + remaining]);
        adu.response_len += read;
        self.last_byte_at_us = self.clock.now_us();
    }

    fn fail_current(&mut self, err: Error) {
        self.recover_line();
        self.exception_frame = false;
        if let Some(index) = self.current.take() {
            self.complete(index, Err(err));
        }
    }

    /// Resynchronizes after a framing failure: with stale bytes still
    /// arriving the engine clears the buffer until a frame timeout of
    /// silence re-establishes the idle boundary.
    fn recover_line(&mut self) {
        if self.drain_stream() > 0 {
            self.state = State::BufferClear;
            self.last_byte_at_us = self.clock.now_us();
        } else {
            self.state = State::Idle;
        }
    }

    fn drain_stream(&mut self) -> usize {
        let mut total = 0;
        let mut chunk = [0u8; 64];
        loop {
            let available = self.stream.available();
            if available == 0 {
                break;
            }
            let len = available.min(chunk.len());
            let n = self.stream.read(&mut chunk[..len]);
            if n == 0 {
                break;
            }
            total += n;
        }
        if total > 0 {
            log::debug!("Discarded {total} stale byte(s)");
        }
        total
    }

    /// Delivers the outcome of a transaction and either reschedules
    /// the ADU for the next slave of its set or releases it.
    fn complete(&mut self, index: usize, result: Result<(), Error>) {
        {
            let pdu = &mut self.pool[index].pdu;
            pdu.err = result.err();
            if pdu.err.is_some() {
                pdu.data_begin = 0;
                pdu.data_len = 0;
            }
        }
        let Some(mut callback) = self.pool[index].pdu.callback.take() else {
            self.pool[index].clear();
            return;
        };
        callback(&self.pool[index].pdu);
        let now_ms = self.clock.now_ms();
        let Some((next, queued_at, delay)) = next_repeat(&mut self.pool[index].slaves, now_ms)
        else {
            self.pool[index].clear();
            return;
        };
        let adu = &mut self.pool[index];
        adu.pdu.callback = Some(callback);
        adu.pdu.reset_response();
        adu.pdu.queued_at_ms = queued_at;
        adu.pdu.delay_to_send_ms = delay;
        adu.response_len = 0;
        adu.stamp(next);
        if !self.queue.add(index) {
            self.pool[index].pdu.err = Some(Error::QueueFull);
            if let Some(mut callback) = self.pool[index].pdu.callback.take() {
                callback(&self.pool[index].pdu);
            }
            self.pool[index].clear();
        }
    }
}

impl<S: SerialStream, C: Clock> Transport for RtuMaster<S, C> {
    fn acquire(&mut self, target: Target, mut callback: Callback) -> Option<usize> {
        let (slave, slaves) = match target {
            Target::Single(slave) => (slave, SlaveSet::new()),
            Target::Set(mut set) => {
                set.reset_cursor();
                match set.next_id() {
                    Some(first) => (first, set),
                    None => {
                        let stub = Pdu::error_stub(BROADCAST, Error::InvalidSlave);
                        callback(&stub);
                        return None;
                    }
                }
            }
        };
        let Some(index) = self.pool.iter().position(|adu| !adu.pdu.used) else {
            let stub = Pdu::error_stub(slave, Error::NoFreeAdu);
            callback(&stub);
            return None;
        };
        let adu = &mut self.pool[index];
        adu.pdu.used = true;
        adu.pdu.slave = slave;
        adu.pdu.callback = Some(callback);
        adu.slaves = slaves;
        Some(index)
    }

    fn pdu_mut(&mut self, index: usize) -> &mut Pdu {
        &mut self.pool[index].pdu
    }

    fn commit(&mut self, index: usize, built: Result<(), Error>) {
        if let Err(err) = built {
            self.pool[index].pdu.err = Some(err);
            if let Some(mut callback) = self.pool[index].pdu.callback.take() {
                callback(&self.pool[index].pdu);
            }
            self.pool[index].clear();
            return;
        }
        let now_ms = self.clock.now_ms();
        let adu = &mut self.pool[index];
        adu.pdu.queued_at_ms = now_ms;
        adu.pdu.delay_to_send_ms = 0;
        adu.response_len = 0;
        let slave = adu.pdu.slave;
        adu.stamp(slave);
        if !self.queue.add(index) {
            self.pool[index].pdu.err = Some(Error::QueueFull);
            if let Some(mut callback) = self.pool[index].pdu.callback.take() {
                callback(&self.pool[index].pdu);
            }
            self.pool[index].clear();
        }
    }

    fn tick(&mut self) {
        self.run_tick();
    }
}

fn derive_timeouts(baud: u32, mode: UartMode) -> (u64, u64) {
    if baud > 19_200 {
        // Fixed timeouts mandated for high baud rates.
        return (750, 1750);
    }
    let char_time_us = 1_000_000u64 / u64::from(baud / mode.char_bits());
    (char_time_us * 3 / 2, char_time_us * 7 / 2)
}

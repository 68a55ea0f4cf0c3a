// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contracts of the external collaborators: the serial byte stream,
//! the per-slave TCP connection, and the monotonic clock.
//!
//! The engines never block on any of these. All waiting is expressed
//! as deadlines checked against the [`Clock`] during a tick, and all
//! reads are preceded by an `available()` probe.

use std::{net::SocketAddr, time::Instant};

/// A non-blocking duplex byte stream carrying RTU frames, typically
/// a UART behind an RS-485 transceiver.
///
/// The two direction-control hooks are no-ops by default; streams
/// wired to an RS-485 transceiver with explicit driver/receiver
/// enable lines override them. The engine asserts the lines before
/// transmitting and releases them after the outbound flush, before
/// it starts to accumulate the response.
pub trait SerialStream {
    /// Number of received bytes that can be read without blocking.
    fn available(&mut self) -> usize;

    /// Reads up to `buf.len()` bytes, returning how many were read.
    /// Must not block; returns 0 if nothing is pending.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Queues bytes for transmission.
    fn write(&mut self, buf: &[u8]);

    /// Drains the transmit path so that all written bytes are on the
    /// wire when this returns.
    fn flush(&mut self);

    /// Drives the RS-485 driver-enable line.
    fn set_driver_enable(&mut self, _active: bool) {}

    /// Drives the RS-485 receiver-enable line.
    fn set_receiver_enable(&mut self, _active: bool) {}
}

/// A connection-oriented, non-blocking client used for Modbus TCP,
/// one instance per configured slave.
pub trait TcpTransport {
    /// Attempts to establish the connection. Returns `true` when the
    /// connection is usable afterwards.
    fn connect(&mut self, addr: SocketAddr) -> bool;

    /// Whether the connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Number of received bytes that can be read without blocking.
    fn available(&mut self) -> usize;

    /// Reads up to `buf.len()` bytes, returning how many were read.
    /// Must not block; returns 0 if nothing is pending.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Queues bytes for transmission.
    fn write(&mut self, buf: &[u8]);
}

/// A monotonic clock.
///
/// RTU timing (inter-character and inter-frame silence) is measured
/// in microseconds, TCP timing (response timeouts, reconnect pacing)
/// in milliseconds.
pub trait Clock {
    /// Monotonic microseconds since an arbitrary epoch.
    fn now_us(&self) -> u64;

    /// Monotonic milliseconds since the same epoch.
    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Whether `interval` has elapsed between `since` and `now`.
pub(crate) fn elapsed(now: u64, since: u64, interval: u64) -> bool {
    now.saturating_sub(since) >= interval
}

// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared mock collaborators for the engine integration tests: a
//! scripted serial stream, a scripted TCP connection, a manually
//! advanced clock, and a callback recorder.

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    net::SocketAddr,
    rc::Rc,
};

use bytes::BytesMut;

use modbus_master::prelude::*;

#[derive(Debug, Default)]
pub struct SerialState {
    /// Bytes the engine will read (the slave's response).
    pub rx: BytesMut,
    /// Bytes the engine wrote (the request on the wire).
    pub tx: BytesMut,
    pub flushes: usize,
    pub driver_enable: Vec<bool>,
    pub receiver_enable: Vec<bool>,
}

/// Serial stream over shared state so tests can script responses and
/// inspect transmissions while the engine owns the stream.
#[derive(Debug, Clone, Default)]
pub struct MockSerial(pub Rc<RefCell<SerialState>>);

impl MockSerial {
    pub fn respond(&self, bytes: &[u8]) {
        self.0.borrow_mut().rx.extend_from_slice(bytes);
    }

    pub fn take_tx(&self) -> Vec<u8> {
        self.0.borrow_mut().tx.split().to_vec()
    }
}

impl SerialStream for MockSerial {
    fn available(&mut self) -> usize {
        self.0.borrow().rx.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut state = self.0.borrow_mut();
        let n = buf.len().min(state.rx.len());
        let chunk = state.rx.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        n
    }

    fn write(&mut self, buf: &[u8]) {
        self.0.borrow_mut().tx.extend_from_slice(buf);
    }

    fn flush(&mut self) {
        self.0.borrow_mut().flushes += 1;
    }

    fn set_driver_enable(&mut self, active: bool) {
        self.0.borrow_mut().driver_enable.push(active);
    }

    fn set_receiver_enable(&mut self, active: bool) {
        self.0.borrow_mut().receiver_enable.push(active);
    }
}

#[derive(Debug)]
pub struct TcpState {
    pub connected: bool,
    pub accept_connect: bool,
    pub connect_attempts: usize,
    pub rx: BytesMut,
    pub tx: BytesMut,
}

impl Default for TcpState {
    fn default() -> Self {
        Self {
            connected: false,
            accept_connect: true,
            connect_attempts: 0,
            rx: BytesMut::new(),
            tx: BytesMut::new(),
        }
    }
}

/// TCP connection over shared state, same idea as [`MockSerial`].
#[derive(Debug, Clone, Default)]
pub struct MockTcp(pub Rc<RefCell<TcpState>>);

impl MockTcp {
    pub fn connected() -> Self {
        let transport = Self::default();
        transport.0.borrow_mut().connected = true;
        transport
    }

    pub fn respond(&self, bytes: &[u8]) {
        self.0.borrow_mut().rx.extend_from_slice(bytes);
    }

    pub fn take_tx(&self) -> Vec<u8> {
        self.0.borrow_mut().tx.split().to_vec()
    }

    pub fn drop_connection(&self) {
        self.0.borrow_mut().connected = false;
    }
}

impl TcpTransport for MockTcp {
    fn connect(&mut self, _addr: SocketAddr) -> bool {
        let mut state = self.0.borrow_mut();
        state.connect_attempts += 1;
        state.connected = state.accept_connect;
        state.connected
    }

    fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }

    fn available(&mut self) -> usize {
        self.0.borrow().rx.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut state = self.0.borrow_mut();
        let n = buf.len().min(state.rx.len());
        let chunk = state.rx.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        n
    }

    fn write(&mut self, buf: &[u8]) {
        self.0.borrow_mut().tx.extend_from_slice(buf);
    }
}

/// Manually advanced microsecond clock.
#[derive(Debug, Clone, Default)]
pub struct MockClock(pub Rc<Cell<u64>>);

impl MockClock {
    pub fn advance_us(&self, delta: u64) {
        self.0.set(self.0.get() + delta);
    }

    pub fn advance_ms(&self, delta: u64) {
        self.advance_us(delta * 1000);
    }
}

impl Clock for MockClock {
    fn now_us(&self) -> u64 {
        self.0.get()
    }
}

/// Records one entry per callback invocation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub slave: SlaveId,
    pub error: Option<Error>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder(pub Rc<RefCell<Vec<Outcome>>>);

impl Recorder {
    /// A callback that appends each delivered result.
    pub fn callback(&self) -> impl FnMut(&Pdu) + 'static {
        let log = Rc::clone(&self.0);
        move |pdu| {
            log.borrow_mut().push(Outcome {
                slave: pdu.slave(),
                error: pdu.error(),
                data: pdu.data().to_vec(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn at(&self, index: usize) -> Outcome {
        self.0.borrow()[index].clone()
    }

    pub fn last(&self) -> Outcome {
        self.0.borrow().last().expect("no callback recorded").clone()
    }
}

/// Parses the transaction id out of a transmitted MBAP frame.
pub fn mbap_transaction_id(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[0], frame[1]])
}

/// Builds a TCP response frame for the given transaction.
pub fn tcp_response(tid: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&tid.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit);
    frame.extend_from_slice(pdu);
    frame
}

// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tick-driven Modbus TCP master.
//!
//! The engine owns one ADU pool shared by up to `client_count`
//! per-slave connections. Each connection keeps its own pending
//! queue, sent window, and reconnect policy. In single-in-flight
//! mode at most one request per slave is outstanding; in pipelined
//! (`all_at_once`) mode the sent window bounds the number of
//! outstanding requests and responses are demultiplexed by MBAP
//! transaction id.

use std::net::SocketAddr;

use smallvec::SmallVec;

use crate::{
    client::{next_repeat, Target, Transport},
    codec,
    error::Error,
    frame::{
        tcp::{TcpAdu, MBAP_LEN},
        Callback, Pdu,
    },
    io::{elapsed, Clock, SystemClock, TcpTransport},
    queue::AduQueue,
    slave::{SlaveId, SlaveSet, MAX_SLAVE_ID},
};

/// Default response timeout in milliseconds.
const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2000;

/// Default minimum spacing between reconnect attempts, milliseconds.
const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 100;

/// TCP engine configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Number of preallocated ADUs shared by all clients.
    pub adu_pool_size: usize,
    /// Per-ADU buffer capacity in bytes, clamped to 8..=253.
    pub pdu_size: usize,
    /// Maximum number of concurrently configured slave connections.
    pub client_count: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            adu_pool_size: 5,
            pdu_size: crate::frame::MAX_PDU_SIZE,
            client_count: 5,
        }
    }
}

/// Per-slave connection options for [`TcpMaster::add_client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Pipelined mode: keep several requests outstanding and
    /// demultiplex responses by transaction id.
    pub all_at_once: bool,
    /// Capacity of the pending queue and of the sent window.
    pub queue_size: usize,
    /// Reconnect automatically whenever the connection is down.
    pub keep_alive: bool,
    /// Minimum spacing between reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Response timeout override; the engine-wide default applies
    /// when `None`.
    pub response_timeout_ms: Option<u64>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            all_at_once: false,
            queue_size: 5,
            keep_alive: true,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            response_timeout_ms: None,
        }
    }
}

/// Transactions that have been transmitted and await their response,
/// indexed for transaction-id lookup and scanned for timeouts.
#[derive(Debug)]
struct SentWindow {
    slots: Vec<Option<usize>>,
}

impl SentWindow {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
        }
    }

    fn add(&mut self, index: usize) -> bool {
        for slot in &mut self.slots {
            if slot.is_none() {
                *slot = Some(index);
                return true;
            }
        }
        false
    }

    fn has_free(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn take_match(&mut self, pred: impl Fn(usize) -> bool) -> Option<usize> {
        for slot in &mut self.slots {
            if slot.is_some_and(&pred) {
                return slot.take();
            }
        }
        None
    }

    fn take_any(&mut self) -> Option<usize> {
        self.take_match(|_| true)
    }
}

enum TcpEvent {
    /// A complete response arrived; validate and deliver.
    Deliver(usize),
    /// The transaction failed; deliver the error.
    Fail(usize, Error),
}

type Events = SmallVec<[TcpEvent; 8]>;

/// One configured slave connection.
#[derive(Debug)]
struct ClientItem<T> {
    id: SlaveId,
    transport: T,
    addr: SocketAddr,
    all_at_once: bool,
    keep_alive: bool,
    reconnect_interval_ms: u64,
    last_reconnect_at_ms: u64,
    response_timeout_ms: u64,
    queue: AduQueue,
    sent: SentWindow,
    current: Option<usize>,
    /// Response bytes still expected after the MBAP header,
    /// 0 while waiting for a header.
    incoming: usize,
}

impl<T: TcpTransport> ClientItem<T> {
    fn tick(&mut self, pool: &mut [TcpAdu], now_ms: u64, events: &mut Events) {
        if !self.ensure_connected(pool, now_ms, events) {
            return;
        }
        self.send_ready(pool, now_ms, events);
        if self.current.is_none() && self.sent.is_empty() {
            return;
        }
        self.receive_header(pool, events);
        self.receive_body(pool, events);
        self.scan_timeouts(pool, now_ms, events);
    }

    /// Connection upkeep. Returns whether the connection is usable.
    fn ensure_connected(&mut self, pool: &mut [TcpAdu], now_ms: u64, events: &mut Events) -> bool {
        if self.transport.is_connected() {
            return true;
        }
        // The connection dropped with transactions outstanding.
        if self.current.is_some() || !self.sent.is_empty() {
            log::warn!("Connection to slave {} lost with transactions in flight", self.id);
            if let Some(index) = self.current.take() {
                events.push(TcpEvent::Fail(index, Error::ConnectionResetByPeer));
            }
            while let Some(index) = self.sent.take_any() {
                events.push(TcpEvent::Fail(index, Error::ConnectionResetByPeer));
            }
            self.incoming = 0;
        }
        if !self.keep_alive {
            return false;
        }
        if !elapsed(now_ms, self.last_reconnect_at_ms, self.reconnect_interval_ms) {
            return false;
        }
        self.last_reconnect_at_ms = now_ms;
        log::debug!("Connecting to slave {} at {}", self.id, self.addr);
        if self.transport.connect(self.addr) {
            return true;
        }
        // The attempt failed; requests that are due cannot be
        // serviced until the slave comes back.
        while let Some(index) = self.queue.read_ready(now_ms, schedule_of(pool)) {
            events.push(TcpEvent::Fail(index, Error::ConnectionRefused));
        }
        false
    }

    fn send_ready(&mut self, pool: &mut [TcpAdu], now_ms: u64, events: &mut Events) {
        if self.all_at_once {
            while let Some(index) = self.queue.read_ready(now_ms, schedule_of(pool)) {
                if !self.sent.has_free() {
                    events.push(TcpEvent::Fail(index, Error::SentBufferFull));
                    return;
                }
                self.send(pool, index, now_ms);
                self.sent.add(index);
            }
        } else if self.current.is_none() {
            if let Some(index) = self.queue.read_ready(now_ms, schedule_of(pool)) {
                self.send(pool, index, now_ms);
                self.current = Some(index);
            }
        }
    }

    fn send(&mut self, pool: &mut [TcpAdu], index: usize, now_ms: u64) {
        let adu = &mut pool[index];
        adu.stamp_mbap();
        self.transport.write(&adu.mbap);
        self.transport.write(&adu.pdu.tx);
        adu.sent_at_ms = now_ms;
    }

    fn receive_header(&mut self, pool: &mut [TcpAdu], events: &mut Events) {
        if self.incoming != 0 || self.transport.available() < MBAP_LEN {
            return;
        }
        let mut mbap = [0u8; MBAP_LEN];
        self.transport.read(&mut mbap);
        let tid = codec::read_u16(&mbap[0..2]);
        let len = usize::from(codec::read_u16(&mbap[4..6]));
        if self.all_at_once {
            match self.sent.take_match(|index| pool[index].tid == tid) {
                Some(index) => self.current = Some(index),
                None => {
                    // Stale or duplicate response: discard and re-sync.
                    log::warn!("No outstanding transaction with id {tid}, discarding");
                    self.drain();
                    self.reset();
                    return;
                }
            }
        }
        let Some(index) = self.current else {
            self.drain();
            self.reset();
            return;
        };
        let adu = &pool[index];
        let err = if tid != adu.tid {
            Some(Error::InvalidMbapTransactionId)
        } else if mbap[2] != 0x00 || mbap[3] != 0x00 {
            Some(Error::InvalidMbapProtocolId)
        } else if mbap[6] != adu.pdu.slave {
            Some(Error::InvalidMbapUnitId)
        } else if len < 2 || len - 1 > adu.pdu.capacity() {
            Some(Error::InvalidByteLength)
        } else {
            None
        };
        if let Some(err) = err {
            self.drain();
            self.reset();
            events.push(TcpEvent::Fail(index, err));
            return;
        }
        // The unit id byte has already been consumed with the header.
        self.incoming = len - 1;
    }

    fn receive_body(&mut self, pool: &mut [TcpAdu], events: &mut Events) {
        if self.incoming == 0 || self.transport.available() < self.incoming {
            return;
        }
        let Some(index) = self.current.take() else {
            self.incoming = 0;
            return;
        };
        let adu = &mut pool[index];
        adu.pdu.rx.resize(self.incoming, 0);
        self.transport.read(&mut adu.pdu.rx);
        self.incoming = 0;
        events.push(TcpEvent::Deliver(index));
    }

    fn scan_timeouts(&mut self, pool: &mut [TcpAdu], now_ms: u64, events: &mut Events) {
        let timeout_ms = self.response_timeout_ms;
        if self.all_at_once {
            while let Some(index) = self
                .sent
                .take_match(|index| elapsed(now_ms, pool[index].sent_at_ms, timeout_ms))
            {
                events.push(TcpEvent::Fail(index, Error::ResponseTimeout));
            }
        } else if let Some(index) = self.current {
            if elapsed(now_ms, pool[index].sent_at_ms, timeout_ms) {
                self.reset();
                events.push(TcpEvent::Fail(index, Error::ResponseTimeout));
            }
        }
    }

    fn drain(&mut self) {
        let mut chunk = [0u8; 64];
        loop {
            let available = self.transport.available();
            if available == 0 {
                return;
            }
            let len = available.min(chunk.len());
            if self.transport.read(&mut chunk[..len]) == 0 {
                return;
            }
        }
    }

    fn reset(&mut self) {
        self.current = None;
        self.incoming = 0;
    }
}

fn schedule_of(pool: &[TcpAdu]) -> impl Fn(usize) -> (u64, u64) + '_ {
    |index| {
        (
            pool[index].pdu.queued_at_ms,
            u64::from(pool[index].pdu.delay_to_send_ms),
        )
    }
}

/// Modbus TCP master multiplexing one ADU pool over per-slave
/// connections.
///
/// Requests are issued through the [`Client`](crate::client::Client)
/// methods; progress requires the host to call
/// [`tick`](Transport::tick) periodically.
#[derive(Debug)]
pub struct TcpMaster<T, C = SystemClock> {
    clock: C,
    pool: Vec<TcpAdu>,
    clients: Vec<ClientItem<T>>,
    client_capacity: usize,
    response_timeout_ms: u64,
}

impl<T: TcpTransport> TcpMaster<T> {
    /// Creates an engine with the system clock.
    /// [`begin`](Self::begin) must be called before issuing requests.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::default())
    }
}

impl<T: TcpTransport> Default for TcpMaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TcpTransport, C: Clock> TcpMaster<T, C> {
    /// Creates an engine driven by a custom clock.
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            pool: Vec::new(),
            clients: Vec::new(),
            client_capacity: 0,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
        }
    }

    /// (Re-)initializes the engine: allocates the ADU pool and drops
    /// all configured clients. Afterwards the engine is
    /// indistinguishable from a fresh instance.
    pub fn begin(&mut self, config: TcpConfig) {
        self.pool = (0..config.adu_pool_size.max(1))
            .map(|_| TcpAdu::with_capacity(config.pdu_size))
            .collect();
        self.clients = Vec::with_capacity(config.client_count);
        self.client_capacity = config.client_count;
        self.response_timeout_ms = DEFAULT_RESPONSE_TIMEOUT_MS;
    }

    /// Tears the engine down: flushes all queues and releases every
    /// ADU without invoking callbacks.
    pub fn end(&mut self) {
        self.clients.clear();
        for adu in &mut self.pool {
            adu.clear();
        }
    }

    /// Registers a connection for `slave`. Fails when the id is
    /// invalid or already configured, or when all client slots are
    /// taken.
    pub fn add_client(
        &mut self,
        slave: SlaveId,
        transport: T,
        addr: SocketAddr,
        options: ClientOptions,
    ) -> bool {
        if slave == 0 || slave > MAX_SLAVE_ID {
            return false;
        }
        if self.clients.len() >= self.client_capacity {
            return false;
        }
        if self.clients.iter().any(|client| client.id == slave) {
            return false;
        }
        let queue_size = options.queue_size.max(1);
        self.clients.push(ClientItem {
            id: slave,
            transport,
            addr,
            all_at_once: options.all_at_once,
            keep_alive: options.keep_alive,
            reconnect_interval_ms: options.reconnect_interval_ms,
            last_reconnect_at_ms: 0,
            response_timeout_ms: options
                .response_timeout_ms
                .unwrap_or(self.response_timeout_ms),
            queue: AduQueue::with_capacity(queue_size),
            sent: SentWindow::with_capacity(queue_size),
            current: None,
            incoming: 0,
        });
        true
    }

    /// Response timeout in milliseconds.
    pub fn response_timeout_ms(&self) -> u64 {
        self.response_timeout_ms
    }

    /// Sets the response timeout for the engine and every configured
    /// client.
    pub fn set_response_timeout_ms(&mut self, timeout_ms: u64) {
        self.response_timeout_ms = timeout_ms;
        for client in &mut self.clients {
            client.response_timeout_ms = timeout_ms;
        }
    }

    fn run_tick(&mut self) {
        let now_ms = self.clock.now_ms();
        for client_index in 0..self.clients.len() {
            let mut events: Events = SmallVec::new();
            self.clients[client_index].tick(&mut self.pool, now_ms, &mut events);
            for event in events {
                match event {
                    TcpEvent::Deliver(index) => {
                        let result = codec::validate_response(&mut self.pool[index].pdu);
                        self.finish(index, result);
                    }
                    TcpEvent::Fail(index, err) => self.finish(index, Err(err)),
                }
            }
        }
    }

    /// Delivers the outcome of a transaction and either redispatches
    /// the ADU to the next slave of its set or releases it.
    fn finish(&mut self, index: usize, result: Result<(), Error>) {
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
        adu.pdu.slave = next;
        if let Err(err) = self.enqueue(index) {
            self.fail_slot(index, err);
        }
    }

    /// Hands a built request to the queue of the client configured
    /// for its slave.
    fn enqueue(&mut self, index: usize) -> Result<(), Error> {
        let slave = self.pool[index].pdu.slave;
        let Some(client) = self.clients.iter_mut().find(|client| client.id == slave) else {
            return Err(Error::NoClientForSlave);
        };
        if !client.queue.add(index) {
            return Err(Error::QueueFull);
        }
        Ok(())
    }

    fn fail_slot(&mut self, index: usize, err: Error) {
        let pdu = &mut self.pool[index].pdu;
        pdu.err = Some(err);
        pdu.data_begin = 0;
        pdu.data_len = 0;
        if let Some(mut callback) = self.pool[index].pdu.callback.take() {
            callback(&self.pool[index].pdu);
        }
        self.pool[index].clear();
    }
}

impl<T: TcpTransport, C: Clock> Transport for TcpMaster<T, C> {
    fn acquire(&mut self, target: Target, mut callback: Callback) -> Option<usize> {
        let (slave, slaves) = match target {
            Target::Single(slave) => (slave, SlaveSet::new()),
            Target::Set(mut set) => {
                set.reset_cursor();
                match set.next_id() {
                    Some(first) => (first, set),
                    None => {
                        let stub = Pdu::error_stub(0, Error::InvalidSlave);
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
            self.fail_slot(index, err);
            return;
        }
        let now_ms = self.clock.now_ms();
        {
            let pdu = &mut self.pool[index].pdu;
            pdu.queued_at_ms = now_ms;
            pdu.delay_to_send_ms = 0;
        }
        if let Err(err) = self.enqueue(index) {
            self.fail_slot(index, err);
        }
    }

    fn tick(&mut self) {
        self.run_tick();
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A pure [Rust](https://www.rust-lang.org)
//! [Modbus](https://en.wikipedia.org/wiki/Modbus) master library
//! driven by a cooperative tick instead of an async runtime.
//!
//! The master issues requests to one or more slave devices over a
//! serial line (Modbus RTU) or over per-slave TCP connections
//! (Modbus TCP) and delivers every outcome asynchronously through a
//! response callback. All buffers are allocated once at engine
//! initialization; the steady state performs no allocation, never
//! blocks, and needs no threads. The host simply calls `tick()`
//! periodically from its event loop or superloop.
//!
//! ## Features
//!
//! - pure Rust library
//! - non-blocking, callback based, single threaded
//! - Modbus TCP with pipelined transactions per connection
//! - Modbus RTU with standard-conforming frame timing and optional
//!   RS-485 direction control
//! - multi-slave polling: round-robin over a slave set with
//!   configurable inter-slave and repeat-cycle spacing, periodic
//!   broadcasts
//! - Open Source (MIT/Apache-2.0)
//!
//! # Installation
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! modbus-master = "*"
//! ```
//!
//! If you like to use Modbus TCP only:
//!
//! ```toml
//! [dependencies]
//! modbus-master = { version = "*", default-features = false, features = ["tcp"] }
//! ```
//!
//! If you like to use Modbus RTU only:
//!
//! ```toml
//! [dependencies]
//! modbus-master = { version = "*", default-features = false, features = ["rtu"] }
//! ```
//!
//! # Examples
//!
//! ## RTU client
//!
//! ```rust,no_run
//! use modbus_master::prelude::*;
//!
//! # struct Uart;
//! # impl SerialStream for Uart {
//! #     fn available(&mut self) -> usize { 0 }
//! #     fn read(&mut self, _buf: &mut [u8]) -> usize { 0 }
//! #     fn write(&mut self, _buf: &[u8]) {}
//! #     fn flush(&mut self) {}
//! # }
//! pub fn main() {
//!     let mut master = RtuMaster::new(Uart);
//!     master.begin(RtuConfig {
//!         baud: 19_200,
//!         ..RtuConfig::default()
//!     });
//!
//!     println!("Reading a sensor value");
//!     master.read_holding_register::<u16>(1u8, 0x082B, |pdu| match pdu.status() {
//!         Ok(()) => println!("Sensor value is: {:?}", pdu.value::<u16>(0)),
//!         Err(err) => println!("Request failed: {err}"),
//!     });
//!
//!     loop {
//!         master.tick();
//!     }
//! }
//! ```
//!
//! ## TCP client polling a slave set
//!
//! ```rust,no_run
//! use modbus_master::prelude::*;
//!
//! # struct Socket;
//! # impl TcpTransport for Socket {
//! #     fn connect(&mut self, _addr: std::net::SocketAddr) -> bool { true }
//! #     fn is_connected(&self) -> bool { true }
//! #     fn available(&mut self) -> usize { 0 }
//! #     fn read(&mut self, _buf: &mut [u8]) -> usize { 0 }
//! #     fn write(&mut self, _buf: &[u8]) {}
//! # }
//! pub fn main() {
//!     let mut master: TcpMaster<Socket> = TcpMaster::new();
//!     master.begin(TcpConfig::default());
//!     let socket_addr = "192.168.0.222:502".parse().unwrap();
//!     master.add_client(1, Socket, socket_addr, ClientOptions::default());
//!
//!     // Poll the slave once per second.
//!     let mut slaves = SlaveSet::single(1);
//!     slaves.set_repeat_delay(Some(1000));
//!     master.read_input_registers::<u16>(&slaves, 0x1000, 7, |pdu| {
//!         println!("Response is '{:?}'", pdu.data());
//!     });
//!
//!     loop {
//!         master.tick();
//!     }
//! }
//! ```
//!
//! # Protocol-Specification
//!
//! - [MODBUS Application Protocol Specification v1.1b3 (PDF)](http://modbus.org/docs/Modbus_Application_Protocol_V1_1b3.pdf)
//! - [MODBUS over serial line specification and implementation guide v1.02 (PDF)](http://modbus.org/docs/Modbus_over_serial_line_V1_02.pdf)
//! - [MODBUS Messaging on TCP/IP Implementation Guide v1.0b (PDF)](http://modbus.org/docs/Modbus_Messaging_Implementation_Guide_V1_0b.pdf)

pub mod client;
pub mod io;
pub mod prelude;

mod codec;
mod error;
mod frame;
mod queue;
mod slave;

pub use crate::{
    codec::Value,
    error::{Error, Exception},
    frame::{Address, Callback, FunctionCode, Pdu, Quantity, MAX_PDU_SIZE, MIN_PDU_SIZE},
    slave::{SlaveId, SlaveSet, BROADCAST, MAX_SLAVE_ID},
};

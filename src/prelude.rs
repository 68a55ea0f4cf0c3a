// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common imports for working with this library.

pub use crate::{
    client::{Client, Target, Transport},
    io::{Clock, SerialStream, SystemClock, TcpTransport},
    Address, Callback, Error, Exception, FunctionCode, Pdu, Quantity, SlaveId, SlaveSet, Value,
    BROADCAST, MAX_SLAVE_ID,
};

#[cfg(feature = "rtu")]
pub use crate::client::rtu::{RtuConfig, RtuMaster, UartMode};

#[cfg(feature = "tcp")]
pub use crate::client::tcp::{ClientOptions, TcpConfig, TcpMaster};

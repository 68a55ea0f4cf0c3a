// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The transport-independent protocol data unit and its per-transport
//! frame wrappers.

#[cfg(feature = "rtu")]
pub(crate) mod rtu;

#[cfg(feature = "tcp")]
pub(crate) mod tcp;

use std::fmt;

use crate::{codec::Value, error::Error, slave::SlaveId};

/// A Modbus function code is represented by an unsigned 8 bit integer.
pub type FunctionCode = u8;

/// A Modbus protocol address is represented by 16 bit from `0` to `65535`.
///
/// This *protocol address* uses 0-based indexing, while the *coil address* or
/// *register address* is often specified as a number with 1-based indexing.
/// Please consult the specification of your devices if 1-based coil/register
/// addresses need to be converted to 0-based protocol addresses by subtracting 1.
pub type Address = u16;

/// Number of items to process.
pub type Quantity = u16;

/// The largest PDU the protocol admits (function code + payload).
pub const MAX_PDU_SIZE: usize = 253;

/// The smallest usable PDU buffer capacity.
pub const MIN_PDU_SIZE: usize = 8;

/// Function codes supported by the request builders.
pub(crate) mod fc {
    pub(crate) const READ_COILS: u8 = 0x01;
    pub(crate) const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub(crate) const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub(crate) const READ_INPUT_REGISTERS: u8 = 0x04;
    pub(crate) const WRITE_SINGLE_COIL: u8 = 0x05;
    pub(crate) const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub(crate) const READ_EXCEPTION_STATUS: u8 = 0x07;
    pub(crate) const DIAGNOSTICS: u8 = 0x08;
    pub(crate) const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub(crate) const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
    pub(crate) const MASK_WRITE_REGISTER: u8 = 0x16;
    pub(crate) const READ_WRITE_MULTIPLE_REGISTERS: u8 = 0x17;
}

/// Length of the reference header kept for response verification:
/// function code plus up to six echoed request bytes.
pub(crate) const RESPONSE_HEAD_LEN: usize = 7;

/// Response callback invoked exactly once per dispatched request
/// (and once more per repetition when a slave set is attached).
pub type Callback = Box<dyn FnMut(&Pdu)>;

/// One Modbus transaction: the request payload, the space for the
/// response, the reference data to verify the response against, and
/// the outcome surfaced to the callback.
///
/// User code only ever observes a `Pdu` borrowed inside a response
/// callback. The accessors interpret the validated response payload;
/// on errors the data region is empty and [`error`](Self::error)
/// reports what went wrong.
pub struct Pdu {
    /// Request payload (function code first), capacity fixed at init.
    pub(crate) tx: Vec<u8>,
    /// Validated response payload, capacity fixed at init.
    pub(crate) rx: Vec<u8>,
    /// Expected response fields, compared against the received bytes.
    pub(crate) response_head: [u8; RESPONSE_HEAD_LEN],
    /// Expected response PDU length (derived at build time).
    pub(crate) expected_response_len: usize,
    /// Element size for typed register payloads, 0 for raw requests.
    pub(crate) elem_size: usize,
    pub(crate) data_begin: usize,
    pub(crate) data_len: usize,
    pub(crate) err: Option<Error>,
    pub(crate) used: bool,
    pub(crate) queued_at_ms: u64,
    pub(crate) delay_to_send_ms: u32,
    /// Addressed slave; also carried by synthesized error results.
    pub(crate) slave: SlaveId,
    pub(crate) callback: Option<Callback>,
    capacity: usize,
}

impl Pdu {
    /// Preallocates a PDU with fixed buffer capacity. Called once per
    /// pool slot at engine init; buffers never grow afterwards.
    pub(crate) fn with_capacity(pdu_size: usize) -> Self {
        let capacity = pdu_size.clamp(MIN_PDU_SIZE, MAX_PDU_SIZE);
        Self {
            tx: Vec::with_capacity(capacity),
            rx: Vec::with_capacity(capacity),
            response_head: [0; RESPONSE_HEAD_LEN],
            expected_response_len: 0,
            elem_size: 0,
            data_begin: 0,
            data_len: 0,
            err: None,
            used: false,
            queued_at_ms: 0,
            delay_to_send_ms: 0,
            slave: 0,
            callback: None,
            capacity,
        }
    }

    /// A buffer-less carrier for errors raised before any pool slot
    /// could be involved (pool exhaustion, rejected arguments).
    /// Does not allocate.
    pub(crate) fn error_stub(slave: SlaveId, err: Error) -> Self {
        Self {
            slave,
            err: Some(err),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            tx: Vec::new(),
            rx: Vec::new(),
            response_head: [0; RESPONSE_HEAD_LEN],
            expected_response_len: 0,
            elem_size: 0,
            data_begin: 0,
            data_len: 0,
            err: None,
            used: false,
            queued_at_ms: 0,
            delay_to_send_ms: 0,
            slave: 0,
            callback: None,
            capacity: 0,
        }
    }

    /// Releases the slot back to the pool. Buffers keep their capacity.
    pub(crate) fn clear(&mut self) {
        self.tx.clear();
        self.rx.clear();
        self.response_head = [0; RESPONSE_HEAD_LEN];
        self.expected_response_len = 0;
        self.elem_size = 0;
        self.data_begin = 0;
        self.data_len = 0;
        self.err = None;
        self.used = false;
        self.queued_at_ms = 0;
        self.delay_to_send_ms = 0;
        self.slave = 0;
        self.callback = None;
    }

    /// Buffer capacity available to request builders.
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resets the per-attempt response state while keeping the request
    /// intact, for redispatch to the next slave of a set.
    pub(crate) fn reset_response(&mut self) {
        self.rx.clear();
        self.err = None;
        self.data_begin = 0;
        self.data_len = 0;
    }

    /// The error of this transaction, `None` on success.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        self.err
    }

    /// The outcome of this transaction as a `Result`.
    pub fn status(&self) -> Result<(), Error> {
        self.err.map_or(Ok(()), Err)
    }

    /// The slave this transaction was addressed to.
    #[must_use]
    pub fn slave(&self) -> SlaveId {
        self.slave
    }

    /// The function code of the received response, if any arrived.
    #[must_use]
    pub fn function(&self) -> Option<FunctionCode> {
        self.rx.first().copied()
    }

    /// The validated response data region. Empty on errors and for
    /// write-class echoes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.rx
            .get(self.data_begin..self.data_begin + self.data_len)
            .unwrap_or(&[])
    }

    /// Length of the response data region in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.data_len
    }

    /// Number of `V` elements in the response data region.
    #[must_use]
    pub fn count<V: Value>(&self) -> usize {
        self.data_len / V::SIZE
    }

    /// The `ix`-th `V` element of the response data region.
    ///
    /// Register payloads have already been folded back into the host
    /// layout of the type the request was built with.
    #[must_use]
    pub fn value<V: Value>(&self, ix: usize) -> Option<V> {
        let begin = ix.checked_mul(V::SIZE)?;
        self.data()
            .get(begin..begin + V::SIZE)
            .map(V::from_host_bytes)
    }

    /// The `ix`-th bit of the response data region, for coil and
    /// discrete-input reads.
    #[must_use]
    pub fn bit(&self, ix: usize) -> Option<bool> {
        if ix >= self.data_len * 8 {
            return None;
        }
        let byte = *self.data().get(ix / 8)?;
        Some(byte >> (ix % 8) & 1 == 1)
    }
}

impl fmt::Debug for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pdu")
            .field("slave", &self.slave)
            .field("tx", &self.tx)
            .field("rx", &self.rx)
            .field("err", &self.err)
            .field("used", &self.used)
            .field("data_begin", &self.data_begin)
            .field("data_len", &self.data_len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_clamped_to_protocol_limits() {
        assert_eq!(Pdu::with_capacity(4).capacity(), MIN_PDU_SIZE);
        assert_eq!(Pdu::with_capacity(300).capacity(), MAX_PDU_SIZE);
        assert_eq!(Pdu::with_capacity(64).capacity(), 64);
    }

    #[test]
    fn error_stub_does_not_allocate() {
        let pdu = Pdu::error_stub(9, Error::NoFreeAdu);
        assert_eq!(pdu.tx.capacity(), 0);
        assert_eq!(pdu.rx.capacity(), 0);
        assert_eq!(pdu.slave(), 9);
        assert_eq!(pdu.error(), Some(Error::NoFreeAdu));
        assert!(pdu.data().is_empty());
    }

    #[test]
    fn bit_access() {
        let mut pdu = Pdu::with_capacity(16);
        pdu.rx.extend_from_slice(&[0x01, 0x02, 0b0000_0101, 0b1000_0000]);
        pdu.data_begin = 2;
        pdu.data_len = 2;
        assert_eq!(pdu.bit(0), Some(true));
        assert_eq!(pdu.bit(1), Some(false));
        assert_eq!(pdu.bit(2), Some(true));
        assert_eq!(pdu.bit(15), Some(true));
        assert_eq!(pdu.bit(16), None);
    }

    #[test]
    fn clear_keeps_buffer_capacity() {
        let mut pdu = Pdu::with_capacity(32);
        pdu.tx.extend_from_slice(&[1, 2, 3]);
        pdu.used = true;
        pdu.clear();
        assert!(!pdu.used);
        assert!(pdu.tx.is_empty());
        assert_eq!(pdu.tx.capacity(), 32);
    }
}

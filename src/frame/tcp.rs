// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP application data unit: MBAP header + PDU.

use std::sync::atomic::{AtomicU16, Ordering};

use byteorder::{BigEndian, ByteOrder};

use crate::{frame::Pdu, slave::SlaveSet};

pub(crate) const MBAP_LEN: usize = 7;

/// Process-wide transaction id counter. Monotonically nondecreasing,
/// wraps at 16 bits, shared by all engines.
static TRANSACTION_ID: AtomicU16 = AtomicU16::new(0);

pub(crate) fn next_transaction_id() -> u16 {
    TRANSACTION_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// One pool slot of the TCP engine: the shared PDU core plus MBAP
/// bookkeeping for the in-flight window.
#[derive(Debug)]
pub(crate) struct TcpAdu {
    pub(crate) pdu: Pdu,
    /// Snapshot of the slave set driving repetition, empty for
    /// single-slave requests.
    pub(crate) slaves: SlaveSet,
    /// MBAP header as transmitted, rebuilt per send.
    pub(crate) mbap: [u8; MBAP_LEN],
    /// Transaction id of the most recent transmission.
    pub(crate) tid: u16,
    pub(crate) sent_at_ms: u64,
}

impl TcpAdu {
    pub(crate) fn with_capacity(pdu_size: usize) -> Self {
        Self {
            pdu: Pdu::with_capacity(pdu_size),
            slaves: SlaveSet::new(),
            mbap: [0; MBAP_LEN],
            tid: 0,
            sent_at_ms: 0,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.pdu.clear();
        self.slaves.clear();
        self.mbap = [0; MBAP_LEN];
        self.tid = 0;
        self.sent_at_ms = 0;
    }

    /// Builds the MBAP header for the current request payload with a
    /// freshly assigned transaction id. Called on each transmission,
    /// so every repetition and redispatch goes out under its own id.
    pub(crate) fn stamp_mbap(&mut self) {
        self.tid = next_transaction_id();
        BigEndian::write_u16(&mut self.mbap[0..2], self.tid);
        self.mbap[2] = 0x00;
        self.mbap[3] = 0x00;
        BigEndian::write_u16(&mut self.mbap[4..6], (self.pdu.tx.len() + 1) as u16);
        self.mbap[6] = self.pdu.slave;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::build_read_registers;
    use crate::frame::fc;

    #[test]
    fn transaction_ids_increment() {
        let first = next_transaction_id();
        let second = next_transaction_id();
        assert_eq!(second, first.wrapping_add(1));
    }

    #[test]
    fn stamp_mbap_layout() {
        let mut adu = TcpAdu::with_capacity(253);
        build_read_registers::<u16>(&mut adu.pdu, fc::READ_HOLDING_REGISTERS, 0x006B, 3).unwrap();
        adu.pdu.slave = 0x11;
        adu.stamp_mbap();
        assert_eq!(adu.mbap[0..2], adu.tid.to_be_bytes());
        assert_eq!(adu.mbap[2..4], [0x00, 0x00]);
        // Length covers unit id + PDU (5 request bytes).
        assert_eq!(adu.mbap[4..6], [0x00, 0x06]);
        assert_eq!(adu.mbap[6], 0x11);

        let previous = adu.tid;
        adu.stamp_mbap();
        assert_ne!(adu.tid, previous);
    }
}

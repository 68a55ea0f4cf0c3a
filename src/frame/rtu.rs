// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU application data unit: slave id prefix + PDU + CRC-16 trailer.

use crate::{codec::crc, frame::Pdu, slave::{SlaveId, SlaveSet}};

pub(crate) const HEADER_LEN: usize = 1;
pub(crate) const CRC_LEN: usize = 2;

/// One pool slot of the RTU engine: the shared PDU core plus the
/// framed transmit image and the response accumulation buffer.
#[derive(Debug)]
pub(crate) struct RtuAdu {
    pub(crate) pdu: Pdu,
    /// Snapshot of the slave set driving repetition, empty for
    /// single-slave requests.
    pub(crate) slaves: SlaveSet,
    /// Complete outgoing frame, rebuilt by [`stamp`](Self::stamp).
    pub(crate) tx_frame: Vec<u8>,
    /// Incoming frame bytes; `response_len` tracks the valid prefix.
    pub(crate) rx_frame: Vec<u8>,
    pub(crate) response_len: usize,
}

impl RtuAdu {
    pub(crate) fn with_capacity(pdu_size: usize) -> Self {
        let pdu = Pdu::with_capacity(pdu_size);
        let frame_capacity = HEADER_LEN + pdu.capacity() + CRC_LEN;
        Self {
            pdu,
            slaves: SlaveSet::new(),
            tx_frame: Vec::with_capacity(frame_capacity),
            rx_frame: vec![0; frame_capacity],
            response_len: 0,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.pdu.clear();
        self.slaves.clear();
        self.tx_frame.clear();
        self.response_len = 0;
    }

    /// Frames the current request payload for `slave`: prefix, PDU,
    /// CRC low byte, CRC high byte.
    pub(crate) fn stamp(&mut self, slave: SlaveId) {
        self.pdu.slave = slave;
        self.tx_frame.clear();
        self.tx_frame.push(slave);
        self.tx_frame.extend_from_slice(&self.pdu.tx);
        crc::push_crc(&mut self.tx_frame);
    }

    /// Expected length of the complete response frame.
    pub(crate) fn expected_frame_len(&self) -> usize {
        HEADER_LEN + self.pdu.expected_response_len + CRC_LEN
    }

    /// Room left in the receive buffer.
    pub(crate) fn rx_remaining(&self) -> usize {
        self.rx_frame.len() - self.response_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::build_read_registers;
    use crate::frame::fc;

    #[test]
    fn stamp_produces_reference_frame() {
        let mut adu = RtuAdu::with_capacity(253);
        build_read_registers::<u16>(&mut adu.pdu, fc::READ_HOLDING_REGISTERS, 0x0000, 1).unwrap();
        adu.stamp(1);
        assert_eq!(
            adu.tx_frame,
            [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
        );
        assert_eq!(adu.expected_frame_len(), 1 + 4 + 2);
    }

    #[test]
    fn restamping_rebuilds_the_frame() {
        let mut adu = RtuAdu::with_capacity(253);
        build_read_registers::<u16>(&mut adu.pdu, fc::READ_HOLDING_REGISTERS, 0x0000, 1).unwrap();
        adu.stamp(1);
        let first = adu.tx_frame.clone();
        adu.stamp(2);
        assert_eq!(adu.tx_frame.len(), first.len());
        assert_ne!(adu.tx_frame, first);
        assert_eq!(adu.tx_frame[0], 0x02);
        assert_eq!(adu.pdu.slave, 2);
    }
}

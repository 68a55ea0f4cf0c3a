// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus master clients.
//!
//! The transport engines implement the low-level [`Transport`]
//! capability (pool slot acquisition, enqueueing, tick-driven
//! progress). The typed request surface is layered on top as the
//! [`Client`] extension trait, shared verbatim by RTU and TCP.
//!
//! Every request-issuing call is non-blocking: it either enqueues the
//! request and returns immediately, or invokes the supplied callback
//! synchronously with an error. Responses, timeouts, and all other
//! outcomes arrive through the same callback while the host drives
//! [`Transport::tick`].

#[cfg(feature = "rtu")]
pub mod rtu;

#[cfg(feature = "tcp")]
pub mod tcp;

use crate::{
    codec,
    error::Error,
    frame::{fc, Address, Callback, Pdu, Quantity},
    slave::{SlaveId, SlaveSet, BROADCAST, MAX_SLAVE_ID},
    Value,
};

/// Where a request is addressed: one slave, or every member of a
/// slave set in turn.
#[derive(Debug, Clone)]
pub enum Target {
    /// A single slave id; 0 broadcasts (RTU write requests only).
    Single(SlaveId),
    /// A snapshot of a slave set. The request is dispatched to each
    /// member in increasing id order, re-scheduled with the set's
    /// inter-slave delay and, if configured, its repeat-cycle delay.
    Set(SlaveSet),
}

impl From<SlaveId> for Target {
    fn from(from: SlaveId) -> Self {
        Target::Single(from)
    }
}

impl From<SlaveSet> for Target {
    fn from(from: SlaveSet) -> Self {
        Target::Set(from)
    }
}

impl From<&SlaveSet> for Target {
    fn from(from: &SlaveSet) -> Self {
        Target::Set(from.clone())
    }
}

/// The capability a transport engine offers to the typed request
/// surface: dispense a pool slot, fill it, hand it over for
/// transmission, and make progress.
pub trait Transport {
    /// Reserves a free ADU for `target` and installs the callback.
    ///
    /// Returns `None` when the pool is exhausted; the callback has
    /// then already been invoked with [`Error::NoFreeAdu`].
    fn acquire(&mut self, target: Target, callback: Callback) -> Option<usize>;

    /// The PDU of a reserved slot, for the request builders.
    fn pdu_mut(&mut self, index: usize) -> &mut Pdu;

    /// Enqueues a built request, or surfaces the builder error
    /// through the stored callback and releases the slot.
    fn commit(&mut self, index: usize, built: Result<(), Error>);

    /// Advances the engine: transmissions, response accumulation,
    /// validation, timeouts, and repetition scheduling. Call this
    /// periodically from the host main loop.
    fn tick(&mut self);
}

fn is_write_function(function: u8) -> bool {
    matches!(
        function,
        fc::WRITE_SINGLE_COIL
            | fc::WRITE_SINGLE_REGISTER
            | fc::WRITE_MULTIPLE_COILS
            | fc::WRITE_MULTIPLE_REGISTERS
            | fc::MASK_WRITE_REGISTER
    )
}

/// Shared issue flow: argument guard, slot acquisition, request
/// build, enqueue. Errors short-circuit through the callback.
fn issue<T: Transport + ?Sized>(
    transport: &mut T,
    target: Target,
    function: u8,
    callback: impl FnMut(&Pdu) + 'static,
    build: impl FnOnce(&mut Pdu) -> Result<(), Error>,
) {
    let mut callback: Callback = Box::new(callback);
    let rejected = match &target {
        Target::Single(slave) => {
            if (*slave == BROADCAST && !is_write_function(function)) || *slave > MAX_SLAVE_ID {
                Some(*slave)
            } else {
                None
            }
        }
        Target::Set(set) => {
            if set.is_empty() {
                Some(BROADCAST)
            } else {
                None
            }
        }
    };
    if let Some(slave) = rejected {
        let stub = Pdu::error_stub(slave, Error::InvalidSlave);
        callback(&stub);
        return;
    }
    let Some(index) = transport.acquire(target, callback) else {
        return;
    };
    let built = build(transport.pdu_mut(index));
    transport.commit(index, built);
}

/// The typed request surface, available on every [`Transport`].
///
/// All operations accept either a single [`SlaveId`] or a
/// [`SlaveSet`] as target and report their outcome exclusively
/// through the response callback.
pub trait Client: Transport {
    /// Read a single coil (0x01).
    fn read_coil(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        self.read_coils(target, addr, 1, callback);
    }

    /// Read multiple coils (0x01).
    fn read_coils(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        count: Quantity,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(self, target.into(), fc::READ_COILS, callback, |pdu| {
            codec::build_read_bits(pdu, fc::READ_COILS, addr, count)
        });
    }

    /// Read coils in whole bytes, eight coils per byte (0x01).
    fn read_coils_by_bytes(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        byte_count: u8,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        self.read_coils(target, addr, Quantity::from(byte_count) * 8, callback);
    }

    /// Read a single discrete input (0x02).
    fn read_discrete_input(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        self.read_discrete_inputs(target, addr, 1, callback);
    }

    /// Read multiple discrete inputs (0x02).
    fn read_discrete_inputs(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        count: Quantity,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(
            self,
            target.into(),
            fc::READ_DISCRETE_INPUTS,
            callback,
            |pdu| codec::build_read_bits(pdu, fc::READ_DISCRETE_INPUTS, addr, count),
        );
    }

    /// Read discrete inputs in whole bytes, eight inputs per byte (0x02).
    fn read_discrete_inputs_by_bytes(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        byte_count: u8,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        self.read_discrete_inputs(target, addr, Quantity::from(byte_count) * 8, callback);
    }

    /// Read a single holding register as a `V` (0x03).
    fn read_holding_register<V: Value>(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        self.read_holding_registers::<V>(target, addr, 1, callback);
    }

    /// Read multiple holding registers, counted in `V` elements (0x03).
    fn read_holding_registers<V: Value>(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        count: Quantity,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(
            self,
            target.into(),
            fc::READ_HOLDING_REGISTERS,
            callback,
            |pdu| codec::build_read_registers::<V>(pdu, fc::READ_HOLDING_REGISTERS, addr, count),
        );
    }

    /// Read a single input register as a `V` (0x04).
    fn read_input_register<V: Value>(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        self.read_input_registers::<V>(target, addr, 1, callback);
    }

    /// Read multiple input registers, counted in `V` elements (0x04).
    fn read_input_registers<V: Value>(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        count: Quantity,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(
            self,
            target.into(),
            fc::READ_INPUT_REGISTERS,
            callback,
            |pdu| codec::build_read_registers::<V>(pdu, fc::READ_INPUT_REGISTERS, addr, count),
        );
    }

    /// Write a single coil (0x05). Broadcast capable.
    fn write_single_coil(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        value: bool,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(self, target.into(), fc::WRITE_SINGLE_COIL, callback, |pdu| {
            codec::build_write_single_coil(pdu, addr, value)
        });
    }

    /// Write multiple coils from individual bit values (0x0F).
    /// Broadcast capable.
    fn write_coils(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        values: &[bool],
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(
            self,
            target.into(),
            fc::WRITE_MULTIPLE_COILS,
            callback,
            |pdu| codec::build_write_coils(pdu, addr, values),
        );
    }

    /// Write multiple coils from a pre-packed byte array holding
    /// `coil_count` bits (0x0F). Broadcast capable.
    fn write_coils_packed(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        src: &[u8],
        coil_count: Quantity,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(
            self,
            target.into(),
            fc::WRITE_MULTIPLE_COILS,
            callback,
            |pdu| codec::build_write_coils_packed(pdu, addr, src, coil_count),
        );
    }

    /// Write a single 16-bit holding register (0x06). Broadcast capable.
    fn write_single_register(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        value: u16,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(
            self,
            target.into(),
            fc::WRITE_SINGLE_REGISTER,
            callback,
            |pdu| codec::build_write_single_register(pdu, addr, value),
        );
    }

    /// Write one typed value into holding registers (0x10).
    /// Broadcast capable.
    fn write_holding_register<V: Value>(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        value: V,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        self.write_holding_registers(target, addr, &[value], callback);
    }

    /// Write multiple typed values into holding registers (0x10).
    /// Broadcast capable.
    fn write_holding_registers<V: Value>(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        values: &[V],
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(
            self,
            target.into(),
            fc::WRITE_MULTIPLE_REGISTERS,
            callback,
            |pdu| codec::build_write_registers(pdu, addr, values),
        );
    }

    /// Set or clear individual bits of a holding register (0x16).
    /// Broadcast capable.
    fn mask_write_register(
        &mut self,
        target: impl Into<Target>,
        addr: Address,
        and_mask: u16,
        or_mask: u16,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(
            self,
            target.into(),
            fc::MASK_WRITE_REGISTER,
            callback,
            |pdu| codec::build_mask_write_register(pdu, addr, and_mask, or_mask),
        );
    }

    /// Perform a diagnostics sub-function (0x08), serial line only.
    fn diagnostics(
        &mut self,
        target: impl Into<Target>,
        sub_function: u16,
        data: u16,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(self, target.into(), fc::DIAGNOSTICS, callback, |pdu| {
            codec::build_diagnostics(pdu, sub_function, data)
        });
    }

    /// Read the exception status byte (0x07), serial line only.
    fn read_exception_status(
        &mut self,
        target: impl Into<Target>,
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(
            self,
            target.into(),
            fc::READ_EXCEPTION_STATUS,
            callback,
            codec::build_read_exception_status,
        );
    }

    /// Read and write multiple registers in one transaction (0x17).
    /// The write is performed before the read.
    fn read_write_multiple_registers<R: Value, W: Value>(
        &mut self,
        target: impl Into<Target>,
        read_addr: Address,
        read_count: Quantity,
        write_addr: Address,
        values: &[W],
        callback: impl FnMut(&Pdu) + 'static,
    ) where
        Self: Sized,
    {
        issue(
            self,
            target.into(),
            fc::READ_WRITE_MULTIPLE_REGISTERS,
            callback,
            |pdu| {
                codec::build_read_write_registers::<R, W>(
                    pdu, read_addr, read_count, write_addr, values,
                )
            },
        );
    }
}

impl<T: Transport> Client for T {}

/// Repeat bookkeeping shared by both engines: advances the ADU's
/// slave-set cursor and computes the redispatch delay. A wrap of the
/// cursor (or a single-member set) selects the repeat-cycle delay,
/// a forward step the inter-slave delay.
pub(crate) fn next_repeat(slaves: &mut SlaveSet, now_ms: u64) -> Option<(SlaveId, u64, u32)> {
    if slaves.is_empty() {
        return None;
    }
    let previous = slaves.active();
    let next = slaves.next_id()?;
    let delay = match previous {
        Some(previous) if next > previous => slaves.delay(),
        _ => slaves.repeat_delay().unwrap_or(0),
    };
    Some((next, now_ms, delay))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_functions() {
        for function in [0x05, 0x06, 0x0F, 0x10, 0x16] {
            assert!(is_write_function(function));
        }
        for function in [0x01, 0x02, 0x03, 0x04, 0x07, 0x08, 0x17] {
            assert!(!is_write_function(function));
        }
    }

    #[test]
    fn repeat_delay_selection() {
        let mut slaves: SlaveSet = [1, 2].into_iter().collect();
        slaves.set_delay(10);
        slaves.set_repeat_delay(Some(1000));
        assert_eq!(slaves.next_id(), Some(1));
        // Forward step: inter-slave delay.
        assert_eq!(next_repeat(&mut slaves, 5), Some((2, 5, 10)));
        // Wrap: repeat-cycle delay.
        assert_eq!(next_repeat(&mut slaves, 6), Some((1, 6, 1000)));
    }

    #[test]
    fn repeat_ends_without_repeat_delay() {
        let mut slaves = SlaveSet::single(4);
        assert_eq!(slaves.next_id(), Some(4));
        assert_eq!(next_repeat(&mut slaves, 0), None);
    }

    #[test]
    fn single_member_cycle_uses_repeat_delay() {
        let mut slaves = SlaveSet::single(0);
        slaves.set_repeat_delay(Some(250));
        assert_eq!(slaves.next_id(), Some(0));
        assert_eq!(next_repeat(&mut slaves, 7), Some((0, 7, 250)));
    }
}

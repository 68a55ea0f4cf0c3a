// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request builders and response validation for every supported
//! function code, plus the typed register packing that maps multi-byte
//! host values onto 16-bit big-endian registers.
//!
//! Each builder fills the transmit buffer of a [`Pdu`] and records the
//! reference fields a valid response must echo. Validation later
//! checks the received bytes field by field against that reference
//! before the data region is exposed to the caller.

#[cfg(feature = "rtu")]
pub(crate) mod crc;

use byteorder::{BigEndian, ByteOrder};

use crate::{
    error::{Error, Exception},
    frame::{fc, Address, Pdu, Quantity},
};

/// Protocol quantity limits.
pub(crate) const MAX_READ_COILS: u16 = 2000;
pub(crate) const MAX_WRITE_COILS: u16 = 1968;
pub(crate) const MAX_WRITE_COIL_BYTES: usize = 246;
pub(crate) const MAX_READ_REGISTERS: u16 = 125;
pub(crate) const MAX_WRITE_REGISTERS: u16 = 123;
pub(crate) const MAX_READ_WRITE_REGISTERS: u16 = 121;

/// Largest element size admitted by the typed register API.
pub(crate) const MAX_ELEMENT_SIZE: usize = 8;

/// Host endianness, fixed at compile time. Tests drive the packing
/// helpers with an explicit flag to cover both layouts.
pub(crate) const HOST_BIG_ENDIAN: bool = cfg!(target_endian = "big");

/// A plain numeric value that can live in Modbus registers.
///
/// Values wider than one register are split across consecutive
/// registers in host memory order; each 16-bit register travels
/// big-endian on the wire. Odd-sized values are padded with one zero
/// byte to the next register boundary.
pub trait Value: Copy {
    /// Size of the value in bytes. At most 8.
    const SIZE: usize;

    #[doc(hidden)]
    fn host_bytes(self) -> [u8; MAX_ELEMENT_SIZE];

    #[doc(hidden)]
    fn from_host_bytes(bytes: &[u8]) -> Self;
}

macro_rules! impl_value {
    ($($ty:ty),+) => {
        $(impl Value for $ty {
            const SIZE: usize = core::mem::size_of::<$ty>();

            fn host_bytes(self) -> [u8; MAX_ELEMENT_SIZE] {
                let mut out = [0u8; MAX_ELEMENT_SIZE];
                out[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
                out
            }

            fn from_host_bytes(bytes: &[u8]) -> Self {
                let mut raw = [0u8; core::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                <$ty>::from_ne_bytes(raw)
            }
        })+
    };
}

impl_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Element size rounded up to the next register boundary.
pub(crate) fn padded_size(elem_size: usize) -> usize {
    (elem_size + 1) & !1
}

/// Appends one element to `dst` as big-endian register pairs.
///
/// On a big-endian host the element is copied verbatim with a zero
/// pad byte appended if needed; on a little-endian host the bytes are
/// swapped within each 16-bit half so that the register values come
/// out identical when read back on the same host.
fn pack_element(dst: &mut Vec<u8>, elem: &[u8], big_endian: bool) {
    let padded = padded_size(elem.len());
    if big_endian {
        dst.extend_from_slice(elem);
        if padded > elem.len() {
            dst.push(0x00);
        }
        return;
    }
    let mut i = 0;
    while i < padded {
        let lo = elem.get(i).copied().unwrap_or(0x00);
        let hi = elem.get(i + 1).copied().unwrap_or(0x00);
        dst.push(hi);
        dst.push(lo);
        i += 2;
    }
}

pub(crate) fn pack_values<V: Value>(values: &[V], dst: &mut Vec<u8>, big_endian: bool) {
    for value in values {
        let bytes = value.host_bytes();
        pack_element(dst, &bytes[..V::SIZE], big_endian);
    }
}

/// Reverses [`pack_values`] in place: folds padded register pairs back
/// into the natural host layout of the element type, dropping the pad
/// bytes. The tail of `buf` beyond `elem_count * elem_size` is left
/// untouched.
pub(crate) fn unpack_values_in_place(
    buf: &mut [u8],
    elem_count: usize,
    elem_size: usize,
    big_endian: bool,
) {
    debug_assert!(elem_size <= MAX_ELEMENT_SIZE);
    let padded = padded_size(elem_size);
    let mut scratch = [0u8; MAX_ELEMENT_SIZE];
    for i in 0..elem_count {
        let src = i * padded;
        if big_endian {
            scratch[..elem_size].copy_from_slice(&buf[src..src + elem_size]);
        } else {
            let mut j = 0;
            while j < padded {
                let hi = buf[src + j];
                let lo = buf[src + j + 1];
                if j < elem_size {
                    scratch[j] = lo;
                }
                if j + 1 < elem_size {
                    scratch[j + 1] = hi;
                }
                j += 2;
            }
        }
        buf[i * elem_size..(i + 1) * elem_size].copy_from_slice(&scratch[..elem_size]);
    }
}

/// Packs a `&[bool]` into the LSB-first coil byte layout.
fn pack_bits(values: &[bool], dst: &mut Vec<u8>) {
    let byte_count = (values.len() + 7) / 8;
    let start = dst.len();
    dst.resize(start + byte_count, 0x00);
    for (i, &bit) in values.iter().enumerate() {
        if bit {
            dst[start + i / 8] |= 1 << (i % 8);
        }
    }
}

fn begin_request(pdu: &mut Pdu, function: u8) {
    pdu.tx.clear();
    pdu.tx.push(function);
    pdu.response_head = [0; crate::frame::RESPONSE_HEAD_LEN];
    pdu.response_head[0] = function;
    pdu.elem_size = 0;
}

fn put_u16(dst: &mut Vec<u8>, value: u16) {
    dst.extend_from_slice(&value.to_be_bytes());
}

/// Read coils (0x01) or discrete inputs (0x02).
pub(crate) fn build_read_bits(
    pdu: &mut Pdu,
    function: u8,
    addr: Address,
    count: Quantity,
) -> Result<(), Error> {
    if count == 0 {
        return Err(Error::TooFewData);
    }
    if count > MAX_READ_COILS {
        return Err(Error::TooManyData);
    }
    let byte_count = (usize::from(count) + 7) / 8;
    if pdu.capacity() < 5 || pdu.capacity() < 2 + byte_count {
        return Err(Error::BufferTooSmall);
    }
    begin_request(pdu, function);
    put_u16(&mut pdu.tx, addr);
    put_u16(&mut pdu.tx, count);
    pdu.response_head[1] = byte_count as u8;
    pdu.expected_response_len = 2 + byte_count;
    Ok(())
}

/// Read holding (0x03) or input (0x04) registers, counted in
/// elements of `V`.
pub(crate) fn build_read_registers<V: Value>(
    pdu: &mut Pdu,
    function: u8,
    addr: Address,
    count: Quantity,
) -> Result<(), Error> {
    if count == 0 {
        return Err(Error::TooFewData);
    }
    let registers = usize::from(count) * padded_size(V::SIZE) / 2;
    if registers > usize::from(MAX_READ_REGISTERS) {
        return Err(Error::TooManyData);
    }
    let byte_count = registers * 2;
    if pdu.capacity() < 5 || pdu.capacity() < 2 + byte_count {
        return Err(Error::BufferTooSmall);
    }
    begin_request(pdu, function);
    put_u16(&mut pdu.tx, addr);
    put_u16(&mut pdu.tx, registers as u16);
    pdu.response_head[1] = byte_count as u8;
    pdu.expected_response_len = 2 + byte_count;
    pdu.elem_size = V::SIZE;
    Ok(())
}

/// Write single coil (0x05).
pub(crate) fn build_write_single_coil(
    pdu: &mut Pdu,
    addr: Address,
    value: bool,
) -> Result<(), Error> {
    if pdu.capacity() < 5 {
        return Err(Error::BufferTooSmall);
    }
    begin_request(pdu, fc::WRITE_SINGLE_COIL);
    put_u16(&mut pdu.tx, addr);
    put_u16(&mut pdu.tx, if value { 0xFF00 } else { 0x0000 });
    pdu.response_head[..5].copy_from_slice(&pdu.tx[..5]);
    pdu.expected_response_len = 5;
    Ok(())
}

/// Write single register (0x06).
pub(crate) fn build_write_single_register(
    pdu: &mut Pdu,
    addr: Address,
    value: u16,
) -> Result<(), Error> {
    if pdu.capacity() < 5 {
        return Err(Error::BufferTooSmall);
    }
    begin_request(pdu, fc::WRITE_SINGLE_REGISTER);
    put_u16(&mut pdu.tx, addr);
    put_u16(&mut pdu.tx, value);
    pdu.response_head[..5].copy_from_slice(&pdu.tx[..5]);
    pdu.expected_response_len = 5;
    Ok(())
}

/// Write multiple coils (0x0F) from a pre-packed byte array holding
/// `coil_count` bits.
pub(crate) fn build_write_coils_packed(
    pdu: &mut Pdu,
    addr: Address,
    src: &[u8],
    coil_count: Quantity,
) -> Result<(), Error> {
    if coil_count == 0 || src.is_empty() {
        return Err(Error::TooFewData);
    }
    if coil_count > MAX_WRITE_COILS || src.len() > MAX_WRITE_COIL_BYTES {
        return Err(Error::TooManyData);
    }
    if src.len() != (usize::from(coil_count) + 7) / 8 {
        return Err(Error::InvalidSourceSize);
    }
    if pdu.capacity() < 6 + src.len() {
        return Err(Error::BufferTooSmall);
    }
    begin_request(pdu, fc::WRITE_MULTIPLE_COILS);
    put_u16(&mut pdu.tx, addr);
    put_u16(&mut pdu.tx, coil_count);
    pdu.tx.push(src.len() as u8);
    pdu.tx.extend_from_slice(src);
    pdu.response_head[..5].copy_from_slice(&pdu.tx[..5]);
    pdu.expected_response_len = 5;
    Ok(())
}

/// Write multiple coils (0x0F) from individual bit values.
pub(crate) fn build_write_coils(
    pdu: &mut Pdu,
    addr: Address,
    values: &[bool],
) -> Result<(), Error> {
    if values.is_empty() {
        return Err(Error::TooFewData);
    }
    if values.len() > usize::from(MAX_WRITE_COILS) {
        return Err(Error::TooManyData);
    }
    let byte_count = (values.len() + 7) / 8;
    if pdu.capacity() < 6 + byte_count {
        return Err(Error::BufferTooSmall);
    }
    begin_request(pdu, fc::WRITE_MULTIPLE_COILS);
    put_u16(&mut pdu.tx, addr);
    put_u16(&mut pdu.tx, values.len() as u16);
    pdu.tx.push(byte_count as u8);
    pack_bits(values, &mut pdu.tx);
    pdu.response_head[..5].copy_from_slice(&pdu.tx[..5]);
    pdu.expected_response_len = 5;
    Ok(())
}

/// Write multiple registers (0x10) from typed elements.
pub(crate) fn build_write_registers<V: Value>(
    pdu: &mut Pdu,
    addr: Address,
    values: &[V],
) -> Result<(), Error> {
    if values.is_empty() {
        return Err(Error::TooFewData);
    }
    let byte_count = values.len() * padded_size(V::SIZE);
    let registers = byte_count / 2;
    if registers > usize::from(MAX_WRITE_REGISTERS) {
        return Err(Error::TooManyData);
    }
    if pdu.capacity() < 6 + byte_count {
        return Err(Error::BufferTooSmall);
    }
    begin_request(pdu, fc::WRITE_MULTIPLE_REGISTERS);
    put_u16(&mut pdu.tx, addr);
    put_u16(&mut pdu.tx, registers as u16);
    pdu.tx.push(byte_count as u8);
    pack_values(values, &mut pdu.tx, HOST_BIG_ENDIAN);
    pdu.response_head[..5].copy_from_slice(&pdu.tx[..5]);
    pdu.expected_response_len = 5;
    Ok(())
}

/// Mask write register (0x16).
pub(crate) fn build_mask_write_register(
    pdu: &mut Pdu,
    addr: Address,
    and_mask: u16,
    or_mask: u16,
) -> Result<(), Error> {
    if pdu.capacity() < 7 {
        return Err(Error::BufferTooSmall);
    }
    begin_request(pdu, fc::MASK_WRITE_REGISTER);
    put_u16(&mut pdu.tx, addr);
    put_u16(&mut pdu.tx, and_mask);
    put_u16(&mut pdu.tx, or_mask);
    pdu.response_head[..7].copy_from_slice(&pdu.tx[..7]);
    pdu.expected_response_len = 7;
    Ok(())
}

/// Read exception status (0x07), serial line only.
pub(crate) fn build_read_exception_status(pdu: &mut Pdu) -> Result<(), Error> {
    if pdu.capacity() < 2 {
        return Err(Error::BufferTooSmall);
    }
    begin_request(pdu, fc::READ_EXCEPTION_STATUS);
    pdu.expected_response_len = 2;
    Ok(())
}

/// Diagnostics sub-functions accepted by [`build_diagnostics`]:
/// 0x00..=0x04 and 0x0A..=0x14.
fn diagnostics_sub_function_valid(sub: u16) -> bool {
    sub <= 0x14 && !(0x05..0x0A).contains(&sub)
}

/// Diagnostics (0x08), serial line only. The response echoes the
/// sub-function; the echoed data word forms the data region.
pub(crate) fn build_diagnostics(pdu: &mut Pdu, sub_function: u16, data: u16) -> Result<(), Error> {
    if !diagnostics_sub_function_valid(sub_function) {
        return Err(Error::InvalidSubFunction);
    }
    if pdu.capacity() < 5 {
        return Err(Error::BufferTooSmall);
    }
    begin_request(pdu, fc::DIAGNOSTICS);
    put_u16(&mut pdu.tx, sub_function);
    put_u16(&mut pdu.tx, data);
    pdu.response_head[..5].copy_from_slice(&pdu.tx[..5]);
    pdu.expected_response_len = 5;
    Ok(())
}

/// Read/write multiple registers (0x17). `read_count` is counted in
/// elements of `R`, the write payload in elements of `W`.
pub(crate) fn build_read_write_registers<R: Value, W: Value>(
    pdu: &mut Pdu,
    read_addr: Address,
    read_count: Quantity,
    write_addr: Address,
    values: &[W],
) -> Result<(), Error> {
    if read_count == 0 || values.is_empty() {
        return Err(Error::TooFewData);
    }
    let read_registers = usize::from(read_count) * padded_size(R::SIZE) / 2;
    if read_registers > usize::from(MAX_READ_REGISTERS) {
        return Err(Error::TooManyData);
    }
    let write_byte_count = values.len() * padded_size(W::SIZE);
    let write_registers = write_byte_count / 2;
    if write_registers > usize::from(MAX_READ_WRITE_REGISTERS) {
        return Err(Error::TooManyData);
    }
    let read_byte_count = read_registers * 2;
    if pdu.capacity() < 10 + write_byte_count || pdu.capacity() < 2 + read_byte_count {
        return Err(Error::BufferTooSmall);
    }
    begin_request(pdu, fc::READ_WRITE_MULTIPLE_REGISTERS);
    put_u16(&mut pdu.tx, read_addr);
    put_u16(&mut pdu.tx, read_registers as u16);
    put_u16(&mut pdu.tx, write_addr);
    put_u16(&mut pdu.tx, write_registers as u16);
    pdu.tx.push(write_byte_count as u8);
    pack_values(values, &mut pdu.tx, HOST_BIG_ENDIAN);
    pdu.response_head[1] = read_byte_count as u8;
    pdu.expected_response_len = 2 + read_byte_count;
    pdu.elem_size = R::SIZE;
    Ok(())
}

fn need(rx: &[u8], len: usize) -> Result<(), Error> {
    if rx.len() < len {
        return Err(Error::TooFewData);
    }
    Ok(())
}

/// Validates a received response PDU against the reference recorded
/// at build time and, on success, marks the data region and folds
/// typed register payloads back into host layout.
pub(crate) fn validate_response(pdu: &mut Pdu) -> Result<(), Error> {
    need(&pdu.rx, 2)?;
    let head = pdu.response_head;
    if pdu.rx[0] == (head[0] | 0x80) {
        let code = pdu.rx[1];
        return Err(Exception::try_from(code)
            .map(Error::Exception)
            .unwrap_or(Error::InvalidExceptionCode));
    }
    if pdu.rx[0] != head[0] {
        return Err(Error::InvalidFunction);
    }
    match pdu.rx[0] {
        fc::READ_COILS
        | fc::READ_DISCRETE_INPUTS
        | fc::READ_HOLDING_REGISTERS
        | fc::READ_INPUT_REGISTERS
        | fc::READ_WRITE_MULTIPLE_REGISTERS => {
            if pdu.rx[1] != head[1] {
                return Err(Error::InvalidByteLength);
            }
            let byte_count = usize::from(pdu.rx[1]);
            need(&pdu.rx, 2 + byte_count)?;
            pdu.data_begin = 2;
            pdu.data_len = byte_count;
            if pdu.elem_size > 0 && byte_count % 2 == 0 {
                let elem_count = byte_count / padded_size(pdu.elem_size);
                let elem_size = pdu.elem_size;
                unpack_values_in_place(
                    &mut pdu.rx[2..2 + byte_count],
                    elem_count,
                    elem_size,
                    HOST_BIG_ENDIAN,
                );
                pdu.data_len = elem_count * elem_size;
            }
        }
        fc::WRITE_SINGLE_COIL | fc::WRITE_SINGLE_REGISTER => {
            need(&pdu.rx, 5)?;
            if pdu.rx[1..3] != head[1..3] {
                return Err(Error::InvalidAddress);
            }
            if pdu.rx[3..5] != head[3..5] {
                return Err(Error::InvalidData);
            }
        }
        fc::READ_EXCEPTION_STATUS => {
            pdu.data_begin = 1;
            pdu.data_len = 1;
        }
        fc::DIAGNOSTICS => {
            need(&pdu.rx, 5)?;
            if pdu.rx[1..3] != head[1..3] {
                return Err(Error::InvalidSubFunction);
            }
            pdu.data_begin = 3;
            pdu.data_len = 2;
        }
        fc::WRITE_MULTIPLE_COILS | fc::WRITE_MULTIPLE_REGISTERS => {
            need(&pdu.rx, 5)?;
            if pdu.rx[1..3] != head[1..3] {
                return Err(Error::InvalidAddress);
            }
            if pdu.rx[3..5] != head[3..5] {
                return Err(Error::InvalidByteLength);
            }
        }
        fc::MASK_WRITE_REGISTER => {
            need(&pdu.rx, 7)?;
            if pdu.rx[1..3] != head[1..3] {
                return Err(Error::InvalidAddress);
            }
            if pdu.rx[3..7] != head[3..7] {
                return Err(Error::InvalidData);
            }
        }
        _ => return Err(Error::NotSupported),
    }
    Ok(())
}

/// Reads a 16-bit big-endian wire field.
pub(crate) fn read_u16(bytes: &[u8]) -> u16 {
    BigEndian::read_u16(bytes)
}

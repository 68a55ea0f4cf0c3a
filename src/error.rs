// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use thiserror::Error;

/// A server (slave) exception as carried in a response with the
/// high bit of the function code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u8)]
pub enum Exception {
    #[error("Illegal function")]
    IllegalFunction = 0x01,
    #[error("Illegal data address")]
    IllegalDataAddress = 0x02,
    #[error("Illegal data value")]
    IllegalDataValue = 0x03,
    #[error("Slave device failure")]
    SlaveDeviceFailure = 0x04,
    #[error("Acknowledge")]
    Acknowledge = 0x05,
    #[error("Slave device busy")]
    SlaveDeviceBusy = 0x06,
    #[error("Negative acknowledge")]
    NegativeAcknowledge = 0x07,
    #[error("Memory parity error")]
    MemoryParityError = 0x08,
    #[error("Gateway path unavailable")]
    GatewayPathUnavailable = 0x09,
    #[error("Gateway target device failed to respond")]
    GatewayTargetDevice = 0x0A,
}

impl From<Exception> for u8 {
    fn from(from: Exception) -> Self {
        from as u8
    }
}

impl TryFrom<u8> for Exception {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, u8> {
        use Exception::*;

        let ex = match code {
            0x01 => IllegalFunction,
            0x02 => IllegalDataAddress,
            0x03 => IllegalDataValue,
            0x04 => SlaveDeviceFailure,
            0x05 => Acknowledge,
            0x06 => SlaveDeviceBusy,
            0x07 => NegativeAcknowledge,
            0x08 => MemoryParityError,
            0x09 => GatewayPathUnavailable,
            0x0A => GatewayTargetDevice,
            _ => return Err(code),
        };
        Ok(ex)
    }
}

/// The unified error taxonomy delivered through response callbacks.
///
/// Every failure, whether raised by the remote device (a _Modbus_
/// exception), detected while validating a response, or produced
/// locally before anything reached the wire, ends up as one of these
/// values on the affected [`Pdu`](crate::Pdu).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The slave responded with a _Modbus_ exception.
    #[error("Modbus exception: {0}")]
    Exception(#[from] Exception),

    /// The request would exceed a protocol quantity limit.
    #[error("Too many data items requested")]
    TooManyData,

    /// The request or response carries fewer data items than required.
    #[error("Too few data items")]
    TooFewData,

    /// No (complete) response arrived within the response timeout.
    #[error("Response timed out")]
    ResponseTimeout,

    /// The connection dropped while transactions were outstanding.
    #[error("Connection reset by peer")]
    ConnectionResetByPeer,

    /// The peer refused the connection attempt.
    #[error("Connection refused")]
    ConnectionRefused,

    /// The slave id is invalid for this request, or the response
    /// came from a different slave than addressed.
    #[error("Invalid slave id")]
    InvalidSlave,

    /// The response function code does not match the request.
    #[error("Invalid function code in response")]
    InvalidFunction,

    /// The diagnostics sub-function is unknown or was not echoed.
    #[error("Invalid diagnostics sub-function")]
    InvalidSubFunction,

    /// The response did not echo the request address.
    #[error("Invalid address in response")]
    InvalidAddress,

    /// The response did not echo the request data.
    #[error("Invalid data in response")]
    InvalidData,

    /// The response did not echo the request quantity.
    #[error("Invalid data quantity in response")]
    InvalidDataQuantity,

    /// The response byte count disagrees with the request.
    #[error("Invalid byte length in response")]
    InvalidByteLength,

    /// The exception code in the response is outside 1..=10.
    #[error("Invalid exception code in response")]
    InvalidExceptionCode,

    /// The RTU frame checksum did not verify.
    #[error("CRC checksum mismatch")]
    Crc,

    /// An argument is outside its admissible range.
    #[error("Invalid argument")]
    InvalidArgument,

    /// The source data size does not match the declared quantity.
    #[error("Invalid source size")]
    InvalidSourceSize,

    /// The responded function code is not supported by this library.
    #[error("Operation not supported")]
    NotSupported,

    /// The pending queue is at capacity.
    #[error("Request queue is full")]
    QueueFull,

    /// The TCP sent window is at capacity.
    #[error("TCP sent buffer is full")]
    SentBufferFull,

    /// No TCP client is configured for the addressed slave.
    #[error("No TCP client for the addressed slave")]
    NoClientForSlave,

    /// Every ADU in the pool is in use.
    #[error("No more free ADUs")]
    NoFreeAdu,

    /// The PDU buffer cannot hold the request payload.
    #[error("Buffer is too small")]
    BufferTooSmall,

    /// The MBAP transaction id does not match the outstanding request.
    #[error("Invalid MBAP transaction id")]
    InvalidMbapTransactionId,

    /// The MBAP protocol id is not zero.
    #[error("Invalid MBAP protocol id")]
    InvalidMbapProtocolId,

    /// The MBAP unit id does not match the addressed slave.
    #[error("Invalid MBAP unit id")]
    InvalidMbapUnitId,
}

//! Protocol data units
//!
//! A [`GenericPdu`] is a function code plus opaque payload. Typed request and response
//! structs convert to and from it through the [`Pdu`] trait. Only the function codes the
//! power unit actually uses are modelled here.

use crate::error::{ModbusError, ModbusResult};
use bytes::{Buf, BufMut};
use std::fmt;

/// Read Holding Registers
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
/// Write Single Register
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
/// Write Multiple Registers
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
/// Vendor extension used for unsolicited reports
pub const FC_UNSOLICITED_REPORT: u8 = 0x41;

/// High bit marking an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Largest register count a single read may request
pub const MAX_READ_REGISTERS: u16 = 125;
/// Largest register count a single write may carry
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Function code plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericPdu {
    pub function_code: u8,
    pub data: Vec<u8>,
}

impl GenericPdu {
    pub fn new(function_code: u8, data: Vec<u8>) -> Self {
        Self {
            function_code,
            data,
        }
    }

    /// Whether this PDU is an exception response
    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    /// Function code with the exception bit cleared
    pub fn masked_function_code(&self) -> u8 {
        self.function_code & !EXCEPTION_FLAG
    }

    /// Serialized length on the wire (function code + payload)
    pub fn wire_len(&self) -> usize {
        1 + self.data.len()
    }

    /// Turn an exception response into the matching error
    pub fn check_exception(self) -> ModbusResult<Self> {
        if !self.is_exception() {
            return Ok(self);
        }
        let exception = ErrorPdu::from_generic(&self)?;
        Err(ModbusError::ProtocolException {
            function_code: exception.function_code,
            exception: exception.exception,
        })
    }
}

impl fmt::Display for GenericPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fc=0x{:02X} data={}", self.function_code, hex::encode(&self.data))
    }
}

/// Conversion between a typed message and [`GenericPdu`]
pub trait Pdu: Sized {
    fn to_generic(&self) -> ModbusResult<GenericPdu>;
    fn from_generic(pdu: &GenericPdu) -> ModbusResult<Self>;
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    Other(u8),
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            other => Self::Other(other),
        }
    }
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> Self {
        match code {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::ServerDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::ServerDeviceBusy => 0x06,
            ExceptionCode::Other(other) => other,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "illegal function"),
            Self::IllegalDataAddress => write!(f, "illegal data address"),
            Self::IllegalDataValue => write!(f, "illegal data value"),
            Self::ServerDeviceFailure => write!(f, "server device failure"),
            Self::Acknowledge => write!(f, "acknowledge"),
            Self::ServerDeviceBusy => write!(f, "server device busy"),
            Self::Other(code) => write!(f, "exception 0x{:02X}", code),
        }
    }
}

/// Exception response: `fc | 0x80` followed by the exception code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPdu {
    /// Function code of the failed request (without the exception bit)
    pub function_code: u8,
    pub exception: ExceptionCode,
}

impl ErrorPdu {
    pub fn new(function_code: u8, exception: ExceptionCode) -> Self {
        Self {
            function_code: function_code & !EXCEPTION_FLAG,
            exception,
        }
    }
}

impl Pdu for ErrorPdu {
    fn to_generic(&self) -> ModbusResult<GenericPdu> {
        Ok(GenericPdu::new(
            self.function_code | EXCEPTION_FLAG,
            vec![self.exception.into()],
        ))
    }

    fn from_generic(pdu: &GenericPdu) -> ModbusResult<Self> {
        if !pdu.is_exception() {
            return Err(ModbusError::decoding("not an exception response", pdu));
        }
        if pdu.data.len() != 1 {
            return Err(ModbusError::decoding(
                "exception response must carry exactly one byte",
                pdu,
            ));
        }
        Ok(Self::new(pdu.function_code, ExceptionCode::from(pdu.data[0])))
    }
}

fn expect_function_code(pdu: &GenericPdu, expected: u8) -> ModbusResult<()> {
    if pdu.function_code != expected {
        return Err(ModbusError::decoding(
            format!("expected function code 0x{:02X}", expected),
            pdu,
        ));
    }
    Ok(())
}

fn expect_data_len(pdu: &GenericPdu, expected: usize) -> ModbusResult<()> {
    if pdu.data.len() != expected {
        return Err(ModbusError::decoding(
            format!("expected {} data bytes, got {}", expected, pdu.data.len()),
            pdu,
        ));
    }
    Ok(())
}

// ============================================================================
// Read Holding Registers (0x03)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadHoldingRegistersRequest {
    pub register_start: u16,
    pub register_count: u16,
}

impl Pdu for ReadHoldingRegistersRequest {
    fn to_generic(&self) -> ModbusResult<GenericPdu> {
        if self.register_count == 0 || self.register_count > MAX_READ_REGISTERS {
            return Err(ModbusError::encoding(format!(
                "read register count {} outside 1..={}",
                self.register_count, MAX_READ_REGISTERS
            )));
        }
        let mut data = Vec::with_capacity(4);
        data.put_u16(self.register_start);
        data.put_u16(self.register_count);
        Ok(GenericPdu::new(FC_READ_HOLDING_REGISTERS, data))
    }

    fn from_generic(pdu: &GenericPdu) -> ModbusResult<Self> {
        expect_function_code(pdu, FC_READ_HOLDING_REGISTERS)?;
        expect_data_len(pdu, 4)?;
        let mut buf = pdu.data.as_slice();
        Ok(Self {
            register_start: buf.get_u16(),
            register_count: buf.get_u16(),
        })
    }
}

/// Register contents in wire byte order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadHoldingRegistersResponse {
    pub registers: Vec<u8>,
}

impl Pdu for ReadHoldingRegistersResponse {
    fn to_generic(&self) -> ModbusResult<GenericPdu> {
        if self.registers.len() % 2 != 0 || self.registers.len() > u8::MAX as usize {
            return Err(ModbusError::encoding(format!(
                "read response of {} bytes cannot be encoded",
                self.registers.len()
            )));
        }
        let mut data = Vec::with_capacity(1 + self.registers.len());
        data.put_u8(self.registers.len() as u8);
        data.put_slice(&self.registers);
        Ok(GenericPdu::new(FC_READ_HOLDING_REGISTERS, data))
    }

    fn from_generic(pdu: &GenericPdu) -> ModbusResult<Self> {
        expect_function_code(pdu, FC_READ_HOLDING_REGISTERS)?;
        let Some((&byte_count, registers)) = pdu.data.split_first() else {
            return Err(ModbusError::decoding("missing byte count", pdu));
        };
        if registers.len() != byte_count as usize || byte_count % 2 != 0 {
            return Err(ModbusError::decoding(
                format!(
                    "byte count {} does not match {} payload bytes",
                    byte_count,
                    registers.len()
                ),
                pdu,
            ));
        }
        Ok(Self {
            registers: registers.to_vec(),
        })
    }
}

// ============================================================================
// Write Single Register (0x06)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSingleRegisterRequest {
    pub register_address: u16,
    pub register_value: u16,
}

impl Pdu for WriteSingleRegisterRequest {
    fn to_generic(&self) -> ModbusResult<GenericPdu> {
        let mut data = Vec::with_capacity(4);
        data.put_u16(self.register_address);
        data.put_u16(self.register_value);
        Ok(GenericPdu::new(FC_WRITE_SINGLE_REGISTER, data))
    }

    fn from_generic(pdu: &GenericPdu) -> ModbusResult<Self> {
        expect_function_code(pdu, FC_WRITE_SINGLE_REGISTER)?;
        expect_data_len(pdu, 4)?;
        let mut buf = pdu.data.as_slice();
        Ok(Self {
            register_address: buf.get_u16(),
            register_value: buf.get_u16(),
        })
    }
}

/// The response echoes the request
pub type WriteSingleRegisterResponse = WriteSingleRegisterRequest;

// ============================================================================
// Write Multiple Registers (0x10)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteMultipleRegistersRequest {
    pub register_start: u16,
    /// Register contents in wire byte order
    pub registers: Vec<u8>,
}

impl WriteMultipleRegistersRequest {
    pub fn register_count(&self) -> u16 {
        (self.registers.len() / 2) as u16
    }
}

impl Pdu for WriteMultipleRegistersRequest {
    fn to_generic(&self) -> ModbusResult<GenericPdu> {
        if self.registers.is_empty() || self.registers.len() % 2 != 0 {
            return Err(ModbusError::encoding(format!(
                "write of {} bytes is not a whole number of registers",
                self.registers.len()
            )));
        }
        if self.register_count() > MAX_WRITE_REGISTERS {
            return Err(ModbusError::encoding(format!(
                "write register count {} exceeds {}",
                self.register_count(),
                MAX_WRITE_REGISTERS
            )));
        }
        let mut data = Vec::with_capacity(5 + self.registers.len());
        data.put_u16(self.register_start);
        data.put_u16(self.register_count());
        data.put_u8(self.registers.len() as u8);
        data.put_slice(&self.registers);
        Ok(GenericPdu::new(FC_WRITE_MULTIPLE_REGISTERS, data))
    }

    fn from_generic(pdu: &GenericPdu) -> ModbusResult<Self> {
        expect_function_code(pdu, FC_WRITE_MULTIPLE_REGISTERS)?;
        if pdu.data.len() < 5 {
            return Err(ModbusError::decoding("write request header truncated", pdu));
        }
        let mut buf = pdu.data.as_slice();
        let register_start = buf.get_u16();
        let register_count = buf.get_u16();
        let byte_count = buf.get_u8() as usize;
        if byte_count != register_count as usize * 2 || buf.remaining() != byte_count {
            return Err(ModbusError::decoding(
                format!(
                    "register count {} / byte count {} / payload {} mismatch",
                    register_count,
                    byte_count,
                    buf.remaining()
                ),
                pdu,
            ));
        }
        Ok(Self {
            register_start,
            registers: buf.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteMultipleRegistersResponse {
    pub register_start: u16,
    pub register_count: u16,
}

impl Pdu for WriteMultipleRegistersResponse {
    fn to_generic(&self) -> ModbusResult<GenericPdu> {
        let mut data = Vec::with_capacity(4);
        data.put_u16(self.register_start);
        data.put_u16(self.register_count);
        Ok(GenericPdu::new(FC_WRITE_MULTIPLE_REGISTERS, data))
    }

    fn from_generic(pdu: &GenericPdu) -> ModbusResult<Self> {
        expect_function_code(pdu, FC_WRITE_MULTIPLE_REGISTERS)?;
        expect_data_len(pdu, 4)?;
        let mut buf = pdu.data.as_slice();
        Ok(Self {
            register_start: buf.get_u16(),
            register_count: buf.get_u16(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;

    #[test]
    fn test_read_request_encoding() {
        let request = ReadHoldingRegistersRequest {
            register_start: 0x2100,
            register_count: 4,
        };
        let pdu = request.to_generic().unwrap();
        assert_eq!(pdu.function_code, 0x03);
        assert_eq!(pdu.data, vec![0x21, 0x00, 0x00, 0x04]);
    }

    #[test]
    fn test_read_request_rejects_zero_count() {
        let request = ReadHoldingRegistersRequest {
            register_start: 0,
            register_count: 0,
        };
        assert!(matches!(request.to_generic(), Err(ModbusError::Encoding(_))));
    }

    #[test]
    fn test_read_response_byte_count_mismatch() {
        let pdu = GenericPdu::new(0x03, vec![0x04, 0x00, 0x01]);
        let err = ReadHoldingRegistersResponse::from_generic(&pdu).unwrap_err();
        match err {
            ModbusError::Decoding { pdu: bad, .. } => assert_eq!(bad, pdu),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_write_multiple_decoding() {
        let pdu = GenericPdu::new(0x10, vec![0x40, 0x08, 0x00, 0x01, 0x02, 0x00, 0x01]);
        let request = WriteMultipleRegistersRequest::from_generic(&pdu).unwrap();
        assert_eq!(request.register_start, 0x4008);
        assert_eq!(request.register_count(), 1);
        assert_eq!(request.registers, vec![0x00, 0x01]);
    }

    #[test]
    fn test_write_multiple_rejects_inconsistent_counts() {
        let pdu = GenericPdu::new(0x10, vec![0x40, 0x08, 0x00, 0x02, 0x02, 0x00, 0x01]);
        assert!(WriteMultipleRegistersRequest::from_generic(&pdu).is_err());
    }

    #[test]
    fn test_exception_translation() {
        let pdu = GenericPdu::new(0x83, vec![0x02]);
        match pdu.check_exception() {
            Err(ModbusError::ProtocolException {
                function_code,
                exception,
            }) => {
                assert_eq!(function_code, 0x03);
                assert_eq!(exception, ExceptionCode::IllegalDataAddress);
            },
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_vendor_exception_code_preserved() {
        let pdu = ErrorPdu::new(0x41, ExceptionCode::from(0x8A))
            .to_generic()
            .unwrap();
        assert_eq!(pdu.function_code, 0xC1);
        assert_eq!(pdu.data, vec![0x8A]);
    }
}

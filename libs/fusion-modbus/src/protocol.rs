//! Frame protocol
//!
//! Turns transport bytes into PDUs tagged with a correlation context. The only
//! implementation is Modbus TCP (MBAP header):
//!
//! ```text
//! [transaction_id:u16][protocol_id:u16][length:u16][unit_id:u8][function_code:u8][payload]
//! ```
//!
//! `length` counts the unit id plus the PDU.

use crate::error::{ModbusError, ModbusResult};
use crate::pdu::GenericPdu;
use crate::transport::Transport;
use bytes::{Buf, BufMut};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::trace;

/// MBAP header plus unit id
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest PDU a Modbus TCP frame may carry
pub const MAX_PDU_LEN: usize = 253;

/// A framing layer that pairs PDUs with a correlation context
pub trait FrameProtocol: Send + Sync {
    /// Key echoed back by the peer in a response
    type Context: Clone + Eq + Hash + Debug + Send + Sync;

    /// Fresh context for an outbound request
    fn new_context(&self) -> Self::Context;

    fn send(&self, context: &Self::Context, pdu: &GenericPdu) -> ModbusResult<()>;

    /// Block until a full frame has been received
    fn receive(&self) -> ModbusResult<(Self::Context, GenericPdu)>;

    /// Receive a frame if one has started arriving, `None` otherwise
    fn try_receive(&self) -> ModbusResult<Option<(Self::Context, GenericPdu)>>;
}

/// Modbus TCP MBAP header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier
    pub transaction_id: u16,
    /// Protocol identifier (0 for Modbus)
    pub protocol_id: u16,
    /// Unit identifier plus PDU length
    pub length: u16,
    /// Unit identifier
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
    }

    pub fn decode(mut bytes: &[u8]) -> ModbusResult<Self> {
        if bytes.len() < MBAP_HEADER_LEN {
            return Err(ModbusError::Io(format!(
                "MBAP header needs {} bytes, got {}",
                MBAP_HEADER_LEN,
                bytes.len()
            )));
        }
        let header = Self {
            transaction_id: bytes.get_u16(),
            protocol_id: bytes.get_u16(),
            length: bytes.get_u16(),
            unit_id: bytes.get_u8(),
        };
        // length covers unit id + function code at minimum
        if header.length < 2 || header.length as usize - 1 > MAX_PDU_LEN {
            return Err(ModbusError::Io(format!(
                "Invalid MBAP length {} in transaction {}",
                header.length, header.transaction_id
            )));
        }
        Ok(header)
    }

    /// Bytes following the header
    pub fn pdu_len(&self) -> usize {
        self.length as usize - 1
    }
}

/// Correlation context for Modbus TCP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpContext {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
}

/// Modbus TCP framing over a [`Transport`]
pub struct ModbusTcpProtocol {
    transport: Arc<dyn Transport>,
    unit_id: u8,
    protocol_id: u16,
    next_transaction_id: AtomicU16,
}

impl ModbusTcpProtocol {
    pub fn new(transport: Arc<dyn Transport>, unit_id: u8) -> Self {
        Self {
            transport,
            unit_id,
            protocol_id: 0,
            next_transaction_id: AtomicU16::new(0),
        }
    }

    fn read_frame(&self, header_bytes: &[u8]) -> ModbusResult<(TcpContext, GenericPdu)> {
        let header = MbapHeader::decode(header_bytes)?;
        let body = self.transport.read(header.pdu_len())?;
        let Some((&function_code, data)) = body.split_first() else {
            return Err(ModbusError::Io("empty PDU".to_string()));
        };
        let context = TcpContext {
            transaction_id: header.transaction_id,
            protocol_id: header.protocol_id,
            unit_id: header.unit_id,
        };
        trace!(
            "RX tid={} unit={} fc=0x{:02X} data={}",
            context.transaction_id,
            context.unit_id,
            function_code,
            hex::encode(data)
        );
        Ok((context, GenericPdu::new(function_code, data.to_vec())))
    }
}

impl FrameProtocol for ModbusTcpProtocol {
    type Context = TcpContext;

    fn new_context(&self) -> TcpContext {
        // Wraps naturally from 0xFFFF to 0x0000
        let transaction_id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        TcpContext {
            transaction_id,
            protocol_id: self.protocol_id,
            unit_id: self.unit_id,
        }
    }

    fn send(&self, context: &TcpContext, pdu: &GenericPdu) -> ModbusResult<()> {
        if pdu.wire_len() > MAX_PDU_LEN {
            return Err(ModbusError::encoding(format!(
                "PDU of {} bytes exceeds {}",
                pdu.wire_len(),
                MAX_PDU_LEN
            )));
        }
        let header = MbapHeader {
            transaction_id: context.transaction_id,
            protocol_id: context.protocol_id,
            length: (pdu.wire_len() + 1) as u16,
            unit_id: context.unit_id,
        };
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.wire_len());
        header.encode(&mut frame);
        frame.put_u8(pdu.function_code);
        frame.put_slice(&pdu.data);
        trace!(
            "TX tid={} unit={} fc=0x{:02X} data={}",
            context.transaction_id,
            context.unit_id,
            pdu.function_code,
            hex::encode(&pdu.data)
        );
        self.transport.write(&frame)
    }

    fn receive(&self) -> ModbusResult<(TcpContext, GenericPdu)> {
        let header = self.transport.read(MBAP_HEADER_LEN)?;
        self.read_frame(&header)
    }

    fn try_receive(&self) -> ModbusResult<Option<(TcpContext, GenericPdu)>> {
        match self.transport.try_read(MBAP_HEADER_LEN)? {
            Some(header) => self.read_frame(&header).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_send_frames_pdu_with_mbap_header() {
        let transport = Arc::new(MemoryTransport::new());
        let protocol = ModbusTcpProtocol::new(transport.clone(), 1);

        let first = protocol.new_context();
        let second = protocol.new_context();
        assert_eq!(first.transaction_id, 0);
        assert_eq!(second.transaction_id, 1);

        protocol
            .send(&second, &GenericPdu::new(0x03, vec![0x00, 0x10, 0x00, 0x02]))
            .unwrap();
        assert_eq!(
            transport.take_outgoing(),
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x10, 0x00, 0x02]
        );
    }

    #[test]
    fn test_try_receive_parses_frame() {
        let transport = Arc::new(MemoryTransport::new());
        let protocol = ModbusTcpProtocol::new(transport.clone(), 1);
        assert!(protocol.try_receive().unwrap().is_none());

        transport.push_incoming(&[0x12, 0x34, 0x00, 0x00, 0x00, 0x03, 0x07, 0x06, 0xAB]);
        let (context, pdu) = protocol.try_receive().unwrap().unwrap();
        assert_eq!(context.transaction_id, 0x1234);
        assert_eq!(context.unit_id, 7);
        assert_eq!(pdu, GenericPdu::new(0x06, vec![0xAB]));
    }

    #[test]
    fn test_rejects_zero_length_header() {
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01];
        assert!(MbapHeader::decode(&bytes).is_err());
    }
}

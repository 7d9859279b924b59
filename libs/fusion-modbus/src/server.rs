//! Server-side request dispatch
//!
//! The power unit is the Modbus client for register access: it reads and writes the
//! dispenser's registers. [`ModbusServer`] answers those requests from the PDUs the
//! correlation layer could not match to an outstanding request.

use crate::correlation::PduCorrelationLayer;
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{
    ErrorPdu, ExceptionCode, GenericPdu, Pdu, ReadHoldingRegistersRequest,
    ReadHoldingRegistersResponse, WriteMultipleRegistersRequest, WriteMultipleRegistersResponse,
    WriteSingleRegisterRequest, FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_REGISTER,
};
use crate::protocol::FrameProtocol;
use crate::registers::Registry;
use std::sync::Arc;
use tracing::{debug, warn};

type ReadHandler = Box<
    dyn Fn(&ReadHoldingRegistersRequest) -> ModbusResult<ReadHoldingRegistersResponse>
        + Send
        + Sync,
>;
type WriteMultipleHandler = Box<
    dyn Fn(&WriteMultipleRegistersRequest) -> ModbusResult<WriteMultipleRegistersResponse>
        + Send
        + Sync,
>;
type WriteSingleHandler = Box<
    dyn Fn(&WriteSingleRegisterRequest) -> ModbusResult<WriteSingleRegisterRequest> + Send + Sync,
>;

/// Function-code dispatch to handler callbacks
#[derive(Default)]
pub struct ModbusServer {
    read_holding_registers: Option<ReadHandler>,
    write_multiple_registers: Option<WriteMultipleHandler>,
    write_single_register: Option<WriteSingleHandler>,
}

impl ModbusServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server backed by a register registry
    pub fn with_registry(registry: Arc<Registry>) -> Self {
        let mut server = Self::new();

        let reg = registry.clone();
        server.set_read_holding_registers(move |req| {
            let registers = reg.on_read(req.register_start, req.register_count)?;
            Ok(ReadHoldingRegistersResponse { registers })
        });

        let reg = registry.clone();
        server.set_write_multiple_registers(move |req| {
            reg.on_write(req.register_start, &req.registers)?;
            Ok(WriteMultipleRegistersResponse {
                register_start: req.register_start,
                register_count: req.register_count(),
            })
        });

        server.set_write_single_register(move |req| {
            registry.on_write(req.register_address, &req.register_value.to_be_bytes())?;
            Ok(req.clone())
        });

        server
    }

    pub fn set_read_holding_registers<F>(&mut self, handler: F)
    where
        F: Fn(&ReadHoldingRegistersRequest) -> ModbusResult<ReadHoldingRegistersResponse>
            + Send
            + Sync
            + 'static,
    {
        self.read_holding_registers = Some(Box::new(handler));
    }

    pub fn set_write_multiple_registers<F>(&mut self, handler: F)
    where
        F: Fn(&WriteMultipleRegistersRequest) -> ModbusResult<WriteMultipleRegistersResponse>
            + Send
            + Sync
            + 'static,
    {
        self.write_multiple_registers = Some(Box::new(handler));
    }

    pub fn set_write_single_register<F>(&mut self, handler: F)
    where
        F: Fn(&WriteSingleRegisterRequest) -> ModbusResult<WriteSingleRegisterRequest>
            + Send
            + Sync
            + 'static,
    {
        self.write_single_register = Some(Box::new(handler));
    }

    /// Install this server as the correlation layer's unmatched-PDU handler
    pub fn attach<P: FrameProtocol>(self, layer: &PduCorrelationLayer<P>) {
        let server = Arc::new(self);
        layer.set_on_pdu(move |pdu| server.handle(pdu));
    }

    /// Answer one request; `None` for PDUs that need no reply
    pub fn handle(&self, pdu: &GenericPdu) -> Option<GenericPdu> {
        if pdu.is_exception() {
            warn!("Ignoring unmatched exception response {}", pdu);
            return None;
        }
        let result = match pdu.function_code {
            FC_READ_HOLDING_REGISTERS => match &self.read_holding_registers {
                Some(handler) => ReadHoldingRegistersRequest::from_generic(pdu)
                    .and_then(|req| handler(&req)?.to_generic()),
                None => Err(unsupported(pdu)),
            },
            FC_WRITE_MULTIPLE_REGISTERS => match &self.write_multiple_registers {
                Some(handler) => WriteMultipleRegistersRequest::from_generic(pdu)
                    .and_then(|req| handler(&req)?.to_generic()),
                None => Err(unsupported(pdu)),
            },
            FC_WRITE_SINGLE_REGISTER => match &self.write_single_register {
                Some(handler) => WriteSingleRegisterRequest::from_generic(pdu)
                    .and_then(|req| handler(&req)?.to_generic()),
                None => Err(unsupported(pdu)),
            },
            _ => Err(unsupported(pdu)),
        };

        match result {
            Ok(response) => Some(response),
            Err(e) => {
                let exception = exception_for(&e);
                debug!(
                    "Request fc=0x{:02X} failed: {}, answering {}",
                    pdu.function_code, e, exception
                );
                ErrorPdu::new(pdu.function_code, exception).to_generic().ok()
            },
        }
    }
}

fn unsupported(pdu: &GenericPdu) -> ModbusError {
    ModbusError::ProtocolException {
        function_code: pdu.function_code,
        exception: ExceptionCode::IllegalFunction,
    }
}

fn exception_for(error: &ModbusError) -> ExceptionCode {
    match error {
        ModbusError::ProtocolException { exception, .. } => *exception,
        ModbusError::InvalidLength(_) => ExceptionCode::IllegalDataAddress,
        ModbusError::InvalidValue(_) | ModbusError::Decoding { .. } | ModbusError::Encoding(_) => {
            ExceptionCode::IllegalDataValue
        },
        _ => ExceptionCode::ServerDeviceFailure,
    }
}

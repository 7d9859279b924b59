//! PDU correlation layer
//!
//! Pairs outbound requests with their responses. A waiter is keyed by
//! `(context, function_code & 0x7F)` so exception responses, which echo the
//! request's function code with the high bit set, land on the same waiter.
//!
//! Frames that match no waiter are handed to a single installed callback. If
//! the callback returns a PDU it is sent back with the incoming context, which is
//! how the server side answers the peer's requests.

use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{GenericPdu, Pdu};
use crate::protocol::FrameProtocol;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Callback for PDUs that match no in-flight request
pub type PduCallback = Arc<dyn Fn(&GenericPdu) -> Option<GenericPdu> + Send + Sync>;

#[derive(Debug)]
enum WaiterSlot {
    Pending,
    Response(GenericPdu),
    Cancelled,
}

#[derive(Debug)]
struct Waiter {
    slot: Mutex<WaiterSlot>,
    ready: Condvar,
}

impl Waiter {
    fn new() -> Self {
        Self {
            slot: Mutex::new(WaiterSlot::Pending),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, outcome: WaiterSlot) {
        *self.slot.lock() = outcome;
        self.ready.notify_all();
    }

    fn take(&self) -> WaiterSlot {
        std::mem::replace(&mut *self.slot.lock(), WaiterSlot::Pending)
    }
}

/// Request/response correlation on top of a [`FrameProtocol`]
pub struct PduCorrelationLayer<P: FrameProtocol> {
    protocol: P,
    waiters: Mutex<HashMap<(P::Context, u8), Arc<Waiter>>>,
    on_pdu: RwLock<Option<PduCallback>>,
    running: AtomicBool,
}

impl<P: FrameProtocol> PduCorrelationLayer<P> {
    pub fn new(protocol: P) -> Self {
        Self {
            protocol,
            waiters: Mutex::new(HashMap::new()),
            on_pdu: RwLock::new(None),
            running: AtomicBool::new(true),
        }
    }

    /// Install the callback for unmatched PDUs, replacing any previous one
    pub fn set_on_pdu<F>(&self, callback: F)
    where
        F: Fn(&GenericPdu) -> Option<GenericPdu> + Send + Sync + 'static,
    {
        *self.on_pdu.write() = Some(Arc::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Send `request` and block until the matching response or `timeout`
    ///
    /// Exception responses are returned as [`ModbusError::ProtocolException`].
    pub fn request_response(
        &self,
        request: &GenericPdu,
        timeout: Duration,
    ) -> ModbusResult<GenericPdu> {
        let context = self.protocol.new_context();
        let function_code = request.masked_function_code();
        let key = (context.clone(), function_code);
        let waiter = Arc::new(Waiter::new());
        {
            // shutdown() clears the flag before draining, so a waiter inserted
            // while the flag is still set is always cancelled
            let mut waiters = self.waiters.lock();
            if !self.is_running() {
                return Err(ModbusError::Shutdown);
            }
            if waiters.contains_key(&key) {
                return Err(ModbusError::DuplicateRequest {
                    context: format!("{:?}", context),
                    function_code,
                });
            }
            waiters.insert(key.clone(), waiter.clone());
        }

        if let Err(e) = self.protocol.send(&context, request) {
            self.waiters.lock().remove(&key);
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        {
            let mut slot = waiter.slot.lock();
            while matches!(*slot, WaiterSlot::Pending) {
                if waiter.ready.wait_until(&mut slot, deadline).timed_out() {
                    break;
                }
            }
        }

        // A response racing the deadline is still delivered to the slot
        self.waiters.lock().remove(&key);
        match waiter.take() {
            WaiterSlot::Response(response) => {
                trace!("Response for {:?}: {}", context, response);
                response.check_exception()
            },
            WaiterSlot::Cancelled => Err(ModbusError::Shutdown),
            WaiterSlot::Pending => {
                debug!(
                    "No response for {:?} fc=0x{:02X} within {:?}",
                    context, function_code, timeout
                );
                Err(ModbusError::Timeout { function_code })
            },
        }
    }

    /// Typed variant of [`request_response`](Self::request_response)
    pub fn request<Req: Pdu, Resp: Pdu>(
        &self,
        request: &Req,
        timeout: Duration,
    ) -> ModbusResult<Resp> {
        let response = self.request_response(&request.to_generic()?, timeout)?;
        Resp::from_generic(&response)
    }

    /// Send without waiting for anything back
    pub fn request_without_response(&self, request: &GenericPdu) -> ModbusResult<()> {
        if !self.is_running() {
            return Err(ModbusError::Shutdown);
        }
        let context = self.protocol.new_context();
        self.protocol.send(&context, request)
    }

    /// Handle one frame if one is available
    ///
    /// Returns `true` when a frame was processed.
    pub fn poll(&self) -> ModbusResult<bool> {
        match self.protocol.try_receive()? {
            Some((context, pdu)) => {
                self.dispatch(context, pdu)?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Block until one frame has been received and handled
    pub fn blocking_poll(&self) -> ModbusResult<()> {
        let (context, pdu) = self.protocol.receive()?;
        self.dispatch(context, pdu)
    }

    /// Fail every in-flight request and refuse new ones
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let waiters: Vec<_> = self.waiters.lock().drain().map(|(_, w)| w).collect();
        if !waiters.is_empty() {
            debug!("Cancelling {} in-flight requests", waiters.len());
        }
        for waiter in waiters {
            waiter.complete(WaiterSlot::Cancelled);
        }
    }

    fn dispatch(&self, context: P::Context, pdu: GenericPdu) -> ModbusResult<()> {
        let key = (context.clone(), pdu.masked_function_code());
        let waiter = self.waiters.lock().remove(&key);
        if let Some(waiter) = waiter {
            waiter.complete(WaiterSlot::Response(pdu));
            return Ok(());
        }

        let callback = self.on_pdu.read().clone();
        let Some(callback) = callback else {
            warn!("Dropping unmatched PDU {} ({:?}), no handler installed", pdu, context);
            return Ok(());
        };
        if let Some(response) = callback(&pdu) {
            self.protocol.send(&context, &response)?;
        }
        Ok(())
    }
}

impl<P: FrameProtocol> Drop for PduCorrelationLayer<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Ethernet framing and the link-layer boundary
//!
//! GOOSE frames ride directly on Ethernet with an 802.1Q tag. The raw socket itself
//! belongs to the host: it implements [`LinkLayer`] and hands it to the dispenser.
//! [`MemoryLink`] is the in-process double used by tests and simulations.

use crate::error::{GooseError, GooseResult};
use bytes::{BufMut, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// TPID announcing an 802.1Q tag
pub const ETHERTYPE_VLAN: u16 = 0x8100;

const HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;

/// How long [`MemoryLink::receive`] waits before reporting "nothing yet"
const MEMORY_RECEIVE_WAIT: Duration = Duration::from_millis(10);

/// 48-bit hardware address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Placeholder destination used before the peer's address is known
    pub const ZERO: MacAddress = MacAddress([0; 6]);
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// 802.1Q tag control information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VlanTag {
    /// Priority code point, 3 bits
    pub priority: u8,
    /// VLAN identifier, 12 bits
    pub vlan_id: u16,
}

impl VlanTag {
    pub fn new(priority: u8, vlan_id: u16) -> Self {
        Self {
            priority: priority & 0x07,
            vlan_id: vlan_id & 0x0FFF,
        }
    }

    pub fn tci(&self) -> u16 {
        (u16::from(self.priority & 0x07) << 13) | (self.vlan_id & 0x0FFF)
    }

    pub fn from_tci(tci: u16) -> Self {
        Self {
            priority: ((tci & 0xE000) >> 13) as u8,
            vlan_id: tci & 0x0FFF,
        }
    }
}

/// Decoded Ethernet II frame, optionally VLAN tagged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub destination: MacAddress,
    pub source: MacAddress,
    pub vlan: Option<VlanTag>,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + VLAN_TAG_LEN + self.payload.len());
        buf.put_slice(self.destination.as_bytes());
        buf.put_slice(self.source.as_bytes());
        if let Some(vlan) = self.vlan {
            buf.put_u16(ETHERTYPE_VLAN);
            buf.put_u16(vlan.tci());
        }
        buf.put_u16(self.ethertype);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> GooseResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(GooseError::decoding(format!(
                "Ethernet frame too short: {} bytes",
                data.len()
            )));
        }
        let mut destination = [0u8; 6];
        let mut source = [0u8; 6];
        destination.copy_from_slice(&data[0..6]);
        source.copy_from_slice(&data[6..12]);

        let mut offset = 12;
        let mut ethertype = u16::from_be_bytes([data[offset], data[offset + 1]]);
        offset += 2;

        let mut vlan = None;
        if ethertype == ETHERTYPE_VLAN {
            if data.len() < HEADER_LEN + VLAN_TAG_LEN {
                return Err(GooseError::decoding("Truncated 802.1Q tag"));
            }
            vlan = Some(VlanTag::from_tci(u16::from_be_bytes([data[offset], data[offset + 1]])));
            ethertype = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
            offset += 4;
        }

        Ok(Self {
            destination: destination.into(),
            source: source.into(),
            vlan,
            ethertype,
            payload: data[offset..].to_vec(),
        })
    }
}

/// Raw Ethernet access consumed by the GOOSE messenger and receive loop
pub trait LinkLayer: Send + Sync {
    /// Transmit one complete frame
    fn send(&self, frame: &[u8]) -> GooseResult<()>;

    /// Next received frame; `None` when nothing arrived within the
    /// implementation's polling interval
    fn receive(&self) -> GooseResult<Option<Vec<u8>>>;

    /// Local interface address, used as the source of outgoing frames
    fn mac_address(&self) -> MacAddress;
}

#[derive(Default)]
struct MemoryLinkState {
    sent: Vec<Vec<u8>>,
    incoming: VecDeque<Vec<u8>>,
    closed: bool,
}

#[derive(Default)]
struct MemoryLinkInner {
    state: Mutex<MemoryLinkState>,
    changed: Condvar,
}

/// In-memory link: captures sent frames and queues frames to receive
#[derive(Clone)]
pub struct MemoryLink {
    mac: MacAddress,
    inner: Arc<MemoryLinkInner>,
}

impl MemoryLink {
    pub fn new(mac: MacAddress) -> Self {
        Self {
            mac,
            inner: Arc::new(MemoryLinkInner::default()),
        }
    }

    /// Queue a frame for the next `receive`
    pub fn push_incoming(&self, frame: Vec<u8>) {
        self.inner.state.lock().incoming.push_back(frame);
        self.inner.changed.notify_all();
    }

    /// Copy of every frame sent so far
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.inner.state.lock().sent.clone()
    }

    /// Drain the sent frames
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.inner.state.lock().sent)
    }

    /// Wait until at least `count` frames were sent; false on timeout
    pub fn wait_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.sent.len() < count {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return state.sent.len() >= count;
            }
        }
        true
    }

    /// Fail every further send and receive
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.changed.notify_all();
    }
}

impl LinkLayer for MemoryLink {
    fn send(&self, frame: &[u8]) -> GooseResult<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(GooseError::Link("memory link closed".to_string()));
        }
        state.sent.push(frame.to_vec());
        drop(state);
        self.inner.changed.notify_all();
        Ok(())
    }

    fn receive(&self) -> GooseResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + MEMORY_RECEIVE_WAIT;
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err(GooseError::Link("memory link closed".to_string()));
            }
            if let Some(frame) = state.incoming.pop_front() {
                return Ok(Some(frame));
            }
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.incoming.pop_front());
            }
        }
    }

    fn mac_address(&self) -> MacAddress {
        self.mac
    }
}

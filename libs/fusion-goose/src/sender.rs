//! GOOSE publishing with retransmission, and the per-connector messenger
//!
//! [`GooseSender`] owns one thread that serializes and transmits publications. Each
//! publication stream (connector number, appid) keeps the last frame and repeats it
//! with a doubling interval until a new frame replaces it: a new frame increments
//! `stNum` and resets `sqNum`, every repetition increments `sqNum`.
//!
//! [`ConnectorMessenger`] is the connector-facing side. It holds the destination MAC
//! and the HMAC key and never publishes an unsigned frame when secure mode is on.

use crate::error::{GooseError, GooseResult};
use crate::ethernet::{LinkLayer, MacAddress, VlanTag};
use crate::frame::{GooseFrame, GoosePdu, GooseTimestamp};
use crate::messages::{
    GooseMessage, PowerRequirement, PowerRequirementRequest, StopChargeReason, StopChargeRequest,
    DEFAULT_SERIAL,
};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Repetition schedule for a publication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retransmission {
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for Retransmission {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(20),
            max_interval: Duration::from_millis(1000),
        }
    }
}

/// Publisher-wide settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenderConfig {
    pub vlan: VlanTag,
    /// `None` publishes each frame once
    pub retransmission: Option<Retransmission>,
}

/// Publication stream identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey {
    pub connector_no: u16,
    pub appid: u16,
}

struct Publication {
    destination: MacAddress,
    appid: u16,
    pdu: GoosePdu,
    key: Option<Vec<u8>>,
    due: Instant,
    interval: Duration,
    /// No further repetitions once sent
    once: bool,
}

#[derive(Default)]
struct SenderState {
    streams: BTreeMap<StreamKey, Publication>,
    /// Last stNum per stream, kept across cancellation so numbering never restarts
    st_nums: BTreeMap<StreamKey, u32>,
    running: bool,
}

struct Outgoing {
    stream: StreamKey,
    frame: GooseFrame,
    key: Option<Vec<u8>>,
}

struct SenderShared {
    link: Arc<dyn LinkLayer>,
    config: SenderConfig,
    state: Mutex<SenderState>,
    wake: Condvar,
}

/// Single-threaded GOOSE publisher shared by all connectors of a dispenser
pub struct GooseSender {
    shared: Arc<SenderShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GooseSender {
    pub fn new(link: Arc<dyn LinkLayer>, config: SenderConfig) -> Self {
        Self {
            shared: Arc::new(SenderShared {
                link,
                config,
                state: Mutex::new(SenderState::default()),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the sender thread; calling it twice is a no-op
    pub fn start(&self) -> GooseResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.shared.state.lock().running = true;
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("goose-sender".to_string())
            .spawn(move || shared.run())
            .map_err(|e| GooseError::Link(format!("Failed to spawn sender thread: {e}")))?;
        *worker = Some(handle);
        info!("GOOSE sender started");
        Ok(())
    }

    /// Stop the thread and drop every pending publication
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            state.streams.clear();
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("GOOSE sender thread panicked");
            }
            info!("GOOSE sender stopped");
        }
    }

    pub fn local_mac(&self) -> MacAddress {
        self.shared.link.mac_address()
    }

    /// Replace the stream's publication with a new state (new stNum, sqNum 0)
    pub fn publish(
        &self,
        connector_no: u16,
        destination: MacAddress,
        appid: u16,
        pdu: GoosePdu,
        key: Option<Vec<u8>>,
    ) {
        let stream = StreamKey {
            connector_no,
            appid,
        };
        let (interval, once) = match self.shared.config.retransmission {
            Some(r) => (r.initial_interval, false),
            None => (Duration::ZERO, true),
        };
        {
            let mut state = self.shared.state.lock();
            state.streams.insert(
                stream,
                Publication {
                    destination,
                    appid,
                    pdu,
                    key,
                    due: Instant::now(),
                    interval,
                    once,
                },
            );
        }
        trace!("Queued publication for connector {} appid 0x{:04X}", connector_no, appid);
        self.shared.wake.notify_all();
    }

    /// Stop repeating a stream
    pub fn cancel(&self, connector_no: u16, appid: u16) {
        let stream = StreamKey {
            connector_no,
            appid,
        };
        if self.shared.state.lock().streams.remove(&stream).is_some() {
            debug!("Cancelled publication for connector {} appid 0x{:04X}", connector_no, appid);
        }
    }
}

impl Drop for GooseSender {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SenderShared {
    fn run(&self) {
        loop {
            let batch = {
                let mut state = self.state.lock();
                loop {
                    if !state.running {
                        return;
                    }
                    let now = Instant::now();
                    let batch = self.collect_due(&mut state, now);
                    if !batch.is_empty() {
                        break batch;
                    }
                    match state.streams.values().map(|p| p.due).min() {
                        Some(next) => {
                            self.wake.wait_until(&mut state, next);
                        },
                        None => self.wake.wait(&mut state),
                    }
                }
            };

            for outgoing in batch {
                self.transmit(outgoing);
            }
        }
    }

    fn collect_due(&self, state: &mut SenderState, now: Instant) -> Vec<Outgoing> {
        let mut batch = Vec::new();
        let mut finished = Vec::new();
        let SenderState {
            streams, st_nums, ..
        } = state;

        for (stream, publication) in streams.iter_mut() {
            if publication.due > now {
                continue;
            }
            if publication.pdu.st_num == 0 {
                // First transmission of this state
                let st_num = st_nums.entry(*stream).or_insert(0);
                *st_num = st_num.wrapping_add(1).max(1);
                publication.pdu.st_num = *st_num;
                publication.pdu.sq_num = 0;
            } else {
                publication.pdu.sq_num = publication.pdu.sq_num.wrapping_add(1);
            }

            if let Some(r) = self.config.retransmission {
                publication.pdu.time_allowed_to_live = (r.max_interval.as_millis() * 2) as u32;
            }

            batch.push(Outgoing {
                stream: *stream,
                frame: GooseFrame {
                    destination: publication.destination,
                    source: self.link.mac_address(),
                    vlan: self.config.vlan,
                    appid: publication.appid,
                    pdu: publication.pdu.clone(),
                },
                key: publication.key.clone(),
            });

            if publication.once {
                finished.push(*stream);
            } else if let Some(r) = self.config.retransmission {
                publication.due = now + publication.interval;
                publication.interval = (publication.interval * 2).min(r.max_interval);
            }
        }

        for stream in finished {
            streams.remove(&stream);
        }
        batch
    }

    fn transmit(&self, outgoing: Outgoing) {
        let Outgoing { stream, frame, key } = outgoing;
        let bytes = match frame.to_bytes(key.as_deref()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    "Failed to serialize frame for connector {} appid 0x{:04X}: {}",
                    stream.connector_no, stream.appid, e
                );
                return;
            },
        };
        trace!(
            "Sending {} (st={} sq={}) to {}: {}",
            frame.pdu.go_id,
            frame.pdu.st_num,
            frame.pdu.sq_num,
            frame.destination,
            hex::encode(&bytes)
        );
        if let Err(e) = self.link.send(&bytes) {
            warn!("Link send failed for connector {}: {}", stream.connector_no, e);
        }
    }
}

#[derive(Debug, Default)]
struct MessengerState {
    destination: Option<MacAddress>,
    key: Option<Vec<u8>>,
}

/// Power requirements and stop requests for one connector
pub struct ConnectorMessenger {
    sender: Arc<GooseSender>,
    connector_no: u16,
    secure: bool,
    state: Mutex<MessengerState>,
}

impl ConnectorMessenger {
    pub fn new(sender: Arc<GooseSender>, connector_no: u16, secure: bool) -> Self {
        Self {
            sender,
            connector_no,
            secure,
            state: Mutex::new(MessengerState::default()),
        }
    }

    pub fn connector_no(&self) -> u16 {
        self.connector_no
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Destination learned from the power unit
    pub fn on_new_mac_address(&self, mac: MacAddress) {
        debug!("Connector {}: GOOSE destination is now {}", self.connector_no, mac);
        self.state.lock().destination = Some(mac);
    }

    pub fn destination(&self) -> Option<MacAddress> {
        self.state.lock().destination
    }

    /// Signing key distributed by the power unit
    pub fn set_hmac_key(&self, key: &[u8]) {
        self.state.lock().key = Some(key.to_vec());
    }

    pub fn clear_hmac_key(&self) {
        self.state.lock().key = None;
    }

    pub fn has_hmac_key(&self) -> bool {
        self.state.lock().key.is_some()
    }

    /// Power requirement; also ends retransmission of the stop request stream
    pub fn send_power_requirement(&self, requirement: PowerRequirement) -> bool {
        let request = PowerRequirementRequest {
            charging_connector_no: self.connector_no,
            charging_sn: DEFAULT_SERIAL,
            requirement,
        };
        debug!(
            "Connector {}: power requirement {:?} {:?} {:.1} V {:.1} A",
            self.connector_no,
            requirement.requirement_type,
            requirement.mode,
            requirement.voltage,
            requirement.current
        );
        let sent = self.publish(&request);
        if sent {
            self.sender.cancel(self.connector_no, StopChargeRequest::APPID);
        }
        sent
    }

    pub fn send_stop_request(&self) -> bool {
        self.send_stop_request_with_reason(StopChargeReason::Normal)
    }

    /// Stop request; also ends retransmission of the power requirement stream
    pub fn send_stop_request_with_reason(&self, reason: StopChargeReason) -> bool {
        let request = StopChargeRequest {
            charging_connector_no: self.connector_no,
            charging_sn: DEFAULT_SERIAL,
            reason,
        };
        debug!("Connector {}: stop request ({:?})", self.connector_no, reason);
        let sent = self.publish(&request);
        if sent {
            self.sender
                .cancel(self.connector_no, PowerRequirementRequest::APPID);
        }
        sent
    }

    /// Returns false when the frame was suppressed for lack of a key
    fn publish<M: GooseMessage>(&self, message: &M) -> bool {
        let (destination, key) = {
            let state = self.state.lock();
            (state.destination, state.key.clone())
        };
        let key = match (self.secure, key) {
            (true, None) => {
                debug!(
                    "Connector {}: no HMAC key yet, suppressing {}",
                    self.connector_no,
                    M::GO_ID
                );
                return false;
            },
            (true, Some(key)) => Some(key),
            (false, _) => None,
        };
        let destination = destination.unwrap_or_else(|| {
            warn!(
                "Connector {}: power unit MAC unknown, sending {} to {}",
                self.connector_no,
                M::GO_ID,
                MacAddress::ZERO
            );
            MacAddress::ZERO
        });

        let mut pdu = message.to_pdu();
        pdu.timestamp = GooseTimestamp::now();
        self.sender
            .publish(self.connector_no, destination, M::APPID, pdu, key);
        true
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;
    use crate::ethernet::{EthernetFrame, MemoryLink};
    use crate::messages::{RequirementType, POWER_REQUEST_APPID, STOP_CHARGE_APPID};
    use tracing_test::traced_test;

    const KEY: [u8; 48] = [0x5A; 48];

    fn setup(retransmission: Option<Retransmission>) -> (MemoryLink, Arc<GooseSender>) {
        let link = MemoryLink::new(MacAddress([2, 0, 0, 0, 0, 1]));
        let sender = Arc::new(GooseSender::new(
            Arc::new(link.clone()),
            SenderConfig {
                vlan: VlanTag::new(5, 0),
                retransmission,
            },
        ));
        sender.start().unwrap();
        (link, sender)
    }

    fn decode(bytes: &[u8], key: Option<&[u8]>) -> GooseFrame {
        let eth = EthernetFrame::from_bytes(bytes).unwrap();
        match key {
            Some(_) => GooseFrame::from_secure_ethernet(&eth, key).unwrap(),
            None => GooseFrame::from_ethernet(&eth).unwrap(),
        }
    }

    #[test]
    #[traced_test]
    fn test_secure_messenger_without_key_sends_nothing() {
        let (link, sender) = setup(Some(Retransmission::default()));
        let messenger = ConnectorMessenger::new(sender.clone(), 1, true);
        messenger.on_new_mac_address(MacAddress([0xAA; 6]));

        assert!(!messenger.send_power_requirement(PowerRequirement::placeholder()));
        assert!(!messenger.send_stop_request());
        assert!(!link.wait_sent(1, Duration::from_millis(100)));
        assert!(logs_contain("no HMAC key yet"));
        sender.stop();
    }

    #[test]
    fn test_signed_power_requirement() {
        let (link, sender) = setup(None);
        let messenger = ConnectorMessenger::new(sender.clone(), 3, true);
        messenger.on_new_mac_address(MacAddress([0xAA; 6]));
        messenger.set_hmac_key(&KEY);

        let requirement =
            PowerRequirement::new(RequirementType::InsulationDetectionVoltageOutput, 400.0, 2.0);
        assert!(messenger.send_power_requirement(requirement));
        assert!(link.wait_sent(1, Duration::from_secs(2)));

        let frame = decode(&link.take_sent()[0], Some(&KEY));
        assert_eq!(frame.destination, MacAddress([0xAA; 6]));
        assert_eq!(frame.source, MacAddress([2, 0, 0, 0, 0, 1]));
        assert_eq!(frame.appid, POWER_REQUEST_APPID);
        assert_eq!(frame.vlan, VlanTag::new(5, 0));
        assert_eq!(frame.pdu.st_num, 1);
        assert_eq!(frame.pdu.sq_num, 0);
        let request = PowerRequirementRequest::from_pdu(&frame.pdu).unwrap();
        assert_eq!(request.charging_connector_no, 3);
        assert_eq!(request.charging_sn, 0xFFFF);
        assert_eq!(request.requirement, requirement);
        sender.stop();
    }

    #[test]
    #[traced_test]
    fn test_unknown_destination_uses_zero_address() {
        let (link, sender) = setup(None);
        let messenger = ConnectorMessenger::new(sender.clone(), 1, false);
        assert!(messenger.send_stop_request());
        assert!(link.wait_sent(1, Duration::from_secs(2)));
        let frame = decode(&link.take_sent()[0], None);
        assert_eq!(frame.destination, MacAddress::ZERO);
        assert_eq!(frame.appid, STOP_CHARGE_APPID);
        assert!(logs_contain("MAC unknown"));
        sender.stop();
    }

    #[test]
    fn test_retransmission_counts() {
        let (link, sender) = setup(Some(Retransmission {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
        }));
        let messenger = ConnectorMessenger::new(sender.clone(), 1, false);
        messenger.on_new_mac_address(MacAddress([0xAA; 6]));

        messenger.send_power_requirement(PowerRequirement::placeholder());
        assert!(link.wait_sent(4, Duration::from_secs(2)));
        messenger.send_power_requirement(PowerRequirement::new(
            RequirementType::Charging,
            1.0,
            1.0,
        ));
        assert!(link.wait_sent(8, Duration::from_secs(2)));
        sender.stop();

        let frames: Vec<_> = link.take_sent().iter().map(|b| decode(b, None)).collect();
        let first: Vec<_> = frames.iter().filter(|f| f.pdu.st_num == 1).collect();
        let second: Vec<_> = frames.iter().filter(|f| f.pdu.st_num == 2).collect();
        assert!(first.len() >= 2);
        assert!(!second.is_empty());
        for (i, frame) in first.iter().enumerate() {
            assert_eq!(frame.pdu.sq_num, i as u32);
        }
        assert_eq!(second[0].pdu.sq_num, 0);
        assert_eq!(
            PowerRequirementRequest::from_pdu(&second[0].pdu)
                .unwrap()
                .requirement
                .requirement_type,
            RequirementType::Charging
        );
        assert_eq!(frames[0].pdu.time_allowed_to_live, 40);
    }

    #[test]
    fn test_stop_request_ends_power_requirement_stream() {
        let (link, sender) = setup(Some(Retransmission {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(10),
        }));
        let messenger = ConnectorMessenger::new(sender.clone(), 1, false);
        messenger.on_new_mac_address(MacAddress([0xAA; 6]));

        messenger.send_power_requirement(PowerRequirement::placeholder());
        assert!(link.wait_sent(2, Duration::from_secs(2)));
        messenger.send_stop_request();
        std::thread::sleep(Duration::from_millis(30));
        link.take_sent();
        assert!(link.wait_sent(2, Duration::from_secs(2)));
        sender.stop();

        for bytes in link.take_sent() {
            assert_eq!(decode(&bytes, None).appid, STOP_CHARGE_APPID);
        }
    }

    #[test]
    fn test_power_requirement_ends_stop_stream() {
        let (link, sender) = setup(Some(Retransmission {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(10),
        }));
        let messenger = ConnectorMessenger::new(sender.clone(), 1, false);
        messenger.on_new_mac_address(MacAddress([0xAA; 6]));

        messenger.send_stop_request();
        assert!(link.wait_sent(2, Duration::from_secs(2)));
        messenger.send_power_requirement(PowerRequirement::placeholder());
        std::thread::sleep(Duration::from_millis(30));
        link.take_sent();
        assert!(link.wait_sent(4, Duration::from_secs(2)));
        sender.stop();

        for bytes in link.take_sent() {
            assert_eq!(decode(&bytes, None).appid, POWER_REQUEST_APPID);
        }
    }

    #[test]
    fn test_stop_cancel_only_touches_own_connector() {
        let (link, sender) = setup(Some(Retransmission {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(10),
        }));
        let first = ConnectorMessenger::new(sender.clone(), 1, false);
        let second = ConnectorMessenger::new(sender.clone(), 2, false);
        first.on_new_mac_address(MacAddress([0xAA; 6]));
        second.on_new_mac_address(MacAddress([0xAA; 6]));

        first.send_stop_request();
        second.send_power_requirement(PowerRequirement::placeholder());
        std::thread::sleep(Duration::from_millis(30));
        link.take_sent();
        assert!(link.wait_sent(4, Duration::from_secs(2)));
        sender.stop();

        let appids: Vec<_> = link.take_sent().iter().map(|b| decode(b, None).appid).collect();
        assert!(appids.contains(&STOP_CHARGE_APPID));
        assert!(appids.contains(&POWER_REQUEST_APPID));
    }
}

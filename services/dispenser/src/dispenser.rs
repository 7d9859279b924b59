//! Dispenser: register map, connectors and the power unit session
//!
//! One dispenser owns the register registry served to the power unit, one
//! [`Connector`] per configured charging connector and the GOOSE sender they
//! share. A session runs three threads:
//!
//! - Modbus poll loop: answers the power unit's register requests and fails the
//!   session when nothing arrives within `modbus_timeout_ms`
//! - unsolicited reporter: pushes dirty registers every report interval
//! - GOOSE receiver: feeds power requirement replies to the connectors
//!
//! All loops run while the communication state is `Initializing` or `Ready`. A
//! failure in any of them moves the state to `Failed` and ends the session; the
//! connectors keep their state so the host can reconnect.

use crate::config::DispenserConfig;
use crate::connector::Connector;
use crate::error::{DispenserError, Result};
use crate::registers::{
    AlarmStatus, ConnectorCallbacks, DispenserAlarm, DispenserRegisters, DispenserRegistersConfig,
    ErrorCallback, ErrorEvent, ErrorRegisters, ErrorSubcategory, PsuRegisters, PsuRunningMode,
};
use fusion_goose::{
    decode_incoming, ConnectorMessenger, GooseMessage, GooseSender, LinkLayer, MacAddress,
    PowerRequirementResponse, RequirementResult,
};
use fusion_modbus::registers::Registry;
use fusion_modbus::{
    send_unsolicited_report, ModbusServer, ModbusTcpProtocol, PduCorrelationLayer, TcpTransport,
    Transport,
};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

type Layer = PduCorrelationLayer<ModbusTcpProtocol>;

/// Modbus unit identifier used on the power unit link
const UNIT_ID: u8 = 0;

/// Delay before the first unsolicited report of a session
const FIRST_REPORT_DELAY: Duration = Duration::from_secs(1);

/// Idle sleep of the poll loop when no frame is pending
const POLL_IDLE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PsuCommunicationState {
    Uninitialized,
    /// Connected, waiting for the power unit to announce its MAC address
    Initializing,
    Ready,
    Failed,
}

impl PsuCommunicationState {
    fn is_ok(&self) -> bool {
        matches!(
            self,
            PsuCommunicationState::Initializing | PsuCommunicationState::Ready
        )
    }
}

/// Session state shared with the worker threads and register callbacks
struct SessionShared {
    state: Mutex<PsuCommunicationState>,
    wake: Condvar,
    raised_errors: Mutex<BTreeMap<ErrorSubcategory, ErrorEvent>>,
}

impl SessionShared {
    fn state(&self) -> PsuCommunicationState {
        *self.state.lock()
    }

    fn is_ok(&self) -> bool {
        self.state().is_ok()
    }

    fn set_state(&self, new_state: PsuCommunicationState) {
        let mut state = self.state.lock();
        if *state != new_state {
            info!("PSU communication {:?} -> {:?}", *state, new_state);
            *state = new_state;
        }
        self.wake.notify_all();
    }

    /// Mark the session failed unless the host is stopping it
    fn fail(&self) {
        let mut state = self.state.lock();
        if *state != PsuCommunicationState::Uninitialized {
            info!("PSU communication {:?} -> Failed", *state);
            *state = PsuCommunicationState::Failed;
        }
        self.wake.notify_all();
    }

    /// Sleep for `duration` unless the session ends first; returns whether it is still ok
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        while state.is_ok() {
            if self.wake.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.is_ok()
    }

    fn on_error_event(&self, event: ErrorEvent) {
        let mut raised = self.raised_errors.lock();
        if event.is_error() {
            if raised.insert(event.subcategory, event).is_none() {
                warn!("Power unit error raised: {}", event);
            }
        } else if raised.remove(&event.subcategory).is_some() {
            info!("Power unit error cleared: {}", event);
        }
    }
}

/// How incoming GOOSE frames are accepted
#[derive(Debug, Clone, Copy)]
struct ReceivePolicy {
    local_mac: MacAddress,
    allow_unsecured: bool,
    verify_hmac: bool,
}

struct Session {
    layer: Arc<Layer>,
    threads: Vec<JoinHandle<()>>,
}

pub struct Dispenser {
    config: DispenserConfig,
    registry: Arc<Registry>,
    dispenser_registers: DispenserRegisters,
    psu_registers: PsuRegisters,
    error_registers: ErrorRegisters,
    connectors: Vec<Arc<Connector>>,
    sender: Arc<GooseSender>,
    link: Arc<dyn LinkLayer>,
    shared: Arc<SessionShared>,
    session: Mutex<Option<Session>>,
}

impl Dispenser {
    /// Build the register map and connectors
    ///
    /// `connector_callbacks` pairs with `config.connectors` by position; missing
    /// entries get callbacks returning defaults.
    pub fn new(
        config: DispenserConfig,
        connector_callbacks: Vec<ConnectorCallbacks>,
        link: Arc<dyn LinkLayer>,
    ) -> Result<Self> {
        config.validate()?;
        if connector_callbacks.len() > config.connectors.len() {
            warn!(
                "{} connector callbacks given for {} connectors, ignoring the rest",
                connector_callbacks.len(),
                config.connectors.len()
            );
        }

        let sender = Arc::new(GooseSender::new(link.clone(), config.sender_config()));
        let dispenser_mac = link.mac_address();
        info!(
            "Dispenser with {} connectors, MAC {}",
            config.connectors.len(),
            dispenser_mac
        );

        let mut callbacks = connector_callbacks.into_iter();
        let mut connectors = Vec::with_capacity(config.connectors.len());
        for (index, connector_config) in config.connectors.iter().enumerate() {
            let messenger = ConnectorMessenger::new(
                sender.clone(),
                connector_config.global_connector_number,
                config.send_secure_goose,
            );
            let connector = Connector::new(
                connector_config.clone(),
                index as u16 + 1,
                callbacks.next().unwrap_or_default(),
                messenger,
                dispenser_mac,
                config.allocation_timeout(),
            )?;
            connectors.push(connector);
        }

        let dispenser_registers = DispenserRegisters::new(&DispenserRegistersConfig {
            manufacturer: config.manufacturer,
            model: config.model,
            protocol_version: config.protocol_version,
            hardware_version: config.hardware_version,
            software_version: config.software_version.clone(),
            esn: config.esn.clone(),
            connector_count: connectors.len() as u16,
        });
        let psu_registers = PsuRegisters::new();
        let error_registers = ErrorRegisters::new();

        let shared = Arc::new(SessionShared {
            state: Mutex::new(PsuCommunicationState::Uninitialized),
            wake: Condvar::new(),
            raised_errors: Mutex::new(BTreeMap::new()),
        });

        let registry = Arc::new(Registry::new());
        registry.add(error_registers.subregistry()?)?;
        for subregistry in dispenser_registers.subregistries()? {
            registry.add(subregistry)?;
        }
        registry.add(psu_registers.common_subregistry()?)?;
        registry.add(psu_registers.settings_subregistry()?)?;
        for connector in &connectors {
            for subregistry in connector.registers().subregistries()? {
                registry.add(subregistry)?;
            }
        }
        registry.verify_overlap()?;
        debug!("Registry holds {} registers", registry.register_count());

        let dispenser = Self {
            config,
            registry,
            dispenser_registers,
            psu_registers,
            error_registers,
            connectors,
            sender,
            link,
            shared,
            session: Mutex::new(None),
        };
        dispenser.watch_registers();
        Ok(dispenser)
    }

    fn watch_registers(&self) {
        let psu = &self.psu_registers;
        psu.manufacturer
            .add_write_callback(|value: &u16| debug!("PSU manufacturer changed to {}", value));
        psu.protocol_version
            .add_write_callback(|value: &u16| debug!("PSU protocol version changed to {}", value));
        psu.hardware_version
            .add_write_callback(|value: &u16| debug!("PSU hardware version changed to {}", value));
        psu.software_version
            .add_write_callback(|value| debug!("PSU software version changed to {}", value));
        psu.esn_control_board
            .add_write_callback(|value| debug!("PSU control board ESN changed to {}", value));

        let last_mode = Mutex::new(None::<PsuRunningMode>);
        psu.psu_running_mode
            .add_write_callback(move |mode: &PsuRunningMode| {
                let mut last = last_mode.lock();
                if *last != Some(*mode) {
                    *last = Some(*mode);
                    info!("PSU running mode changed to {:?}", mode);
                }
            });

        let connectors = self.connectors.clone();
        let shared = self.shared.clone();
        psu.psu_mac.add_write_callback(move |value: &[u8; 6]| {
            let mac = MacAddress(*value);
            debug!("PSU MAC changed to {}", mac);
            for connector in &connectors {
                connector.on_psu_mac_change(mac);
            }
            if shared.is_ok() {
                shared.set_state(PsuCommunicationState::Ready);
            }
        });

        let shared = self.shared.clone();
        self.error_registers
            .add_callback(Arc::new(move |event| shared.on_error_event(event)));
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Connect to the configured power unit over TCP and start the session
    pub fn connect(&self) -> Result<()> {
        self.shared.set_state(PsuCommunicationState::Initializing);
        let address = self.config.psu_address();
        info!("Connecting to power unit at {}", address);
        let transport = match TcpTransport::connect_with_retry(
            &address,
            self.config.connect_retries,
            self.config.connect_backoff(),
        ) {
            Ok(transport) => transport,
            Err(e) => {
                error!("Could not connect to power unit: {}", e);
                self.shared.fail();
                return Err(e.into());
            },
        };
        self.start(Arc::new(transport))
    }

    /// Start a session on an already connected byte stream
    ///
    /// A running session is stopped first. Every connector forgets the previous
    /// session's HMAC key and power unit settings.
    pub fn start(&self, transport: Arc<dyn Transport>) -> Result<()> {
        if self.session.lock().is_some() {
            debug!("Restarting power unit session");
            self.stop();
        }
        self.shared.set_state(PsuCommunicationState::Initializing);
        for connector in &self.connectors {
            connector.start();
        }

        if let Err(e) = self.sender.start() {
            self.shared.fail();
            return Err(e.into());
        }

        let layer = Arc::new(PduCorrelationLayer::new(ModbusTcpProtocol::new(
            transport, UNIT_ID,
        )));
        ModbusServer::with_registry(self.registry.clone()).attach(&layer);

        let mut threads = Vec::with_capacity(3);
        let spawned = self
            .spawn_poll_loop(layer.clone())
            .and_then(|handle| {
                threads.push(handle);
                self.spawn_unsolicited_reporter(layer.clone())
            })
            .and_then(|handle| {
                threads.push(handle);
                self.spawn_goose_receiver()
            });
        match spawned {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                error!("Failed to spawn session thread: {}", e);
                self.shared.fail();
                layer.shutdown();
                join_all(threads);
                return Err(DispenserError::NotRunning);
            },
        }

        *self.session.lock() = Some(Session { layer, threads });
        info!("Power unit session started");
        Ok(())
    }

    /// End the session and join its threads
    pub fn stop(&self) {
        self.shared.set_state(PsuCommunicationState::Uninitialized);
        if let Some(session) = self.session.lock().take() {
            session.layer.shutdown();
            join_all(session.threads);
            info!("Power unit session stopped");
        }
        self.sender.stop();
        for connector in &self.connectors {
            connector.stop();
        }
    }

    fn spawn_poll_loop(&self, layer: Arc<Layer>) -> std::io::Result<JoinHandle<()>> {
        let shared = self.shared.clone();
        let timeout = self.config.modbus_timeout();
        std::thread::Builder::new()
            .name("modbus-poll".to_string())
            .spawn(move || run_poll_loop(&shared, &layer, timeout))
    }

    fn spawn_unsolicited_reporter(&self, layer: Arc<Layer>) -> std::io::Result<JoinHandle<()>> {
        let shared = self.shared.clone();
        let registry = self.registry.clone();
        let location = self.config.unsolicited_report_location;
        let interval = self.config.unsolicited_report_interval();
        let timeout = self.config.unsolicited_report_timeout();
        std::thread::Builder::new()
            .name("unsolicited-report".to_string())
            .spawn(move || {
                if !shared.sleep(FIRST_REPORT_DELAY) {
                    return;
                }
                loop {
                    if let Some(report) = registry.unsolicited_report(location, true) {
                        if let Err(e) = send_unsolicited_report(&layer, &report, timeout) {
                            if shared.is_ok() {
                                error!("Unsolicited report failed: {}", e);
                                shared.fail();
                            }
                            break;
                        }
                    }
                    if !shared.sleep(interval) {
                        break;
                    }
                }
                debug!("Unsolicited reporter exiting");
            })
    }

    fn spawn_goose_receiver(&self) -> std::io::Result<JoinHandle<()>> {
        let shared = self.shared.clone();
        let link = self.link.clone();
        let connectors = self.connectors.clone();
        let policy = ReceivePolicy {
            local_mac: link.mac_address(),
            allow_unsecured: self.config.allow_unsecured_goose,
            verify_hmac: self.config.verify_secure_goose_hmac,
        };
        std::thread::Builder::new()
            .name("goose-receive".to_string())
            .spawn(move || {
                while shared.is_ok() {
                    match link.receive() {
                        Ok(Some(bytes)) => handle_goose_frame(&bytes, &policy, &connectors),
                        Ok(None) => {},
                        Err(e) => {
                            if shared.is_ok() {
                                error!("GOOSE receive failed: {}", e);
                                shared.fail();
                            }
                            break;
                        },
                    }
                }
                debug!("GOOSE receiver exiting");
            })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_psu_communication_state(&self) -> PsuCommunicationState {
        self.shared.state()
    }

    pub fn get_psu_running_mode(&self) -> PsuRunningMode {
        self.psu_registers.psu_running_mode.get_value()
    }

    /// Currently raised power unit errors, ordered by category and subcategory
    pub fn get_raised_errors(&self) -> Vec<ErrorEvent> {
        self.shared.raised_errors.lock().values().copied().collect()
    }

    /// Forward every power unit error event to `callback`
    pub fn add_error_callback(&self, callback: ErrorCallback) {
        self.error_registers.add_callback(callback);
    }

    pub fn get_connector(&self, global_connector_number: u16) -> Result<&Arc<Connector>> {
        self.connectors
            .iter()
            .find(|c| c.global_connector_number() == global_connector_number)
            .ok_or(DispenserError::InvalidConnector(global_connector_number))
    }

    pub fn connectors(&self) -> &[Arc<Connector>] {
        &self.connectors
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn psu_registers(&self) -> &PsuRegisters {
        &self.psu_registers
    }

    pub fn set_dispenser_alarm(&self, alarm: DispenserAlarm, status: AlarmStatus) {
        self.dispenser_registers.alarm(alarm).update_value(status);
    }

    pub fn config(&self) -> &DispenserConfig {
        &self.config
    }
}

impl Drop for Dispenser {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_all(threads: Vec<JoinHandle<()>>) {
    for handle in threads {
        let name = handle.thread().name().unwrap_or("session").to_string();
        if handle.join().is_err() {
            error!("{} thread panicked", name);
        }
    }
}

fn run_poll_loop(shared: &SessionShared, layer: &Layer, timeout: Duration) {
    let mut deadline = Instant::now() + timeout;
    while shared.is_ok() {
        match layer.poll() {
            Ok(true) => deadline = Instant::now() + timeout,
            Ok(false) => {
                if Instant::now() > deadline {
                    error!("No Modbus data received for {} ms", timeout.as_millis());
                    shared.fail();
                    break;
                }
                std::thread::sleep(POLL_IDLE);
            },
            Err(e) => {
                if shared.is_ok() {
                    error!("Modbus poll failed: {}", e);
                    shared.fail();
                }
                break;
            },
        }
    }
    layer.shutdown();
    debug!("Modbus poll loop exiting");
}

/// Route one received frame to the connector it addresses
fn handle_goose_frame(bytes: &[u8], policy: &ReceivePolicy, connectors: &[Arc<Connector>]) {
    let received = match decode_incoming(bytes, policy.local_mac, policy.allow_unsecured) {
        Ok(Some(received)) => received,
        Ok(None) => return,
        Err(e) => {
            warn!("Received frame could not be decoded: {}", e);
            return;
        },
    };
    let pdu = &received.frame.pdu;
    if pdu.go_id != PowerRequirementResponse::GO_ID {
        debug!("Ignoring GOOSE frame with goID '{}'", pdu.go_id);
        return;
    }
    let response = match PowerRequirementResponse::from_pdu(pdu) {
        Ok(response) => response,
        Err(e) => {
            warn!("Malformed power requirement reply: {}", e);
            return;
        },
    };

    let Some(connector) = connectors
        .iter()
        .find(|c| c.global_connector_number() == response.charging_connector_no)
    else {
        debug!(
            "Power requirement reply for unknown connector {}",
            response.charging_connector_no
        );
        return;
    };

    if policy.verify_hmac {
        if let Err(e) = received.verify(&connector.get_hmac_key()) {
            error!(
                "Connector #{}: HMAC verification of power requirement reply failed: {}",
                connector.local_connector_number(),
                e
            );
            return;
        }
        trace!("HMAC verified for power requirement reply");
    }

    connector.on_module_placeholder_allocation_response(
        response.result == RequirementResult::Success,
    );
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;
    use crate::config::ConnectorConfig;
    use crate::connector::ConnectionState;
    use crate::registers::{AlarmStatus, ChargingPowerUnitAlarm, ConnectorType, ErrorPayload};
    use fusion_goose::{GooseFrame, MemoryLink, PowerRequirement, RequirementType, VlanTag};
    use fusion_modbus::registers::DataProvider;
    use tracing_test::traced_test;

    const DISPENSER_MAC: MacAddress = MacAddress([0x02, 0xD1, 0, 0, 0, 0x01]);
    const PSU_MAC: MacAddress = MacAddress([0x02, 0xB0, 0, 0, 0, 0x01]);
    const KEY: [u8; 48] = [0x42; 48];

    fn config(verify_hmac: bool) -> DispenserConfig {
        DispenserConfig {
            send_secure_goose: false,
            allow_unsecured_goose: true,
            verify_secure_goose_hmac: verify_hmac,
            goose_retransmission: None,
            connectors: vec![
                ConnectorConfig {
                    global_connector_number: 3,
                    connector_type: ConnectorType::Ccs2,
                    max_rated_charge_current: 200.0,
                    max_rated_output_power: 120_000.0,
                },
                ConnectorConfig {
                    global_connector_number: 4,
                    connector_type: ConnectorType::Ccs1,
                    max_rated_charge_current: 100.0,
                    max_rated_output_power: 60_000.0,
                },
            ],
            ..DispenserConfig::default()
        }
    }

    fn reply(connector_no: u16, result: RequirementResult) -> GooseFrame {
        let response = PowerRequirementResponse {
            charging_connector_no: connector_no,
            charging_sn: 0xFFFF,
            requirement: PowerRequirement::placeholder(),
            result,
        };
        GooseFrame {
            destination: DISPENSER_MAC,
            source: PSU_MAC,
            vlan: VlanTag::new(5, 0),
            appid: PowerRequirementResponse::APPID,
            pdu: response.to_pdu(),
        }
    }

    fn waiting_for_allocation(dispenser: &Dispenser, connector_no: u16) -> Arc<Connector> {
        let connector = dispenser.get_connector(connector_no).unwrap().clone();
        connector.on_car_connected();
        connector.registers().hmac_key.on_write(KEY);
        assert_eq!(connector.get_state().0, ConnectionState::ConnectedNoAllocation);
        connector
    }

    fn policy(dispenser: &Dispenser) -> ReceivePolicy {
        ReceivePolicy {
            local_mac: DISPENSER_MAC,
            allow_unsecured: dispenser.config().allow_unsecured_goose,
            verify_hmac: dispenser.config().verify_secure_goose_hmac,
        }
    }

    #[test]
    fn test_registry_layout_for_two_connectors() {
        let link = Arc::new(MemoryLink::new(DISPENSER_MAC));
        let dispenser = Dispenser::new(config(false), vec![], link).unwrap();

        assert_eq!(dispenser.connectors().len(), 2);
        assert_eq!(dispenser.get_connector(4).unwrap().local_connector_number(), 2);
        assert!(matches!(
            dispenser.get_connector(1),
            Err(DispenserError::InvalidConnector(1))
        ));
        assert_eq!(
            dispenser.get_psu_communication_state(),
            PsuCommunicationState::Uninitialized
        );
        // Connector count in the collected dispenser information
        assert_eq!(dispenser.registry().on_read(0x1015, 1).unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_reply_routed_by_global_number() {
        let link = Arc::new(MemoryLink::new(DISPENSER_MAC));
        let dispenser = Dispenser::new(config(false), vec![], link).unwrap();
        let connector = waiting_for_allocation(&dispenser, 4);

        let frame = reply(3, RequirementResult::Success).to_bytes(None).unwrap();
        handle_goose_frame(&frame, &policy(&dispenser), dispenser.connectors());
        assert_eq!(connector.get_state().0, ConnectionState::ConnectedNoAllocation);

        let frame = reply(4, RequirementResult::Success).to_bytes(None).unwrap();
        handle_goose_frame(&frame, &policy(&dispenser), dispenser.connectors());
        assert_eq!(connector.get_state().0, ConnectionState::Running);
        assert!(!connector.module_placeholder_allocation_failed());
    }

    #[test]
    fn test_failed_reply_sets_flag() {
        let link = Arc::new(MemoryLink::new(DISPENSER_MAC));
        let dispenser = Dispenser::new(config(false), vec![], link).unwrap();
        let connector = waiting_for_allocation(&dispenser, 3);

        let frame = reply(3, RequirementResult::Failed).to_bytes(None).unwrap();
        handle_goose_frame(&frame, &policy(&dispenser), dispenser.connectors());
        assert_eq!(connector.get_state().0, ConnectionState::ConnectedNoAllocation);
        assert!(connector.module_placeholder_allocation_failed());
    }

    #[test]
    #[traced_test]
    fn test_hmac_verification() {
        let link = Arc::new(MemoryLink::new(DISPENSER_MAC));
        let dispenser = Dispenser::new(config(true), vec![], link).unwrap();
        let connector = waiting_for_allocation(&dispenser, 3);

        let forged = reply(3, RequirementResult::Success)
            .to_bytes(Some(&[0x13; 48]))
            .unwrap();
        handle_goose_frame(&forged, &policy(&dispenser), dispenser.connectors());
        assert_eq!(connector.get_state().0, ConnectionState::ConnectedNoAllocation);
        assert!(logs_contain("HMAC verification of power requirement reply failed"));

        let plain = reply(3, RequirementResult::Success).to_bytes(None).unwrap();
        handle_goose_frame(&plain, &policy(&dispenser), dispenser.connectors());
        assert_eq!(connector.get_state().0, ConnectionState::ConnectedNoAllocation);

        let signed = reply(3, RequirementResult::Success)
            .to_bytes(Some(&KEY))
            .unwrap();
        handle_goose_frame(&signed, &policy(&dispenser), dispenser.connectors());
        assert_eq!(connector.get_state().0, ConnectionState::Running);
    }

    #[test]
    fn test_own_and_foreign_frames_ignored() {
        let link = Arc::new(MemoryLink::new(DISPENSER_MAC));
        let dispenser = Dispenser::new(config(false), vec![], link).unwrap();
        let connector = waiting_for_allocation(&dispenser, 3);

        let mut own = reply(3, RequirementResult::Success);
        own.source = DISPENSER_MAC;
        handle_goose_frame(
            &own.to_bytes(None).unwrap(),
            &policy(&dispenser),
            dispenser.connectors(),
        );
        handle_goose_frame(&[0u8; 10], &policy(&dispenser), dispenser.connectors());
        assert_eq!(connector.get_state().0, ConnectionState::ConnectedNoAllocation);
    }

    #[test]
    fn test_raised_errors_follow_alarm_writes() {
        let link = Arc::new(MemoryLink::new(DISPENSER_MAC));
        let dispenser = Dispenser::new(config(false), vec![], link).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        dispenser.add_error_callback(Arc::new(move |event| sink.lock().push(event)));

        dispenser.registry().on_write(0x4008, &[0x00, 0x01]).unwrap();
        let raised = dispenser.get_raised_errors();
        assert_eq!(raised.len(), 1);
        assert_eq!(
            raised[0].subcategory,
            ErrorSubcategory::ChargingPowerUnit(ChargingPowerUnitAlarm::STATUS_ALARMS[3])
        );
        assert_eq!(raised[0].payload, ErrorPayload::Alarm(AlarmStatus::Alarm));

        dispenser.registry().on_write(0x4008, &[0x00, 0x00]).unwrap();
        assert!(dispenser.get_raised_errors().is_empty());
        assert_eq!(events.lock().len(), 2);
    }

    #[test]
    fn test_dispenser_alarm_reported() {
        let link = Arc::new(MemoryLink::new(DISPENSER_MAC));
        let dispenser = Dispenser::new(config(false), vec![], link).unwrap();
        dispenser.registry().take_report_segments();

        dispenser.set_dispenser_alarm(DispenserAlarm::EmergencyStop, AlarmStatus::Alarm);
        let segments = dispenser.registry().take_report_segments();
        assert!(segments
            .iter()
            .any(|s| s.registers_start == 0x3003 && s.registers == vec![0x00, 0x01]));
    }
}

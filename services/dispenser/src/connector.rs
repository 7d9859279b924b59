//! Connector state machine
//!
//! A connector's session is the pair `(ConnectionState, ModePhase)`:
//!
//! ```text
//! CarDisconnected --car connected--> NoKeyYet --HMAC key--> ConnectedNoAllocation
//!        ^                              ^                        |  allocation ok
//!        |                              |                        |  or timeout
//!   car disconnected             export phase                    v
//!   (from any state)   Completed <-----------mode Off------- Running
//! ```
//!
//! Every transition updates the working status, connection status and charging
//! event registers and publishes the GOOSE frame the new state calls for. The
//! decision is made under the connector's state lock; register updates and frame
//! publication run after it is released, serialized by a second lock so effects
//! are applied in decision order.

use crate::config::ConnectorConfig;
use crate::error::{DispenserError, Result};
use crate::registers::{
    AlarmStatus, ChargingEvent, ConnectionStatus, ConnectorAlarm, ConnectorCallbacks,
    ConnectorRegisters, ConnectorRegistersConfig, PsuPortAvailability, WorkingStatus,
};
use crate::timer::OneShotTimer;
use fusion_goose::{ConnectorMessenger, MacAddress, PowerRequirement, RequirementType};
use fusion_modbus::registers::HoldingProvider;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    CarDisconnected,
    NoKeyYet,
    ConnectedNoAllocation,
    Running,
    Completed,
}

/// Charge sequencing stage supplied by the charging controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ModePhase {
    #[default]
    Off,
    ExportCableCheck,
    OffCableCheck,
    ExportPrecharge,
    ExportCharging,
}

impl ModePhase {
    pub fn is_export(&self) -> bool {
        matches!(
            self,
            ModePhase::ExportCableCheck | ModePhase::ExportPrecharge | ModePhase::ExportCharging
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEvent {
    CarConnected,
    CarDisconnected,
    HmacKeyReceived,
    AllocationResponse { success: bool },
    AllocationTimeout,
    ModePhaseChange(ModePhase),
}

/// Result of feeding one event to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous_state: ConnectionState,
    pub previous_phase: ModePhase,
    pub state: ConnectionState,
    pub phase: ModePhase,
}

impl Transition {
    pub fn state_changed(&self) -> bool {
        self.previous_state != self.state
    }

    pub fn changed(&self) -> bool {
        self.state_changed() || self.previous_phase != self.phase
    }
}

/// The pure transition function, without timers or I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorFsm {
    state: ConnectionState,
    mode_phase: ModePhase,
    allocation_failed: bool,
}

impl Default for ConnectorFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorFsm {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::CarDisconnected,
            mode_phase: ModePhase::Off,
            allocation_failed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mode_phase(&self) -> ModePhase {
        self.mode_phase
    }

    /// Set when the last placeholder allocation was refused or timed out
    pub fn allocation_failed(&self) -> bool {
        self.allocation_failed
    }

    pub fn working_status(&self) -> WorkingStatus {
        working_status(self.state, self.mode_phase)
    }

    pub fn clear_allocation_failed(&mut self) {
        self.allocation_failed = false;
    }

    pub fn handle(&mut self, event: FsmEvent) -> Transition {
        let previous_state = self.state;
        let previous_phase = self.mode_phase;

        match (self.state, event) {
            (_, FsmEvent::CarDisconnected) => {
                self.state = ConnectionState::CarDisconnected;
                self.mode_phase = ModePhase::Off;
            },
            (ConnectionState::CarDisconnected, FsmEvent::CarConnected) => {
                self.state = ConnectionState::NoKeyYet;
                self.allocation_failed = false;
            },
            (ConnectionState::NoKeyYet, FsmEvent::HmacKeyReceived) => {
                self.state = ConnectionState::ConnectedNoAllocation;
            },
            (ConnectionState::ConnectedNoAllocation, FsmEvent::AllocationResponse { success }) => {
                if success {
                    self.state = ConnectionState::Running;
                    self.allocation_failed = false;
                } else {
                    self.allocation_failed = true;
                }
            },
            // Charging may continue without a confirmed placeholder
            (ConnectionState::ConnectedNoAllocation, FsmEvent::AllocationTimeout) => {
                self.state = ConnectionState::Running;
                self.allocation_failed = true;
            },
            (_, FsmEvent::ModePhaseChange(phase)) => self.change_mode_phase(phase),
            _ => {},
        }

        Transition {
            previous_state,
            previous_phase,
            state: self.state,
            phase: self.mode_phase,
        }
    }

    fn change_mode_phase(&mut self, phase: ModePhase) {
        let previous = self.mode_phase;
        self.mode_phase = phase;
        match self.state {
            ConnectionState::Running if phase == ModePhase::Off && previous != ModePhase::Off => {
                self.state = ConnectionState::Completed;
            },
            // A new session after completion needs a fresh key
            ConnectionState::Completed if phase.is_export() => {
                self.state = ConnectionState::NoKeyYet;
            },
            _ => {},
        }
    }
}

pub fn working_status(state: ConnectionState, phase: ModePhase) -> WorkingStatus {
    match state {
        ConnectionState::CarDisconnected => WorkingStatus::Standby,
        ConnectionState::NoKeyYet => WorkingStatus::StandbyWithConnectorInserted,
        ConnectionState::ConnectedNoAllocation => WorkingStatus::ChargingStarting,
        ConnectionState::Running if phase == ModePhase::ExportCharging => WorkingStatus::Charging,
        ConnectionState::Running => WorkingStatus::ChargingStarting,
        ConnectionState::Completed => WorkingStatus::ChargingComplete,
    }
}

/// Requested export voltage (V) and current (A)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Setpoint {
    pub voltage: f32,
    pub current: f32,
}

/// GOOSE publication a connector state calls for
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frame {
    Requirement(PowerRequirement),
    Stop,
}

pub fn needed_frame(state: ConnectionState, phase: ModePhase, setpoint: Setpoint) -> Frame {
    let Setpoint { voltage, current } = setpoint;
    match state {
        ConnectionState::CarDisconnected
        | ConnectionState::NoKeyYet
        | ConnectionState::Completed => Frame::Stop,
        ConnectionState::ConnectedNoAllocation => {
            Frame::Requirement(PowerRequirement::placeholder())
        },
        ConnectionState::Running => Frame::Requirement(match phase {
            ModePhase::Off => PowerRequirement::placeholder(),
            ModePhase::ExportCableCheck => PowerRequirement::new(
                RequirementType::InsulationDetectionVoltageOutput,
                voltage,
                current,
            ),
            ModePhase::OffCableCheck => PowerRequirement::new(
                RequirementType::InsulationDetectionVoltageOutputStoppage,
                0.0,
                0.0,
            ),
            ModePhase::ExportPrecharge => {
                PowerRequirement::new(RequirementType::PrechargeVoltageOutput, voltage, current)
            },
            ModePhase::ExportCharging => {
                PowerRequirement::new(RequirementType::Charging, voltage, current)
            },
        }),
    }
}

/// Side effects decided under the state lock
#[derive(Debug, Default, PartialEq)]
struct Effects {
    charging_event: Option<ChargingEvent>,
    connection_status: Option<ConnectionStatus>,
    working_status: Option<WorkingStatus>,
    frame: Option<Frame>,
}

impl Effects {
    fn for_transition(t: &Transition, setpoint: Setpoint) -> Self {
        if !t.changed() {
            return Self::default();
        }
        let mut effects = Self::default();
        if t.state_changed() {
            if t.state == ConnectionState::Running {
                effects.charging_event = Some(ChargingEvent::StopToStart);
            } else if t.previous_state == ConnectionState::Running {
                effects.charging_event = Some(ChargingEvent::StartToStop);
            }
            effects.connection_status = Some(if t.state == ConnectionState::CarDisconnected {
                ConnectionStatus::NotConnected
            } else {
                ConnectionStatus::FullConnected
            });
        }
        effects.working_status = Some(working_status(t.state, t.phase));
        effects.frame = Some(needed_frame(t.state, t.phase, setpoint));
        effects
    }

    fn frame(frame: Frame) -> Self {
        Self {
            frame: Some(frame),
            ..Self::default()
        }
    }
}

/// What the power unit can deliver on this connector
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Capabilities {
    pub max_export_voltage: f32,
    pub min_export_voltage: f32,
    pub max_export_current: f32,
    pub min_export_current: f32,
    /// Watts
    pub max_export_power: f32,
}

struct ConnectorInner {
    fsm: ConnectorFsm,
    setpoint: Setpoint,
    allocation_timer: Option<OneShotTimer>,
    /// Identifies the current timer so a late expiry cannot hit a newer session
    allocation_generation: u64,
}

pub struct Connector {
    config: ConnectorConfig,
    local_connector_number: u16,
    allocation_timeout: Duration,
    log_prefix: String,
    registers: ConnectorRegisters,
    messenger: ConnectorMessenger,
    inner: Mutex<ConnectorInner>,
    /// Signalled after every decision
    state_changed: Condvar,
    effects_lock: Mutex<()>,
    weak: Weak<Connector>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("global_connector_number", &self.config.global_connector_number)
            .field("local_connector_number", &self.local_connector_number)
            .field("state", &self.get_state())
            .finish()
    }
}

impl Connector {
    pub fn new(
        config: ConnectorConfig,
        local_connector_number: u16,
        callbacks: ConnectorCallbacks,
        messenger: ConnectorMessenger,
        dispenser_mac: MacAddress,
        allocation_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let registers_config = ConnectorRegistersConfig {
            mac_address: *dispenser_mac.as_bytes(),
            connector_type: config.connector_type,
            local_connector_number,
            max_rated_charge_current: config.max_rated_charge_current,
            rated_output_power_connector: config.max_rated_output_power / 1000.0,
        };
        let registers = ConnectorRegisters::new(&registers_config, callbacks)
            .ok_or(DispenserError::InvalidConnector(local_connector_number))?;
        let log_prefix = format!("Connector #{}: ", local_connector_number);

        let connector = Arc::new_cyclic(|weak: &Weak<Connector>| {
            Self::watch_registers(&registers, weak.clone(), &log_prefix);
            Connector {
                config,
                local_connector_number,
                allocation_timeout,
                log_prefix,
                registers,
                messenger,
                inner: Mutex::new(ConnectorInner {
                    fsm: ConnectorFsm::new(),
                    setpoint: Setpoint::default(),
                    allocation_timer: None,
                    allocation_generation: 0,
                }),
                state_changed: Condvar::new(),
                effects_lock: Mutex::new(()),
                weak: weak.clone(),
            }
        });
        Ok(connector)
    }

    fn watch_registers(registers: &ConnectorRegisters, weak: Weak<Connector>, prefix: &str) {
        registers.hmac_key.add_write_callback(move |key| {
            if let Some(connector) = weak.upgrade() {
                connector.on_hmac_key(key);
            }
        });

        {
            let prefix = prefix.to_string();
            registers
                .psu_port_available
                .add_write_callback(move |value: &PsuPortAvailability| {
                    debug!("{}PSU port availability changed to {:?}", prefix, value);
                });
        }
        log_changes(
            &registers.rated_output_power_psu,
            format!("{}PSU rated output power", prefix),
            "kW",
        );
        log_changes(
            &registers.max_rated_psu_voltage,
            format!("{}PSU max rated voltage", prefix),
            "V",
        );
        log_changes(
            &registers.max_rated_psu_current,
            format!("{}PSU max rated current", prefix),
            "A",
        );
    }

    pub fn global_connector_number(&self) -> u16 {
        self.config.global_connector_number
    }

    pub fn local_connector_number(&self) -> u16 {
        self.local_connector_number
    }

    pub fn registers(&self) -> &ConnectorRegisters {
        &self.registers
    }

    pub fn messenger(&self) -> &ConnectorMessenger {
        &self.messenger
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn on_car_connected(&self) {
        self.apply(|inner| self.transition(inner, FsmEvent::CarConnected));
    }

    pub fn on_car_disconnected(&self) {
        self.apply(|inner| self.transition(inner, FsmEvent::CarDisconnected));
    }

    pub fn on_mode_phase_change(&self, phase: ModePhase) {
        self.apply(|inner| self.transition(inner, FsmEvent::ModePhaseChange(phase)));
    }

    pub fn on_module_placeholder_allocation_response(&self, success: bool) {
        if success {
            info!("{}Module placeholder allocation succeeded", self.log_prefix);
        } else {
            info!("{}Module placeholder allocation failed", self.log_prefix);
        }
        self.apply(|inner| self.transition(inner, FsmEvent::AllocationResponse { success }));
    }

    /// New setpoint; re-sent at once while exporting
    pub fn new_export_voltage_current(&self, voltage: f32, current: f32) {
        self.apply(|inner| {
            inner.setpoint = Setpoint { voltage, current };
            let state = inner.fsm.state();
            let phase = inner.fsm.mode_phase();
            if state == ConnectionState::Running && phase.is_export() {
                Effects::frame(needed_frame(state, phase, inner.setpoint))
            } else {
                Effects::default()
            }
        });
    }

    /// The power unit announced its link-layer address
    pub fn on_psu_mac_change(&self, mac: MacAddress) {
        self.messenger.on_new_mac_address(mac);
        self.apply(|inner| {
            Effects::frame(needed_frame(
                inner.fsm.state(),
                inner.fsm.mode_phase(),
                inner.setpoint,
            ))
        });
    }

    fn on_hmac_key(&self, key: &[u8; 48]) {
        debug!("{}HMAC key changed to {}", self.log_prefix, hex::encode_upper(key));
        self.messenger.set_hmac_key(key);
        self.apply(|inner| self.transition(inner, FsmEvent::HmacKeyReceived));
    }

    fn on_allocation_timeout(&self, generation: u64) {
        self.apply(|inner| {
            if inner.allocation_generation != generation {
                trace!("{}Stale allocation timeout ignored", self.log_prefix);
                return Effects::default();
            }
            info!("{}Module placeholder allocation timed out", self.log_prefix);
            self.transition(inner, FsmEvent::AllocationTimeout)
        });
    }

    /// Prepare for a new power unit session
    ///
    /// The power unit hands out a fresh HMAC key per session, so the previous key
    /// is dropped from the register and the messenger. In secure mode nothing is
    /// sent until the new key arrives. Connection state and mode phase are kept.
    pub fn start(&self) {
        self.registers.hmac_key.update_value([0; 48]);
        self.messenger.clear_hmac_key();
        self.inner.lock().fsm.clear_allocation_failed();
        self.reset_psu_capabilities();
        debug!("{}Session data reset", self.log_prefix);
    }

    /// Plug a virtual car in and out to obtain a key and stop a stale charge
    ///
    /// Waits up to `timeout` for the power unit to hand out an HMAC key, then
    /// disconnects, which sends a stop request once the key is known. The mode
    /// phase from before the cycle is restored unless the host changed it
    /// meanwhile. Returns whether a key was received.
    pub fn car_connect_disconnect_cycle(&self, timeout: Duration) -> bool {
        let phase_before = self.get_state().1;
        self.on_mode_phase_change(ModePhase::Off);

        let deadline = Instant::now() + timeout;
        self.on_car_connected();
        let keyed = {
            let mut inner = self.inner.lock();
            while !has_key_state(inner.fsm.state()) {
                if self.state_changed.wait_until(&mut inner, deadline).timed_out() {
                    break;
                }
            }
            has_key_state(inner.fsm.state())
        };
        if !keyed {
            error!("{}Timeout while waiting for the HMAC key", self.log_prefix);
        }
        self.on_car_disconnected();

        if self.get_state().1 == ModePhase::Off {
            self.on_mode_phase_change(phase_before);
        }
        keyed
    }

    /// Stop the allocation timer; the session state is kept
    pub fn stop(&self) {
        if let Some(timer) = self.inner.lock().allocation_timer.take() {
            timer.cancel();
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_state(&self) -> (ConnectionState, ModePhase) {
        let inner = self.inner.lock();
        (inner.fsm.state(), inner.fsm.mode_phase())
    }

    pub fn get_working_status(&self) -> WorkingStatus {
        self.inner.lock().fsm.working_status()
    }

    pub fn module_placeholder_allocation_failed(&self) -> bool {
        self.inner.lock().fsm.allocation_failed()
    }

    pub fn get_capabilities(&self) -> Capabilities {
        Capabilities {
            max_export_voltage: self.registers.max_rated_psu_voltage.get_value(),
            min_export_voltage: self.registers.min_rated_psu_voltage.get_value(),
            max_export_current: self.registers.max_rated_psu_current.get_value(),
            min_export_current: self.registers.min_rated_psu_current.get_value(),
            max_export_power: self.registers.rated_output_power_psu.get_value() * 1000.0,
        }
    }

    /// Forget what the power unit reported, e.g. after the session was lost
    pub fn reset_psu_capabilities(&self) {
        self.registers.max_rated_psu_voltage.update_value(0.0);
        self.registers.min_rated_psu_voltage.update_value(0.0);
        self.registers.max_rated_psu_current.update_value(0.0);
        self.registers.min_rated_psu_current.update_value(0.0);
        self.registers.rated_output_power_psu.update_value(0.0);
    }

    /// kWh delivered by this connector over its lifetime
    pub fn set_total_historical_energy_charged(&self, energy: f64) {
        self.registers.total_energy_charged.update_value(energy);
    }

    pub fn get_psu_port_available(&self) -> PsuPortAvailability {
        self.registers.psu_port_available.get_value()
    }

    pub fn get_hmac_key(&self) -> [u8; 48] {
        self.registers.hmac_key.get_value()
    }

    pub fn set_alarm(&self, alarm: ConnectorAlarm, status: AlarmStatus) {
        self.registers.alarm(alarm).update_value(status);
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Decide under the state lock, then apply effects in decision order
    fn apply<F>(&self, decide: F)
    where
        F: FnOnce(&mut ConnectorInner) -> Effects,
    {
        let (effects, _ordered) = {
            let mut inner = self.inner.lock();
            let effects = decide(&mut inner);
            (effects, self.effects_lock.lock())
        };
        self.state_changed.notify_all();
        self.execute(effects);
    }

    fn transition(&self, inner: &mut ConnectorInner, event: FsmEvent) -> Effects {
        let t = inner.fsm.handle(event);
        if !t.changed() {
            trace!(
                "{}{:?} ignored in {:?}/{:?}",
                self.log_prefix,
                event,
                t.state,
                t.phase
            );
            return Effects::default();
        }
        info!(
            "{}{:?}/{:?} -> {:?}/{:?}",
            self.log_prefix, t.previous_state, t.previous_phase, t.state, t.phase
        );

        if t.state_changed() {
            if t.previous_state == ConnectionState::ConnectedNoAllocation {
                if let Some(timer) = inner.allocation_timer.take() {
                    timer.cancel();
                }
            }
            if t.state == ConnectionState::ConnectedNoAllocation {
                self.start_allocation_timer(inner);
            }
        }
        Effects::for_transition(&t, inner.setpoint)
    }

    fn start_allocation_timer(&self, inner: &mut ConnectorInner) {
        inner.allocation_generation += 1;
        let generation = inner.allocation_generation;
        let weak = self.weak.clone();
        let name = format!("allocation-timer-{}", self.local_connector_number);
        debug!(
            "{}Waiting {} ms for module placeholder allocation",
            self.log_prefix,
            self.allocation_timeout.as_millis()
        );
        match OneShotTimer::start(&name, self.allocation_timeout, move || {
            if let Some(connector) = weak.upgrade() {
                connector.on_allocation_timeout(generation);
            }
        }) {
            Ok(timer) => inner.allocation_timer = Some(timer),
            Err(e) => error!("{}Failed to start allocation timer: {}", self.log_prefix, e),
        }
    }

    fn execute(&self, effects: Effects) {
        if let Some(event) = effects.charging_event {
            self.registers.charging_event.report(event);
        }
        if let Some(status) = effects.connection_status {
            self.registers.connection_status.update_value(status);
        }
        if let Some(status) = effects.working_status {
            if self.registers.working_status.get_value() != status {
                info!("{}Working status {:?}", self.log_prefix, status);
                self.registers.working_status.update_value(status);
            }
        }
        match effects.frame {
            Some(Frame::Requirement(requirement)) => {
                self.messenger.send_power_requirement(requirement);
            },
            Some(Frame::Stop) => {
                self.messenger.send_stop_request();
            },
            None => {},
        }
    }
}

fn has_key_state(state: ConnectionState) -> bool {
    matches!(
        state,
        ConnectionState::ConnectedNoAllocation | ConnectionState::Running
    )
}

/// Log power unit writes that change the value
fn log_changes(provider: &HoldingProvider<f32>, what: String, unit: &'static str) {
    let last = Mutex::new(None::<f32>);
    provider.add_write_callback(move |value: &f32| {
        let mut last = last.lock();
        if *last != Some(*value) {
            *last = Some(*value);
            info!("{} changed to {} {}", what, value, unit);
        }
    });
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.get_mut().allocation_timer.take() {
            timer.cancel();
        }
    }
}

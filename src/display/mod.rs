//! Display-MCU orchestration.
//!
//! One logical event loop: decode the controller's status stream into the
//! [`UiStatus`] snapshot, send commands with a bounded ack wait, ingest
//! power-meter data, and gate publication to MQTT/cloud through the
//! change detector. The network clients themselves (Wi-Fi, MQTT, cloud)
//! are external collaborators — this module only produces the payloads
//! and the decision to publish.

pub mod ota;

use log::{info, warn};

use crate::config::SystemConfig;
use crate::error::CommsError;
use crate::hal::{Clock, SerialPort, StoragePort};
use crate::meter::PowerMeterManager;
use crate::proto::messages::{HandshakeInfo, StatusPayload};
use crate::proto::{encode_frame, Command, FrameDecoder, Response, STATUS_REPORT};
use crate::status::{ChangedFields, StatusChangeDetector, UiStatus};

/// Status stream silence after which the controller counts as gone.
const CONTROLLER_TIMEOUT_MS: u64 = 2_000;

const UI_NAMESPACE: &str = "ui";
const UI_SNAPSHOT_KEY: &str = "snapshot";

/// Subset of the machine state persisted across display reboots, so the
/// UI shows the last known values before the first status frame lands.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StateSnapshot {
    machine_state: u8,
    heating_mode: u8,
    brew_setpoint_c: f32,
    steam_setpoint_c: f32,
}

/// Display-side service.
pub struct DisplayService {
    decoder: FrameDecoder,
    status: UiStatus,
    detector: StatusChangeDetector,
    meters: PowerMeterManager,
    handshake: Option<HandshakeInfo>,
    last_status_rx_ms: u64,
    ever_heard_controller: bool,
    ack_timeout_ms: u64,
}

impl DisplayService {
    pub fn new(config: &SystemConfig) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            status: UiStatus::default(),
            detector: StatusChangeDetector::new(),
            meters: PowerMeterManager::new(config.mqtt_meter_stale_secs),
            handshake: None,
            last_status_rx_ms: 0,
            ever_heard_controller: false,
            ack_timeout_ms: config.command_ack_timeout_ms as u64,
        }
    }

    /// Restore persisted state (meter source, last machine snapshot)
    /// from storage.
    pub fn begin(&mut self, storage: &impl StoragePort) {
        self.meters.begin(storage);

        let mut buf = [0u8; 128];
        if let Ok(n) = storage.read(UI_NAMESPACE, UI_SNAPSHOT_KEY, &mut buf) {
            if let Ok(snap) = serde_json::from_slice::<StateSnapshot>(&buf[..n]) {
                if let Some(state) = crate::machine::MachineState::from_u8(snap.machine_state) {
                    self.status.machine_state = state;
                }
                if let Some(mode) = crate::machine::HeatingMode::from_u8(snap.heating_mode) {
                    self.status.heating_mode = mode;
                }
                self.status.brew_setpoint_c = snap.brew_setpoint_c;
                self.status.steam_setpoint_c = snap.steam_setpoint_c;
                info!("Restored UI snapshot from storage");
            }
        }
    }

    /// Persist the machine-state snapshot (called on graceful shutdown
    /// and periodically by the owner).
    pub fn save_state_snapshot(&self, storage: &mut impl StoragePort) -> bool {
        let snap = StateSnapshot {
            machine_state: self.status.machine_state as u8,
            heating_mode: self.status.heating_mode as u8,
            brew_setpoint_c: self.status.brew_setpoint_c,
            steam_setpoint_c: self.status.steam_setpoint_c,
        };
        match serde_json::to_vec(&snap) {
            Ok(blob) => storage.write(UI_NAMESPACE, UI_SNAPSHOT_KEY, &blob).is_ok(),
            Err(_) => false,
        }
    }

    // ── Link intake ───────────────────────────────────────────

    /// Drain the receive FIFO, folding unsolicited frames into the
    /// snapshot.
    pub fn poll(&mut self, serial: &mut impl SerialPort, clock: &impl Clock) {
        while let Some(byte) = serial.read_byte() {
            if let Some(frame) = self.decoder.step(byte) {
                self.handle_frame(frame.opcode, frame.payload(), clock);
            }
        }
    }

    fn handle_frame(&mut self, opcode: u8, payload: &[u8], clock: &impl Clock) {
        if opcode == STATUS_REPORT {
            if let Some(status) = StatusPayload::from_bytes(payload) {
                self.apply_status(&status, clock.now_ms());
            }
            return;
        }
        match Response::from_u8(opcode) {
            Some(Response::HandshakeInfo) => {
                if let Some(info) = HandshakeInfo::from_bytes(payload) {
                    info!(
                        "Controller handshake: proto v{}, fw {}.{}, reset cause 0x{:02X}",
                        info.proto_version, info.fw_major, info.fw_minor, info.reset_cause
                    );
                    self.handshake = Some(info);
                }
            }
            Some(Response::Ack) | Some(Response::Nak) => {
                // Stray ack outside a send window; nothing waits for it.
            }
            Some(Response::ConfigReport) | None => {}
        }
    }

    fn apply_status(&mut self, status: &StatusPayload, now_ms: u64) {
        self.status.machine_state = status.machine_state;
        self.status.heating_mode = status.heating_mode;
        self.status.is_heating =
            status.brew_duty_pct > 0 || status.steam_duty_pct > 0;
        self.status.is_brewing =
            status.machine_state == crate::machine::MachineState::Brewing;
        self.status.brew_temp_c = status.brew_temp_c.unwrap_or(0.0);
        self.status.brew_setpoint_c = status.brew_setpoint_c;
        self.status.steam_temp_c = status.steam_temp_c.unwrap_or(0.0);
        self.status.steam_setpoint_c = status.steam_setpoint_c;
        self.status.group_temp_c = status.group_temp_c.unwrap_or(0.0);
        self.status.pressure_bar = status.pressure_bar.unwrap_or(0.0);
        self.status.water_low = status.water_level_pct == 0;
        self.status.alarm_active = status.fault_bits != 0;
        self.status.alarm_code = status.fault_bits;
        self.last_status_rx_ms = now_ms;
        self.ever_heard_controller = true;
    }

    // ── Commands ──────────────────────────────────────────────

    /// Send one command and wait for its ack, folding any status frames
    /// that arrive in between. Duplicate sends are safe — the controller
    /// treats commands idempotently — so the caller retries on timeout.
    pub fn send_command(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl Clock,
        command: Command,
        payload: &[u8],
    ) -> Result<(), CommsError> {
        let mut buf = [0u8; 64];
        let Some(n) = encode_frame(command as u8, payload, &mut buf) else {
            return Err(CommsError::TxFailed);
        };
        serial.write(&buf[..n]);
        serial.flush();

        let deadline = clock.now_ms() + self.ack_timeout_ms;
        while clock.now_ms() < deadline {
            let Some(byte) = serial.read_byte() else {
                continue;
            };
            let Some(frame) = self.decoder.step(byte) else {
                continue;
            };
            match Response::from_u8(frame.opcode) {
                Some(Response::Ack) if frame.payload().first() == Some(&(command as u8)) => {
                    return Ok(());
                }
                Some(Response::Nak) if frame.payload().first() == Some(&(command as u8)) => {
                    let code = frame.payload().get(1).copied().unwrap_or(0);
                    warn!("Command {:?} NAKed with code {code}", command);
                    return Err(CommsError::Nak(code));
                }
                _ => self.handle_frame(frame.opcode, frame.payload(), clock),
            }
        }
        Err(CommsError::AckTimeout)
    }

    /// Request the controller's handshake info.
    pub fn request_handshake(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl Clock,
    ) -> Option<HandshakeInfo> {
        // Handshake answers with its info frame rather than a bare ack;
        // send and then poll for it within the ack window.
        let mut buf = [0u8; 8];
        let n = encode_frame(Command::Handshake as u8, &[], &mut buf)?;
        serial.write(&buf[..n]);
        serial.flush();

        let deadline = clock.now_ms() + self.ack_timeout_ms;
        while clock.now_ms() < deadline {
            if let Some(byte) = serial.read_byte() {
                if let Some(frame) = self.decoder.step(byte) {
                    self.handle_frame(frame.opcode, frame.payload(), clock);
                    if self.handshake.is_some() {
                        return self.handshake;
                    }
                }
            }
        }
        None
    }

    // ── Periodic work ─────────────────────────────────────────

    /// Per-loop tick: refresh meter state and the derived status fields.
    pub fn tick(&mut self, now_ms: u64, local_time: Option<chrono::NaiveDateTime>) {
        self.meters.tick(now_ms, local_time);
        if let Some(reading) = self.meters.reading(now_ms) {
            self.status.power_watts = reading.power;
        }
        self.status.controller_connected = self.controller_connected(now_ms);
    }

    /// True while the status stream is alive.
    pub fn controller_connected(&self, now_ms: u64) -> bool {
        self.ever_heard_controller
            && now_ms.saturating_sub(self.last_status_rx_ms) < CONTROLLER_TIMEOUT_MS
    }

    /// Gate publication: returns the snapshot and its changed groups only
    /// when something meaningful moved (always on the first call).
    pub fn publish_if_changed(&mut self) -> Option<(UiStatus, ChangedFields)> {
        let fields = self.detector.changed_fields(&self.status);
        if self.detector.has_changed(&self.status) {
            Some((self.status.clone(), fields))
        } else {
            None
        }
    }

    /// Force the next publication to be a full one (after a reconnect).
    pub fn force_full_publish(&mut self) {
        self.detector.reset();
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn status(&self) -> &UiStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut UiStatus {
        &mut self.status
    }

    pub fn meters(&mut self) -> &mut PowerMeterManager {
        &mut self.meters
    }

    pub fn handshake(&self) -> Option<HandshakeInfo> {
        self.handshake
    }

    /// The protocol decoder must be clean before the link is handed to
    /// the firmware sender.
    pub fn reset_link_state(&mut self) {
        self.decoder.reset_state();
    }
}

//! Controller-MCU orchestration.
//!
//! Work is split across the two cores: the control core samples sensors,
//! runs the safety supervisor and the PIDs, and streams status frames;
//! the app core dispatches incoming command frames, polls the Modbus
//! meter, and flushes deferred config saves. [`ControlService`] holds the
//! state both halves operate on; cross-core flags live in
//! [`DeviceShared`].

use std::sync::Arc;

use log::{info, warn};

use crate::boot::{copier, BootError, BootloaderSession};
use crate::config::{
    validate_config, SystemConfig, BREW_SETPOINT_RANGE_C, STEAM_SETPOINT_RANGE_C,
};
use crate::control::PidController;
use crate::device::{DeviceShared, ResetCause};
use crate::hal::{Clock, ConfigPort, FlashOps, SerialPort, WatchdogPort};
use crate::machine::{HeatingMode, MachineState};
use crate::proto::messages::{
    decode_pid_gains, decode_setpoint, ConfigReport, HandshakeInfo, StatusPayload,
};
use crate::proto::{
    encode_frame, Command, FrameDecoder, Response, CHECKSUM_SCHEME_XOR, NAK_BAD_PAYLOAD,
    NAK_OUT_OF_RANGE, PROTO_VERSION, STATUS_REPORT,
};
use crate::safety::SafetySupervisor;
use crate::sensors::{SensorHub, SensorInputs};

const FW_MAJOR: u8 = 2;
const FW_MINOR: u8 = 33;

/// What the serial dispatcher wants the caller to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// Keep going.
    Continue,
    /// The display requested a firmware update; run
    /// [`ControlService::run_bootloader`] with exclusive link ownership.
    EnterBootloader,
    /// The display requested a reboot.
    Reset,
}

/// Controller state shared by the per-tick control path and the command
/// dispatcher.
pub struct ControlService {
    config: SystemConfig,
    hub: SensorHub,
    safety: SafetySupervisor,
    brew_pid: PidController,
    steam_pid: PidController,
    heating_mode: HeatingMode,
    decoder: FrameDecoder,
    shared: Arc<DeviceShared>,
    brew_duty: u8,
    steam_duty: u8,
    last_status_ms: u64,
    config_dirty: bool,
}

impl ControlService {
    pub fn new(config: SystemConfig, shared: Arc<DeviceShared>) -> Self {
        let mut brew_pid = PidController::new(
            config.brew_pid.kp,
            config.brew_pid.ki,
            config.brew_pid.kd,
            config.brew_setpoint_c,
        );
        brew_pid.set_ramp_rate(config.setpoint_ramp_c_per_s);
        let mut steam_pid = PidController::new(
            config.steam_pid.kp,
            config.steam_pid.ki,
            config.steam_pid.kd,
            config.steam_setpoint_c,
        );
        steam_pid.set_ramp_rate(config.setpoint_ramp_c_per_s);

        Self {
            hub: SensorHub::new(config.machine),
            safety: SafetySupervisor::new(config.max_boiler_temp_c),
            brew_pid,
            steam_pid,
            heating_mode: HeatingMode::BrewOnly,
            decoder: FrameDecoder::new(),
            shared,
            brew_duty: 0,
            steam_duty: 0,
            last_status_ms: 0,
            config_dirty: false,
            config,
        }
    }

    // ── Control core ──────────────────────────────────────────

    /// One control tick: sample → safety → PID → duty gating, then a
    /// status frame when the cadence is due.
    pub fn tick(
        &mut self,
        inputs: &mut impl SensorInputs,
        serial: &mut impl SerialPort,
        watchdog: &impl WatchdogPort,
        clock: &impl Clock,
    ) {
        watchdog.feed();
        if self.shared.bootloader_active() {
            // Parked: the bootloader owns the link and flash.
            return;
        }

        self.hub.sample(inputs);
        let reading = self.hub.reading();
        self.safety.evaluate(&self.hub, &reading);

        let dt = self.config.control_loop_interval_ms as f32 / 1000.0;
        let heating_on = self.shared.heating_enabled() && !self.safety.outputs_inhibited();

        self.brew_duty = match reading.brew_temp_c {
            Some(temp) if heating_on && self.heating_mode.brew_enabled() => {
                self.brew_pid.compute(temp, dt) as u8
            }
            _ => {
                self.brew_pid.reset();
                0
            }
        };
        self.steam_duty = match reading.steam_temp_c {
            Some(temp) if heating_on && self.heating_mode.steam_enabled() => {
                self.steam_pid.compute(temp, dt) as u8
            }
            _ => {
                self.steam_pid.reset();
                0
            }
        };

        let now = clock.now_ms();
        let due = self.last_status_ms == 0
            || now.saturating_sub(self.last_status_ms) >= self.config.status_interval_ms as u64;
        if due {
            self.last_status_ms = now.max(1);
            self.send_status(serial);
        }
    }

    fn machine_state(&self) -> MachineState {
        let reading = self.hub.reading();
        if self.shared.bootloader_active() {
            return MachineState::Updating;
        }
        if self.safety.faults() != 0 {
            return MachineState::Fault;
        }
        if !self.shared.heating_enabled() || self.heating_mode == HeatingMode::Off {
            return MachineState::Standby;
        }
        match reading.brew_temp_c.or(reading.steam_temp_c) {
            Some(temp) => {
                let target = if self.heating_mode.brew_enabled() {
                    self.brew_pid.setpoint()
                } else {
                    self.steam_pid.setpoint()
                };
                if temp < target - 1.0 {
                    MachineState::Heating
                } else {
                    MachineState::Ready
                }
            }
            None => MachineState::Standby,
        }
    }

    fn send_status(&mut self, serial: &mut impl SerialPort) {
        let reading = self.hub.reading();
        let status = StatusPayload {
            machine_state: self.machine_state(),
            heating_mode: self.heating_mode,
            fault_bits: self.safety.faults(),
            water_level_pct: reading.water_level_pct,
            brew_temp_c: reading.brew_temp_c,
            brew_setpoint_c: self.brew_pid.setpoint(),
            steam_temp_c: reading.steam_temp_c,
            steam_setpoint_c: self.steam_pid.setpoint(),
            group_temp_c: reading.group_temp_c,
            pressure_bar: reading.pressure_bar,
            brew_duty_pct: self.brew_duty,
            steam_duty_pct: self.steam_duty,
        };
        let mut buf = [0u8; 64];
        if let Some(n) = encode_frame(STATUS_REPORT, &status.to_bytes(), &mut buf) {
            serial.write(&buf[..n]);
        }
    }

    // ── App core: command dispatch ────────────────────────────

    /// Drain the receive FIFO through the protocol decoder, dispatching
    /// complete command frames. Returns the first action that needs the
    /// caller's involvement.
    pub fn poll_serial(&mut self, serial: &mut impl SerialPort) -> LinkAction {
        if self.shared.bootloader_active() {
            return LinkAction::Continue;
        }
        while let Some(byte) = serial.read_byte() {
            if let Some(frame) = self.decoder.step(byte) {
                let action = self.dispatch(frame.opcode, frame.payload(), serial);
                if action != LinkAction::Continue {
                    return action;
                }
            }
        }
        LinkAction::Continue
    }

    fn dispatch(
        &mut self,
        opcode: u8,
        payload: &[u8],
        serial: &mut impl SerialPort,
    ) -> LinkAction {
        let Some(command) = Command::from_u8(opcode) else {
            // Unknown opcode: not a command we recognise; drop silently
            // like any other malformed traffic.
            return LinkAction::Continue;
        };

        match command {
            Command::Handshake => {
                let info = HandshakeInfo {
                    proto_version: PROTO_VERSION,
                    checksum_scheme: CHECKSUM_SCHEME_XOR,
                    fw_major: FW_MAJOR,
                    fw_minor: FW_MINOR,
                    reset_cause: self.shared.reset_cause().encode(),
                };
                self.send_response(serial, Response::HandshakeInfo, &info.to_bytes());
            }
            Command::SetBrewSetpoint => match decode_setpoint(payload) {
                Some(v) if BREW_SETPOINT_RANGE_C.contains(&v) => {
                    info!("Command: brew setpoint -> {v:.1}C");
                    self.config.brew_setpoint_c = v;
                    self.brew_pid.set_target(v);
                    self.mark_dirty();
                    self.send_ack(serial, opcode);
                }
                Some(v) => {
                    warn!("Command: brew setpoint {v:.1}C out of range, keeping previous");
                    self.send_nak(serial, opcode, NAK_OUT_OF_RANGE);
                }
                None => self.send_nak(serial, opcode, NAK_BAD_PAYLOAD),
            },
            Command::SetSteamSetpoint => match decode_setpoint(payload) {
                Some(v) if STEAM_SETPOINT_RANGE_C.contains(&v) => {
                    info!("Command: steam setpoint -> {v:.1}C");
                    self.config.steam_setpoint_c = v;
                    self.steam_pid.set_target(v);
                    self.mark_dirty();
                    self.send_ack(serial, opcode);
                }
                Some(_) => self.send_nak(serial, opcode, NAK_OUT_OF_RANGE),
                None => self.send_nak(serial, opcode, NAK_BAD_PAYLOAD),
            },
            Command::SetHeatingMode => match payload.first().and_then(|b| HeatingMode::from_u8(*b)) {
                Some(mode) => {
                    info!("Command: heating mode -> {mode:?}");
                    self.heating_mode = mode;
                    self.send_ack(serial, opcode);
                }
                None => self.send_nak(serial, opcode, NAK_BAD_PAYLOAD),
            },
            Command::SetComponent => match payload {
                [0x00, enabled] => {
                    self.shared.set_heating_enabled(*enabled != 0);
                    self.send_ack(serial, opcode);
                }
                _ => self.send_nak(serial, opcode, NAK_BAD_PAYLOAD),
            },
            Command::EnterBootloader => {
                // Acked from the handoff itself, after the drain: the ack
                // is the sender's green light to start streaming chunks.
                info!("Command: enter bootloader");
                return LinkAction::EnterBootloader;
            }
            Command::Reset => {
                self.send_ack(serial, opcode);
                return LinkAction::Reset;
            }
            Command::GetConfig => {
                let report = ConfigReport {
                    brew_setpoint_c: self.config.brew_setpoint_c,
                    steam_setpoint_c: self.config.steam_setpoint_c,
                    heating_mode: self.heating_mode,
                    machine_kind: self.config.machine as u8,
                };
                self.send_response(serial, Response::ConfigReport, &report.to_bytes());
            }
            Command::SetPidGains => match decode_pid_gains(payload) {
                Some((boiler, kp, ki, kd)) => {
                    let mut candidate = self.config.clone();
                    let gains = crate::config::PidGains { kp, ki, kd };
                    match boiler {
                        0 => candidate.brew_pid = gains,
                        1 => candidate.steam_pid = gains,
                        _ => {
                            self.send_nak(serial, opcode, NAK_BAD_PAYLOAD);
                            return LinkAction::Continue;
                        }
                    }
                    // Reject invalid gains outright; the running config
                    // keeps its previous values.
                    if validate_config(&candidate).is_err() {
                        self.send_nak(serial, opcode, NAK_OUT_OF_RANGE);
                        return LinkAction::Continue;
                    }
                    self.config = candidate;
                    if boiler == 0 {
                        self.brew_pid.set_gains(kp, ki, kd);
                    } else {
                        self.steam_pid.set_gains(kp, ki, kd);
                    }
                    self.mark_dirty();
                    self.send_ack(serial, opcode);
                }
                None => self.send_nak(serial, opcode, NAK_BAD_PAYLOAD),
            },
            Command::ConfigureMeter => match payload {
                [enabled, index] => {
                    self.config.modbus_meter_enabled = *enabled != 0;
                    self.config.modbus_meter_index = *index;
                    self.shared.request_save();
                    self.send_ack(serial, opcode);
                }
                _ => self.send_nak(serial, opcode, NAK_BAD_PAYLOAD),
            },
        }
        LinkAction::Continue
    }

    fn send_response(&mut self, serial: &mut impl SerialPort, response: Response, payload: &[u8]) {
        let mut buf = [0u8; 64];
        if let Some(n) = encode_frame(response as u8, payload, &mut buf) {
            serial.write(&buf[..n]);
        }
    }

    fn send_ack(&mut self, serial: &mut impl SerialPort, cmd_opcode: u8) {
        self.send_response(serial, Response::Ack, &[cmd_opcode]);
    }

    fn send_nak(&mut self, serial: &mut impl SerialPort, cmd_opcode: u8, code: u8) {
        self.send_response(serial, Response::Nak, &[cmd_opcode, code]);
    }

    fn mark_dirty(&mut self) {
        self.config_dirty = true;
        self.shared.request_save();
    }

    /// Flush a deferred save request from the owning core's loop.
    pub fn process_pending_save(&mut self, storage: &mut impl ConfigPort) -> bool {
        if !self.shared.take_pending_save() {
            return false;
        }
        match storage.save(&self.config) {
            Ok(()) => {
                self.config_dirty = false;
                info!("Config saved");
                true
            }
            Err(e) => {
                warn!("Config save failed: {e}");
                false
            }
        }
    }

    // ── Bootloader handoff ────────────────────────────────────

    /// Full firmware-update sequence: safe state, drain, decoder reset,
    /// flag with release ordering, ready ack, then exclusive bootloader
    /// ownership of the link. The ack goes out only after the final
    /// drain, so the sender's first chunk can never be swallowed. On
    /// success control would never return (the copy ends in reset); on
    /// failure the caller must reset via the watchdog.
    pub fn run_bootloader(
        &mut self,
        serial: &mut impl SerialPort,
        flash: &mut impl FlashOps,
        watchdog: &impl WatchdogPort,
        clock: &impl Clock,
    ) -> Result<(), BootError> {
        // Idempotency: a re-entered prepare is a no-op.
        if self.shared.bootloader_active() {
            return Ok(());
        }

        self.safety.enter_safe_state();
        self.brew_duty = 0;
        self.steam_duty = 0;

        serial.flush();
        let drained = serial.drain_rx();
        if drained > 0 {
            info!("Bootloader: drained {drained} bytes before handoff");
        }
        self.decoder.reset_state();
        // Release-publish after the drain and decoder reset so the other
        // core parks before any chunk traffic arrives.
        self.shared.set_bootloader_active(true);
        serial.drain_rx();

        // Green light: the sender starts streaming on this ack.
        self.send_ack(serial, Command::EnterBootloader as u8);
        serial.flush();

        let mut session = BootloaderSession::new();
        let result = session
            .run(serial, flash, watchdog, clock)
            .and_then(|image| {
                // Pre-load buffer for the copy phase. On the real part
                // this is the reserved static in the copier's RAM
                // section, sized for the largest supported image.
                let sectors = image.size.div_ceil(crate::hal::FLASH_SECTOR_SIZE as u32);
                let mut ram_buf = vec![0u8; sectors as usize * crate::hal::FLASH_SECTOR_SIZE];
                copier::copy_staging_to_active(
                    flash,
                    watchdog,
                    &mut copier::NullMarker,
                    image.size,
                    &mut ram_buf,
                )
                .map(|_| ())
            });

        match &result {
            Ok(()) => {
                // On hardware the copy never returns; the reset happens
                // inside the RAM-resident routine.
                self.shared.set_reset_cause(ResetCause::Ok);
            }
            Err(err) => {
                warn!("Bootloader: update failed ({err}), drain and reset");
                serial.drain_rx();
                self.shared
                    .set_reset_cause(ResetCause::BootloaderFail(err.code()));
            }
        }
        result
    }

    // ── Queries (for the harness and tests) ───────────────────

    pub fn duties(&self) -> (u8, u8) {
        (self.brew_duty, self.steam_duty)
    }

    pub fn heating_mode(&self) -> HeatingMode {
        self.heating_mode
    }

    pub fn brew_setpoint(&self) -> f32 {
        self.config.brew_setpoint_c
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn is_config_dirty(&self) -> bool {
        self.config_dirty
    }
}

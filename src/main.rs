//! Host simulation harness.
//!
//! Wires the controller loop and the display loop over an in-memory
//! duplex serial link and walks the whole system through its life:
//! handshake, heat-up under closed-loop control with live status
//! streaming, a setpoint change from the display, power-meter ingestion,
//! and finally a full firmware update ending in a simulated reset.
//!
//! On hardware the two halves run on separate MCUs; everything exercised
//! here is the same code, reached through the port traits.

use std::sync::Arc;

use anyhow::Result;
use log::info;

use brewcore::boot::BootError;
use brewcore::config::SystemConfig;
use brewcore::controller::{ControlService, LinkAction};
use brewcore::device::DeviceShared;
use brewcore::display::{ota, DisplayService};
use brewcore::hal::sim::{MemStorage, SimClock, SimFlash, SimSerial, SimWatchdog};
use brewcore::hal::{Clock, SerialPort, FLASH_ACTIVE_OFFSET};
use brewcore::proto::messages::encode_setpoint;
use brewcore::proto::{encode_frame, Command};
use brewcore::sensors::{ntc, SensorInputs, WaterProbes};

/// Thermal model behind the simulated ADC inputs: boilers warm with
/// heater duty and bleed heat to ambient.
struct BoilerModel {
    brew_temp_c: f32,
    steam_temp_c: f32,
    brew_duty: u8,
    steam_duty: u8,
}

impl BoilerModel {
    fn new() -> Self {
        Self {
            brew_temp_c: 25.0,
            steam_temp_c: 25.0,
            brew_duty: 0,
            steam_duty: 0,
        }
    }

    fn step(&mut self) {
        self.brew_temp_c += self.brew_duty as f32 * 0.012 - (self.brew_temp_c - 25.0) * 0.004;
        self.steam_temp_c += self.steam_duty as f32 * 0.018 - (self.steam_temp_c - 25.0) * 0.004;
    }

    fn temp_to_adc(temp_c: f32) -> u16 {
        // Invert the divider + Beta equation the sensor hub applies.
        let t_kelvin = temp_c + 273.15;
        let r_ntc = ntc::NTC_R25_OHMS
            * (ntc::NTC_B_VALUE * (1.0 / t_kelvin - 1.0 / 298.15)).exp();
        let v = ntc::ADC_VREF * r_ntc / (ntc::NTC_SERIES_R_OHMS + r_ntc);
        (v / ntc::ADC_VREF * ntc::ADC_MAX) as u16
    }
}

impl SensorInputs for BoilerModel {
    fn brew_adc(&mut self) -> u16 {
        Self::temp_to_adc(self.brew_temp_c)
    }

    fn steam_adc(&mut self) -> u16 {
        Self::temp_to_adc(self.steam_temp_c)
    }

    fn pressure_volts(&mut self) -> f32 {
        0.5 * 0.641 // idle: 0 bar at the transducer
    }

    fn water_probes(&mut self) -> WaterProbes {
        WaterProbes {
            plumbed: false,
            tank_ok: Some(true),
            steam_ok: Some(true),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("brewcore v{} — simulation harness", env!("CARGO_PKG_VERSION"));

    let config = SystemConfig::default();
    let shared = Arc::new(DeviceShared::new());
    let mut controller = ControlService::new(config.clone(), shared.clone());
    let mut display = DisplayService::new(&config);
    let mut storage = MemStorage::new();
    display.begin(&storage);

    let (mut ctrl_serial, mut disp_serial) = SimSerial::pair();
    let ctrl_clock = SimClock::default();
    let disp_clock = SimClock::default();
    let watchdog = SimWatchdog::new();
    let mut model = BoilerModel::new();

    // ── Handshake ─────────────────────────────────────────────
    // The display asks first; the command dispatcher on the app core
    // answers between control ticks. The harness interleaves the two
    // loops by hand where hardware would run them on separate MCUs.
    let dispatch_command = |display: &mut DisplayService,
                                controller: &mut ControlService,
                                disp_serial: &mut SimSerial,
                                ctrl_serial: &mut SimSerial,
                                clock: &SimClock,
                                command: Command,
                                payload: &[u8]|
     -> LinkAction {
        let mut buf = [0u8; 64];
        let n = encode_frame(command as u8, payload, &mut buf).expect("command frame fits");
        disp_serial.write(&buf[..n]);
        let action = controller.poll_serial(ctrl_serial);
        display.poll(disp_serial, clock);
        action
    };

    dispatch_command(
        &mut display,
        &mut controller,
        &mut disp_serial,
        &mut ctrl_serial,
        &disp_clock,
        Command::Handshake,
        &[],
    );
    let hs = display.handshake().expect("controller answered the handshake");
    info!(
        "Handshake ok: proto v{}, checksum scheme {}, firmware {}.{}",
        hs.proto_version, hs.checksum_scheme, hs.fw_major, hs.fw_minor
    );

    // ── Heat-up under closed-loop control ─────────────────────
    info!("Heating to {:.1}C ...", config.brew_setpoint_c);
    let mut published = 0u32;
    for tick in 0..3000u32 {
        model.step();
        controller.tick(&mut model, &mut ctrl_serial, &watchdog, &ctrl_clock);
        let _ = controller.poll_serial(&mut ctrl_serial);
        let (brew_duty, steam_duty) = controller.duties();
        model.brew_duty = brew_duty;
        model.steam_duty = steam_duty;

        display.poll(&mut disp_serial, &disp_clock);
        display.tick(disp_clock.now_ms(), None);
        if display.publish_if_changed().is_some() {
            published += 1;
        }

        if tick % 500 == 0 {
            info!(
                "t={tick:4} brew={:6.2}C duty={brew_duty:3}% steam={:6.2}C",
                model.brew_temp_c, model.steam_temp_c
            );
        }
    }
    info!(
        "Heat-up done: brew={:.2}C (target {:.1}C), {published} publications gated from 3000 ticks",
        model.brew_temp_c, config.brew_setpoint_c
    );

    // ── Setpoint change from the display ──────────────────────
    dispatch_command(
        &mut display,
        &mut controller,
        &mut disp_serial,
        &mut ctrl_serial,
        &disp_clock,
        Command::SetBrewSetpoint,
        &encode_setpoint(94.5),
    );
    assert_eq!(controller.brew_setpoint(), 94.5);
    info!("Setpoint command acknowledged, target now 94.5C");

    // ── Power meter over MQTT ─────────────────────────────────
    display
        .meters()
        .configure_mqtt(&mut storage, "tele/espresso-plug/SENSOR", "auto");
    display.meters().on_mqtt_data(
        br#"{"ENERGY":{"Power":1310,"Voltage":231,"Current":5.67,"Total":45.210,"Factor":0.97}}"#,
        disp_clock.now_ms(),
    );
    display.tick(disp_clock.now_ms(), None);
    let meter_name = display.meters().meter_name().to_string();
    let meter_connected = display.meters().is_connected(disp_clock.now_ms());
    let meter_today_kwh = display.meters().today_kwh();
    let power_watts = display.status().power_watts;
    info!(
        "Power meter: {} connected={} {:.0}W today={:.3}kWh",
        meter_name, meter_connected, power_watts, meter_today_kwh,
    );

    // Persist the UI snapshot before the update takes the machine down.
    if display.save_state_snapshot(&mut storage) {
        info!("UI snapshot persisted");
    }

    // ── Firmware update ───────────────────────────────────────
    // Build a plausible image: vector table then a version blob.
    let mut image = vec![0u8; 4096];
    image[..4].copy_from_slice(&0x2004_2000u32.to_le_bytes());
    image[4..8].copy_from_slice(&0x1000_0201u32.to_le_bytes());
    for (i, b) in image.iter_mut().enumerate().skip(8) {
        *b = (i * 7 % 256) as u8;
    }

    let action = dispatch_command(
        &mut display,
        &mut controller,
        &mut disp_serial,
        &mut ctrl_serial,
        &disp_clock,
        Command::EnterBootloader,
        &[],
    );
    assert_eq!(action, LinkAction::EnterBootloader);
    display.reset_link_state();

    // The controller core parks in the bootloader with exclusive link
    // ownership while the display streams the image. Fine-grained sim
    // clocks here: the two loops poll each other across real threads.
    let image_for_sender = image.clone();
    let controller_half = std::thread::spawn(move || {
        let mut flash = SimFlash::new();
        let ota_clock = SimClock::new(10);
        let result = controller.run_bootloader(&mut ctrl_serial, &mut flash, &watchdog, &ota_clock);
        (result, flash)
    });

    let sender_clock = SimClock::new(10);
    ota::send_firmware(&mut disp_serial, &sender_clock, &image_for_sender)
        .map_err(|e| anyhow::anyhow!("firmware send failed: {e}"))?;

    let (result, flash) = controller_half
        .join()
        .map_err(|_| anyhow::anyhow!("controller thread panicked"))?;
    match result {
        Ok(()) => {
            let active = flash.contents(FLASH_ACTIVE_OFFSET, image.len());
            assert_eq!(active, &image[..], "active region must match the sent image");
            info!(
                "Firmware update complete: {} bytes live in the active region, device resets (cause 0x{:02X})",
                image.len(),
                shared.reset_cause().encode()
            );
        }
        Err(BootError::Timeout) => anyhow::bail!("update timed out"),
        Err(e) => anyhow::bail!("update failed: {e}"),
    }

    info!("Simulation complete");
    Ok(())
}

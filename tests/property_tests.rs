//! Property tests for the protocol, control, and metering invariants.
//!
//! Runs on the host only — proptest is not available on the MCU targets.

#![cfg(not(target_os = "espidf"))]

use brewcore::boot::{xor8, BootError, BootloaderSession, CHUNK_MAGIC, END_SEQUENCE};
use brewcore::control::PidController;
use brewcore::hal::sim::{SimClock, SimFlash, SimSerial, SimWatchdog};
use brewcore::hal::SerialPort;
use brewcore::meter::modbus::{build_request, verify_response, METER_MAPS};
use brewcore::proto::{encode_frame, FrameDecoder};
use brewcore::status::{StatusChangeDetector, UiStatus};
use proptest::prelude::*;

// ── Framing ───────────────────────────────────────────────────

proptest! {
    /// decode(encode(opcode, p)) == (opcode, p) for any payload.
    #[test]
    fn frame_roundtrip(
        opcode in 0u8..=255,
        payload in proptest::collection::vec(0u8..=255u8, 0..=255),
    ) {
        let mut buf = [0u8; 300];
        let n = encode_frame(opcode, &payload, &mut buf).unwrap();

        let mut dec = FrameDecoder::new();
        let mut decoded = None;
        for &b in &buf[..n] {
            if let Some(frame) = dec.step(b) {
                decoded = Some(frame);
            }
        }
        let frame = decoded.expect("frame must decode");
        prop_assert_eq!(frame.opcode, opcode);
        prop_assert_eq!(frame.payload(), &payload[..]);
    }

    /// A single corrupted byte either fails the frame or (if it hit
    /// before the frame body, e.g. the SOF) delays sync — and a clean
    /// frame afterwards always decodes.
    #[test]
    fn frame_recovers_after_single_byte_corruption(
        payload in proptest::collection::vec(0u8..=255u8, 0..=32),
        corrupt_at in 0usize..16,
        corrupt_with in 1u8..=255,
    ) {
        let mut buf = [0u8; 64];
        let n = encode_frame(0x02, &payload, &mut buf).unwrap();
        let idx = corrupt_at % n;
        buf[idx] ^= corrupt_with;

        let mut dec = FrameDecoder::new();
        for &b in &buf[..n] {
            let _ = dec.step(b);
        }

        // Recovery: a hard reset then a clean frame always decodes.
        dec.reset_state();
        let mut clean = [0u8; 64];
        let m = encode_frame(0x03, b"ok", &mut clean).unwrap();
        let mut decoded = None;
        for &b in &clean[..m] {
            if let Some(frame) = dec.step(b) {
                decoded = Some(frame);
            }
        }
        prop_assert!(decoded.is_some());
        prop_assert_eq!(decoded.unwrap().opcode, 0x03);
    }
}

// ── PID ───────────────────────────────────────────────────────

proptest! {
    /// Output is always within [0, 100] for positive dt.
    #[test]
    fn pid_output_bounded(
        kp in 0.0f32..100.0,
        ki in 0.0f32..10.0,
        kd in 0.0f32..50.0,
        setpoint in -50.0f32..250.0,
        measurements in proptest::collection::vec(-50.0f32..250.0, 1..100),
        dt in 0.001f32..5.0,
    ) {
        let mut pid = PidController::new(kp, ki, kd, setpoint);
        for m in measurements {
            let out = pid.compute(m, dt);
            prop_assert!((0.0..=100.0).contains(&out));
        }
    }

    /// First call after init: exactly clamp(Kp*e + Ki*e*dt, 0, 100) —
    /// no derivative contribution.
    #[test]
    fn pid_first_call_formula(
        kp in 0.0f32..10.0,
        ki in 0.01f32..1.0,
        kd in 0.0f32..50.0,
        setpoint in 0.0f32..150.0,
        measurement in 0.0f32..150.0,
        dt in 0.01f32..1.0,
    ) {
        let mut pid = PidController::new(kp, ki, kd, setpoint);
        let out = pid.compute(measurement, dt);
        let e = setpoint - measurement;
        let expected = (kp * e + ki * e * dt).clamp(0.0, 100.0);
        prop_assert!((out - expected).abs() < 1e-3,
            "first call {out} != {expected}");
    }
}

// ── Change detector ───────────────────────────────────────────

proptest! {
    /// has_changed(x) then has_changed(x) is true then false for any
    /// snapshot.
    #[test]
    fn change_detector_idempotent(
        brew in 0.0f32..150.0,
        pressure in 0.0f32..16.0,
        power in 0.0f32..3000.0,
        mqtt in prop::bool::ANY,
    ) {
        let status = UiStatus {
            brew_temp_c: brew,
            pressure_bar: pressure,
            power_watts: power,
            mqtt_connected: mqtt,
            ..Default::default()
        };
        let mut det = StatusChangeDetector::new();
        prop_assert!(det.has_changed(&status));
        prop_assert!(!det.has_changed(&status));
    }
}

// ── Modbus ────────────────────────────────────────────────────

proptest! {
    /// Every produced request passes its own CRC check, and any
    /// single-byte corruption of a response is rejected.
    #[test]
    fn modbus_crc_detects_corruption(
        map_idx in 0usize..METER_MAPS.len(),
        data in proptest::collection::vec(0u8..=255u8, 2..40),
        corrupt_at in 0usize..64,
        corrupt_with in 1u8..=255,
    ) {
        let map = &METER_MAPS[map_idx];

        // Requests self-verify.
        let req = build_request(map.slave_addr, map.function_code, map.voltage_reg, map.num_registers);
        let crc = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS).checksum(&req[..6]);
        prop_assert_eq!(u16::from_le_bytes([req[6], req[7]]), crc);

        // A well-formed response verifies; corrupting any byte kills it.
        let mut resp = vec![map.slave_addr, map.function_code, data.len() as u8];
        resp.extend_from_slice(&data);
        let crc = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS).checksum(&resp);
        resp.extend_from_slice(&crc.to_le_bytes());
        prop_assert!(verify_response(&resp, map));

        let idx = corrupt_at % resp.len();
        resp[idx] ^= corrupt_with;
        prop_assert!(!verify_response(&resp, map));
    }
}

// ── Bootloader sequencing ─────────────────────────────────────

fn write_chunk(serial: &mut SimSerial, seq: u32, payload: &[u8]) {
    serial.write(&CHUNK_MAGIC);
    serial.write(&seq.to_le_bytes());
    serial.write(&(payload.len() as u16).to_le_bytes());
    serial.write(payload);
    serial.write(&[xor8(payload)]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Chunks are accepted iff sequence numbers are 0, 1, 2, ...
    /// contiguous; any gap or replay aborts the session.
    #[test]
    fn ota_sequence_must_be_contiguous(
        chunk_count in 2u32..8,
        bad_position in 1u32..8,
        offset in prop_oneof![Just(-1i64), Just(1i64), Just(2i64)],
    ) {
        let bad_position = bad_position % chunk_count;
        prop_assume!(bad_position > 0);

        let (mut sender, mut receiver) = SimSerial::pair();
        let payload = {
            let mut p = vec![0u8; 256];
            p[..4].copy_from_slice(&0x2004_2000u32.to_le_bytes());
            p[4..8].copy_from_slice(&0x1000_0201u32.to_le_bytes());
            p
        };

        for seq in 0..chunk_count {
            let wire_seq = if seq == bad_position {
                (seq as i64 + offset) as u32
            } else {
                seq
            };
            write_chunk(&mut sender, wire_seq, &payload);
        }
        write_chunk(&mut sender, END_SEQUENCE, &[0x00]);

        let mut flash = SimFlash::new();
        let dog = SimWatchdog::new();
        let clock = SimClock::default();
        let mut session = BootloaderSession::new();
        let result = session.run(&mut receiver, &mut flash, &dog, &clock);

        prop_assert_eq!(result.unwrap_err(), BootError::InvalidChunk);
    }
}

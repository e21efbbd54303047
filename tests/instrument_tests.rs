use rfbus::framing::encode_frame;
use rfbus::opcodes::{Opcode, PatternCtl};
use rfbus::pattern::{PatternWord, SYS_CLKS_PER_PTN_CLK};
use rfbus::processor::{OpcodeProcessor, ProcessorConfig};
use rfbus::state::StateFlags;
use rfbus::status::{AlarmId, ErrorCode, ResponseVersion, StatusResponse};

fn ready_processor() -> OpcodeProcessor {
    let config = ProcessorConfig::default();
    let init_ticks = config.init_ticks;
    let mut proc = OpcodeProcessor::new(config);
    for _ in 0..init_ticks {
        proc.tick();
    }
    assert!(proc.state_snapshot().contains(StateFlags::INITIALIZED));
    proc
}

fn drain_one(proc: &mut OpcodeProcessor, max_ticks: u32) -> StatusResponse {
    for _ in 0..max_ticks {
        if let Some(bytes) = proc.take_response() {
            return StatusResponse::decode(&bytes, proc.response_version()).unwrap();
        }
        proc.tick();
    }
    panic!("no response within {max_ticks} ticks");
}

#[test]
fn test_power_up_lifecycle() {
    let mut proc = OpcodeProcessor::new(ProcessorConfig::default());

    // Fresh out of reset: RESET and INITIALIZING up, nothing else
    let state = proc.state_snapshot();
    assert!(state.contains(StateFlags::RESET));
    assert!(state.contains(StateFlags::INITIALIZING));
    assert!(!state.contains(StateFlags::INITIALIZED));

    // Status queries are served during the self-check
    proc.feed(&encode_frame(Opcode::Status, &[]));
    let rsp = drain_one(&mut proc, 2);
    assert_eq!(rsp.error, ErrorCode::Success);
    assert!(rsp.state.contains(StateFlags::INITIALIZING));

    // Device commands are not
    proc.feed(&encode_frame(Opcode::Bias, &[0, 1]));
    let rsp = drain_one(&mut proc, 2);
    assert_eq!(rsp.error, ErrorCode::InvalidState);

    for _ in 0..ProcessorConfig::default().init_ticks {
        proc.tick();
    }
    assert!(proc.state_snapshot().contains(StateFlags::INITIALIZED));

    proc.feed(&encode_frame(Opcode::Bias, &[0, 1]));
    let rsp = drain_one(&mut proc, 64);
    assert_eq!(rsp.error, ErrorCode::Success);
}

#[test]
fn test_concurrent_subsystem_commands_all_complete() {
    let mut proc = ready_processor();

    // One command per bus subsystem, back to back in a single block
    let mut wire = encode_frame(Opcode::Freq, &2_450_000_000u32.to_le_bytes());
    wire.extend_from_slice(&encode_frame(Opcode::Power, &[0, 0x00, 0x14]));
    wire.extend_from_slice(&encode_frame(Opcode::Phase, &[1, 0x08, 0x07]));
    wire.extend_from_slice(&encode_frame(Opcode::Bias, &[2, 1]));
    proc.feed(&wire);

    // All four busy flags are up while the transactions are serialized
    // over the one bus
    let state = proc.state_snapshot();
    assert!(state.contains(StateFlags::FRQ_BUSY));
    assert!(state.contains(StateFlags::PWR_BUSY));
    assert!(state.contains(StateFlags::PHS_BUSY));
    assert!(state.contains(StateFlags::BIAS_BUSY));

    for expected in [Opcode::Freq, Opcode::Power, Opcode::Phase, Opcode::Bias] {
        let rsp = drain_one(&mut proc, 128);
        assert_eq!(rsp.opcode, expected.as_u8());
        assert_eq!(rsp.error, ErrorCode::Success);
    }

    let state = proc.state_snapshot();
    assert!(!state.intersects(StateFlags::FRQ_BUSY));
    assert!(!state.intersects(StateFlags::PWR_BUSY));
    assert!(!state.intersects(StateFlags::PHS_BUSY));
    assert!(!state.intersects(StateFlags::BIAS_BUSY));
}

#[test]
fn test_frequency_validation_errors() {
    let mut proc = ready_processor();

    // Out of band
    proc.feed(&encode_frame(Opcode::Freq, &2_600_000_000u32.to_le_bytes()));
    let rsp = drain_one(&mut proc, 4);
    assert_eq!(rsp.error, ErrorCode::FreqConverge);

    // Off the 100 kHz raster
    proc.feed(&encode_frame(Opcode::Freq, &2_450_000_001u32.to_le_bytes()));
    let rsp = drain_one(&mut proc, 4);
    assert_eq!(rsp.error, ErrorCode::FreqConverge);

    // A rejected command leaves the subsystem available
    assert!(!proc.state_snapshot().contains(StateFlags::FRQ_BUSY));
}

#[test]
fn test_calibration_sequence_rides_power_flag() {
    let mut proc = ready_processor();

    // CALPWR occupies the power subsystem; POWER during it is rejected
    proc.feed(&encode_frame(Opcode::CalPwr, &[0, 0x00, 0x14]));
    assert!(proc.state_snapshot().contains(StateFlags::PWR_BUSY));
    proc.feed(&encode_frame(Opcode::Power, &[0, 0x00, 0x14]));

    let rsp = drain_one(&mut proc, 64);
    assert_eq!(rsp.opcode, Opcode::CalPwr.as_u8());
    assert_eq!(rsp.error, ErrorCode::Success);
    let rsp = drain_one(&mut proc, 4);
    assert_eq!(rsp.error, ErrorCode::InvalidState);

    // Table chunk, ADC constants, verify: the full calibration flow
    let mut table = vec![0u8, 0];
    for entry in 0u16..8 {
        table.extend_from_slice(&entry.to_le_bytes());
    }
    proc.feed(&encode_frame(Opcode::CalPtbl, &table));
    let rsp = drain_one(&mut proc, 64);
    assert_eq!(rsp.error, ErrorCode::Success);

    proc.feed(&encode_frame(Opcode::CalZmon, &[1, 2, 3, 4]));
    let rsp = drain_one(&mut proc, 64);
    assert_eq!(rsp.error, ErrorCode::Success);

    proc.feed(&encode_frame(Opcode::CalVfy, &[0]));
    let rsp = drain_one(&mut proc, 64);
    assert_eq!(rsp.error, ErrorCode::Success);
}

#[test]
fn test_pattern_branch_loops_until_abort() {
    let mut proc = ready_processor();

    // Word at 0, then a branch back to 0: an infinite loop
    let word = PatternWord {
        tick: 0,
        opcode: 0x10,
        data: [7; 8],
    };
    proc.feed(&encode_frame(Opcode::PatClk, &word.to_write_bytes()));
    proc.feed(&encode_frame(Opcode::Branch, &0u16.to_le_bytes()));
    proc.feed(&encode_frame(Opcode::PatCtl, &[PatternCtl::RUN]));
    for _ in 0..3 {
        let rsp = drain_one(&mut proc, 8);
        assert_eq!(rsp.error, ErrorCode::Success);
    }

    // Let it loop for a while; it must still be running
    for _ in 0..20 * SYS_CLKS_PER_PTN_CLK {
        proc.tick();
    }
    assert!(proc.state_snapshot().contains(StateFlags::PTN_BUSY));
    assert!(proc.stats().pattern_words_played > 1);

    proc.feed(&encode_frame(Opcode::PatCtl, &[PatternCtl::ABORT]));
    let rsp = drain_one(&mut proc, 4);
    assert_eq!(rsp.error, ErrorCode::Success);
    assert!(!proc.state_snapshot().contains(StateFlags::PTN_BUSY));
}

#[test]
fn test_pattern_override_redirects_start() {
    let mut proc = ready_processor();

    // Word at address 10, default start at 0 (END sentinel)
    proc.feed(&encode_frame(Opcode::PatAdr, &10u16.to_le_bytes()));
    let word = PatternWord {
        tick: 0,
        opcode: 0x10,
        data: [1; 8],
    };
    proc.feed(&encode_frame(Opcode::PatClk, &word.to_write_bytes()));

    // Channel 0 override points the start at address 10
    let mut ovrd = [0u8; 3];
    ovrd[1..3].copy_from_slice(&10u16.to_le_bytes());
    proc.feed(&encode_frame(Opcode::Ovrd, &ovrd));
    proc.feed(&encode_frame(Opcode::PatCtl, &[PatternCtl::RUN]));
    for _ in 0..4 {
        let rsp = drain_one(&mut proc, 8);
        assert_eq!(rsp.error, ErrorCode::Success);
    }

    // The word at 10 plays, then the END sentinel at 11 halts
    for _ in 0..8 * SYS_CLKS_PER_PTN_CLK {
        proc.tick();
        if !proc.state_snapshot().contains(StateFlags::PTN_BUSY) {
            break;
        }
    }
    assert!(!proc.state_snapshot().contains(StateFlags::PTN_BUSY));
    assert_eq!(proc.stats().pattern_words_played, 1);
}

#[test]
fn test_pattern_step_bypasses_tick_gate() {
    let mut proc = ready_processor();

    // A word far in the future; STEP forces it out immediately
    let word = PatternWord {
        tick: 100_000,
        opcode: 0x10,
        data: [9; 8],
    };
    proc.feed(&encode_frame(Opcode::PatClk, &word.to_write_bytes()));
    proc.feed(&encode_frame(Opcode::PatCtl, &[PatternCtl::STEP]));

    let rsp = drain_one(&mut proc, 8);
    assert_eq!(rsp.error, ErrorCode::Success);
    let rsp = drain_one(&mut proc, 8);
    assert_eq!(rsp.error, ErrorCode::Success);

    // The stepped word goes out over the bus
    for _ in 0..32 {
        proc.tick();
    }
    assert_eq!(proc.stats().pattern_words_played, 1);
}

#[test]
fn test_measurement_reflects_commanded_output() {
    let mut proc = ready_processor();

    // 20.0 dBm on channel 2, then measure channel 2
    proc.feed(&encode_frame(Opcode::Power, &[2, 0x00, 0x14]));
    let rsp = drain_one(&mut proc, 64);
    assert_eq!(rsp.error, ErrorCode::Success);

    proc.feed(&encode_frame(Opcode::Meas, &[2, 3]));
    let rsp = drain_one(&mut proc, 32);
    assert_eq!(rsp.error, ErrorCode::Success);
    assert_eq!(rsp.payload[0], 2);
    assert_eq!(rsp.payload[1], 3);
    let magnitude = u16::from_le_bytes([rsp.payload[2], rsp.payload[3]]);
    assert_eq!(magnitude, 0x1400);
}

#[test]
fn test_alarm_flow_end_to_end() {
    let mut proc = ready_processor();

    // Enable over-power and PLL-unlock monitoring
    let mask = AlarmId::OverPower.bit() | AlarmId::PllUnlock.bit();
    proc.feed(&encode_frame(Opcode::Alarms, &[0, mask]));
    let rsp = drain_one(&mut proc, 4);
    assert_eq!(rsp.error, ErrorCode::Success);

    // Over-power trips and clears; over-temperature trips but is not enabled
    proc.set_alarm_readings(AlarmId::OverPower.bit() | AlarmId::OverTemperature.bit());
    proc.tick();
    proc.set_alarm_readings(0);
    proc.tick();

    proc.feed(&encode_frame(Opcode::Status, &[]));
    let rsp = drain_one(&mut proc, 4);
    assert_eq!(rsp.alarms.enable, mask);
    assert_eq!(rsp.alarms.read, 0);
    assert_eq!(rsp.alarms.latch, AlarmId::OverPower.bit());

    // Clearing one latch leaves the others alone
    proc.feed(&encode_frame(Opcode::Alarms, &[1, AlarmId::OverPower.bit()]));
    let rsp = drain_one(&mut proc, 4);
    assert_eq!(rsp.alarms.latch, 0);
}

#[test]
fn test_response_ordering_under_mixed_latency() {
    let mut proc = ready_processor();

    // Slow command, then two fast ones; responses keep acceptance order
    let mut wire = encode_frame(Opcode::Freq, &2_450_000_000u32.to_le_bytes());
    wire.extend_from_slice(&encode_frame(Opcode::Status, &[]));
    wire.extend_from_slice(&encode_frame(Opcode::ZmSize, &256u16.to_le_bytes()));
    proc.feed(&wire);

    let rsp = drain_one(&mut proc, 64);
    assert_eq!(rsp.opcode, Opcode::Freq.as_u8());
    let rsp = drain_one(&mut proc, 4);
    assert_eq!(rsp.opcode, Opcode::Status.as_u8());
    let rsp = drain_one(&mut proc, 4);
    assert_eq!(rsp.opcode, Opcode::ZmSize.as_u8());
}

#[test]
fn test_length_negotiation_end_to_end() {
    let mut proc = ready_processor();
    assert_eq!(proc.response_version(), ResponseVersion::Rev2);

    proc.feed(&encode_frame(Opcode::Length, &26u16.to_le_bytes()));
    let bytes = proc.take_response().unwrap();
    assert_eq!(bytes.len(), 26);

    // Every subsequent response is 26 bytes
    proc.feed(&encode_frame(Opcode::Status, &[]));
    let bytes = proc.take_response().unwrap();
    assert_eq!(bytes.len(), 26);
    let rsp = StatusResponse::decode(&bytes, ResponseVersion::Rev1).unwrap();
    assert_eq!(rsp.error, ErrorCode::Success);

    // And back up to the extended size
    proc.feed(&encode_frame(Opcode::Length, &48u16.to_le_bytes()));
    let bytes = proc.take_response().unwrap();
    assert_eq!(bytes.len(), 48);
}

#[test]
fn test_reset_fails_outstanding_commands() {
    let mut proc = ready_processor();

    // FREQ is in flight when RESET arrives
    proc.feed(&encode_frame(Opcode::Freq, &2_450_000_000u32.to_le_bytes()));
    proc.feed(&encode_frame(Opcode::Reset, &[]));

    // The killed command still gets its response, in order
    let rsp = drain_one(&mut proc, 4);
    assert_eq!(rsp.opcode, Opcode::Freq.as_u8());
    assert_eq!(rsp.error, ErrorCode::InvalidState);
    let rsp = drain_one(&mut proc, 4);
    assert_eq!(rsp.opcode, Opcode::Reset.as_u8());
    assert_eq!(rsp.error, ErrorCode::Success);

    assert!(!proc.state_snapshot().intersects(StateFlags::FRQ_BUSY));
    assert!(proc.state_snapshot().contains(StateFlags::INITIALIZING));
}

//! End-to-end tests of the session against the simulated bootloader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ccpflash::protocol::packet::DEFAULT_HOST_ID;
use ccpflash::{
    AddressExtension, ChannelTransport, CommandCode, DownloadPlan, DownloadStep, Error, Frame,
    Handler, HandlerConfig, HandlerState, Packet, Password, Session, SimTransport,
    SimulatedTarget, Transport, crc16, decode, encode_command,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sim_session(memory: usize) -> Session<SimTransport> {
    Session::new(
        SimTransport::new(SimulatedTarget::new(0, memory)),
        HandlerConfig::default(),
    )
}

/// Host commands sent so far, as (code, payload).
fn sent_commands(session: &Session<SimTransport>) -> Vec<(CommandCode, [u8; 6])> {
    session
        .transport()
        .sent()
        .iter()
        .map(|frame| match decode(frame).unwrap() {
            Packet::Command(command) => (command.code, command.payload),
            Packet::Reply(_) => panic!("host sent a reply"),
        })
        .collect()
}

/// Expected wire payload of a download step, as the codec lays it out.
fn step_frame(step: &DownloadStep, counter: u8) -> Frame {
    let (code, payload) = match step {
        DownloadStep::SetMta { extension, address } => (
            CommandCode::SetMta,
            ccpflash::protocol::packet::payload::set_mta(*extension, *address),
        ),
        DownloadStep::Download(data) => (
            CommandCode::Download,
            ccpflash::protocol::packet::payload::download(data),
        ),
        DownloadStep::Download6(data) => (CommandCode::Download6, data.to_vec()),
        DownloadStep::BuildChecksum { checksum, length } => (
            CommandCode::BuildChecksum,
            ccpflash::protocol::packet::payload::build_checksum(*checksum, *length),
        ),
    };
    encode_command(DEFAULT_HOST_ID, code, counter, &payload).unwrap()
}

fn swapped(data: &[u8]) -> Vec<u8> {
    data.chunks(2)
        .flat_map(|pair| pair.iter().rev().copied())
        .collect()
}

#[test]
fn test_end_to_end_flash_sequence() {
    init_logger();
    let mut session = sim_session(4096);
    let data: Vec<u8> = (0x10..0x21).collect();
    assert_eq!(data.len(), 17);

    session.connect(0).unwrap();
    session.unlock(Password::DspFlash).unwrap();
    session.set_mta(AddressExtension::FlashMemory, 0x0000).unwrap();
    session.clear_memory().unwrap();
    let summary = session
        .download_block(AddressExtension::FlashMemory, 0x0000, &data, &mut |_, _| {})
        .unwrap();
    session.disconnect().unwrap();

    assert_eq!(session.state(), HandlerState::Idle);
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.batches, 1);

    let commands = sent_commands(&session);
    let codes: Vec<CommandCode> = commands.iter().map(|(code, _)| *code).collect();
    assert_eq!(codes, vec![
        CommandCode::Connect,
        CommandCode::Unlock,
        CommandCode::SetMta,
        CommandCode::ClearMemory,
        CommandCode::SetMta,
        CommandCode::Download6,
        CommandCode::Download6,
        CommandCode::Download6,
        CommandCode::BuildChecksum,
        CommandCode::Disconnect,
    ]);

    let checksums: Vec<&[u8; 6]> = commands
        .iter()
        .filter(|(code, _)| *code == CommandCode::BuildChecksum)
        .map(|(_, payload)| payload)
        .collect();
    assert_eq!(checksums.len(), 1);
    let expected = crc16(&swapped(&data), None);
    let [l0, l1, l2, l3, c0, c1] = *checksums[0];
    assert_eq!(u32::from_be_bytes([l0, l1, l2, l3]), 17);
    assert_eq!(u16::from_be_bytes([c0, c1]), expected);
    assert_eq!(summary.continuous_checksum, expected);

    // counters run 0, 1, 2, ... across the whole session
    for (index, frame) in session.transport().sent().iter().enumerate() {
        assert_eq!(usize::from(frame.data[1]), index);
    }
}

#[test]
fn test_download_replays_plan_for_many_lengths() {
    init_logger();
    for length in [0usize, 1, 2, 5, 6, 7, 11, 29, 30, 31, 59, 61, 255, 1000, 4093] {
        let data: Vec<u8> = (0..length).map(|i| (i * 31 % 256) as u8).collect();

        let mut session = sim_session(8192);
        session.connect(0).unwrap();
        let before = session.transport().sent().len();
        let counter = session.handler().next_counter();

        session
            .download_block(AddressExtension::FlashMemory, 0x200, &data, &mut |_, _| {})
            .unwrap();

        let sent = &session.transport().sent()[before..];
        let plan: Vec<DownloadStep> = DownloadPlan::new(AddressExtension::FlashMemory, 0x200, &data)
            .unwrap()
            .collect();
        assert_eq!(sent.len(), plan.len(), "length {length}");
        for (i, (frame, step)) in sent.iter().zip(&plan).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let expected = step_frame(step, counter.wrapping_add(i as u8));
            assert_eq!(frame, &expected, "length {length}, step {i}");
        }

        // the device holds the swapped image
        let memory = session.transport().target().memory(AddressExtension::FlashMemory);
        assert_eq!(&memory[0x200..0x200 + length], swapped(&data).as_slice());
    }
}

#[test]
fn test_state_violation_set_mta_then_disconnect() {
    init_logger();
    let mut bus = SimTransport::new(SimulatedTarget::new(0, 64));
    let mut handler = Handler::default();

    handler.connect(&mut bus, 0).unwrap();
    let reply = bus.recv(Duration::ZERO).unwrap().unwrap();
    assert!(handler.receive(&reply).unwrap().unwrap().result.is_ok());

    handler
        .set_mta(&mut bus, AddressExtension::FlashMemory, 0x10)
        .unwrap();
    assert!(matches!(handler.disconnect(&mut bus), Err(Error::HandlerBusy)));

    // the set_mta reply never arrives; the handler stays in setting_mta
    let _ = bus.recv(Duration::ZERO).unwrap();
    let done = handler
        .check_timeout(Instant::now() + Duration::from_secs(1))
        .unwrap();
    assert!(done.result.unwrap_err().is_timeout());

    let sent = bus.sent().len();
    assert!(matches!(
        handler.disconnect(&mut bus),
        Err(Error::InvalidState {
            operation: CommandCode::Disconnect,
            state: HandlerState::SettingMta
        })
    ));
    assert_eq!(bus.sent().len(), sent);
}

#[test]
fn test_operation_after_failure_is_accepted() {
    init_logger();
    let mut session = sim_session(64);
    session.connect(0).unwrap();

    assert!(session.clear_memory().is_err());
    session.unlock(Password::DspFlash).unwrap();
    session.clear_memory().unwrap();
}

#[test]
fn test_upload_block_over_channel_transport() {
    init_logger();
    let (host, bus) = ChannelTransport::pair();
    let stop = Arc::new(AtomicBool::new(false));

    let content: Vec<u8> = (0..1234u32).map(|i| (i ^ 0x5A) as u8).collect();
    let mut target = SimulatedTarget::new(4, 4096);
    target
        .load(AddressExtension::DATA_LOGGER, 0x400, &content)
        .unwrap();

    let running = Arc::clone(&stop);
    let device = thread::spawn(move || {
        while !running.load(Ordering::Relaxed) {
            let Ok(Some(frame)) = bus.take(Duration::from_millis(5)) else {
                continue;
            };
            for reply in target.handle(&frame) {
                if bus.deliver(reply).is_err() {
                    return;
                }
            }
        }
    });

    let config = HandlerConfig::default().with_minimum_timeout(Duration::from_millis(500));
    let mut session = Session::new(host, config);
    session.connect(4).unwrap();
    let mut reports = 0;
    let data = session
        .upload_block(AddressExtension::DATA_LOGGER, 0x400, 1234, &mut |_, _| {
            reports += 1;
        })
        .unwrap();
    session.disconnect().unwrap();

    stop.store(true, Ordering::Relaxed);
    device.join().unwrap();

    assert_eq!(data, content);
    assert_eq!(reports, 5);
}

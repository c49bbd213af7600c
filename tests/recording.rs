use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use lab_console::serial::binary::{encode_record, MARKER_FAILED, MARKER_OK};
use lab_console::serial::{open_loopback, LinkEvent, ReadMode, RecordValidity, RecordingError, SerialLinkConfig};

fn binary_config() -> SerialLinkConfig {
    let mut config = SerialLinkConfig::new("COM5", 115200)
        .with_timeout(Duration::from_millis(50))
        .with_read_mode(ReadMode::BinaryDevice);
    config.max_signal_rate = 1000;
    config
}

fn next_record(rx: &mut broadcast::Receiver<LinkEvent>) -> lab_console::serial::BinaryRecord {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        match rx.try_recv() {
            Ok(LinkEvent::RecordReceived { record, .. }) => return record,
            Ok(_) | Err(broadcast::error::TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("event stream broken: {}", e),
        }
    }
    panic!("no record received");
}

#[test]
fn valid_and_corrupt_records_are_recorded_and_counted() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut rx) = broadcast::channel(64);
    let (transport, device) = open_loopback(binary_config(), tx).unwrap();
    let path = transport.start_recording(dir.path(), "run.txt", false).unwrap();
    assert_eq!(path, dir.path().join("run.txt"));

    device.inject(&encode_record(&[0x1234, 0x00ff], 0x0001));
    let ok = next_record(&mut rx);
    assert_eq!(ok.validity, RecordValidity::Ok);
    assert_eq!(ok.channels(), vec![0x1234, 0x00ff]);
    assert_eq!(&ok.hex_words()[..3], ["1234", "00ff", "0001"]);

    let mut corrupt = encode_record(&[0x1234, 0x00ff], 0x0001);
    let crc_hi = corrupt.len() - 2;
    corrupt[crc_hi] ^= 0x01;
    device.inject(&corrupt);
    let bad = next_record(&mut rx);
    assert_eq!(bad.validity, RecordValidity::FailedCrc);

    assert_eq!(transport.recording_failures(), 1);
    assert_eq!(transport.stop_recording().unwrap(), Some(path.clone()));
    transport.join();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 5, "{}", text);
    assert_eq!(lines[1], ok.to_line());
    assert!(lines[1].ends_with(MARKER_OK));
    assert!(lines[2].ends_with(MARKER_FAILED));
    assert_eq!(lines[4], "FatalError = 1");
}

#[test]
fn paused_recording_skips_records_and_failures() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut rx) = broadcast::channel(64);
    let (transport, device) = open_loopback(binary_config(), tx).unwrap();
    let path = transport.start_recording(dir.path(), "paused.txt", false).unwrap();

    transport.pause_recording();
    let mut corrupt = encode_record(&[7], 0);
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0x80;
    device.inject(&corrupt);
    assert_eq!(next_record(&mut rx).validity, RecordValidity::FailedCrc);
    assert_eq!(transport.recording_failures(), 0);

    // notes still go in while paused
    transport.append_to_recording("operator note\n").unwrap();

    transport.resume_recording();
    device.inject(&encode_record(&[8], 0));
    next_record(&mut rx);
    transport.stop_recording().unwrap();
    transport.join();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[1], "operator note");
    assert!(lines[2].ends_with(MARKER_OK));
    assert_eq!(lines.last().copied(), Some("FatalError = 0"));
}

#[test]
fn recording_requires_existing_directory_and_single_start() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, _rx) = broadcast::channel(8);
    let (transport, _device) = open_loopback(binary_config(), tx).unwrap();

    let missing = dir.path().join("nope");
    assert!(matches!(
        transport.start_recording(&missing, "x.txt", false),
        Err(RecordingError::MissingDirectory(_))
    ));

    transport.start_recording(dir.path(), "", true).unwrap();
    assert!(matches!(
        transport.start_recording(dir.path(), "again.txt", false),
        Err(RecordingError::AlreadyRecording(_))
    ));

    let path = transport.recording_path().unwrap();
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.ends_with("_COM5.txt"), "{}", name);
    transport.join();
}

#[test]
fn text_lines_are_recorded_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut rx) = broadcast::channel(64);
    let config = SerialLinkConfig::new("COM6", 9600).with_timeout(Duration::from_millis(50));
    let (transport, device) = open_loopback(config, tx).unwrap();
    let path = transport.start_recording(dir.path(), "lines.txt", false).unwrap();

    device.inject(b"v|PVBIN|1\n");
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Ok(LinkEvent::DataReceived { .. }) = rx.try_recv() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    transport.stop_recording().unwrap();
    transport.join();

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().nth(1), Some("v|PVBIN|1"));
}

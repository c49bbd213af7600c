use lab_console::serial::protocol::{self, FrameAssembler, NONE_PARAM};
use lab_console::DeviceCommand;

#[test]
fn setpoint_frame_matches_firmware_contract() {
    let frame = protocol::encode("s", &["PSET", "300000"]);
    assert_eq!(frame, "<s|PSET|300000|X>");
    assert_eq!(protocol::decode(&frame).as_deref(), Some("s|PSET|300000|"));

    let command = DeviceCommand::set_point(300_000.0);
    assert_eq!(command.wire(), frame);
    assert_eq!(command.ack_key().as_deref(), Some("PSET"));
}

#[test]
fn emergency_stop_frame() {
    assert_eq!(DeviceCommand::EmergencyStop.wire(), "<s|ES|E>");
    assert_eq!(DeviceCommand::EmergencyStop.ack_key(), None);
}

#[test]
fn decoded_payload_walks_with_next_param() {
    let text = format!("junk{}tail", protocol::encode("v", &["PVBIN", "250000"]));
    let payload = protocol::decode(&text).unwrap();

    let (tag, rest) = protocol::next_param(&payload);
    let (name, rest) = protocol::next_param(rest);
    let (value, rest) = protocol::next_param(rest);
    assert_eq!((tag, name, value), ("v", "PVBIN", "250000"));
    assert_eq!(protocol::next_param(rest).0, NONE_PARAM);
}

#[test]
fn checksum_mismatch_is_rejected() {
    let frame = protocol::encode("s", &["PSET", "300000"]);
    let tampered = frame.replace("300000", "300001");
    assert_eq!(protocol::decode(&tampered), None);
    assert!(protocol::frame_available(&tampered));
}

#[test]
fn end_marker_before_start_is_not_a_frame() {
    assert!(!protocol::frame_available(">x<"));
    assert_eq!(protocol::decode(">s|ES|E<"), None);
}

#[test]
fn several_frames_in_one_read() {
    let text = format!(
        "{}\r\n{}\r\n{}",
        protocol::encode("r", &["PSET"]),
        "<r|KAL|A>",
        protocol::encode("v", &["MD", "left"])
    );
    // the middle frame carries a wrong checksum
    assert_eq!(protocol::decode_all(&text), vec!["r|PSET|", "v|MD|left|"]);
}

#[test]
fn assembler_joins_a_frame_split_three_ways() {
    let frame = protocol::encode("r", &["APSET"]);
    let mut assembler = FrameAssembler::default();
    assert!(assembler.push(&frame[..3]).is_empty());
    assert!(assembler.push(&frame[3..6]).is_empty());
    assert_eq!(assembler.push(&format!("{}\r\n", &frame[6..])), vec!["r|APSET|"]);
    assert!(assembler.pending().is_empty());
}

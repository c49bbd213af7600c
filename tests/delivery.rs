use std::time::{Duration, Instant};

use lab_console::delivery::{DeliveryEvent, DeliveryMachine, DeliveryState, DeliveryTimings, DeviceCommand};
use lab_console::Target;

fn machine() -> DeliveryMachine {
    DeliveryMachine::new(Target::port("COM1"), DeliveryTimings::default())
}

fn transmits(events: &[DeliveryEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, DeliveryEvent::Transmit { .. }))
        .count()
}

#[test]
fn rapid_sends_keep_one_in_flight_and_the_latest_queued() {
    let t0 = Instant::now();
    let mut machine = machine();

    let mut ids = Vec::new();
    let mut events = Vec::new();
    for value in [100.0, 200.0, 300.0, 400.0, 500.0] {
        let (id, evs) = machine.send_command(&DeviceCommand::set_point(value), t0).unwrap();
        ids.push(id);
        events.extend(evs);
    }

    assert_eq!(transmits(&events), 1);
    assert_eq!(machine.in_flight(), Some(ids[0]));
    assert_eq!(machine.queued(), Some(ids[4]));
    let superseded: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            DeliveryEvent::Superseded { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(superseded, ids[1..4].to_vec());

    // ack of the first releases the latest
    let events = machine.on_ack("PSET", t0 + Duration::from_millis(50));
    assert!(matches!(&events[0], DeliveryEvent::Delivered { id, .. } if *id == ids[0]));
    match &events[1] {
        DeliveryEvent::Transmit { id, wire, .. } => {
            assert_eq!(*id, ids[4]);
            assert_eq!(wire, &DeviceCommand::set_point(500.0).wire());
        }
        other => panic!("expected transmit, got {:?}", other),
    }
    assert_eq!(machine.queued(), None);
}

#[test]
fn unacknowledged_command_is_resent_then_fails() {
    let t0 = Instant::now();
    let mut machine = machine();
    let (first, _) = machine.send_command(&DeviceCommand::Calibrate, t0).unwrap();
    let (second, _) = machine.send_command(&DeviceCommand::set_point(1.0), t0).unwrap();

    let mut resends = 0;
    let mut now = t0;
    let mut last = Vec::new();
    while machine.state() != DeliveryState::Free {
        now = machine.next_deadline().unwrap();
        last = machine.poll(now);
        resends += transmits(&last);
    }

    // 2025 ms resend period inside an 11 s failure window
    assert_eq!(resends, 5);
    assert_eq!(now - t0, Duration::from_millis(11_000));
    assert!(matches!(&last[0], DeliveryEvent::Failed { id, ack_key, .. } if *id == first && ack_key == "KAL"));
    assert!(matches!(&last[1], DeliveryEvent::Dropped { id, .. } if *id == second));
    assert_eq!(machine.in_flight(), None);
    assert_eq!(machine.queued(), None);
    assert_eq!(machine.next_deadline(), None);
}

#[test]
fn late_ack_after_failure_is_ignored() {
    let t0 = Instant::now();
    let mut machine = DeliveryMachine::new(
        Target::All,
        DeliveryTimings {
            resend: Duration::from_millis(10),
            failure: Duration::from_millis(30),
        },
    );
    machine.send_command(&DeviceCommand::set_point(5.0), t0).unwrap();
    let events = machine.poll(t0 + Duration::from_millis(30));
    assert!(events.iter().any(|e| matches!(e, DeliveryEvent::Failed { .. })));

    assert!(machine.on_ack("PSET", t0 + Duration::from_millis(31)).is_empty());
    assert!(machine.is_free());
}

#[test]
fn fire_and_forget_commands_bypass_the_machine() {
    let mut machine = machine();
    for command in [DeviceCommand::EmergencyStop, DeviceCommand::PressureUp, DeviceCommand::PressureDown] {
        assert!(machine.send_command(&command, Instant::now()).is_none());
    }
    assert!(machine.is_free());
}

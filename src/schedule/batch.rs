//! Sends a list of acknowledged commands one after another through a
//! target's delivery machine. The next command goes out only after the
//! previous one was acknowledged; any delivery failure ends the batch.
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::ScheduleError;
use crate::delivery::timer::Timer;
use crate::delivery::{CommandId, DeliveryEvent, DeliveryMachine, DeviceCommand};
use crate::serial::Target;

/// Command indices are 1-based
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Started { target: Target, count: usize },
    CommandSent { target: Target, index: usize, id: CommandId },
    CommandDelivered { target: Target, index: usize, ack_key: String },
    Finished { target: Target },
    Aborted { target: Target, index: usize, reason: String },
}

#[derive(Debug, Default)]
pub struct BatchOutput {
    pub events: Vec<BatchEvent>,
    pub delivery: Vec<DeliveryEvent>,
}

#[derive(Debug)]
pub struct CommandBatch {
    target: Target,
    free_poll_period: Duration,
    commands: Vec<DeviceCommand>,
    index: usize,
    running: bool,
    free_poll: Timer,
    ticket: Option<CommandId>,
}

impl CommandBatch {
    pub fn new(target: Target, free_poll_period: Duration) -> Self {
        Self {
            target,
            free_poll_period,
            commands: Vec::new(),
            index: 0,
            running: false,
            free_poll: Timer::default(),
            ticket: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current command, 1-based
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn start(&mut self, commands: Vec<DeviceCommand>, now: Instant) -> Result<Vec<BatchEvent>, ScheduleError> {
        if self.running {
            return Err(ScheduleError::AlreadyRunning);
        }
        if commands.is_empty() {
            return Err(ScheduleError::Empty);
        }
        if let Some(command) = commands.iter().find(|c| c.ack_key().is_none()) {
            return Err(ScheduleError::Unacknowledged(command.wire()));
        }
        log::info!("Sending {} commands to {} in sequence", commands.len(), self.target);

        self.commands = commands;
        self.index = 0;
        self.running = true;
        let mut events = vec![BatchEvent::Started {
            target: self.target.clone(),
            count: self.commands.len(),
        }];
        self.advance(now, &mut events);
        Ok(events)
    }

    pub fn stop(&mut self) {
        if self.running {
            log::info!("Command batch on {} stopped at {}", self.target, self.index);
        }
        self.free_poll.cancel();
        self.ticket = None;
        self.running = false;
    }

    fn advance(&mut self, now: Instant, events: &mut Vec<BatchEvent>) {
        self.index += 1;
        if self.index > self.commands.len() {
            self.index = self.commands.len();
            self.stop();
            events.push(BatchEvent::Finished {
                target: self.target.clone(),
            });
            return;
        }
        self.free_poll.start(now, Duration::ZERO);
    }

    /// Send the next command once the delivery machine is free
    pub fn poll(&mut self, now: Instant, delivery: &mut DeliveryMachine) -> BatchOutput {
        let mut out = BatchOutput::default();
        if !self.running || !self.free_poll.fired(now) {
            return out;
        }
        if !delivery.is_free() {
            self.free_poll.start(now, self.free_poll_period);
            return out;
        }

        let command = &self.commands[self.index - 1];
        match delivery.send_command(command, now) {
            Some((id, delivery_events)) => {
                log::debug!("Batch command {}/{} on {}: {:?}", self.index, self.commands.len(), self.target, command);
                self.ticket = Some(id);
                out.delivery.extend(delivery_events);
                out.events.push(BatchEvent::CommandSent {
                    target: self.target.clone(),
                    index: self.index,
                    id,
                });
            }
            None => self.abort("command has no acknowledgement key".into(), &mut out.events),
        }
        out
    }

    /// React to the outcome of the command this batch sent last
    pub fn on_delivery_event(&mut self, event: &DeliveryEvent, now: Instant) -> Vec<BatchEvent> {
        let mut events = Vec::new();
        if !self.running || self.ticket != Some(event.id()) {
            return events;
        }

        match event {
            DeliveryEvent::Delivered { ack_key, .. } => {
                self.ticket = None;
                events.push(BatchEvent::CommandDelivered {
                    target: self.target.clone(),
                    index: self.index,
                    ack_key: ack_key.clone(),
                });
                self.advance(now, &mut events);
            }
            DeliveryEvent::Failed { ack_key, .. } => {
                self.abort(format!("{} was never acknowledged", ack_key), &mut events)
            }
            DeliveryEvent::Dropped { .. } => self.abort("command was dropped".into(), &mut events),
            DeliveryEvent::Superseded { .. } => self.abort("command was superseded".into(), &mut events),
            DeliveryEvent::Transmit { .. } | DeliveryEvent::Retrying { .. } => {}
        }
        events
    }

    fn abort(&mut self, reason: String, events: &mut Vec<BatchEvent>) {
        log::error!("Command batch on {} failed at {}: {}", self.target, self.index, reason);
        let index = self.index;
        self.stop();
        events.push(BatchEvent::Aborted {
            target: self.target.clone(),
            index,
            reason,
        });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.running {
            self.free_poll.deadline()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryTimings, MotorOptions};

    fn setup() -> (CommandBatch, DeliveryMachine) {
        let target = Target::port("COM1");
        (
            CommandBatch::new(target.clone(), Duration::from_millis(100)),
            DeliveryMachine::new(target, DeliveryTimings::default()),
        )
    }

    fn feed(batch: &mut CommandBatch, events: &[DeliveryEvent], now: Instant) -> Vec<BatchEvent> {
        events.iter().flat_map(|e| batch.on_delivery_event(e, now)).collect()
    }

    #[test]
    fn test_each_command_waits_for_the_previous_ack() {
        let t0 = Instant::now();
        let (mut batch, mut delivery) = setup();
        let commands = MotorOptions::default().commands();
        let count = commands.len();
        batch.start(commands, t0).unwrap();

        let mut acked = Vec::new();
        for _ in 0..count {
            let out = batch.poll(t0, &mut delivery);
            assert!(matches!(&out.delivery[..], [DeliveryEvent::Transmit { .. }]));
            // nothing else goes out until the ack
            assert!(batch.poll(t0, &mut delivery).delivery.is_empty());

            let key = match &out.events[..] {
                [BatchEvent::CommandSent { id, .. }] => {
                    assert_eq!(delivery.in_flight(), Some(*id));
                    delivery.in_flight_key().map(str::to_string).unwrap()
                }
                other => panic!("unexpected {:?}", other),
            };
            let delivered = delivery.on_ack(&key, t0);
            feed(&mut batch, &delivered, t0);
            acked.push(key);
        }

        assert_eq!(acked.first().map(String::as_str), Some("MST"));
        assert_eq!(acked.last().map(String::as_str), Some("MTI"));
        assert!(!batch.is_running());
        assert_eq!(batch.next_deadline(), None);
    }

    #[test]
    fn test_failure_aborts_the_rest() {
        let t0 = Instant::now();
        let (mut batch, mut delivery) = setup();
        batch.start(MotorOptions::default().commands(), t0).unwrap();
        batch.poll(t0, &mut delivery);
        let ack = delivery.on_ack("MST", t0);
        feed(&mut batch, &ack, t0);
        batch.poll(t0, &mut delivery);

        let failure = delivery.poll(t0 + Duration::from_secs(11));
        let events = feed(&mut batch, &failure, t0 + Duration::from_secs(11));
        assert!(matches!(&events[..], [BatchEvent::Aborted { index: 2, reason, .. }] if reason.contains("MSI")));
        assert!(!batch.is_running());
        assert!(batch.poll(t0 + Duration::from_secs(12), &mut delivery).delivery.is_empty());
    }

    #[test]
    fn test_rejects_unacknowledged_commands() {
        let (mut batch, _) = setup();
        let result = batch.start(vec![DeviceCommand::Calibrate, DeviceCommand::EmergencyStop], Instant::now());
        assert!(matches!(result, Err(ScheduleError::Unacknowledged(_))));
        assert!(matches!(batch.start(Vec::new(), Instant::now()), Err(ScheduleError::Empty)));
        assert!(!batch.is_running());
    }

    #[test]
    fn test_waits_while_target_is_busy() {
        let t0 = Instant::now();
        let (mut batch, mut delivery) = setup();
        delivery.send("<s|KAL|T>".into(), "KAL", t0);
        batch.start(vec![DeviceCommand::Calibrate], t0).unwrap();

        assert!(batch.poll(t0, &mut delivery).delivery.is_empty());
        assert_eq!(batch.next_deadline(), Some(t0 + Duration::from_millis(100)));
    }
}

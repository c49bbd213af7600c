//! Single-in-flight command delivery with resend and failure deadlines
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::command::{CommandId, DeviceCommand};
use super::timer::{earliest, Timer};
use crate::serial::Target;

pub const DEFAULT_RESEND: Duration = Duration::from_millis(2025);
pub const DEFAULT_FAILURE: Duration = Duration::from_millis(11_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTimings {
    /// Retransmit an unacknowledged frame after this long
    pub resend: Duration,
    /// Give up on the command entirely after this long
    pub failure: Duration,
}

impl Default for DeliveryTimings {
    fn default() -> Self {
        Self {
            resend: DEFAULT_RESEND,
            failure: DEFAULT_FAILURE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Free,
    Send,
    WaitForSending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// Write this frame to the target's links
    Transmit { target: Target, id: CommandId, wire: String },
    /// The ack did not arrive in time and the frame was sent again
    Retrying {
        target: Target,
        id: CommandId,
        ack_key: String,
        attempt: u32,
    },
    Delivered { target: Target, id: CommandId, ack_key: String },
    /// No ack before the failure deadline; the queued command is dropped too
    Failed { target: Target, id: CommandId, ack_key: String },
    /// A newer send replaced this command while it was queued
    Superseded { target: Target, id: CommandId },
    /// Queued command discarded because the one ahead of it failed
    Dropped { target: Target, id: CommandId },
}

impl DeliveryEvent {
    pub fn id(&self) -> CommandId {
        match self {
            DeliveryEvent::Transmit { id, .. }
            | DeliveryEvent::Retrying { id, .. }
            | DeliveryEvent::Delivered { id, .. }
            | DeliveryEvent::Failed { id, .. }
            | DeliveryEvent::Superseded { id, .. }
            | DeliveryEvent::Dropped { id, .. } => *id,
        }
    }

    pub fn target(&self) -> &Target {
        match self {
            DeliveryEvent::Transmit { target, .. }
            | DeliveryEvent::Retrying { target, .. }
            | DeliveryEvent::Delivered { target, .. }
            | DeliveryEvent::Failed { target, .. }
            | DeliveryEvent::Superseded { target, .. }
            | DeliveryEvent::Dropped { target, .. } => target,
        }
    }

    /// True for events after which the command is no longer tracked
    pub fn is_final(&self) -> bool {
        !matches!(self, DeliveryEvent::Transmit { .. } | DeliveryEvent::Retrying { .. })
    }
}

#[derive(Debug, Clone)]
struct PendingCommand {
    id: CommandId,
    wire: String,
    ack_key: String,
    attempts: u32,
}

/// Delivery state for one target: at most one command in flight and at most
/// one queued behind it.
///
/// Time is passed in explicitly; the owner calls [`poll`](Self::poll) at
/// [`next_deadline`](Self::next_deadline).
#[derive(Debug)]
pub struct DeliveryMachine {
    target: Target,
    timings: DeliveryTimings,
    state: DeliveryState,
    in_flight: Option<PendingCommand>,
    next: Option<PendingCommand>,
    resend: Timer,
    failure: Timer,
}

impl DeliveryMachine {
    pub fn new(target: Target, timings: DeliveryTimings) -> Self {
        Self {
            target,
            timings,
            state: DeliveryState::Free,
            in_flight: None,
            next: None,
            resend: Timer::default(),
            failure: Timer::default(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub fn is_free(&self) -> bool {
        self.state == DeliveryState::Free
    }

    pub fn in_flight(&self) -> Option<CommandId> {
        self.in_flight.as_ref().map(|p| p.id)
    }

    pub fn in_flight_key(&self) -> Option<&str> {
        self.in_flight.as_ref().map(|p| p.ack_key.as_str())
    }

    pub fn queued(&self) -> Option<CommandId> {
        self.next.as_ref().map(|p| p.id)
    }

    /// Accept a framed command. It goes out immediately when the target is
    /// free, otherwise it replaces whatever was queued.
    pub fn send(&mut self, wire: String, ack_key: impl Into<String>, now: Instant) -> (CommandId, Vec<DeliveryEvent>) {
        let pending = PendingCommand {
            id: CommandId::next(),
            wire,
            ack_key: ack_key.into(),
            attempts: 0,
        };
        let id = pending.id;
        let mut events = Vec::new();

        if self.is_free() {
            self.in_flight = Some(pending);
            self.state = DeliveryState::Send;
            self.transmit(now, &mut events);
        } else if let Some(old) = self.next.replace(pending) {
            log::debug!("{} on {} superseded by {}", old.id, self.target, id);
            events.push(DeliveryEvent::Superseded {
                target: self.target.clone(),
                id: old.id,
            });
        }
        (id, events)
    }

    /// Send a catalogue command. `None` for fire-and-forget commands, which
    /// do not go through the machine.
    pub fn send_command(&mut self, command: &DeviceCommand, now: Instant) -> Option<(CommandId, Vec<DeliveryEvent>)> {
        let ack_key = command.ack_key()?;
        Some(self.send(command.wire(), ack_key, now))
    }

    fn transmit(&mut self, now: Instant, events: &mut Vec<DeliveryEvent>) {
        let Some(pending) = self.in_flight.as_mut() else {
            self.state = DeliveryState::Free;
            return;
        };
        pending.attempts = 1;
        self.resend.start(now, self.timings.resend);
        self.failure.start(now, self.timings.failure);
        self.state = DeliveryState::WaitForSending;
        events.push(DeliveryEvent::Transmit {
            target: self.target.clone(),
            id: pending.id,
            wire: pending.wire.clone(),
        });
    }

    /// Handle `r|<key>` from the device. Keys other than the in-flight one
    /// are stale and ignored.
    pub fn on_ack(&mut self, key: &str, now: Instant) -> Vec<DeliveryEvent> {
        let mut events = Vec::new();
        if self.state != DeliveryState::WaitForSending || self.in_flight_key() != Some(key) {
            log::trace!("Ignoring ack '{}' on {}", key, self.target);
            return events;
        }

        self.resend.cancel();
        self.failure.cancel();
        if let Some(done) = self.in_flight.take() {
            events.push(DeliveryEvent::Delivered {
                target: self.target.clone(),
                id: done.id,
                ack_key: done.ack_key,
            });
        }
        self.state = DeliveryState::Free;

        if let Some(next) = self.next.take() {
            self.in_flight = Some(next);
            self.state = DeliveryState::Send;
            self.transmit(now, &mut events);
        }
        events
    }

    /// Fire due timers
    pub fn poll(&mut self, now: Instant) -> Vec<DeliveryEvent> {
        let mut events = Vec::new();

        if self.failure.fired(now) {
            self.resend.cancel();
            if let Some(failed) = self.in_flight.take() {
                log::error!(
                    "Command {} on {} failed: no '{}' ack after {} attempts",
                    failed.id,
                    self.target,
                    failed.ack_key,
                    failed.attempts
                );
                events.push(DeliveryEvent::Failed {
                    target: self.target.clone(),
                    id: failed.id,
                    ack_key: failed.ack_key,
                });
            }
            if let Some(dropped) = self.next.take() {
                events.push(DeliveryEvent::Dropped {
                    target: self.target.clone(),
                    id: dropped.id,
                });
            }
            self.state = DeliveryState::Free;
            return events;
        }

        if self.resend.fired(now) {
            if let Some(pending) = self.in_flight.as_mut() {
                pending.attempts += 1;
                log::warn!(
                    "No '{}' ack on {}, resending (attempt {})",
                    pending.ack_key,
                    self.target,
                    pending.attempts
                );
                events.push(DeliveryEvent::Retrying {
                    target: self.target.clone(),
                    id: pending.id,
                    ack_key: pending.ack_key.clone(),
                    attempt: pending.attempts,
                });
                events.push(DeliveryEvent::Transmit {
                    target: self.target.clone(),
                    id: pending.id,
                    wire: pending.wire.clone(),
                });
                self.resend.start(now, self.timings.resend);
            }
        }
        events
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([self.resend.deadline(), self.failure.deadline()])
    }

    /// Forget everything without reporting; used when the target goes away
    pub fn clear(&mut self) {
        self.resend.cancel();
        self.failure.cancel();
        self.in_flight = None;
        self.next = None;
        self.state = DeliveryState::Free;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> DeliveryMachine {
        DeliveryMachine::new(Target::port("COM1"), DeliveryTimings::default())
    }

    #[test]
    fn test_send_when_free_transmits() {
        let t0 = Instant::now();
        let mut m = machine();
        let (id, events) = m.send("<s|KAL|P>".into(), "KAL", t0);

        assert_eq!(m.state(), DeliveryState::WaitForSending);
        assert_eq!(m.in_flight(), Some(id));
        assert!(matches!(&events[..], [DeliveryEvent::Transmit { wire, .. }] if wire == "<s|KAL|P>"));
        assert_eq!(m.next_deadline(), Some(t0 + DEFAULT_RESEND));
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let t0 = Instant::now();
        let mut m = machine();
        m.send("a".into(), "PSET", t0);
        assert!(m.on_ack("KAL", t0).is_empty());
        assert_eq!(m.state(), DeliveryState::WaitForSending);
    }

    #[test]
    fn test_ack_while_free_is_ignored() {
        let mut m = machine();
        assert!(m.on_ack("PSET", Instant::now()).is_empty());
        assert!(m.is_free());
    }

    #[test]
    fn test_resend_then_failure() {
        let t0 = Instant::now();
        let mut m = machine();
        let (id, _) = m.send("a".into(), "PSET", t0);

        let events = m.poll(t0 + DEFAULT_RESEND);
        assert!(matches!(events[0], DeliveryEvent::Retrying { attempt: 2, .. }));
        assert!(matches!(events[1], DeliveryEvent::Transmit { .. }));

        let events = m.poll(t0 + DEFAULT_FAILURE);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DeliveryEvent::Failed { id: failed, .. } if failed == id));
        assert!(m.is_free());
        assert_eq!(m.next_deadline(), None);
    }

    #[test]
    fn test_ack_promotes_queued_command() {
        let t0 = Instant::now();
        let mut m = machine();
        let (first, _) = m.send("a".into(), "PSET", t0);
        let (second, events) = m.send("b".into(), "KAL", t0);
        assert!(events.is_empty());
        assert_eq!(m.queued(), Some(second));

        let t1 = t0 + Duration::from_millis(300);
        let events = m.on_ack("PSET", t1);
        assert!(matches!(events[0], DeliveryEvent::Delivered { id, .. } if id == first));
        assert!(matches!(&events[1], DeliveryEvent::Transmit { id, wire, .. } if *id == second && wire == "b"));
        assert_eq!(m.in_flight_key(), Some("KAL"));
        assert_eq!(m.queued(), None);
        // timers restart for the promoted command
        assert_eq!(m.next_deadline(), Some(t1 + DEFAULT_RESEND));
    }
}

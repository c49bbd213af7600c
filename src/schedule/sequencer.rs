//! Walks a target through setpoint steps, dwelling only after the device
//! acknowledged each new setpoint.
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::step::ScheduleStep;
use super::ScheduleError;
use crate::delivery::timer::{earliest, Timer};
use crate::delivery::{CommandId, DeliveryEvent, DeliveryMachine, DeviceCommand};
use crate::serial::Target;

pub const DEFAULT_FREE_POLL: Duration = Duration::from_millis(100);
pub const DEFAULT_PROGRESS_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerTimings {
    /// How often a waiting step checks whether the target became free
    pub free_poll: Duration,
    /// How often dwell progress is recomputed
    pub progress_tick: Duration,
}

impl Default for SequencerTimings {
    fn default() -> Self {
        Self {
            free_poll: DEFAULT_FREE_POLL,
            progress_tick: DEFAULT_PROGRESS_TICK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencerState {
    Stop,
    WaitForFree,
    Send,
    WaitForSending,
    Dwell,
}

/// Step indices are 1-based
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SequencerEvent {
    StepStarted { target: Target, index: usize, setpoint: f64 },
    SetpointSent { target: Target, index: usize, id: CommandId },
    DwellStarted { target: Target, index: usize, dwell: Duration },
    Progress { target: Target, index: usize, percent: u8 },
    StepCompleted { target: Target, index: usize },
    Finished { target: Target },
    Aborted { target: Target, index: usize, reason: String },
}

/// Output of one poll: sequencer notifications plus whatever the delivery
/// machine produced while the sequencer was sending through it
#[derive(Debug, Default)]
pub struct SequencerOutput {
    pub events: Vec<SequencerEvent>,
    pub delivery: Vec<DeliveryEvent>,
}

#[derive(Debug)]
pub struct Sequencer {
    target: Target,
    timings: SequencerTimings,
    steps: Vec<ScheduleStep>,
    index: usize,
    state: SequencerState,
    running: bool,
    free_poll: Timer,
    dwell: Timer,
    tick: Timer,
    dwell_started: Option<Instant>,
    ticket: Option<CommandId>,
}

impl Sequencer {
    pub fn new(target: Target, timings: SequencerTimings) -> Self {
        Self {
            target,
            timings,
            steps: Vec::new(),
            index: 0,
            state: SequencerState::Stop,
            running: false,
            free_poll: Timer::default(),
            dwell: Timer::default(),
            tick: Timer::default(),
            dwell_started: None,
            ticket: None,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current step, 1-based; 0 before the first start
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn steps(&self) -> &[ScheduleStep] {
        &self.steps
    }

    pub fn progress(&self) -> Vec<u8> {
        self.steps.iter().map(|s| s.progress).collect()
    }

    /// Replace the steps; only allowed while stopped
    pub fn set_steps(&mut self, steps: Vec<ScheduleStep>) -> Result<(), ScheduleError> {
        if self.running {
            return Err(ScheduleError::AlreadyRunning);
        }
        for step in &steps {
            step.validate()?;
        }
        self.steps = steps;
        self.index = 0;
        Ok(())
    }

    pub fn start(&mut self, now: Instant) -> Result<Vec<SequencerEvent>, ScheduleError> {
        if self.running {
            return Err(ScheduleError::AlreadyRunning);
        }
        if self.steps.is_empty() {
            return Err(ScheduleError::Empty);
        }
        log::info!("Starting {}-step schedule on {}", self.steps.len(), self.target);

        for step in &mut self.steps {
            step.progress = 0;
        }
        self.index = 0;
        self.running = true;
        self.state = SequencerState::Stop;

        let mut events = Vec::new();
        self.advance(now, &mut events);
        Ok(events)
    }

    /// Cancel every timer and stop where it is; progress is kept
    pub fn stop(&mut self) {
        if self.running {
            log::info!("Schedule on {} stopped at step {}", self.target, self.index);
        }
        self.free_poll.cancel();
        self.dwell.cancel();
        self.tick.cancel();
        self.dwell_started = None;
        self.ticket = None;
        self.state = SequencerState::Stop;
        self.running = false;
    }

    /// Stop and clear all progress
    pub fn reset(&mut self) {
        self.stop();
        self.index = 0;
        for step in &mut self.steps {
            step.progress = 0;
        }
    }

    fn advance(&mut self, now: Instant, events: &mut Vec<SequencerEvent>) {
        self.index += 1;

        if self.index > self.steps.len() {
            self.index = self.steps.len();
            if let Some(last) = self.steps.last_mut() {
                last.progress = 100;
            }
            self.running = false;
            self.stop();
            log::info!("Schedule on {} finished", self.target);
            events.push(SequencerEvent::Finished {
                target: self.target.clone(),
            });
            return;
        }

        for step in &mut self.steps[..self.index - 1] {
            step.progress = 100;
        }
        self.steps[self.index - 1].progress = 0;
        self.state = SequencerState::WaitForFree;
        // first check happens on the next poll
        self.free_poll.start(now, Duration::ZERO);
        events.push(SequencerEvent::StepStarted {
            target: self.target.clone(),
            index: self.index,
            setpoint: self.steps[self.index - 1].setpoint,
        });
    }

    /// Fire due timers. Sends go through `delivery`, whose events are
    /// returned alongside.
    pub fn poll(&mut self, now: Instant, delivery: &mut DeliveryMachine) -> SequencerOutput {
        let mut out = SequencerOutput::default();
        if !self.running {
            return out;
        }

        match self.state {
            SequencerState::WaitForFree => {
                if self.free_poll.fired(now) {
                    if delivery.is_free() {
                        self.state = SequencerState::Send;
                        self.send_setpoint(now, delivery, &mut out);
                    } else {
                        self.free_poll.start(now, self.timings.free_poll);
                    }
                }
            }
            SequencerState::Dwell => {
                if self.dwell.fired(now) {
                    self.tick.cancel();
                    self.dwell_started = None;
                    let step = &mut self.steps[self.index - 1];
                    if step.progress < 100 {
                        step.progress = 100;
                        out.events.push(SequencerEvent::Progress {
                            target: self.target.clone(),
                            index: self.index,
                            percent: 100,
                        });
                    }
                    out.events.push(SequencerEvent::StepCompleted {
                        target: self.target.clone(),
                        index: self.index,
                    });
                    self.state = SequencerState::Stop;
                    self.advance(now, &mut out.events);
                } else if self.tick.fired(now) {
                    self.update_progress(now, &mut out.events);
                    self.tick.start(now, self.timings.progress_tick);
                }
            }
            SequencerState::Stop | SequencerState::Send | SequencerState::WaitForSending => {}
        }
        out
    }

    fn send_setpoint(&mut self, now: Instant, delivery: &mut DeliveryMachine, out: &mut SequencerOutput) {
        let command = DeviceCommand::set_point(self.steps[self.index - 1].setpoint);
        match delivery.send_command(&command, now) {
            Some((id, delivery_events)) => {
                self.ticket = Some(id);
                self.state = SequencerState::WaitForSending;
                out.delivery.extend(delivery_events);
                out.events.push(SequencerEvent::SetpointSent {
                    target: self.target.clone(),
                    index: self.index,
                    id,
                });
            }
            None => self.abort("setpoint command has no acknowledgement key".into(), &mut out.events),
        }
    }

    fn update_progress(&mut self, now: Instant, events: &mut Vec<SequencerEvent>) {
        let Some(started) = self.dwell_started else {
            return;
        };
        let step = &mut self.steps[self.index - 1];
        let percent = step.progress_at(now.duration_since(started));
        if percent > step.progress {
            step.progress = percent;
            events.push(SequencerEvent::Progress {
                target: self.target.clone(),
                index: self.index,
                percent,
            });
        }
    }

    /// React to the outcome of the setpoint this sequencer sent. Events for
    /// other commands are ignored.
    pub fn on_delivery_event(&mut self, event: &DeliveryEvent, now: Instant) -> Vec<SequencerEvent> {
        let mut events = Vec::new();
        if self.state != SequencerState::WaitForSending || self.ticket != Some(event.id()) {
            return events;
        }

        match event {
            DeliveryEvent::Delivered { .. } => {
                self.ticket = None;
                self.enter_dwell(now, &mut events);
            }
            DeliveryEvent::Failed { .. } => self.abort("setpoint was never acknowledged".into(), &mut events),
            DeliveryEvent::Dropped { .. } => self.abort("setpoint was dropped".into(), &mut events),
            DeliveryEvent::Superseded { .. } => self.abort("setpoint was superseded".into(), &mut events),
            DeliveryEvent::Transmit { .. } | DeliveryEvent::Retrying { .. } => {}
        }
        events
    }

    fn enter_dwell(&mut self, now: Instant, events: &mut Vec<SequencerEvent>) {
        let dwell = self.steps[self.index - 1].dwell_duration();
        self.state = SequencerState::Dwell;
        self.dwell_started = Some(now);
        self.steps[self.index - 1].progress = 0;
        self.dwell.start(now, dwell);
        self.tick.start(now, self.timings.progress_tick);
        events.push(SequencerEvent::DwellStarted {
            target: self.target.clone(),
            index: self.index,
            dwell,
        });
    }

    fn abort(&mut self, reason: String, events: &mut Vec<SequencerEvent>) {
        log::error!("Schedule on {} aborted at step {}: {}", self.target, self.index, reason);
        let index = self.index;
        self.stop();
        events.push(SequencerEvent::Aborted {
            target: self.target.clone(),
            index,
            reason,
        });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        earliest([self.free_poll.deadline(), self.dwell.deadline(), self.tick.deadline()])
    }
}

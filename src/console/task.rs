//! Control task owning every delivery machine and sequencer
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::types::*;
use crate::config::TimingConfig;
use crate::delivery::timer::earliest;
use crate::delivery::{CommandId, DeliveryEvent, DeliveryMachine, DeviceCommand};
use crate::device::{LinkError, LinkManager};
use crate::schedule::{BatchEvent, CommandBatch, ScheduleStep, Sequencer, SequencerEvent};
use crate::serial::{LinkEvent, LinkId, Target};
use crate::telemetry::{InboundDecoder, InboundMessage};

#[derive(Clone)]
pub struct ConsoleHandle {
    requests_tx: mpsc::Sender<ConsoleRequest>,
    events_tx: broadcast::Sender<ConsoleEvent>,
    manager: Arc<LinkManager>,
}

impl ConsoleHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.events_tx.subscribe()
    }

    pub fn manager(&self) -> &Arc<LinkManager> {
        &self.manager
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ConsoleRequest) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests_tx.send(build(tx)).await.map_err(|_| ConsoleError::Closed)?;
        rx.await.map_err(|_| ConsoleError::Closed)
    }

    /// Queue a command for `target`. Returns the delivery ticket, or `None`
    /// for commands that are not acknowledged.
    pub async fn send_command(&self, target: Target, command: DeviceCommand) -> Result<Option<CommandId>> {
        self.request(|responder| ConsoleRequest::Send {
            target,
            command,
            responder,
        })
        .await?
    }

    pub async fn start_schedule(&self, target: Target, steps: Vec<ScheduleStep>) -> Result<()> {
        self.request(|responder| ConsoleRequest::StartSchedule {
            target,
            steps,
            responder,
        })
        .await?
    }

    /// Stop the schedule of `target`; `reset` also clears its progress
    pub async fn stop_schedule(&self, target: Target, reset: bool) -> Result<bool> {
        self.request(|responder| ConsoleRequest::StopSchedule {
            target,
            reset,
            responder,
        })
        .await
    }

    /// Send `commands` one after another, each only once the previous one
    /// was acknowledged. The batch stops at the first delivery failure.
    pub async fn start_batch(&self, target: Target, commands: Vec<DeviceCommand>) -> Result<()> {
        self.request(|responder| ConsoleRequest::StartBatch {
            target,
            commands,
            responder,
        })
        .await?
    }

    pub async fn stop_batch(&self, target: Target) -> Result<bool> {
        self.request(|responder| ConsoleRequest::StopBatch { target, responder })
            .await
    }

    pub async fn status(&self) -> Result<Vec<TargetStatus>> {
        self.request(|responder| ConsoleRequest::Status { responder }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.requests_tx.send(ConsoleRequest::Shutdown).await;
    }
}

pub struct ConsoleBuilder {
    pub manager: Arc<LinkManager>,
    pub timing: TimingConfig,
    pub event_capacity: usize,
    pub request_capacity: usize,
}

impl ConsoleBuilder {
    pub fn new(manager: Arc<LinkManager>) -> Self {
        Self {
            manager,
            timing: TimingConfig::default(),
            event_capacity: 1024,
            request_capacity: 64,
        }
    }

    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Spawn the control task on the current runtime
    pub fn build(self) -> (ConsoleHandle, JoinHandle<()>) {
        let (requests_tx, requests_rx) = mpsc::channel(self.request_capacity);
        let (events_tx, _events_rx) = broadcast::channel(self.event_capacity);
        let link_events = self.manager.subscribe();

        let control = ControlLoop {
            manager: self.manager.clone(),
            timing: self.timing,
            targets: HashMap::new(),
            decoders: HashMap::new(),
            events_tx: events_tx.clone(),
        };
        let task = tokio::spawn(control.run(requests_rx, link_events));

        let handle = ConsoleHandle {
            requests_tx,
            events_tx,
            manager: self.manager,
        };
        (handle, task)
    }
}

/// Delivery machine plus the drivers that send through it
struct TargetState {
    delivery: DeliveryMachine,
    sequencer: Sequencer,
    batch: CommandBatch,
}

struct ControlLoop {
    manager: Arc<LinkManager>,
    timing: TimingConfig,
    /// Keyed by canonical target
    targets: HashMap<Target, TargetState>,
    decoders: HashMap<LinkId, InboundDecoder>,
    events_tx: broadcast::Sender<ConsoleEvent>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<ConsoleRequest>,
        mut link_events: broadcast::Receiver<LinkEvent>,
    ) {
        use tokio::select;
        use tokio::time::sleep_until;

        log::info!("Console control task started");
        loop {
            let deadline = self.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            select! {
                request = requests.recv() => match request {
                    Some(ConsoleRequest::Shutdown) | None => break,
                    Some(request) => self.handle_request(request).await,
                },
                event = link_events.recv() => match event {
                    Ok(event) => self.handle_link_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Console fell behind, {} link events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = timer => self.poll(Instant::now()).await,
            }
        }

        for state in self.targets.values_mut() {
            state.sequencer.stop();
            state.batch.stop();
            state.delivery.clear();
        }
        log::info!("Console control task stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest(self.targets.values().flat_map(|state| {
            [
                state.delivery.next_deadline(),
                state.sequencer.next_deadline(),
                state.batch.next_deadline(),
            ]
        }))
    }

    fn publish(&self, event: ConsoleEvent) {
        let _ = self.events_tx.send(event);
    }

    fn target_state(&mut self, target: &Target) -> &mut TargetState {
        let timing = &self.timing;
        self.targets.entry(target.clone()).or_insert_with(|| TargetState {
            delivery: DeliveryMachine::new(target.clone(), timing.delivery()),
            sequencer: Sequencer::new(target.clone(), timing.sequencer()),
            batch: CommandBatch::new(target.clone(), timing.sequencer().free_poll),
        })
    }

    async fn ensure_open(&self, target: &Target) -> Result<()> {
        if self.manager.is_open(target).await {
            Ok(())
        } else {
            Err(ConsoleError::Link(LinkError::NotConnected(target.clone())))
        }
    }

    async fn handle_request(&mut self, request: ConsoleRequest) {
        match request {
            ConsoleRequest::Send {
                target,
                command,
                responder,
            } => {
                let result = self.send(&target.canonical(), command).await;
                let _ = responder.send(result);
            }
            ConsoleRequest::StartSchedule {
                target,
                steps,
                responder,
            } => {
                let result = self.start_schedule(&target.canonical(), steps).await;
                let _ = responder.send(result);
            }
            ConsoleRequest::StartBatch {
                target,
                commands,
                responder,
            } => {
                let result = self.start_batch(&target.canonical(), commands).await;
                let _ = responder.send(result);
            }
            ConsoleRequest::StopBatch { target, responder } => {
                let was_running = match self.targets.get_mut(&target.canonical()) {
                    Some(state) => {
                        let running = state.batch.is_running();
                        state.batch.stop();
                        running
                    }
                    None => false,
                };
                let _ = responder.send(was_running);
            }
            ConsoleRequest::StopSchedule {
                target,
                reset,
                responder,
            } => {
                let was_running = match self.targets.get_mut(&target.canonical()) {
                    Some(state) => {
                        let running = state.sequencer.is_running();
                        if reset {
                            state.sequencer.reset();
                        } else {
                            state.sequencer.stop();
                        }
                        running
                    }
                    None => false,
                };
                let _ = responder.send(was_running);
            }
            ConsoleRequest::Status { responder } => {
                let mut status: Vec<TargetStatus> = self
                    .targets
                    .iter()
                    .map(|(target, state)| TargetStatus {
                        target: target.clone(),
                        delivery: state.delivery.state(),
                        in_flight: state.delivery.in_flight(),
                        queued: state.delivery.queued(),
                        sequencer: state.sequencer.state(),
                        step: state.sequencer.index(),
                        progress: state.sequencer.progress(),
                        batch_running: state.batch.is_running(),
                    })
                    .collect();
                status.sort_by_key(|s| s.target.to_string());
                let _ = responder.send(status);
            }
            ConsoleRequest::Shutdown => {}
        }
    }

    async fn send(&mut self, target: &Target, command: DeviceCommand) -> Result<Option<CommandId>> {
        self.ensure_open(target).await?;

        if command.ack_key().is_none() {
            log::info!("Sending {:?} to {} without acknowledgement", command, target);
            self.manager.write_frame(target, &command.wire()).await?;
            return Ok(None);
        }

        let now = Instant::now();
        let Some((id, events)) = self.target_state(target).delivery.send_command(&command, now) else {
            return Ok(None);
        };
        log::debug!("Command {} queued for {}: {:?}", id, target, command);
        self.dispatch_delivery(events, now).await;
        Ok(Some(id))
    }

    async fn start_schedule(&mut self, target: &Target, steps: Vec<ScheduleStep>) -> Result<()> {
        self.ensure_open(target).await?;
        let now = Instant::now();
        let sequencer = &mut self.target_state(target).sequencer;
        sequencer.set_steps(steps)?;
        let events = sequencer.start(now)?;
        for event in events {
            self.publish(ConsoleEvent::Sequencer(event));
        }
        Ok(())
    }

    async fn start_batch(&mut self, target: &Target, commands: Vec<DeviceCommand>) -> Result<()> {
        self.ensure_open(target).await?;
        let events = self.target_state(target).batch.start(commands, Instant::now())?;
        for event in events {
            self.publish(ConsoleEvent::Batch(event));
        }
        Ok(())
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        let messages = match &event {
            LinkEvent::DataReceived { link, data } => {
                let buffered = self.timing.buffer_partial_frames;
                self.decoders
                    .entry(link.clone())
                    .or_insert_with(|| InboundDecoder::new(buffered))
                    .feed(data)
            }
            LinkEvent::Disconnected { link, .. } => {
                self.decoders.remove(link);
                Vec::new()
            }
            _ => Vec::new(),
        };
        let link = event.link().clone();
        self.publish(ConsoleEvent::Link(event));

        for message in messages {
            if let InboundMessage::Ack { key } = &message {
                self.route_ack(&link, key).await;
            }
            self.publish(ConsoleEvent::Telemetry {
                link: link.clone(),
                message,
            });
        }
    }

    /// An ack from one link completes the in-flight command of every
    /// target that addresses that link
    async fn route_ack(&mut self, link: &LinkId, key: &str) {
        let now = Instant::now();
        let targets: Vec<Target> = self
            .targets
            .keys()
            .filter(|target| target.matches(link))
            .cloned()
            .collect();
        for target in targets {
            let events = match self.targets.get_mut(&target) {
                Some(state) => state.delivery.on_ack(key, now),
                None => continue,
            };
            self.dispatch_delivery(events, now).await;
        }
    }

    async fn poll(&mut self, now: Instant) {
        let targets: Vec<Target> = self.targets.keys().cloned().collect();
        for target in targets {
            let Some(state) = self.targets.get_mut(&target) else {
                continue;
            };
            let delivery_events = state.delivery.poll(now);
            self.dispatch_delivery(delivery_events, now).await;

            let Some(state) = self.targets.get_mut(&target) else {
                continue;
            };
            let output = state.sequencer.poll(now, &mut state.delivery);
            for event in output.events {
                self.publish(ConsoleEvent::Sequencer(event));
            }
            self.dispatch_delivery(output.delivery, now).await;

            let Some(state) = self.targets.get_mut(&target) else {
                continue;
            };
            let output = state.batch.poll(now, &mut state.delivery);
            for event in output.events {
                self.publish(ConsoleEvent::Batch(event));
            }
            self.dispatch_delivery(output.delivery, now).await;
        }
    }

    /// Write transmissions, let the sequencer and batch of the target
    /// observe outcomes and publish everything
    async fn dispatch_delivery(&mut self, events: Vec<DeliveryEvent>, now: Instant) {
        for event in events {
            if let DeliveryEvent::Transmit { target, wire, .. } = &event {
                if let Err(e) = self.manager.write_frame(target, wire).await {
                    // the resend and failure timers keep running
                    log::warn!("Transmit to {} failed: {}", target, e);
                }
            }

            let (sequencer_events, batch_events): (Vec<SequencerEvent>, Vec<BatchEvent>) =
                match self.targets.get_mut(event.target()) {
                    Some(state) => (
                        state.sequencer.on_delivery_event(&event, now),
                        state.batch.on_delivery_event(&event, now),
                    ),
                    None => (Vec::new(), Vec::new()),
                };
            self.publish(ConsoleEvent::Delivery(event));
            for sequencer_event in sequencer_events {
                self.publish(ConsoleEvent::Sequencer(sequencer_event));
            }
            for batch_event in batch_events {
                self.publish(ConsoleEvent::Batch(batch_event));
            }
        }
    }
}

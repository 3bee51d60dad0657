use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::protocol::{
    error::ModemError,
    mqtt::{InboundPublish, Message, MqttClient, QoS},
};

/// Publish attempts for errors that say "try again".
const PUBLISH_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
    /// How long the worker waits on the outbound queue before polling inbound.
    pub poll_interval: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 32,
            inbound_capacity: 64,
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
enum PumpControl {
    Stop,
}

/// Result of one outbound message, reported on [`MessagePump::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEvent {
    Delivered(u16),
    Failed(ModemError),
}

/// Bridges the MQTT client to the layers above through bounded queues.
///
/// A worker thread publishes everything sent on [`outbound`](Self::outbound)
/// and forwards inbound deliveries to [`inbound`](Self::inbound).
pub struct MessagePump {
    outbound: Sender<Message>,
    inbound: Receiver<InboundPublish>,
    events: Receiver<PumpEvent>,
    control: Sender<PumpControl>,
    worker: Option<JoinHandle<()>>,
}

impl MessagePump {
    pub fn start(mqtt: Arc<MqttClient>, config: PumpConfig) -> Result<Self> {
        let (outbound_tx, outbound_rx) = flume::bounded(config.outbound_capacity);
        let (inbound_tx, inbound_rx) = flume::bounded(config.inbound_capacity);
        let (events_tx, events_rx) = flume::unbounded();
        let (control_tx, control_rx) = flume::unbounded();

        let worker = thread::Builder::new()
            .name("atmux-pump".into())
            .spawn(move || {
                run_pump(
                    &mqtt,
                    &control_rx,
                    &outbound_rx,
                    &inbound_tx,
                    &events_tx,
                    config.poll_interval,
                )
            })
            .context("Failed to spawn message pump thread")?;

        Ok(Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
            events: events_rx,
            control: control_tx,
            worker: Some(worker),
        })
    }

    pub fn outbound(&self) -> &Sender<Message> {
        &self.outbound
    }

    pub fn inbound(&self) -> &Receiver<InboundPublish> {
        &self.inbound
    }

    pub fn events(&self) -> &Receiver<PumpEvent> {
        &self.events
    }

    /// Stop the worker after the message in flight, if any.
    pub fn stop(&mut self) {
        let _ = self.control.send(PumpControl::Stop);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Message pump thread panicked");
            }
        }
    }
}

impl Drop for MessagePump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_pump(
    mqtt: &MqttClient,
    control: &Receiver<PumpControl>,
    outbound: &Receiver<Message>,
    inbound: &Sender<InboundPublish>,
    events: &Sender<PumpEvent>,
    poll_interval: Duration,
) {
    log::info!("Message pump started on socket {}", mqtt.socket());
    loop {
        match control.try_recv() {
            Ok(PumpControl::Stop) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        while let Some(publish) = mqtt.poll_inbound() {
            match inbound.try_send(publish) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    log::warn!(
                        "Inbound queue full, dropping message {} on {}",
                        dropped.msg_id,
                        dropped.topic
                    );
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }

        match outbound.recv_timeout(poll_interval) {
            Ok(message) => {
                let event = match publish(mqtt, message) {
                    Ok(msg_id) => PumpEvent::Delivered(msg_id),
                    Err(err) => {
                        log::warn!("Publish failed: {err}");
                        PumpEvent::Failed(err)
                    }
                };
                let _ = events.send(event);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::info!("Message pump stopped");
}

/// Assign a message id when the producer left it unset, then publish with a
/// short retry on retryable errors.
fn publish(mqtt: &MqttClient, mut message: Message) -> Result<u16, ModemError> {
    if !message.has_msg_id() {
        let id = match message.qos()? {
            QoS::AtMostOnce => 0,
            _ => mqtt.next_msg_id(),
        };
        message.set_msg_id(id);
    }
    let msg_id = message.msg_id()?;
    let mut attempt = 1;
    loop {
        match mqtt.publish(&message) {
            Ok(()) => return Ok(msg_id),
            Err(err) if err.is_retryable() && attempt < PUBLISH_ATTEMPTS => {
                log::warn!("Retrying publish of message {msg_id}: {err}");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc,
    },
    time::Duration,
};

use flume::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use super::{
    message::{InboundPublish, Message, QoS},
    session::BrokerSession,
};
use crate::{
    protocol::{
        codes::{ConnackCode, MqttOpenResult, MqttResult, MqttStatCode},
        device::{CommandLease, Correlation, DeviceController, RequestTag, SessionEvent},
        error::{ErrorKind, ModemError, Result},
        response::{Field, Grammar, ResponseFrame},
    },
    utils::Deadline,
};

/// Retransmission notices tolerated per request before giving up.
pub const RETRANSMIT_CEILING: u32 = 3;
/// Largest payload `AT+QMTPUBEX` accepts.
pub const MAX_PAYLOAD: usize = 4096;
/// Granted-QoS value of a refused subscription.
const SUBSCRIPTION_REFUSED: i64 = 128;

const PUBLISH_PROMPT: &[u8] = b"> ";

const QMTOPEN: Grammar = Grammar::new("+QMTOPEN", &[Field::int("socket"), Field::int("result")]);
const QMTCONN: Grammar = Grammar::new(
    "+QMTCONN",
    &[
        Field::int("socket"),
        Field::int("result"),
        Field::int("ret_code").opt(),
    ],
);
const QMTCONN_STATE: Grammar = Grammar::new("+QMTCONN", &[Field::int("socket"), Field::int("state")]);
const QMTSUB: Grammar = Grammar::new(
    "+QMTSUB",
    &[
        Field::int("socket"),
        Field::int("msg_id"),
        Field::int("result"),
        Field::int("value").opt(),
    ],
);
const QMTUNS: Grammar = Grammar::new(
    "+QMTUNS",
    &[Field::int("socket"), Field::int("msg_id"), Field::int("result")],
);
const QMTPUB: Grammar = Grammar::new(
    "+QMTPUB",
    &[
        Field::int("socket"),
        Field::int("msg_id"),
        Field::int("result"),
        Field::int("value").opt(),
    ],
);
const QMTDISC: Grammar = Grammar::new("+QMTDISC", &[Field::int("socket"), Field::int("result")]);
const QMTCLOSE: Grammar = Grammar::new("+QMTCLOSE", &[Field::int("socket"), Field::int("result")]);

/// `+QMTCONN?` state of a connected session.
const STATE_CONNECTED: i64 = 3;

#[derive(Debug, Clone)]
pub struct MqttTiming {
    /// `OK` of configuration commands and of the command line preceding a result frame.
    pub command: Duration,
    pub open: Duration,
    pub connect: Duration,
    pub subscribe: Duration,
    pub publish: Duration,
    pub prompt: Duration,
    pub disconnect: Duration,
}

impl Default for MqttTiming {
    fn default() -> Self {
        Self {
            command: Duration::from_millis(800),
            open: Duration::from_secs(75),
            connect: Duration::from_secs(30),
            subscribe: Duration::from_secs(20),
            publish: Duration::from_secs(20),
            prompt: Duration::from_secs(5),
            disconnect: Duration::from_secs(30),
        }
    }
}

/// MQTT session driven through the modem's embedded client.
pub struct MqttClient {
    device: Arc<DeviceController>,
    session: BrokerSession,
    inbound: Receiver<SessionEvent>,
    pending: Mutex<VecDeque<InboundPublish>>,
    connected: AtomicBool,
    next_msg_id: AtomicU16,
    timing: MqttTiming,
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("socket", &self.session.socket)
            .field("host", &self.session.host)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MqttClient {
    /// Create a client and claim the session socket's notifications.
    pub fn new(device: Arc<DeviceController>, session: BrokerSession, timing: MqttTiming) -> Self {
        let inbound = device.router().attach(session.socket);
        Self {
            device,
            session,
            inbound,
            pending: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(false),
            next_msg_id: AtomicU16::new(0),
            timing,
        }
    }

    pub fn session(&self) -> &BrokerSession {
        &self.session
    }

    pub fn socket(&self) -> u8 {
        self.session.socket
    }

    /// Next non-zero message id, wrapping at 65535.
    pub fn next_msg_id(&self) -> u16 {
        loop {
            let id = self.next_msg_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Apply the session configuration: protocol level, keep-alive, TLS and
    /// a receive mode that carries the payload length.
    pub fn init(&self) -> Result<()> {
        self.session.validate()?;
        let s = self.session.socket;
        let mut commands = vec![
            format!("AT+QMTCFG=\"version\",{s},{}", self.session.version.level()),
            format!("AT+QMTCFG=\"keepalive\",{s},{}", self.session.keepalive_s),
            format!("AT+QMTCFG=\"session\",{s},{}", u8::from(self.session.clean_session)),
        ];
        commands.push(match self.session.ssl_context {
            Some(ctx) => format!("AT+QMTCFG=\"ssl\",{s},1,{ctx}"),
            None => format!("AT+QMTCFG=\"ssl\",{s},0"),
        });
        commands.push(format!("AT+QMTCFG=\"recv/mode\",{s},0,1"));

        let lease = self.device.lease()?;
        for command in &commands {
            lease.command(command, self.timing.command)?;
        }
        log::info!("MQTT socket {s} configured for {}:{}", self.session.host, self.session.port);
        Ok(())
    }

    /// Open the network socket, then send CONNECT.
    pub fn connect(&self) -> Result<()> {
        self.session.validate()?;
        let s = self.session.socket;
        let lease = self.device.lease()?;

        self.request(
            &lease,
            &format!("AT+QMTOPEN={s},\"{}\",{}", self.session.host, self.session.port),
        )?;
        let opened = self.device.wait_frame(
            lease.token(),
            &QMTOPEN,
            self.timing.open,
            self.device.correlate(QMTOPEN.label, s, None),
        )?;
        let code: i8 = opened.get("result")?;
        MqttOpenResult::try_from(code)
            .map_err(|_| ModemError::malformed(format!("+QMTOPEN result {code}")))?
            .into_result()?;

        let command = match (&self.session.username, &self.session.password) {
            (Some(user), Some(pass)) => {
                format!("AT+QMTCONN={s},\"{}\",\"{user}\",\"{pass}\"", self.session.client_id)
            }
            (Some(user), None) => format!("AT+QMTCONN={s},\"{}\",\"{user}\"", self.session.client_id),
            _ => format!("AT+QMTCONN={s},\"{}\"", self.session.client_id),
        };
        let tag = self.request(&lease, &command)?;
        let frame = self.await_ack(&lease, &QMTCONN, None, self.timing.connect, tag)?;
        if let Some(code) = frame.opt_int("ret_code")? {
            let code = u8::try_from(code)
                .ok()
                .and_then(|c| ConnackCode::try_from(c).ok())
                .ok_or_else(|| ModemError::malformed(format!("CONNACK code {code}")))?;
            code.into_result()?;
        }
        self.drain_events();
        self.connected.store(true, Ordering::SeqCst);
        log::info!("MQTT socket {s} connected as {}", self.session.client_id);
        Ok(())
    }

    /// Send DISCONNECT; close the socket when the broker side does not confirm.
    pub fn disconnect(&self) -> Result<()> {
        let s = self.session.socket;
        let lease = self.device.lease()?;
        self.connected.store(false, Ordering::SeqCst);

        let disconnected = self
            .request(&lease, &format!("AT+QMTDISC={s}"))
            .and_then(|_| {
                self.device.wait_frame(
                    lease.token(),
                    &QMTDISC,
                    self.timing.disconnect,
                    self.device.correlate(QMTDISC.label, s, None),
                )
            })
            .and_then(|frame| frame.int("result"));
        match disconnected {
            Ok(0) => {
                log::info!("MQTT socket {s} disconnected");
                Ok(())
            }
            other => {
                log::warn!("MQTT disconnect on socket {s} not confirmed ({other:?}), closing");
                self.request(&lease, &format!("AT+QMTCLOSE={s}"))?;
                let frame = self.device.wait_frame(
                    lease.token(),
                    &QMTCLOSE,
                    self.timing.disconnect,
                    self.device.correlate(QMTCLOSE.label, s, None),
                )?;
                match frame.int("result")? {
                    0 => Ok(()),
                    code => Err(ModemError::VendorRejected {
                        code: code.unsigned_abs() as u16,
                        kind: ErrorKind::DeviceFailure,
                    }),
                }
            }
        }
    }

    /// True when the local session is up and the modem reports it connected.
    pub fn is_connected(&self) -> Result<bool> {
        self.drain_events();
        if !self.connected.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let reply = self.device.lease()?.command("AT+QMTCONN?", self.timing.command)?;
        let up = reply
            .frames(&QMTCONN_STATE)?
            .iter()
            .any(|f| f.int("socket").ok() == Some(i64::from(self.session.socket))
                && f.int("state").ok() == Some(STATE_CONNECTED));
        if !up {
            log::warn!("Modem reports MQTT socket {} not connected", self.session.socket);
            self.connected.store(false, Ordering::SeqCst);
        }
        Ok(up)
    }

    pub fn subscribe(&self, messages: &[Message]) -> Result<()> {
        self.ensure_connected()?;
        let lease = self.device.lease()?;
        for message in messages {
            let msg_id = self.checked_id(message)?;
            let topic = message.topic()?.path(&self.session.topic_root);
            let qos = u8::from(message.qos()?);
            let tag = self.request(
                &lease,
                &format!("AT+QMTSUB={},{msg_id},\"{topic}\",{qos}", self.session.socket),
            )?;
            let frame = self.await_ack(&lease, &QMTSUB, Some(msg_id), self.timing.subscribe, tag)?;
            if frame.opt_int("value")? == Some(SUBSCRIPTION_REFUSED) {
                return Err(ModemError::VendorRejected {
                    code: SUBSCRIPTION_REFUSED as u16,
                    kind: ErrorKind::Rejected,
                });
            }
            log::info!("Subscribed to {topic} (qos {qos})");
        }
        Ok(())
    }

    pub fn unsubscribe(&self, messages: &[Message]) -> Result<()> {
        self.ensure_connected()?;
        let lease = self.device.lease()?;
        for message in messages {
            let msg_id = self.checked_id(message)?;
            let topic = message.topic()?.path(&self.session.topic_root);
            let tag = self.request(
                &lease,
                &format!("AT+QMTUNS={},{msg_id},\"{topic}\"", self.session.socket),
            )?;
            self.await_ack(&lease, &QMTUNS, Some(msg_id), self.timing.subscribe, tag)?;
            log::info!("Unsubscribed from {topic}");
        }
        Ok(())
    }

    /// Publish one message. The payload is streamed after the `> ` prompt.
    pub fn publish(&self, message: &Message) -> Result<()> {
        let socket = message.socket()?;
        if socket != self.session.socket {
            return Err(ModemError::invalid(format!(
                "message for socket {socket} published on socket {}",
                self.session.socket
            )));
        }
        let qos = message.qos()?;
        let msg_id = message.msg_id()?;
        match qos {
            QoS::AtMostOnce if msg_id != 0 => {
                return Err(ModemError::invalid("qos 0 message must use message id 0"))
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce if msg_id == 0 => {
                return Err(ModemError::invalid("qos 1/2 message needs a non-zero message id"))
            }
            _ => {}
        }
        let payload = message.payload()?;
        if payload.len() > MAX_PAYLOAD {
            return Err(ModemError::invalid(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD}",
                payload.len()
            )));
        }
        let topic = message.topic()?.path(&self.session.topic_root);
        let retain = u8::from(message.retain()?);
        self.ensure_connected()?;

        let lease = self.device.lease()?;
        let token = lease.token();
        let tag = lease.execute(&format!(
            "AT+QMTPUBEX={socket},{msg_id},{},{retain},\"{topic}\",{}",
            u8::from(qos),
            payload.len()
        ))?;
        self.device.wait_prompt(token, PUBLISH_PROMPT, self.timing.prompt)?;
        self.device.execute_payload(&payload, token)?;
        self.device.read_reply(token, self.timing.prompt)?;
        self.await_ack(&lease, &QMTPUB, Some(msg_id), self.timing.publish, tag)?;
        log::debug!("Published {} bytes to {topic} (msg {msg_id})", payload.len());
        Ok(())
    }

    /// Next buffered inbound publish, without blocking.
    pub fn poll_inbound(&self) -> Option<InboundPublish> {
        self.drain_events();
        self.pending.lock().pop_front()
    }

    /// Wait up to `timeout` for an inbound publish.
    pub fn recv_inbound_timeout(&self, timeout: Duration) -> Option<InboundPublish> {
        let deadline = Deadline::after(timeout);
        loop {
            if let Some(publish) = self.poll_inbound() {
                return Some(publish);
            }
            match self.inbound.recv_timeout(deadline.remaining()) {
                Ok(event) => self.on_event(event),
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn drain_events(&self) {
        for event in self.inbound.try_iter() {
            self.on_event(event);
        }
    }

    fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Received {
                msg_id,
                topic,
                payload,
            } => self.pending.lock().push_back(InboundPublish {
                socket: self.session.socket,
                msg_id,
                topic,
                payload,
            }),
            SessionEvent::StateChanged { code } => {
                let reason = MqttStatCode::try_from(code)
                    .map(|c| format!("{c:?}"))
                    .unwrap_or_else(|_| format!("code {code}"));
                log::warn!("MQTT socket {} lost its session: {reason}", self.session.socket);
                self.connected.store(false, Ordering::SeqCst);
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        self.drain_events();
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ModemError::NotConnected)
        }
    }

    fn checked_id(&self, message: &Message) -> Result<u16> {
        let socket = message.socket()?;
        if socket != self.session.socket {
            return Err(ModemError::invalid(format!("message for socket {socket}")));
        }
        match message.msg_id()? {
            0 => Err(ModemError::invalid("subscription needs a non-zero message id")),
            id => Ok(id),
        }
    }

    /// Write `command` and wait for its `OK`.
    fn request(&self, lease: &CommandLease<'_>, command: &str) -> Result<RequestTag> {
        let tag = lease.execute(command)?;
        self.device.read_reply(lease.token(), self.timing.command)?;
        Ok(tag)
    }

    /// Wait for the result frame of a request, riding out retransmission
    /// notices up to [`RETRANSMIT_CEILING`].
    fn await_ack(
        &self,
        lease: &CommandLease<'_>,
        grammar: &Grammar,
        msg_id: Option<u16>,
        timeout: Duration,
        tag: RequestTag,
    ) -> Result<ResponseFrame> {
        let socket = self.session.socket;
        let id = msg_id.map(u32::from);
        let deadline = Deadline::after(timeout);
        let mut notices = 0;
        loop {
            let waited = self.device.wait_frame(
                lease.token(),
                grammar,
                deadline.remaining(),
                self.device.correlate(grammar.label, socket, id),
            );
            let frame = match waited {
                Ok(frame) => frame,
                Err(ModemError::Timeout) => {
                    self.abandon(grammar, id, tag);
                    return Err(if notices > 0 {
                        ModemError::Uncertain
                    } else {
                        ModemError::Timeout
                    });
                }
                Err(e) => return Err(e),
            };
            let code: i8 = frame.get("result")?;
            match MqttResult::try_from(code) {
                Ok(MqttResult::Acknowledged) => return Ok(frame),
                Ok(MqttResult::Retransmitting) => {
                    notices += 1;
                    log::warn!(
                        "{tag} {} retransmitting ({notices}/{RETRANSMIT_CEILING})",
                        grammar.label
                    );
                    if notices >= RETRANSMIT_CEILING {
                        self.abandon(grammar, id, tag);
                        return Err(ModemError::RetriesExhausted { attempts: notices });
                    }
                }
                Ok(MqttResult::Failed) => {
                    return Err(ModemError::DeliveryFailed {
                        result: i32::from(code),
                    })
                }
                Err(_) => return Err(ModemError::malformed(format!("{} result {code}", grammar.label))),
            }
        }
    }

    fn abandon(&self, grammar: &Grammar, id: Option<u32>, tag: RequestTag) {
        if let Some(id) = id {
            self.device
                .abandon(Correlation::new(grammar.label, self.session.socket, id), tag);
        }
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.device.router().detach(self.session.socket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        device::{ConnectParams, DeviceTiming},
        hal::mock::{MockPin, MockStatusLine, ScriptedModem},
        transport::{TransportConfig, TransportProcessor},
    };
    use crate::protocol::mqtt::message::Topic;

    fn quick() -> MqttTiming {
        MqttTiming {
            command: Duration::from_millis(200),
            open: Duration::from_millis(300),
            connect: Duration::from_millis(300),
            subscribe: Duration::from_millis(300),
            publish: Duration::from_millis(150),
            prompt: Duration::from_millis(200),
            disconnect: Duration::from_millis(300),
        }
    }

    fn online(modem: &ScriptedModem) -> Arc<DeviceController> {
        let transport = Arc::new(TransportProcessor::new(
            Box::new(modem.clone()),
            TransportConfig {
                poll_interval: Duration::from_millis(1),
                ..TransportConfig::default()
            },
        ));
        let device = Arc::new(DeviceController::new(
            transport,
            Box::new(MockPin::new()),
            Arc::new(MockStatusLine::new(true)),
            DeviceTiming {
                boot_timeout: Duration::from_millis(20),
                command_timeout: Duration::from_millis(200),
                poll: Duration::from_millis(1),
                ..DeviceTiming::default()
            },
        ));
        device.init().unwrap();
        device.config(ConnectParams::new("iot")).unwrap();
        device.connect().unwrap();
        device
    }

    fn connected(modem: &ScriptedModem) -> (Arc<DeviceController>, MqttClient) {
        modem
            .on("AT+QMTOPEN=", "\r\nOK\r\n\r\n+QMTOPEN: 0,0\r\n")
            .on("AT+QMTCONN=", "\r\nOK\r\n\r\n+QMTCONN: 0,0,0\r\n");
        let device = online(modem);
        let client = MqttClient::new(
            Arc::clone(&device),
            BrokerSession::new("broker.local", 1883, "gw-1"),
            quick(),
        );
        client.connect().unwrap();
        (device, client)
    }

    fn telemetry(msg_id: u16) -> Message {
        Message::new()
            .with_socket(0)
            .with_msg_id(msg_id)
            .with_qos(QoS::AtLeastOnce)
            .with_retain(false)
            .with_topic(Topic::Telemetry)
            .with_payload(&b"{\"t\":21}"[..])
    }

    #[test]
    fn test_init_configures_session() {
        let modem = ScriptedModem::online();
        let device = online(&modem);
        let client = MqttClient::new(
            Arc::clone(&device),
            BrokerSession::new("broker.local", 8883, "gw-1").with_ssl_context(2),
            quick(),
        );
        client.init().unwrap();
        assert!(modem.sent("AT+QMTCFG=\"version\",0,4"));
        assert!(modem.sent("AT+QMTCFG=\"ssl\",0,1,2"));
        assert!(modem.sent("AT+QMTCFG=\"recv/mode\",0,0,1"));
        device.shutdown();
    }

    #[test]
    fn test_connect_rejected_credentials() {
        let modem = ScriptedModem::online();
        modem
            .on("AT+QMTOPEN=", "\r\nOK\r\n\r\n+QMTOPEN: 0,0\r\n")
            .on("AT+QMTCONN=", "\r\nOK\r\n\r\n+QMTCONN: 0,0,4\r\n");
        let device = online(&modem);
        let client = MqttClient::new(
            Arc::clone(&device),
            BrokerSession::new("broker.local", 1883, "gw-1").with_credentials("u", "p"),
            quick(),
        );
        let err = client.connect().unwrap_err();
        assert_eq!(err.vendor_code(), Some(4));
        assert!(modem.sent("AT+QMTCONN=0,\"gw-1\",\"u\",\"p\""));
        device.shutdown();
    }

    #[test]
    fn test_publish_acknowledged() {
        let modem = ScriptedModem::online();
        modem.on_payload("AT+QMTPUBEX=", "\r\n> ", "\r\nOK\r\n\r\n+QMTPUB: 0,3,0\r\n");
        let (device, client) = connected(&modem);
        client.publish(&telemetry(3)).unwrap();
        assert!(modem.sent("AT+QMTPUBEX=0,3,1,0,\"gateway/telemetry\",8"));
        assert_eq!(modem.payloads(), vec![b"{\"t\":21}".to_vec()]);
        device.shutdown();
    }

    #[test]
    fn test_publish_delivery_failed() {
        let modem = ScriptedModem::online();
        modem.on_payload("AT+QMTPUBEX=", "\r\n> ", "\r\nOK\r\n\r\n+QMTPUB: 0,3,2\r\n");
        let (device, client) = connected(&modem);
        assert_eq!(
            client.publish(&telemetry(3)),
            Err(ModemError::DeliveryFailed { result: 2 })
        );
        device.shutdown();
    }

    #[test]
    fn test_publish_rejects_foreign_socket() {
        let modem = ScriptedModem::online();
        modem.on_payload("AT+QMTPUBEX=", "\r\n> ", "\r\nOK\r\n\r\n+QMTPUB: 1,3,0\r\n");
        let (device, client) = connected(&modem);
        assert!(matches!(
            client.publish(&telemetry(3)),
            Err(ModemError::MalformedResponse(_))
        ));
        device.shutdown();
    }

    #[test]
    fn test_publish_gives_up_after_retransmit_ceiling() {
        let modem = ScriptedModem::online();
        modem.on_payload(
            "AT+QMTPUBEX=",
            "\r\n> ",
            "\r\nOK\r\n\r\n+QMTPUB: 0,5,1,1\r\n\r\n+QMTPUB: 0,5,1,2\r\n\r\n+QMTPUB: 0,5,1,3\r\n\r\n+QMTPUB: 0,5,1,4\r\n",
        );
        let (device, client) = connected(&modem);
        assert_eq!(
            client.publish(&telemetry(5)),
            Err(ModemError::RetriesExhausted { attempts: 3 })
        );
        device.shutdown();
    }

    #[test]
    fn test_publish_uncertain_after_retransmit_then_silence() {
        let modem = ScriptedModem::online();
        modem.on_payload("AT+QMTPUBEX=", "\r\n> ", "\r\nOK\r\n\r\n+QMTPUB: 0,6,1,1\r\n");
        let (device, client) = connected(&modem);
        assert_eq!(client.publish(&telemetry(6)), Err(ModemError::Uncertain));
        device.shutdown();
    }

    #[test]
    fn test_late_ack_of_abandoned_publish_is_discarded() {
        let modem = ScriptedModem::online();
        modem
            .once_payload("AT+QMTPUBEX=0,7", "\r\n> ", "\r\nOK\r\n")
            .once_payload("AT+QMTPUBEX=0,8", "\r\n> ", "\r\nOK\r\n");
        let (device, client) = connected(&modem);
        assert_eq!(client.publish(&telemetry(7)), Err(ModemError::Timeout));

        // the ack for 7 arrives while 8 is waiting
        let late = std::thread::spawn({
            let modem = modem.clone();
            move || {
                std::thread::sleep(Duration::from_millis(40));
                modem.inject("\r\n+QMTPUB: 0,7,0\r\n\r\n+QMTPUB: 0,8,0\r\n");
            }
        });
        client.publish(&telemetry(8)).unwrap();
        late.join().unwrap();
        device.shutdown();
    }

    #[test]
    fn test_oversized_payload_is_invalid() {
        let modem = ScriptedModem::online();
        let (device, client) = connected(&modem);
        let message = telemetry(1).with_payload(vec![b'x'; MAX_PAYLOAD + 1]);
        assert!(matches!(
            client.publish(&message),
            Err(ModemError::InvalidArgument(_))
        ));
        assert!(!modem.sent("AT+QMTPUBEX"));
        device.shutdown();
    }

    #[test]
    fn test_subscribe_refused() {
        let modem = ScriptedModem::online();
        modem.on("AT+QMTSUB=", "\r\nOK\r\n\r\n+QMTSUB: 0,2,0,128\r\n");
        let (device, client) = connected(&modem);
        let err = client
            .subscribe(&[Message::new()
                .with_socket(0)
                .with_msg_id(2)
                .with_qos(QoS::AtLeastOnce)
                .with_topic(Topic::Command)])
            .unwrap_err();
        assert_eq!(err.vendor_code(), Some(128));
        device.shutdown();
    }

    #[test]
    fn test_inbound_and_session_loss() {
        let modem = ScriptedModem::online();
        modem.on("AT+QMTCONN?", "\r\n+QMTCONN: 0,3\r\n\r\nOK\r\n");
        let (device, client) = connected(&modem);
        assert!(client.is_connected().unwrap());

        modem.inject("\r\n+QMTRECV: 0,4,\"gateway/command\",5,\"reset\"\r\n");
        let inbound = client
            .recv_inbound_timeout(Duration::from_secs(1))
            .unwrap();
        assert_eq!(inbound.topic, "gateway/command");
        assert_eq!(inbound.payload.as_ref(), b"reset");

        modem.inject("\r\n+QMTSTAT: 0,1\r\n");
        let deadline = Deadline::after(Duration::from_secs(1));
        while client.is_connected().unwrap() && !deadline.expired() {
            deadline.pause(Duration::from_millis(2));
        }
        assert!(!client.is_connected().unwrap());
        assert_eq!(
            client.publish(&telemetry(9)),
            Err(ModemError::NotConnected)
        );
        device.shutdown();
    }
}

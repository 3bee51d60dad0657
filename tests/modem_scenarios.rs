//! End-to-end scenarios over the scripted modem.

use std::{sync::Arc, time::Duration};

use atmux::{
    cli::config::{GatewayConfig, ModemSection, MqttSection, Subscription},
    core::Gateway,
    protocol::{
        device::DeviceState,
        hal::mock::{MockPin, MockStatusLine, ScriptedModem},
        http::{HttpSettings, HttpTiming, RequestHeader, Scheme},
        mqtt::{BrokerSession, Message, MqttTiming, QoS, Topic, RETRANSMIT_CEILING},
    },
    utils::Deadline,
    ModemError,
};

fn config() -> GatewayConfig {
    GatewayConfig {
        modem: ModemSection {
            apn: "iot".into(),
            boot_timeout_ms: 20,
            reach_backoff_ms: 1,
            reset_pulse_ms: 1,
            debounce_ms: 5,
            ..ModemSection::default()
        },
        mqtt: Some(MqttSection {
            session: BrokerSession::new("broker.local", 1883, "gw-1"),
            subscriptions: vec![Subscription {
                topic: Topic::Command,
                qos: QoS::AtLeastOnce,
            }],
        }),
        http: Some(HttpSettings {
            response_timeout_s: 0,
            ..HttpSettings::default()
        }),
        ..GatewayConfig::default()
    }
}

fn mqtt_timing() -> MqttTiming {
    MqttTiming {
        command: Duration::from_millis(200),
        open: Duration::from_millis(300),
        connect: Duration::from_millis(300),
        subscribe: Duration::from_millis(300),
        publish: Duration::from_millis(200),
        prompt: Duration::from_millis(200),
        disconnect: Duration::from_millis(200),
    }
}

fn http_timing() -> HttpTiming {
    HttpTiming {
        command: Duration::from_millis(200),
        prompt: Duration::from_millis(200),
        margin: Duration::from_millis(200),
        read: Duration::from_millis(300),
    }
}

fn modem() -> ScriptedModem {
    let modem = ScriptedModem::online();
    modem
        .on("AT+QMTOPEN=", "\r\nOK\r\n\r\n+QMTOPEN: 0,0\r\n")
        .on("AT+QMTCONN=", "\r\nOK\r\n\r\n+QMTCONN: 0,0,0\r\n")
        .on("AT+QMTSUB=", "\r\nOK\r\n\r\n+QMTSUB: 0,1,0,1\r\n")
        .on("AT+QMTDISC=", "\r\nOK\r\n\r\n+QMTDISC: 0,0\r\n")
        .on_payload("AT+QHTTPURL=", "\r\nCONNECT\r\n", "\r\nOK\r\n");
    modem
}

fn gateway(modem: &ScriptedModem, line: &MockStatusLine) -> Gateway {
    Gateway::with_timing(
        Box::new(modem.clone()),
        Box::new(MockPin::new()),
        Arc::new(line.clone()),
        &config(),
        mqtt_timing(),
        http_timing(),
    )
}

fn online() -> (ScriptedModem, MockStatusLine, Gateway) {
    let modem = modem();
    let line = MockStatusLine::new(true);
    let gateway = gateway(&modem, &line);
    gateway.bring_up().unwrap();
    (modem, line, gateway)
}

fn telemetry(gateway: &Gateway, msg_id: u16) -> Message {
    Message::new()
        .with_socket(0)
        .with_msg_id(msg_id)
        .with_qos(QoS::AtLeastOnce)
        .with_retain(false)
        .with_topic(Topic::Telemetry)
        .with_payload(format!("{{\"gw\":{}}}", gateway.device().ip_address().unwrap_or_default()))
}

#[test]
fn test_bring_up_reaches_ip_acquired() {
    let (modem, _line, gateway) = online();
    assert_eq!(gateway.device().state(), DeviceState::IpAcquired);
    assert_eq!(gateway.device().ip_address().as_deref(), Some("10.64.0.9"));

    let commands = modem.commands();
    let position = |prefix: &str| commands.iter().position(|c| c.starts_with(prefix));
    assert!(position("ATE0") < position("AT+QICSGP"));
    assert!(position("AT+QICSGP") < position("AT+QMTOPEN"));
    assert!(position("AT+QMTCONN=") < position("AT+QMTSUB"));
    gateway.shutdown();
}

#[test]
fn test_released_token_cannot_write() {
    let (modem, _line, gateway) = online();
    let device = gateway.device();
    let old = device.take_mutex().unwrap();
    device.release_mutex(old);
    let fresh = device.take_mutex().unwrap();
    let before = modem.commands().len();
    assert!(matches!(
        device.execute("AT+CSQ", old),
        Err(ModemError::StaleToken { .. })
    ));
    assert_eq!(modem.commands().len(), before);
    device.release_mutex(fresh);
    gateway.shutdown();
}

#[test]
fn test_publish_result_codes() {
    let (modem, _line, gateway) = online();
    let mqtt = gateway.mqtt().unwrap();

    modem.once_payload("AT+QMTPUBEX=0,3", "\r\n> ", "\r\nOK\r\n\r\n+QMTPUB: 0,3,0\r\n");
    mqtt.publish(&telemetry(&gateway, 3)).unwrap();

    modem.once_payload("AT+QMTPUBEX=0,4", "\r\n> ", "\r\nOK\r\n\r\n+QMTPUB: 0,4,2\r\n");
    assert_eq!(
        mqtt.publish(&telemetry(&gateway, 4)),
        Err(ModemError::DeliveryFailed { result: 2 })
    );

    modem.once_payload("AT+QMTPUBEX=0,5", "\r\n> ", "\r\nOK\r\n\r\n+QMTPUB: 1,5,0\r\n");
    assert!(matches!(
        mqtt.publish(&telemetry(&gateway, 5)),
        Err(ModemError::MalformedResponse(_))
    ));
    gateway.shutdown();
}

#[test]
fn test_retransmission_ceiling() {
    let (modem, _line, gateway) = online();
    let notices: String = (1..=RETRANSMIT_CEILING)
        .map(|n| format!("\r\n+QMTPUB: 0,6,1,{n}\r\n"))
        .collect();
    modem.once_payload("AT+QMTPUBEX=0,6", "\r\n> ", &format!("\r\nOK\r\n{notices}"));
    assert_eq!(
        gateway.mqtt().unwrap().publish(&telemetry(&gateway, 6)),
        Err(ModemError::RetriesExhausted {
            attempts: RETRANSMIT_CEILING
        })
    );
    gateway.shutdown();
}

#[test]
fn test_timeout_keeps_partial_reply() {
    let (modem, _line, gateway) = online();
    modem.once("AT+CSQ", "\r\n+CSQ: 21,99\r\n");
    let device = gateway.device();
    {
        let lease = device.lease().unwrap();
        assert_eq!(
            lease.command("AT+CSQ", Duration::from_millis(50)),
            Err(ModemError::Timeout)
        );
    }
    let buffered = device.transport().buffered();
    assert!(String::from_utf8_lossy(&buffered).contains("+CSQ: 21,99"));
    gateway.shutdown();
}

#[test]
fn test_leading_garbage_is_consumed_with_reply() {
    let (modem, _line, gateway) = online();
    modem.once("AT+GMR", "garbage\r\nOK\r\n");
    let device = gateway.device();
    let reply = device
        .lease()
        .unwrap()
        .command("AT+GMR", Duration::from_millis(200))
        .unwrap();
    assert_eq!(reply.as_text(), "garbage\r\nOK\r\n");
    assert!(device.transport().buffered().is_empty());
    gateway.shutdown();
}

#[test]
fn test_http_get_and_retrieve() {
    let (modem, _line, gateway) = online();
    modem
        .on("AT+QHTTPGET=", "\r\nOK\r\n\r\n+QHTTPGET: 0,200,11\r\n")
        .on("AT+QHTTPREAD=", "\r\nCONNECT\r\n{\"ok\":true}\r\nOK\r\n\r\n+QHTTPREAD: 0\r\n");
    let http = gateway.http().unwrap();
    let response = http
        .get(&RequestHeader::get(Scheme::Http, "api.local", "/v1/ping"))
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(http.retrieve_string().unwrap(), "{\"ok\":true}");
    assert!(modem
        .payloads()
        .contains(&b"http://api.local/v1/ping".to_vec()));
    gateway.shutdown();
}

#[test]
fn test_status_line_loss_blocks_commands() {
    let (modem, line, gateway) = online();
    line.set_level(false);
    let device = gateway.device();
    let deadline = Deadline::after(Duration::from_secs(1));
    while device.state() != DeviceState::Disconnected && !deadline.expired() {
        deadline.pause(Duration::from_millis(2));
    }
    assert_eq!(device.state(), DeviceState::Disconnected);
    assert!(device.ip_address().is_none());

    let before = modem.commands().len();
    let lease = device.lease().unwrap();
    assert!(matches!(
        lease.execute("AT"),
        Err(ModemError::DeviceFailure(_))
    ));
    drop(lease);
    assert_eq!(modem.commands().len(), before);
    device.shutdown();
}

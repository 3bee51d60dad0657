use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::{
    cli::config::{GatewayConfig, MqttSection},
    protocol::{
        device::{ConnectParams, DeviceController, DeviceState},
        hal::{self, FixedStatusLine, NoopPin, OutputPin, SerialChannel, StatusLine},
        http::{HttpClient, HttpTiming},
        mqtt::{MqttClient, MqttTiming},
        transport::TransportProcessor,
    },
};

/// Reconnect attempts made by [`Gateway::recover`] before giving up.
pub const MAX_SESSION_RETRIES: u32 = 3;

/// Owns the device controller and the protocol clients built on it.
///
/// Everything is constructed once; callers share the components through the
/// returned `Arc`s.
pub struct Gateway {
    device: Arc<DeviceController>,
    mqtt: Option<Arc<MqttClient>>,
    http: Option<Arc<HttpClient>>,
    params: ConnectParams,
    mqtt_section: Option<MqttSection>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("device", &self.device)
            .field("mqtt", &self.mqtt.is_some())
            .field("http", &self.http.is_some())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Open the configured serial port. Boards without a wired reset or
    /// status line get a no-op pin and a line that always reads high.
    pub fn open(config: &GatewayConfig) -> Result<Self> {
        let port = hal::open_serial(&config.serial.port, &config.serial_config())
            .with_context(|| format!("Failed to open modem port {}", config.serial.port))?;
        Ok(Self::with_channel(
            Box::new(port),
            Box::new(NoopPin),
            Arc::new(FixedStatusLine(true)),
            config,
        ))
    }

    pub fn with_channel(
        channel: Box<dyn SerialChannel>,
        reset_pin: Box<dyn OutputPin>,
        status_line: Arc<dyn StatusLine>,
        config: &GatewayConfig,
    ) -> Self {
        Self::with_timing(
            channel,
            reset_pin,
            status_line,
            config,
            MqttTiming::default(),
            HttpTiming::default(),
        )
    }

    /// Like [`with_channel`](Self::with_channel) with explicit client timing.
    pub fn with_timing(
        channel: Box<dyn SerialChannel>,
        reset_pin: Box<dyn OutputPin>,
        status_line: Arc<dyn StatusLine>,
        config: &GatewayConfig,
        mqtt_timing: MqttTiming,
        http_timing: HttpTiming,
    ) -> Self {
        let transport = Arc::new(TransportProcessor::new(channel, config.transport_config()));
        let device = Arc::new(DeviceController::new(
            transport,
            reset_pin,
            status_line,
            config.device_timing(),
        ));
        let mqtt = config.mqtt.as_ref().map(|section| {
            Arc::new(MqttClient::new(
                Arc::clone(&device),
                section.session.clone(),
                mqtt_timing.clone(),
            ))
        });
        let http = config.http.as_ref().map(|settings| {
            Arc::new(HttpClient::new(
                Arc::clone(&device),
                settings.clone(),
                http_timing.clone(),
            ))
        });
        Self {
            device,
            mqtt,
            http,
            params: config.connect_params(),
            mqtt_section: config.mqtt.clone(),
        }
    }

    pub fn device(&self) -> &Arc<DeviceController> {
        &self.device
    }

    pub fn mqtt(&self) -> Option<&Arc<MqttClient>> {
        self.mqtt.as_ref()
    }

    pub fn http(&self) -> Option<&Arc<HttpClient>> {
        self.http.as_ref()
    }

    /// Init, config and connect the modem, then open the MQTT session and
    /// subscribe to the configured topics.
    pub fn bring_up(&self) -> Result<()> {
        self.device.init().context("Modem init failed")?;
        self.device
            .config(self.params.clone())
            .context("Modem config failed")?;
        self.device.connect().context("Modem connect failed")?;

        if let (Some(mqtt), Some(section)) = (&self.mqtt, &self.mqtt_section) {
            mqtt.init().context("MQTT configuration failed")?;
            mqtt.connect()
                .with_context(|| format!("MQTT connect to {} failed", section.session.host))?;
            if !section.subscriptions.is_empty() {
                let messages = section.subscribe_messages(|| mqtt.next_msg_id());
                mqtt.subscribe(&messages).context("MQTT subscribe failed")?;
            }
        }
        log::info!("Gateway up, modem {}", self.device.state());
        Ok(())
    }

    /// Reset the modem and redo [`bring_up`](Self::bring_up), at most
    /// [`MAX_SESSION_RETRIES`] times.
    pub fn recover(&self) -> Result<()> {
        let mut last = None;
        for attempt in 1..=MAX_SESSION_RETRIES {
            log::warn!("Recovering gateway session ({attempt}/{MAX_SESSION_RETRIES})");
            if let Err(err) = self.device.reconnect() {
                log::error!("Modem reset failed: {err}");
                last = Some(anyhow!(err).context("Modem reset failed"));
                continue;
            }
            if let Some(http) = &self.http {
                http.invalidate();
            }
            match self.bring_up() {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::warn!("Recovery attempt {attempt} failed: {err:#}");
                    last = Some(err);
                }
            }
        }
        let err = last.unwrap_or_else(|| anyhow!("no recovery attempt was made"));
        Err(err.context(format!(
            "Gateway session lost after {MAX_SESSION_RETRIES} recovery attempts"
        )))
    }

    /// Whether the modem is up and, when configured, the MQTT session too.
    pub fn is_healthy(&self) -> bool {
        if !matches!(
            self.device.state(),
            DeviceState::Connected | DeviceState::IpAcquired
        ) || !self.device.is_healthy()
        {
            return false;
        }
        match &self.mqtt {
            Some(mqtt) => mqtt.is_connected().unwrap_or(false),
            None => true,
        }
    }

    pub fn shutdown(&self) {
        if let Some(mqtt) = &self.mqtt {
            if let Err(err) = mqtt.disconnect() {
                log::warn!("MQTT disconnect failed: {err}");
            }
        }
        self.device.shutdown();
        log::info!("Gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        cli::config::{ModemSection, Subscription},
        protocol::{
            hal::mock::{MockPin, MockStatusLine, ScriptedModem},
            mqtt::{BrokerSession, QoS, Topic},
        },
    };

    fn config() -> GatewayConfig {
        GatewayConfig {
            modem: ModemSection {
                apn: "iot".into(),
                boot_timeout_ms: 20,
                reach_backoff_ms: 1,
                reset_pulse_ms: 1,
                ..ModemSection::default()
            },
            mqtt: Some(MqttSection {
                session: BrokerSession::new("broker.local", 1883, "gw-1"),
                subscriptions: vec![Subscription {
                    topic: Topic::Command,
                    qos: QoS::AtLeastOnce,
                }],
            }),
            ..GatewayConfig::default()
        }
    }

    fn quick() -> MqttTiming {
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

    fn broker(modem: &ScriptedModem) {
        modem
            .on("AT+QMTOPEN=", "\r\nOK\r\n\r\n+QMTOPEN: 0,0\r\n")
            .on("AT+QMTCONN=", "\r\nOK\r\n\r\n+QMTCONN: 0,0,0\r\n")
            .on("AT+QMTSUB=", "\r\nOK\r\n\r\n+QMTSUB: 0,1,0,1\r\n")
            .on("AT+QMTDISC=", "\r\nOK\r\n\r\n+QMTDISC: 0,0\r\n");
    }

    fn gateway(modem: &ScriptedModem, pin: &MockPin) -> Gateway {
        Gateway::with_timing(
            Box::new(modem.clone()),
            Box::new(pin.clone()),
            Arc::new(MockStatusLine::new(true)),
            &config(),
            quick(),
            HttpTiming::default(),
        )
    }

    #[test]
    fn test_bring_up_subscribes() {
        let modem = ScriptedModem::online();
        broker(&modem);
        let gateway = gateway(&modem, &MockPin::new());
        gateway.bring_up().unwrap();
        assert_eq!(gateway.device().state(), DeviceState::IpAcquired);
        assert!(modem.sent("AT+QMTSUB=0,1,\"gateway/command\",1"));
        assert!(gateway.http().is_none());
        gateway.shutdown();
    }

    #[test]
    fn test_bring_up_reports_broker_refusal() {
        let modem = ScriptedModem::online();
        modem
            .on("AT+QMTOPEN=", "\r\nOK\r\n\r\n+QMTOPEN: 0,0\r\n")
            .on("AT+QMTCONN=", "\r\nOK\r\n\r\n+QMTCONN: 0,0,5\r\n");
        let gateway = gateway(&modem, &MockPin::new());
        let err = gateway.bring_up().unwrap_err();
        assert!(format!("{err:#}").contains("MQTT connect to broker.local failed"));
        gateway.shutdown();
    }

    #[test]
    fn test_recover_resets_and_reconnects() {
        let modem = ScriptedModem::online();
        broker(&modem);
        let pin = MockPin::new();
        let gateway = gateway(&modem, &pin);
        gateway.bring_up().unwrap();
        gateway.recover().unwrap();
        assert_eq!(pin.levels(), vec![false, true, false]);
        assert_eq!(gateway.device().state(), DeviceState::IpAcquired);
        gateway.shutdown();
    }

    #[test]
    fn test_recover_gives_up_at_ceiling() {
        let modem = ScriptedModem::online();
        broker(&modem);
        let pin = MockPin::new();
        let gateway = gateway(&modem, &pin);
        gateway.bring_up().unwrap();
        for _ in 0..MAX_SESSION_RETRIES {
            modem.once("AT+QMTOPEN=", "\r\nOK\r\n\r\n+QMTOPEN: 0,3\r\n");
        }
        let err = gateway.recover().unwrap_err();
        assert!(err.to_string().contains("after 3 recovery attempts"));
        assert_eq!(pin.levels().iter().filter(|high| **high).count(), 3);
        gateway.shutdown();
    }
}

//! Modem lifecycle and shared access to its single command channel.

pub mod exclusion;
pub mod pending;
pub mod reply;
pub mod router;
pub mod state;
pub mod supervisor;

pub use exclusion::{CommandMutex, MutexToken};
pub use pending::{Correlation, RequestTag};
pub use reply::Accept;
pub use router::{SessionEvent, SessionRouter};
pub use state::{ConnStep, DeviceState, DeviceStatus, InitStep};

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use self::{pending::AbandonedRequests, supervisor::Supervisor};
use super::{
    codes::RegistrationStatus,
    error::{ModemError, Result},
    hal::{OutputPin, StatusLine},
    response::{Field, Grammar, ReplyBlock},
    transport::TransportProcessor,
    urc::{Notification, NotificationHandler, Urc},
};
use crate::utils::Deadline;

const QIACT: Grammar = Grammar::new(
    "+QIACT",
    &[
        Field::int("context"),
        Field::int("state"),
        Field::int("type"),
        Field::text("ip").opt(),
    ],
);
const COPS: Grammar = Grammar::new(
    "+COPS",
    &[
        Field::int("mode"),
        Field::int("format").opt(),
        Field::text("operator").opt(),
        Field::int("act").opt(),
    ],
);
const CEREG: Grammar = Grammar::new(
    "+CEREG",
    &[
        Field::int("n"),
        Field::int("stat"),
        Field::text("tac").opt(),
        Field::text("ci").opt(),
        Field::int("act").opt(),
    ],
);

/// PDP authentication for the data context.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AuthMode {
    #[default]
    None = 0,
    Pap = 1,
    Chap = 2,
}

/// Parameters recorded by [`DeviceController::config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub apn: String,
    pub username: String,
    pub password: String,
    pub auth: AuthMode,
    pub context_id: u8,
}

impl ConnectParams {
    pub fn new(apn: impl Into<String>) -> Self {
        Self {
            apn: apn.into(),
            username: String::new(),
            password: String::new(),
            auth: AuthMode::None,
            context_id: 1,
        }
    }
}

/// Every wait the controller performs, so deployments and tests can tune them.
#[derive(Debug, Clone)]
pub struct DeviceTiming {
    /// Bounded wait of `take_mutex`.
    pub mutex_wait: Duration,
    /// A lease idle for this long may be preempted by a waiter.
    pub max_hold: Duration,
    /// Short configuration commands.
    pub command_timeout: Duration,
    pub boot_timeout: Duration,
    pub reach_retries: u32,
    pub reach_backoff: Duration,
    pub registration_retries: u32,
    pub registration_backoff: Duration,
    pub activation_timeout: Duration,
    pub debounce: Duration,
    pub reset_pulse: Duration,
    /// How long an abandoned correlation is remembered.
    pub abandon_ttl: Duration,
    /// Sleep between polls of every wait loop.
    pub poll: Duration,
    pub inbound_capacity: usize,
}

impl Default for DeviceTiming {
    fn default() -> Self {
        Self {
            mutex_wait: Duration::from_secs(5),
            max_hold: Duration::from_secs(180),
            command_timeout: Duration::from_millis(800),
            boot_timeout: Duration::from_secs(15),
            reach_retries: 3,
            reach_backoff: Duration::from_secs(1),
            registration_retries: 10,
            registration_backoff: Duration::from_secs(2),
            activation_timeout: Duration::from_secs(150),
            debounce: Duration::from_millis(50),
            reset_pulse: Duration::from_millis(500),
            abandon_ttl: Duration::from_secs(300),
            poll: Duration::from_millis(5),
            inbound_capacity: 64,
        }
    }
}

/// Finite-state machine over the modem plus token-based exclusion of its
/// command channel.
pub struct DeviceController {
    transport: Arc<TransportProcessor>,
    status: Arc<Mutex<DeviceStatus>>,
    mutex: CommandMutex,
    reset_pin: Mutex<Box<dyn OutputPin>>,
    status_line: Arc<dyn StatusLine>,
    router: Arc<SessionRouter>,
    abandoned: AbandonedRequests,
    next_tag: AtomicU64,
    params: Mutex<Option<ConnectParams>>,
    supervisor: Mutex<Option<Supervisor>>,
    init_lock: Mutex<()>,
    timing: DeviceTiming,
}

impl std::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController")
            .field("status", &*self.status.lock())
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl DeviceController {
    pub fn new(
        transport: Arc<TransportProcessor>,
        reset_pin: Box<dyn OutputPin>,
        status_line: Arc<dyn StatusLine>,
        timing: DeviceTiming,
    ) -> Self {
        Self {
            transport,
            status: Arc::new(Mutex::new(DeviceStatus::default())),
            mutex: CommandMutex::new(timing.max_hold),
            reset_pin: Mutex::new(reset_pin),
            status_line,
            router: Arc::new(SessionRouter::new(timing.inbound_capacity)),
            abandoned: AbandonedRequests::new(timing.abandon_ttl),
            next_tag: AtomicU64::new(0),
            params: Mutex::new(None),
            supervisor: Mutex::new(None),
            init_lock: Mutex::new(()),
            timing,
        }
    }

    pub fn timing(&self) -> &DeviceTiming {
        &self.timing
    }

    pub fn transport(&self) -> &Arc<TransportProcessor> {
        &self.transport
    }

    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    pub fn state(&self) -> DeviceState {
        self.status.lock().state().clone()
    }

    pub fn status(&self) -> DeviceStatus {
        self.status.lock().clone()
    }

    pub fn ip_address(&self) -> Option<String> {
        self.status.lock().ip_address.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.status_line.is_high()
    }

    /// Bring up pins, notification handlers and the drain loop. Idempotent;
    /// steps already recorded as done are never repeated.
    pub fn init(&self) -> Result<()> {
        let _serialized = self.init_lock.lock();
        {
            let mut status = self.status.lock();
            if *status.state() == DeviceState::Uninitialized {
                status.transition(DeviceState::Initializing);
            }
        }

        if !self.has_init(InitStep::CallbacksRegistered) {
            self.register_handlers()?;
            self.status.lock().mark_init(InitStep::CallbacksRegistered);
        }
        if !self.has_init(InitStep::SerialReady) {
            self.transport.start()?;
            self.status.lock().mark_init(InitStep::SerialReady);
        }
        if !self.has_init(InitStep::PinsConfigured) {
            self.reset_pin
                .lock()
                .set_low()
                .map_err(|e| ModemError::DeviceFailure(format!("reset pin: {e}")))?;
            let supervisor = Supervisor::spawn(
                Arc::clone(&self.status),
                Arc::clone(&self.status_line),
                self.transport.events(),
                self.timing.debounce,
            )?;
            *self.supervisor.lock() = Some(supervisor);
            let mut status = self.status.lock();
            if self.status_line.is_high() {
                status.mark_conn(ConnStep::StatusHealthy);
            }
            status.mark_init(InitStep::PinsConfigured);
        }
        log::info!("Modem controller initialised, state {}", self.state());
        Ok(())
    }

    fn has_init(&self, step: InitStep) -> bool {
        self.status.lock().init.contains(step)
    }

    fn has_conn(&self, step: ConnStep) -> bool {
        self.status.lock().conn.contains(step)
    }

    fn register_handlers(&self) -> Result<()> {
        use strum::IntoEnumIterator;

        for notification in Notification::iter() {
            let status = Arc::clone(&self.status);
            let router = Arc::clone(&self.router);
            let handler: NotificationHandler = Arc::new(move |urc: Urc| on_notification(&status, &router, urc));
            self.transport.register(notification, handler)?;
        }
        Ok(())
    }

    /// Record connection parameters. Must follow [`init`](Self::init).
    pub fn config(&self, params: ConnectParams) -> Result<()> {
        let mut status = self.status.lock();
        if *status.state() == DeviceState::Uninitialized {
            return Err(ModemError::ContractViolation("config before init".into()));
        }
        let mut current = self.params.lock();
        if current.as_ref().is_some_and(|p| *p != params) {
            status.unmark_conn(ConnStep::ContextConfigured);
        }
        *current = Some(params);
        if *status.state() == DeviceState::Initializing {
            status.transition(DeviceState::Configured);
        }
        Ok(())
    }

    /// Reachability, data context and registration, skipping completed steps.
    pub fn connect(&self) -> Result<()> {
        let params = self
            .params
            .lock()
            .clone()
            .ok_or_else(|| ModemError::ContractViolation("connect before config".into()))?;
        self.resume()?;
        let booted = self.wait_booted(self.timing.boot_timeout);

        let lease = self.lease()?;
        self.check_reachable(&lease)?;
        lease.command("ATE0", self.timing.command_timeout)?;
        lease.command("AT+CMEE=1", self.timing.command_timeout)?;
        if !booted {
            self.adopt_running_modem(&lease)?;
        }
        {
            let mut status = self.status.lock();
            if *status.state() == DeviceState::Started {
                status.transition(DeviceState::Connected);
            }
        }
        self.activate_context(&lease, &params)?;
        self.check_registration(&lease)?;
        log::info!(
            "Modem online, context {} address {}",
            params.context_id,
            self.ip_address().unwrap_or_default()
        );
        Ok(())
    }

    /// Leave `Disconnected` for a fresh attempt when the line says the modem is up.
    fn resume(&self) -> Result<()> {
        let mut status = self.status.lock();
        match status.state() {
            DeviceState::Uninitialized => {
                Err(ModemError::ContractViolation("connect before init".into()))
            }
            DeviceState::Disconnected | DeviceState::Failed(_) => {
                if !self.status_line.is_high() {
                    return Err(ModemError::DeviceFailure("status line low".into()));
                }
                status.transition(DeviceState::Configured);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn wait_booted(&self, timeout: Duration) -> bool {
        let deadline = Deadline::after(timeout);
        loop {
            if self.status.lock().state().is_booted() {
                return true;
            }
            if deadline.expired() {
                return false;
            }
            deadline.pause(self.timing.poll.max(Duration::from_millis(10)));
        }
    }

    fn check_reachable(&self, lease: &CommandLease<'_>) -> Result<()> {
        let attempts = self.timing.reach_retries.max(1);
        for attempt in 1..=attempts {
            match lease.command("AT", self.timing.command_timeout) {
                Ok(_) => {
                    self.status.lock().mark_conn(ConnStep::Reachable);
                    return Ok(());
                }
                Err(e @ (ModemError::Timeout | ModemError::Busy | ModemError::CommandFailed)) => {
                    log::warn!("Modem not answering AT ({attempt}/{attempts}): {e}");
                    self.status.lock().unmark_conn(ConnStep::Reachable);
                    if attempt < attempts {
                        thread::sleep(self.timing.reach_backoff);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(ModemError::Timeout)
    }

    /// The modem was already running, so its boot notifications were missed.
    /// The `+CFUN`/`+CPIN` replies are picked up by the notification handlers.
    fn adopt_running_modem(&self, lease: &CommandLease<'_>) -> Result<()> {
        log::info!("Boot notifications not seen, probing the running modem");
        lease.command("AT+CFUN?", self.timing.command_timeout)?;
        lease.command("AT+CPIN?", self.timing.command_timeout)?;

        let deadline = Deadline::after(self.timing.command_timeout);
        loop {
            {
                let mut status = self.status.lock();
                if status.init.contains(InitStep::FunctionsReady)
                    && status.init.contains(InitStep::SimReady)
                {
                    status.mark_init(InitStep::BasebandReady);
                    status.mark_init(InitStep::NotificationsReady);
                    status.mark_init(InitStep::AppReady);
                    return Ok(());
                }
            }
            if deadline.expired() {
                let missing = self.status.lock().init.missing();
                return Err(ModemError::DeviceFailure(format!(
                    "modem not ready after probing, missing {missing:?}"
                )));
            }
            deadline.pause(self.timing.poll);
        }
    }

    fn activate_context(&self, lease: &CommandLease<'_>, params: &ConnectParams) -> Result<()> {
        let ctx = params.context_id;
        if !self.has_conn(ConnStep::ContextConfigured) {
            let auth: u8 = params.auth.into();
            let command = format!(
                "AT+QICSGP={ctx},1,\"{}\",\"{}\",\"{}\",{auth}",
                params.apn, params.username, params.password
            );
            lease
                .command(&command, self.timing.command_timeout)
                .map_err(no_data_context)?;
            self.status.lock().mark_conn(ConnStep::ContextConfigured);
        }
        if self.has_conn(ConnStep::ContextActivated) {
            return Ok(());
        }

        let ip = match self.query_context(lease, ctx)? {
            Some(ip) => {
                log::info!("Data context {ctx} already active, adopting {ip}");
                ip
            }
            None => {
                lease
                    .command(&format!("AT+QIACT={ctx}"), self.timing.activation_timeout)
                    .map_err(no_data_context)?;
                self.query_context(lease, ctx)?
                    .ok_or(ModemError::NoDataContext)?
            }
        };
        let mut status = self.status.lock();
        status.mark_conn(ConnStep::ContextActivated);
        status.ip_address = Some(ip);
        status.transition(DeviceState::IpAcquired);
        Ok(())
    }

    fn query_context(&self, lease: &CommandLease<'_>, ctx: u8) -> Result<Option<String>> {
        let reply = lease.command("AT+QIACT?", self.timing.command_timeout)?;
        for frame in reply.frames(&QIACT)? {
            if frame.get::<u8>("context")? == ctx && frame.int("state")? == 1 {
                return Ok(Some(frame.opt_text("ip").unwrap_or_default().to_string()));
            }
        }
        Ok(None)
    }

    fn check_registration(&self, lease: &CommandLease<'_>) -> Result<()> {
        if self.has_conn(ConnStep::Registered) {
            return Ok(());
        }
        let attempts = self.timing.registration_retries.max(1);
        for attempt in 1..=attempts {
            if !self.has_conn(ConnStep::OperatorFound) {
                let reply = lease.command("AT+COPS?", self.timing.command_timeout)?;
                let frame = reply.frame(&COPS)?;
                if let Some(operator) = frame.opt_text("operator").filter(|o| !o.is_empty()) {
                    log::info!("Operator {operator}");
                    self.status.lock().mark_conn(ConnStep::OperatorFound);
                }
            }
            let reply = lease.command("AT+CEREG?", self.timing.command_timeout)?;
            let stat: u8 = reply.frame(&CEREG)?.get("stat")?;
            let stat = RegistrationStatus::try_from(stat)
                .map_err(|_| ModemError::malformed(format!("registration status {stat}")))?;
            match stat {
                RegistrationStatus::Denied => return Err(ModemError::RegistrationDenied),
                s if s.is_registered() && self.has_conn(ConnStep::OperatorFound) => {
                    self.status.lock().mark_conn(ConnStep::Registered);
                    return Ok(());
                }
                s => log::info!("Waiting for registration ({attempt}/{attempts}): {s:?}"),
            }
            if attempt < attempts {
                thread::sleep(self.timing.registration_backoff);
            }
        }
        Err(ModemError::Timeout)
    }

    /// Drop to `Disconnected`, clearing every post-boot flag.
    pub fn disconnect(&self) {
        self.status.lock().transition(DeviceState::Disconnected);
    }

    /// [`disconnect`](Self::disconnect), then pulse the reset line. The boot
    /// notifications that follow promote the state to `Started` again.
    pub fn reconnect(&self) -> Result<()> {
        self.disconnect();
        let mut pin = self.reset_pin.lock();
        log::info!("Pulsing modem reset for {:?}", self.timing.reset_pulse);
        pin.set_high()
            .map_err(|e| ModemError::DeviceFailure(format!("reset pin: {e}")))?;
        thread::sleep(self.timing.reset_pulse);
        pin.set_low()
            .map_err(|e| ModemError::DeviceFailure(format!("reset pin: {e}")))?;
        Ok(())
    }

    pub fn take_mutex(&self) -> Result<MutexToken> {
        self.mutex.take(self.timing.mutex_wait)
    }

    pub fn release_mutex(&self, token: MutexToken) {
        self.mutex.release(token);
    }

    /// Take the command channel for the lifetime of the returned lease.
    pub fn lease(&self) -> Result<CommandLease<'_>> {
        Ok(CommandLease {
            device: self,
            token: self.take_mutex()?,
        })
    }

    /// Write one command line on behalf of the holder of `token`.
    pub fn execute(&self, command: &str, token: MutexToken) -> Result<RequestTag> {
        self.mutex.renew(token)?;
        let status = self.status.lock();
        check_ready(&status, self.status_line.as_ref())?;
        if !self.transport.is_passthrough() {
            self.transport.with_buffer(reply::sweep_stale);
        }
        let tag = RequestTag(self.next_tag.fetch_add(1, Ordering::SeqCst) + 1);
        log::debug!("{tag} {token} {command}");
        self.transport.write(command)?;
        Ok(tag)
    }

    /// Write a payload after a prompt, under the same checks as [`execute`](Self::execute).
    pub fn execute_payload(&self, payload: &[u8], token: MutexToken) -> Result<()> {
        self.mutex.renew(token)?;
        let status = self.status.lock();
        check_ready(&status, self.status_line.as_ref())?;
        self.transport.write_raw(payload)
    }

    /// Stop the supervisor and the drain loop.
    pub fn shutdown(&self) {
        if let Some(mut supervisor) = self.supervisor.lock().take() {
            supervisor.stop();
        }
        self.transport.stop();
        log::info!("Modem controller shut down");
    }
}

fn check_ready(status: &DeviceStatus, line: &dyn StatusLine) -> Result<()> {
    if !line.is_high() {
        return Err(ModemError::DeviceFailure("status line low".into()));
    }
    match status.state() {
        DeviceState::Disconnected => Err(ModemError::Disconnected),
        DeviceState::Failed(reason) => Err(ModemError::DeviceFailure(reason.clone())),
        DeviceState::Uninitialized => Err(ModemError::NotConnected),
        _ => Ok(()),
    }
}

fn no_data_context(err: ModemError) -> ModemError {
    match err {
        ModemError::CommandFailed | ModemError::VendorRejected { .. } => {
            log::warn!("Data context setup rejected: {err}");
            ModemError::NoDataContext
        }
        other => other,
    }
}

fn on_notification(status: &Mutex<DeviceStatus>, router: &SessionRouter, urc: Urc) {
    match urc {
        Urc::MqttState { socket, code } => {
            router.deliver(socket, SessionEvent::StateChanged { code });
        }
        Urc::MqttReceive {
            socket,
            msg_id,
            topic,
            payload,
        } => router.deliver(
            socket,
            SessionEvent::Received {
                msg_id,
                topic,
                payload,
            },
        ),
        boot => on_boot_notification(&mut status.lock(), boot),
    }
}

fn on_boot_notification(status: &mut DeviceStatus, urc: Urc) {
    match urc {
        Urc::Ready => {
            if status.state().is_booted() {
                log::warn!("Modem rebooted unexpectedly");
                status.transition(DeviceState::Disconnected);
            }
            status.mark_init(InitStep::BasebandReady);
        }
        Urc::Functionality(1) => status.mark_init(InitStep::FunctionsReady),
        Urc::Functionality(level) => {
            log::warn!("Modem functionality level {level}");
            status.unmark_init(InitStep::FunctionsReady);
        }
        Urc::SimState(state) if state == "READY" => status.mark_init(InitStep::SimReady),
        Urc::SimState(state) => {
            log::warn!("SIM not ready: {state}");
            status.unmark_init(InitStep::SimReady);
        }
        Urc::SmsDone => status.mark_init(InitStep::NotificationsReady),
        Urc::AppReady => status.mark_init(InitStep::AppReady),
        Urc::PoweredDown => {
            log::warn!("Modem powered down");
            status.transition(DeviceState::Disconnected);
        }
        Urc::PdpDeactivated(ctx) => {
            log::warn!("Network deactivated data context {ctx}");
            if *status.state() == DeviceState::IpAcquired {
                status.transition(DeviceState::Connected);
            } else {
                status.unmark_conn(ConnStep::ContextActivated);
            }
        }
        Urc::MqttState { .. } | Urc::MqttReceive { .. } => {}
    }
}

/// RAII hold on the command channel; releases on drop.
pub struct CommandLease<'a> {
    device: &'a DeviceController,
    token: MutexToken,
}

impl CommandLease<'_> {
    pub fn token(&self) -> MutexToken {
        self.token
    }

    pub fn device(&self) -> &DeviceController {
        self.device
    }

    pub fn execute(&self, command: &str) -> Result<RequestTag> {
        self.device.execute(command, self.token)
    }

    /// Execute `command` and read its `OK`-terminated reply.
    pub fn command(&self, command: &str, timeout: Duration) -> Result<ReplyBlock> {
        self.execute(command)?;
        self.device.read_reply(self.token, timeout)
    }
}

impl Drop for CommandLease<'_> {
    fn drop(&mut self) {
        self.device.release_mutex(self.token);
    }
}

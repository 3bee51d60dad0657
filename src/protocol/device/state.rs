use std::{fmt, marker::PhantomData};

use derive_more::Display;
use num_enum::IntoPrimitive;
use strum::{EnumIter, IntoEnumIterator};

/// Lifecycle of the modem as seen by the controller.
#[derive(Debug, Display, Clone, Default, PartialEq, Eq)]
pub enum DeviceState {
    #[default]
    #[display("uninitialized")]
    Uninitialized,
    #[display("initializing")]
    Initializing,
    #[display("configured")]
    Configured,
    #[display("started")]
    Started,
    #[display("connected")]
    Connected,
    #[display("ip acquired")]
    IpAcquired,
    #[display("disconnected")]
    Disconnected,
    #[display("failed: {_0}")]
    Failed(String),
}

impl DeviceState {
    /// True when commands may not be issued in this state.
    pub fn is_down(&self) -> bool {
        matches!(self, DeviceState::Disconnected | DeviceState::Failed(_))
    }

    /// True once the boot handshake has completed.
    pub fn is_booted(&self) -> bool {
        matches!(
            self,
            DeviceState::Started | DeviceState::Connected | DeviceState::IpAcquired
        )
    }
}

/// Bring-up sub-steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, EnumIter)]
#[repr(u8)]
pub enum InitStep {
    SerialReady = 0,
    CallbacksRegistered = 1,
    PinsConfigured = 2,
    BasebandReady = 3,
    FunctionsReady = 4,
    SimReady = 5,
    NotificationsReady = 6,
    AppReady = 7,
}

impl InitStep {
    /// Steps that only hold while the modem keeps running since its last boot.
    pub fn is_post_boot(self) -> bool {
        !matches!(
            self,
            InitStep::SerialReady | InitStep::CallbacksRegistered | InitStep::PinsConfigured
        )
    }
}

/// Connectivity sub-steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, EnumIter)]
#[repr(u8)]
pub enum ConnStep {
    StatusHealthy = 0,
    Reachable = 1,
    ContextConfigured = 2,
    ContextActivated = 3,
    OperatorFound = 4,
    Registered = 5,
}

/// Small bitset over one of the step enumerations.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StepSet<S> {
    bits: u8,
    _marker: PhantomData<S>,
}

impl<S> Default for StepSet<S> {
    fn default() -> Self {
        Self {
            bits: 0,
            _marker: PhantomData,
        }
    }
}

impl<S: Copy + Into<u8> + IntoEnumIterator> StepSet<S> {
    fn mask(step: S) -> u8 {
        1u8 << step.into()
    }

    /// Set `step`; returns true when it was not set before.
    pub fn set(&mut self, step: S) -> bool {
        let was = self.contains(step);
        self.bits |= Self::mask(step);
        !was
    }

    pub fn clear(&mut self, step: S) -> bool {
        let was = self.contains(step);
        self.bits &= !Self::mask(step);
        was
    }

    pub fn contains(&self, step: S) -> bool {
        self.bits & Self::mask(step) != 0
    }

    pub fn is_complete(&self) -> bool {
        S::iter().all(|s| self.contains(s))
    }

    pub fn clear_where(&mut self, pred: impl Fn(S) -> bool) {
        for step in S::iter() {
            if pred(step) {
                self.clear(step);
            }
        }
    }

    pub fn missing(&self) -> Vec<S> {
        S::iter().filter(|s| !self.contains(*s)).collect()
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }
}

impl<S: Copy + Into<u8> + IntoEnumIterator + fmt::Debug> fmt::Debug for StepSet<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(S::iter().filter(|s| self.contains(*s)))
            .finish()
    }
}

/// Everything the controller tracks about the modem, guarded by one lock.
#[derive(Debug, Clone, Default)]
pub struct DeviceStatus {
    pub state: DeviceState,
    pub init: StepSet<InitStep>,
    pub conn: StepSet<ConnStep>,
    pub ip_address: Option<String>,
}

impl DeviceStatus {
    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// The only place the state changes. Each target clears exactly the
    /// flags that stop holding once it is reached.
    pub fn transition(&mut self, to: DeviceState) {
        let from = self.state.clone();
        match &to {
            DeviceState::Uninitialized => {
                self.init = StepSet::default();
                self.conn = StepSet::default();
                self.ip_address = None;
            }
            DeviceState::Disconnected | DeviceState::Failed(_) => {
                self.init.clear_where(InitStep::is_post_boot);
                self.conn.clear_where(|s| s != ConnStep::StatusHealthy);
                self.ip_address = None;
            }
            DeviceState::Connected if from == DeviceState::IpAcquired => {
                self.conn.clear(ConnStep::ContextActivated);
                self.ip_address = None;
            }
            _ => {}
        }
        if from != to {
            log::info!("Modem state {from} -> {to}");
        }
        self.state = to;
    }

    /// Record a bring-up step and promote to `Started` once all are done.
    pub fn mark_init(&mut self, step: InitStep) {
        if self.init.set(step) {
            log::debug!("Init step {step:?} done");
        }
        self.promote_if_booted();
    }

    pub fn unmark_init(&mut self, step: InitStep) {
        if self.init.clear(step) {
            log::debug!("Init step {step:?} lost");
        }
    }

    pub fn mark_conn(&mut self, step: ConnStep) {
        if self.conn.set(step) {
            log::debug!("Connectivity step {step:?} done");
        }
    }

    pub fn unmark_conn(&mut self, step: ConnStep) {
        if self.conn.clear(step) {
            log::debug!("Connectivity step {step:?} lost");
        }
    }

    fn promote_if_booted(&mut self) {
        let waiting = matches!(
            self.state,
            DeviceState::Initializing | DeviceState::Configured | DeviceState::Disconnected
        );
        if waiting && self.init.is_complete() {
            self.transition(DeviceState::Started);
        }
    }
}

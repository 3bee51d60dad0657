use derive_more::Display;

/// Generic error kinds shared by every layer of the stack.
///
/// Vendor-specific codes are always mapped onto one of these so callers can
/// decide on retry policy without knowing modem firmware details.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    #[display("busy")]
    Busy,
    #[display("timeout")]
    Timeout,
    #[display("not connected")]
    NotConnected,
    #[display("disconnected")]
    Disconnected,
    #[display("device failure")]
    DeviceFailure,
    #[display("malformed response")]
    MalformedResponse,
    #[display("rejected")]
    Rejected,
    #[display("out of memory")]
    OutOfMemory,
    #[display("invalid argument")]
    InvalidArgument,
}

/// Errors produced by the transport, device and protocol client layers.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ModemError {
    #[display("resource busy, retry later")]
    Busy,
    #[display("timed out waiting for the modem")]
    Timeout,
    #[display("modem is not connected")]
    NotConnected,
    #[display("modem is disconnected")]
    Disconnected,
    #[display("modem answered ERROR")]
    CommandFailed,
    #[display("device failure: {_0}")]
    DeviceFailure(String),
    #[display("malformed response: {_0}")]
    MalformedResponse(String),
    #[display("modem rejected request with vendor code {code} ({kind})")]
    VendorRejected { code: u16, kind: ErrorKind },
    #[display("out of memory")]
    OutOfMemory,
    #[display("invalid argument: {_0}")]
    InvalidArgument(String),
    #[display("stale mutex token {presented} (current {current})")]
    StaleToken { presented: u64, current: u64 },
    #[display("no data context available")]
    NoDataContext,
    #[display("network registration denied")]
    RegistrationDenied,
    #[display("delivery failed with result code {result}")]
    DeliveryFailed { result: i32 },
    #[display("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[display("delivery outcome unknown")]
    Uncertain,
    #[display("http request returned status {status}")]
    HttpRejected { status: u16 },
    #[display("serial i/o error: {_0}")]
    Io(String),
    #[display("contract violation: {_0}")]
    ContractViolation(String),
}

impl std::error::Error for ModemError {}

impl ModemError {
    /// Nearest generic kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModemError::Busy | ModemError::Uncertain => ErrorKind::Busy,
            ModemError::Timeout => ErrorKind::Timeout,
            ModemError::NotConnected
            | ModemError::NoDataContext
            | ModemError::RegistrationDenied => ErrorKind::NotConnected,
            ModemError::Disconnected => ErrorKind::Disconnected,
            ModemError::DeviceFailure(_) | ModemError::Io(_) => ErrorKind::DeviceFailure,
            ModemError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            ModemError::VendorRejected { kind, .. } => *kind,
            ModemError::OutOfMemory => ErrorKind::OutOfMemory,
            ModemError::InvalidArgument(_)
            | ModemError::StaleToken { .. }
            | ModemError::ContractViolation(_) => ErrorKind::InvalidArgument,
            ModemError::CommandFailed
            | ModemError::DeliveryFailed { .. }
            | ModemError::RetriesExhausted { .. }
            | ModemError::HttpRejected { .. } => ErrorKind::Rejected,
        }
    }

    /// Vendor code carried by this error, if any.
    pub fn vendor_code(&self) -> Option<u16> {
        match self {
            ModemError::VendorRejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModemError::Busy | ModemError::Uncertain)
            || matches!(self.kind(), ErrorKind::Busy)
    }

    pub fn malformed(what: impl Into<String>) -> Self {
        ModemError::MalformedResponse(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        ModemError::InvalidArgument(what.into())
    }
}

impl From<std::io::Error> for ModemError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ModemError::Busy,
            std::io::ErrorKind::OutOfMemory => ModemError::OutOfMemory,
            _ => ModemError::Io(err.to_string()),
        }
    }
}

pub type Result<T, E = ModemError> = std::result::Result<T, E>;

//! Closed tables translating numeric modem codes into the shared error taxonomy.

use num_enum::TryFromPrimitive;

use super::error::{ErrorKind, ModemError};

/// Map a `+CME ERROR: <n>` code onto the nearest generic kind.
pub fn cme_error_kind(code: u16) -> ErrorKind {
    match code {
        // 3GPP TS 27.007 equipment errors
        3 | 4 | 50 | 552 | 555 | 572 => ErrorKind::InvalidArgument,
        10 | 13 | 15 | 16 | 17 | 18 => ErrorKind::DeviceFailure,
        14 | 551 | 564 | 568 | 574 => ErrorKind::Busy,
        20 | 23 | 553 => ErrorKind::OutOfMemory,
        30 | 31 | 32 | 561 | 573 => ErrorKind::NotConnected,
        567 | 570 => ErrorKind::Disconnected,
        569 => ErrorKind::Timeout,
        // socket, DNS and PDP failures of the TCP/IP stack land here too
        _ => ErrorKind::Rejected,
    }
}

pub fn cme_error(code: u16) -> ModemError {
    ModemError::VendorRejected {
        code,
        kind: cme_error_kind(code),
    }
}

/// Result field of MQTT request frames (`+QMTPUB`, `+QMTSUB`, `+QMTCONN`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i8)]
pub enum MqttResult {
    Acknowledged = 0,
    Retransmitting = 1,
    Failed = 2,
}

/// Result field of `+QMTOPEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i8)]
pub enum MqttOpenResult {
    Failed = -1,
    Opened = 0,
    WrongParameter = 1,
    IdentifierOccupied = 2,
    ContextActivationFailed = 3,
    DomainParseFailed = 4,
    NetworkDisconnected = 5,
}

impl MqttOpenResult {
    pub fn into_result(self) -> Result<(), ModemError> {
        match self {
            // the socket is already open from an earlier session, reuse it
            MqttOpenResult::Opened | MqttOpenResult::IdentifierOccupied => Ok(()),
            MqttOpenResult::WrongParameter => Err(ModemError::invalid("mqtt open parameters")),
            MqttOpenResult::ContextActivationFailed => Err(ModemError::NoDataContext),
            MqttOpenResult::NetworkDisconnected => Err(ModemError::Disconnected),
            MqttOpenResult::DomainParseFailed => Err(ModemError::VendorRejected {
                code: 4,
                kind: ErrorKind::NotConnected,
            }),
            MqttOpenResult::Failed => Err(ModemError::VendorRejected {
                code: 0,
                kind: ErrorKind::NotConnected,
            }),
        }
    }
}

/// CONNACK return code carried as the optional third field of `+QMTCONN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocol = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadCredentials = 4,
    NotAuthorized = 5,
}

impl ConnackCode {
    pub fn into_result(self) -> Result<(), ModemError> {
        let kind = match self {
            ConnackCode::Accepted => return Ok(()),
            ConnackCode::ServerUnavailable => ErrorKind::Busy,
            ConnackCode::UnacceptableProtocol | ConnackCode::IdentifierRejected => {
                ErrorKind::InvalidArgument
            }
            ConnackCode::BadCredentials | ConnackCode::NotAuthorized => ErrorKind::Rejected,
        };
        Err(ModemError::VendorRejected {
            code: self as u16,
            kind,
        })
    }
}

/// Error code of the `+QMTSTAT` session-state notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MqttStatCode {
    ClosedByPeer = 1,
    PingFailed = 2,
    ConnectTimeout = 3,
    ConnackFailed = 4,
    ClientDisconnected = 5,
    RetransmitExhausted = 6,
    LinkBroken = 7,
    ServerDisconnected = 8,
}

/// Map the diagnostic field of `+QHTTPGET`/`+QHTTPPOST`/`+QHTTPREAD`.
pub fn http_diagnostic(code: u16) -> Result<(), ModemError> {
    let kind = match code {
        0 => return Ok(()),
        702 | 722 | 726..=728 => ErrorKind::Timeout,
        703 | 704 | 706 | 724 | 725 => ErrorKind::Busy,
        705 | 711..=713 | 720 | 730 => ErrorKind::InvalidArgument,
        708 | 709 => ErrorKind::NotConnected,
        710 | 714..=719 => ErrorKind::Disconnected,
        721 | 723 => ErrorKind::MalformedResponse,
        729 => ErrorKind::OutOfMemory,
        _ => ErrorKind::Rejected,
    };
    Err(ModemError::VendorRejected { code, kind })
}

/// Outcome of an HTTP result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpOutcome {
    Ok,
    Forbidden,
    NotFound,
    Conflict,
    LengthRequired,
    ServerError,
    Unexpected,
}

impl HttpOutcome {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => HttpOutcome::Ok,
            403 => HttpOutcome::Forbidden,
            404 => HttpOutcome::NotFound,
            409 => HttpOutcome::Conflict,
            411 => HttpOutcome::LengthRequired,
            500..=599 => HttpOutcome::ServerError,
            _ => HttpOutcome::Unexpected,
        }
    }
}

/// `<stat>` of `+CEREG`/`+CREG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum RegistrationStatus {
    NotSearching = 0,
    Home = 1,
    Searching = 2,
    Denied = 3,
    Unknown = 4,
    Roaming = 5,
}

impl RegistrationStatus {
    pub fn is_registered(self) -> bool {
        matches!(self, RegistrationStatus::Home | RegistrationStatus::Roaming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cme_table() {
        assert_eq!(cme_error_kind(569), ErrorKind::Timeout);
        assert_eq!(cme_error_kind(14), ErrorKind::Busy);
        assert_eq!(cme_error_kind(23), ErrorKind::OutOfMemory);
        assert_eq!(cme_error_kind(10), ErrorKind::DeviceFailure);
        assert_eq!(cme_error_kind(9999), ErrorKind::Rejected);
        assert_eq!(cme_error(570).vendor_code(), Some(570));
    }

    #[test]
    fn test_mqtt_result_codes() {
        assert_eq!(MqttResult::try_from(0).ok(), Some(MqttResult::Acknowledged));
        assert_eq!(MqttResult::try_from(1).ok(), Some(MqttResult::Retransmitting));
        assert_eq!(MqttResult::try_from(2).ok(), Some(MqttResult::Failed));
        assert!(MqttResult::try_from(3).is_err());
    }

    #[test]
    fn test_open_result_reuses_occupied_socket() {
        assert!(MqttOpenResult::IdentifierOccupied.into_result().is_ok());
        assert_eq!(
            MqttOpenResult::ContextActivationFailed.into_result(),
            Err(ModemError::NoDataContext)
        );
    }

    #[test]
    fn test_http_tables() {
        assert!(http_diagnostic(0).is_ok());
        assert_eq!(
            http_diagnostic(702).map_err(|e| e.kind()),
            Err(ErrorKind::Timeout)
        );
        assert_eq!(HttpOutcome::from_status(204), HttpOutcome::Ok);
        assert_eq!(HttpOutcome::from_status(411), HttpOutcome::LengthRequired);
        assert_eq!(HttpOutcome::from_status(503), HttpOutcome::ServerError);
        assert_eq!(HttpOutcome::from_status(302), HttpOutcome::Unexpected);
    }

    #[test]
    fn test_connack_codes() {
        assert!(ConnackCode::Accepted.into_result().is_ok());
        assert_eq!(
            ConnackCode::BadCredentials.into_result().map_err(|e| e.kind()),
            Err(ErrorKind::Rejected)
        );
    }
}

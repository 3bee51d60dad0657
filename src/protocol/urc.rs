//! Unsolicited result codes the background drain loop recognises.
//!
//! The set is closed: every [`Notification`] must have a handler registered
//! before the transport starts. Matching is line-anchored so `RDY` never
//! fires on `APP RDY`.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use strum::{Display, EnumIter, IntoEnumIterator};

use super::{
    error::{ModemError, Result},
    response::{Field, Grammar},
    ring_buffer::RingBuffer,
};

/// Parse order of the background task is the declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, Display)]
pub enum Notification {
    #[strum(to_string = "app-ready")]
    AppReady,
    #[strum(to_string = "ready")]
    Ready,
    #[strum(to_string = "functionality")]
    Functionality,
    #[strum(to_string = "sim-state")]
    SimState,
    #[strum(to_string = "sms-done")]
    SmsDone,
    #[strum(to_string = "powered-down")]
    PoweredDown,
    #[strum(to_string = "pdp-deactivated")]
    PdpDeactivated,
    #[strum(to_string = "mqtt-state")]
    MqttState,
    #[strum(to_string = "mqtt-receive")]
    MqttReceive,
}

const CFUN: Grammar = Grammar::new("+CFUN", &[Field::int("fun")]);
const CPIN: Grammar = Grammar::new("+CPIN", &[Field::text("state")]);
const QIURC: Grammar = Grammar::new("+QIURC", &[Field::text("event"), Field::int("context")]);
const QMTSTAT: Grammar = Grammar::new("+QMTSTAT", &[Field::int("socket"), Field::int("code")]);

/// Decoded notification handed to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Urc {
    Ready,
    AppReady,
    Functionality(u8),
    SimState(String),
    SmsDone,
    PoweredDown,
    PdpDeactivated(u8),
    MqttState {
        socket: u8,
        code: u8,
    },
    MqttReceive {
        socket: u8,
        msg_id: u16,
        topic: String,
        payload: Bytes,
    },
}

/// Callback invoked on the drain thread. Must return quickly.
pub type NotificationHandler = Arc<dyn Fn(Urc) + Send + Sync>;

impl Notification {
    pub fn prefix(self) -> &'static [u8] {
        match self {
            Notification::AppReady => b"APP RDY",
            Notification::Ready => b"RDY",
            Notification::Functionality => b"+CFUN: ",
            Notification::SimState => b"+CPIN: ",
            Notification::SmsDone => b"+QIND: SMS DONE",
            Notification::PoweredDown => b"POWERED DOWN",
            Notification::PdpDeactivated => b"+QIURC: \"pdpdeact\"",
            Notification::MqttState => b"+QMTSTAT: ",
            Notification::MqttReceive => b"+QMTRECV: ",
        }
    }

    /// Notification whose prefix starts `line`, if any.
    pub fn classify(line: &[u8]) -> Option<Notification> {
        Notification::iter().find(|n| line.starts_with(n.prefix()))
    }

    /// End (exclusive) of the frame beginning at `start`, or `None` while it
    /// is still incomplete.
    pub fn frame_end(self, rb: &RingBuffer, start: usize) -> Option<usize> {
        match self {
            Notification::MqttReceive => match parse_recv(&rb.slice(start..rb.len())) {
                RecvParse::Incomplete => None,
                RecvParse::Malformed(n) | RecvParse::Complete(n, _) => Some(start + n),
            },
            _ => rb.find(b"\r\n", start).map(|end| end + 2),
        }
    }

    /// Remove the first complete frame of this notification from the buffer.
    pub fn extract(self, rb: &mut RingBuffer) -> Option<Result<Urc>> {
        let start = rb.find_line_start(self.prefix(), 0)?;
        if self == Notification::MqttReceive {
            return match parse_recv(&rb.slice(start..rb.len())) {
                RecvParse::Incomplete => None,
                RecvParse::Malformed(n) => {
                    let raw = rb.take_range(start..start + n);
                    Some(Err(ModemError::malformed(format!(
                        "bad +QMTRECV frame {}",
                        crate::utils::escape_bytes(&raw)
                    ))))
                }
                RecvParse::Complete(n, urc) => {
                    rb.take_range(start..start + n);
                    Some(Ok(urc))
                }
            };
        }
        let end = rb.find(b"\r\n", start)?;
        let line = rb.take_range(start..end + 2);
        Some(self.decode(&line))
    }

    fn decode(self, line: &[u8]) -> Result<Urc> {
        Ok(match self {
            Notification::AppReady => Urc::AppReady,
            Notification::Ready => Urc::Ready,
            Notification::SmsDone => Urc::SmsDone,
            Notification::PoweredDown => Urc::PoweredDown,
            Notification::Functionality => Urc::Functionality(CFUN.parse(line)?.get("fun")?),
            Notification::SimState => Urc::SimState(CPIN.parse(line)?.text("state")?.to_string()),
            Notification::PdpDeactivated => {
                Urc::PdpDeactivated(QIURC.parse(line)?.get("context")?)
            }
            Notification::MqttState => {
                let frame = QMTSTAT.parse(line)?;
                Urc::MqttState {
                    socket: frame.get("socket")?,
                    code: frame.get("code")?,
                }
            }
            Notification::MqttReceive => {
                return Err(ModemError::ContractViolation(
                    "+QMTRECV is length framed".into(),
                ))
            }
        })
    }
}

/// Table from notification to handler, frozen when the transport starts.
#[derive(Clone, Default)]
pub struct HandlerTable {
    entries: Vec<(Notification, NotificationHandler)>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(n, _)| n))
            .finish()
    }
}

impl HandlerTable {
    pub fn insert(&mut self, notification: Notification, handler: NotificationHandler) {
        self.entries.retain(|(n, _)| *n != notification);
        self.entries.push((notification, handler));
    }

    pub fn get(&self, notification: Notification) -> Option<&NotificationHandler> {
        self.entries
            .iter()
            .find(|(n, _)| *n == notification)
            .map(|(_, h)| h)
    }

    /// Notifications that still lack a handler.
    pub fn missing(&self) -> Vec<Notification> {
        Notification::iter()
            .filter(|n| self.get(*n).is_none())
            .collect()
    }
}

enum RecvParse {
    Incomplete,
    /// Bytes to drop: the frame is not a valid `+QMTRECV`.
    Malformed(usize),
    Complete(usize, Urc),
}

/// Frame a `+QMTRECV` notification.
///
/// With length reporting enabled the modem sends
/// `+QMTRECV: <socket>,<msgid>,"<topic>",<len>,"<payload>"` and the payload
/// may itself contain CR/LF, so the declared length decides where it ends.
/// Without it the payload runs to the closing `"\r\n`.
fn parse_recv(bytes: &[u8]) -> RecvParse {
    let mut cur = Cursor {
        bytes,
        pos: Notification::MqttReceive.prefix().len(),
    };
    let malformed = |bytes: &[u8]| match bytes.windows(2).position(|w| w == b"\r\n") {
        Some(i) => RecvParse::Malformed(i + 2),
        None => RecvParse::Incomplete,
    };

    let Some(socket) = cur.number(b',') else {
        return if cur.exhausted() {
            RecvParse::Incomplete
        } else {
            malformed(bytes)
        };
    };
    let Some(msg_id) = cur.number(b',') else {
        return if cur.exhausted() {
            RecvParse::Incomplete
        } else {
            malformed(bytes)
        };
    };
    let Some(topic) = cur.quoted() else {
        return if cur.exhausted() {
            RecvParse::Incomplete
        } else {
            malformed(bytes)
        };
    };
    if cur.exhausted() {
        return RecvParse::Incomplete;
    }
    if !cur.eat(b',') {
        return malformed(bytes);
    }
    if cur.exhausted() {
        return RecvParse::Incomplete;
    }

    let payload = if cur.peek() == Some(b'"') {
        let body = &bytes[cur.pos + 1..];
        match body.windows(3).position(|w| w == b"\"\r\n") {
            Some(i) => {
                let payload = Bytes::copy_from_slice(&body[..i]);
                cur.pos += 1 + i + 3;
                payload
            }
            None => return RecvParse::Incomplete,
        }
    } else {
        let Some(len) = cur.number(b',') else {
            return if cur.exhausted() {
                RecvParse::Incomplete
            } else {
                malformed(bytes)
            };
        };
        let begin = cur.pos + 1;
        let end = begin + len as usize;
        if bytes.len() < end + 3 {
            return RecvParse::Incomplete;
        }
        if bytes[cur.pos] != b'"' || &bytes[end..end + 3] != b"\"\r\n" {
            return malformed(bytes);
        }
        cur.pos = end + 3;
        Bytes::copy_from_slice(&bytes[begin..end])
    };

    let (Ok(socket), Ok(msg_id)) = (u8::try_from(socket), u16::try_from(msg_id)) else {
        return RecvParse::Malformed(cur.pos);
    };
    RecvParse::Complete(
        cur.pos,
        Urc::MqttReceive {
            socket,
            msg_id,
            topic,
            payload,
        },
    )
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn exhausted(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Decimal digits followed by `delim`; the delimiter is consumed.
    fn number(&mut self, delim: u8) -> Option<u64> {
        let start = self.pos;
        let mut value: u64 = 0;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => {
                    value = value.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
                    self.pos += 1;
                }
                b if b == delim && self.pos > start => {
                    self.pos += 1;
                    return Some(value);
                }
                _ => return None,
            }
        }
        None
    }

    fn quoted(&mut self) -> Option<String> {
        if !self.eat(b'"') {
            return None;
        }
        let start = self.pos;
        let len = self.bytes[start..].iter().position(|b| *b == b'"')?;
        self.pos = start + len + 1;
        Some(String::from_utf8_lossy(&self.bytes[start..start + len]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(data: &[u8]) -> RingBuffer {
        let mut rb = RingBuffer::new(512);
        rb.extend_from_slice(data);
        rb
    }

    #[test]
    fn test_boot_lines_are_anchored() {
        let mut rb = buffer(b"\r\nAPP RDY\r\n");
        assert!(Notification::Ready.extract(&mut rb).is_none());
        assert_eq!(
            Notification::AppReady.extract(&mut rb).unwrap().unwrap(),
            Urc::AppReady
        );
    }

    #[test]
    fn test_decode_labelled_notifications() {
        let mut rb = buffer(b"\r\n+CPIN: READY\r\n\r\n+QMTSTAT: 0,1\r\n+CFUN: 1\r\n");
        assert_eq!(
            Notification::SimState.extract(&mut rb).unwrap().unwrap(),
            Urc::SimState("READY".into())
        );
        assert_eq!(
            Notification::MqttState.extract(&mut rb).unwrap().unwrap(),
            Urc::MqttState { socket: 0, code: 1 }
        );
        assert_eq!(
            Notification::Functionality.extract(&mut rb).unwrap().unwrap(),
            Urc::Functionality(1)
        );
        assert_eq!(rb.snapshot().as_ref(), b"\r\n\r\n");
    }

    #[test]
    fn test_partial_line_waits() {
        let mut rb = buffer(b"+QMTSTAT: 0,");
        assert!(Notification::MqttState.extract(&mut rb).is_none());
        assert_eq!(rb.len(), 12);
    }

    #[test]
    fn test_recv_with_length_allows_crlf_in_payload() {
        let mut rb = buffer(b"+QMTRECV: 0,5,\"gw/cfg\",4,\"a\r\nb\"\r\nOK\r\n");
        let urc = Notification::MqttReceive.extract(&mut rb).unwrap().unwrap();
        assert_eq!(
            urc,
            Urc::MqttReceive {
                socket: 0,
                msg_id: 5,
                topic: "gw/cfg".into(),
                payload: Bytes::from_static(b"a\r\nb"),
            }
        );
        assert_eq!(rb.snapshot().as_ref(), b"OK\r\n");
    }

    #[test]
    fn test_recv_incomplete_payload_waits() {
        let mut rb = buffer(b"+QMTRECV: 0,5,\"t\",10,\"abc");
        assert!(Notification::MqttReceive.extract(&mut rb).is_none());
        assert_eq!(Notification::MqttReceive.frame_end(&rb, 0), None);
    }

    #[test]
    fn test_recv_without_length() {
        let mut rb = buffer(b"+QMTRECV: 1,0,\"t\",\"{\\\"a\\\":1}\"\r\n");
        match Notification::MqttReceive.extract(&mut rb).unwrap().unwrap() {
            Urc::MqttReceive {
                socket, payload, ..
            } => {
                assert_eq!(socket, 1);
                assert_eq!(payload.as_ref(), b"{\\\"a\\\":1}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_recv_is_dropped() {
        let mut rb = buffer(b"+QMTRECV: x\r\nOK\r\n");
        assert!(Notification::MqttReceive.extract(&mut rb).unwrap().is_err());
        assert_eq!(rb.snapshot().as_ref(), b"OK\r\n");
    }

    #[test]
    fn test_handler_table_reports_missing() {
        let mut table = HandlerTable::default();
        assert_eq!(table.missing().len(), Notification::iter().count());
        for n in Notification::iter() {
            table.insert(n, Arc::new(|_: Urc| {}));
        }
        assert!(table.missing().is_empty());
    }
}

//! Bounded wait loops over the shared receive buffer.
//!
//! Every loop polls against a monotonic deadline, checks that the caller
//! still holds the command channel, and removes only the span it matched.
//! On timeout nothing is consumed.

use std::{ops::Range, time::Duration};

use bytes::{Bytes, BytesMut};

use super::{pending::Correlation, DeviceController, MutexToken, RequestTag};
use crate::{
    protocol::{
        codes::cme_error,
        error::{ModemError, Result},
        response::{
            parse_cme, Grammar, ReplyBlock, ResponseFrame, Terminal, CME_ERROR_PREFIX, ERROR_LINE,
            OK_LINE,
        },
        ring_buffer::RingBuffer,
        urc::Notification,
    },
    utils::{escape_bytes, Deadline},
};

/// Verdict of a frame filter in [`DeviceController::wait_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accept {
    Take,
    /// Late reply of an abandoned request; drop it and keep waiting.
    Discard,
    /// Identifiers do not belong to this request.
    Mismatch(String),
}

/// First complete terminal status line, searched from the buffer start.
fn scan_terminal(rb: &RingBuffer) -> Option<(Terminal, Range<usize>)> {
    let ok = rb
        .find_line_start(OK_LINE, 0)
        .map(|s| (Terminal::Ok, s..s + OK_LINE.len()));
    let error = rb
        .find_line_start(ERROR_LINE, 0)
        .map(|s| (Terminal::Error, s..s + ERROR_LINE.len()));
    let cme = rb.find_line(CME_ERROR_PREFIX, b"\r\n").map(|range| {
        let code = parse_cme(&rb.slice(range.clone())).unwrap_or(0);
        (Terminal::CmeError(code), range)
    });
    [ok, error, cme]
        .into_iter()
        .flatten()
        .min_by_key(|(_, range)| range.start)
}

fn terminal_error(terminal: &Terminal) -> Option<ModemError> {
    match terminal {
        Terminal::Ok => None,
        Terminal::Error => Some(ModemError::CommandFailed),
        Terminal::CmeError(code) => Some(cme_error(*code)),
    }
}

/// Drop complete stale lines left by earlier commands, keeping notification
/// frames (complete or not) and any trailing partial line.
pub(super) fn sweep_stale(rb: &mut RingBuffer) -> usize {
    let data = rb.snapshot();
    let mut keep = Vec::with_capacity(data.len());
    let mut dropped = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let rest = &data[pos..];
        if let Some(notification) = Notification::classify(rest) {
            match notification.frame_end(rb, pos) {
                Some(end) => {
                    keep.extend_from_slice(&data[pos..end]);
                    pos = end;
                    continue;
                }
                None => {
                    keep.extend_from_slice(rest);
                    break;
                }
            }
        }
        match rest.windows(2).position(|w| w == b"\r\n") {
            Some(i) => {
                dropped.extend_from_slice(&rest[..i + 2]);
                pos += i + 2;
            }
            None => {
                keep.extend_from_slice(rest);
                break;
            }
        }
    }
    if dropped.is_empty() {
        return 0;
    }
    if dropped.iter().any(|b| !b.is_ascii_whitespace()) {
        log::warn!("Discarding stale reply bytes {}", escape_bytes(&dropped));
    }
    rb.clear();
    rb.extend_from_slice(&keep);
    dropped.len()
}

impl DeviceController {
    fn poll_interval(&self) -> Duration {
        self.timing.poll
    }

    /// Read until `OK`, `ERROR` or `+CME ERROR: <n>`.
    ///
    /// The consumption boundary is the buffer start through the end of the
    /// terminal line: `"garbage\r\nOK\r\n"` is consumed whole and returned.
    pub fn read_reply(&self, token: MutexToken, timeout: Duration) -> Result<ReplyBlock> {
        let deadline = Deadline::after(timeout);
        loop {
            self.mutex.renew(token)?;
            let found = self.transport.with_buffer(|rb| {
                scan_terminal(rb).map(|(terminal, range)| (terminal, rb.take_through(range.end)))
            });
            if let Some((terminal, bytes)) = found {
                log::debug!("{token} reply {}", escape_bytes(&bytes));
                return match terminal_error(&terminal) {
                    None => Ok(ReplyBlock { bytes }),
                    Some(err) => Err(err),
                };
            }
            if deadline.expired() {
                log::warn!("{token} no OK/ERROR within {timeout:?}");
                return Err(ModemError::Timeout);
            }
            deadline.pause(self.poll_interval());
        }
    }

    /// Wait for `prompt` (`> ` or `CONNECT\r\n`) and consume through it.
    pub fn wait_prompt(&self, token: MutexToken, prompt: &[u8], timeout: Duration) -> Result<()> {
        let deadline = Deadline::after(timeout);
        loop {
            self.mutex.renew(token)?;
            let outcome = self.transport.with_buffer(|rb| {
                let at = rb.find(prompt, 0);
                let failure = scan_terminal(rb)
                    .filter(|(t, range)| *t != Terminal::Ok && at.map_or(true, |p| range.start < p));
                if let Some((terminal, range)) = failure {
                    rb.take_through(range.end);
                    return Some(Err(terminal));
                }
                at.map(|p| {
                    rb.take_through(p + prompt.len());
                    Ok(())
                })
            });
            match outcome {
                Some(Ok(())) => return Ok(()),
                Some(Err(terminal)) => {
                    return Err(terminal_error(&terminal).unwrap_or(ModemError::CommandFailed))
                }
                None => {}
            }
            if deadline.expired() {
                log::warn!("{token} prompt {} not seen within {timeout:?}", escape_bytes(prompt));
                return Err(ModemError::Timeout);
            }
            deadline.pause(self.poll_interval());
        }
    }

    /// Wait for a labelled frame of `grammar` that `accept` takes.
    ///
    /// Frames the filter discards are dropped and the wait continues; a
    /// mismatch or a frame that does not parse is a malformed response. An
    /// `ERROR`/`+CME ERROR` line ahead of the frame fails the wait.
    pub fn wait_frame(
        &self,
        token: MutexToken,
        grammar: &Grammar,
        timeout: Duration,
        mut accept: impl FnMut(&ResponseFrame) -> Accept,
    ) -> Result<ResponseFrame> {
        let prefix = grammar.prefix();
        let deadline = Deadline::after(timeout);
        loop {
            self.mutex.renew(token)?;
            let outcome = self.transport.with_buffer(|rb| {
                let frame = rb.find_line(prefix.as_bytes(), b"\r\n");
                let failure = scan_terminal(rb).filter(|(t, range)| {
                    *t != Terminal::Ok && frame.as_ref().map_or(true, |f| range.start < f.start)
                });
                if let Some((terminal, range)) = failure {
                    rb.take_through(range.end);
                    return Some(Err(terminal));
                }
                frame.map(|range| Ok(rb.take_range(range)))
            });

            match outcome {
                Some(Ok(line)) => {
                    let frame = grammar.parse(&line)?;
                    match accept(&frame) {
                        Accept::Take => return Ok(frame),
                        Accept::Discard => {
                            log::warn!("{token} discarded late frame {}", escape_bytes(&line));
                            continue;
                        }
                        Accept::Mismatch(why) => {
                            return Err(ModemError::malformed(format!(
                                "{} does not match request: {why}",
                                escape_bytes(&line)
                            )))
                        }
                    }
                }
                Some(Err(terminal)) => {
                    return Err(terminal_error(&terminal).unwrap_or(ModemError::CommandFailed))
                }
                None => {}
            }
            if deadline.expired() {
                log::warn!("{token} no {} within {timeout:?}", grammar.label);
                return Err(ModemError::Timeout);
            }
            deadline.pause(self.poll_interval());
        }
    }

    /// Read bytes up to `terminal`, consume through it and return what
    /// preceded it (the terminal literal itself is trimmed).
    pub fn read_until(&self, token: MutexToken, terminal: &[u8], timeout: Duration) -> Result<Bytes> {
        let deadline = Deadline::after(timeout);
        loop {
            self.mutex.renew(token)?;
            let body = self.transport.with_buffer(|rb| {
                rb.find(terminal, 0).map(|at| {
                    let body = rb.take_through(at);
                    rb.take_through(terminal.len());
                    body
                })
            });
            if let Some(body) = body {
                return Ok(body);
            }
            if deadline.expired() {
                return Err(ModemError::Timeout);
            }
            deadline.pause(self.poll_interval());
        }
    }

    /// Like [`read_until`](Self::read_until), but for bodies that may not fit
    /// the receive buffer: bytes that cannot start `terminal` are moved out
    /// as they arrive. Meant for pass-through transfers. Unlike the other
    /// loops, a timeout drops what was already moved out.
    pub fn read_stream_until(&self, token: MutexToken, terminal: &[u8], timeout: Duration) -> Result<Bytes> {
        let keep = terminal.len().saturating_sub(1);
        let mut body = BytesMut::new();
        let deadline = Deadline::after(timeout);
        loop {
            self.mutex.renew(token)?;
            let done = self.transport.with_buffer(|rb| {
                if let Some(at) = rb.find(terminal, 0) {
                    body.extend_from_slice(&rb.take_through(at));
                    rb.take_through(terminal.len());
                    return true;
                }
                if rb.len() > keep {
                    body.extend_from_slice(&rb.take_through(rb.len() - keep));
                }
                false
            });
            if done {
                return Ok(body.freeze());
            }
            if deadline.expired() {
                log::warn!("{token} body end not seen within {timeout:?} after {} bytes", body.len());
                return Err(ModemError::Timeout);
            }
            deadline.pause(self.poll_interval());
        }
    }

    /// Read exactly `len` bytes from the front of the buffer.
    pub fn read_exact(&self, token: MutexToken, len: usize, timeout: Duration) -> Result<Bytes> {
        if len > self.transport.config().buffer_capacity {
            return Err(ModemError::invalid(format!(
                "{len} byte read exceeds the {} byte receive buffer",
                self.transport.config().buffer_capacity
            )));
        }
        let deadline = Deadline::after(timeout);
        loop {
            self.mutex.renew(token)?;
            let chunk = self
                .transport
                .with_buffer(|rb| (rb.len() >= len).then(|| rb.take_through(len)));
            if let Some(chunk) = chunk {
                return Ok(chunk);
            }
            if deadline.expired() {
                return Err(ModemError::Timeout);
            }
            deadline.pause(self.poll_interval());
        }
    }

    /// Filter for frames carrying `(socket, id)` correlation fields.
    ///
    /// A frame for another socket is a mismatch. A frame for this socket but
    /// another id is discarded when that id was abandoned earlier, and is a
    /// mismatch otherwise.
    pub fn correlate(
        &self,
        label: &'static str,
        socket: u8,
        id: Option<u32>,
    ) -> impl FnMut(&ResponseFrame) -> Accept + '_ {
        move |frame: &ResponseFrame| {
            let got_socket = match frame.get::<u8>("socket") {
                Ok(s) => s,
                Err(e) => return Accept::Mismatch(e.to_string()),
            };
            let got_id = match id {
                Some(_) => match frame.get::<u32>("msg_id") {
                    Ok(m) => Some(m),
                    Err(e) => return Accept::Mismatch(e.to_string()),
                },
                None => None,
            };
            if let Some(got) = got_id {
                if got_id != id {
                    let key = Correlation::new(label, got_socket, got);
                    if self.abandoned.claim(&key).is_some() {
                        return Accept::Discard;
                    }
                    return Accept::Mismatch(format!("message id {got}, expected {:?}", id));
                }
            }
            if got_socket != socket {
                return Accept::Mismatch(format!("socket {got_socket}, expected {socket}"));
            }
            Accept::Take
        }
    }

    /// Remember that the reply correlated by `key` will never be waited for.
    pub fn abandon(&self, key: Correlation, tag: RequestTag) {
        self.abandoned.abandon(key, tag);
    }
}

//! In-memory modem used by unit and integration tests.
//!
//! [`ScriptedModem`] answers complete command lines from a rule table,
//! treats the write following a prompt as a payload, and lets tests inject
//! unsolicited notifications at any time.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use flume::Sender;
use parking_lot::Mutex;

use super::{OutputPin, PinEdge, StatusLine};

struct Rule {
    prefix: String,
    reply: Vec<u8>,
    after_payload: Option<Vec<u8>>,
    once: bool,
}

#[derive(Default)]
struct Script {
    rx: VecDeque<u8>,
    line: Vec<u8>,
    rules: Vec<Rule>,
    default_reply: Option<Vec<u8>>,
    awaiting_payload: Option<Vec<u8>>,
    commands: Vec<String>,
    payloads: Vec<Vec<u8>>,
    fail_reads: bool,
}

impl Script {
    fn answer(&mut self, command: String) {
        let position = self
            .rules
            .iter()
            .position(|r| r.once && command.starts_with(&r.prefix))
            .or_else(|| {
                self.rules
                    .iter()
                    .position(|r| !r.once && command.starts_with(&r.prefix))
            });
        match position {
            Some(index) => {
                let (reply, after_payload) = {
                    let rule = &self.rules[index];
                    (rule.reply.clone(), rule.after_payload.clone())
                };
                if self.rules[index].once {
                    self.rules.remove(index);
                }
                self.rx.extend(reply);
                self.awaiting_payload = after_payload;
            }
            None => {
                if let Some(reply) = &self.default_reply {
                    self.rx.extend(reply.iter().copied());
                }
            }
        }
        self.commands.push(command);
    }
}

/// Scripted stand-in for an AT modem.
#[derive(Clone, Default)]
pub struct ScriptedModem {
    script: Arc<Mutex<Script>>,
}

impl ScriptedModem {
    /// Modem that answers every unknown command with `OK`.
    pub fn new() -> Self {
        let modem = Self::default();
        modem.script.lock().default_reply = Some(b"\r\nOK\r\n".to_vec());
        modem
    }

    /// Modem that has already booted, holds an active data context and is
    /// registered on its home network.
    pub fn online() -> Self {
        let modem = Self::new();
        modem
            .on("AT+CFUN?", "\r\n+CFUN: 1\r\n\r\nOK\r\n")
            .on("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n")
            .on("AT+QIACT?", "\r\n+QIACT: 1,1,1,\"10.64.0.9\"\r\n\r\nOK\r\n")
            .on("AT+COPS?", "\r\n+COPS: 0,0,\"Carrier\",7\r\n\r\nOK\r\n")
            .on("AT+CEREG?", "\r\n+CEREG: 0,1\r\n\r\nOK\r\n");
        modem
    }

    /// Modem that stays silent for unknown commands.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Reply with `reply` to every command starting with `prefix`.
    pub fn on(&self, prefix: &str, reply: &str) -> &Self {
        self.push_rule(prefix, reply.as_bytes(), None, false)
    }

    /// Reply with `reply` to the next command starting with `prefix` only.
    pub fn once(&self, prefix: &str, reply: &str) -> &Self {
        self.push_rule(prefix, reply.as_bytes(), None, true)
    }

    /// Reply with `prompt`, then answer the following payload write with `reply`.
    pub fn on_payload(&self, prefix: &str, prompt: &str, reply: &str) -> &Self {
        self.push_rule(prefix, prompt.as_bytes(), Some(reply.as_bytes()), false)
    }

    pub fn once_payload(&self, prefix: &str, prompt: &str, reply: &str) -> &Self {
        self.push_rule(prefix, prompt.as_bytes(), Some(reply.as_bytes()), true)
    }

    /// Like [`on`](Self::on) with raw bytes, for binary bodies.
    pub fn on_bytes(&self, prefix: &str, reply: &[u8]) -> &Self {
        self.push_rule(prefix, reply, None, false)
    }

    fn push_rule(
        &self,
        prefix: &str,
        reply: &[u8],
        after_payload: Option<&[u8]>,
        once: bool,
    ) -> &Self {
        self.script.lock().rules.push(Rule {
            prefix: prefix.to_string(),
            reply: reply.to_vec(),
            after_payload: after_payload.map(|p| p.to_vec()),
            once,
        });
        self
    }

    /// Queue unsolicited bytes as if the modem emitted them.
    pub fn inject(&self, bytes: &str) {
        self.script.lock().rx.extend(bytes.as_bytes().iter().copied());
    }

    /// Every command line written so far, without the line terminator.
    pub fn commands(&self) -> Vec<String> {
        self.script.lock().commands.clone()
    }

    /// Every payload written after a prompt.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.script.lock().payloads.clone()
    }

    pub fn sent(&self, prefix: &str) -> bool {
        self.script
            .lock()
            .commands
            .iter()
            .any(|c| c.starts_with(prefix))
    }

    /// Make subsequent reads fail with an I/O error.
    pub fn break_link(&self) {
        self.script.lock().fail_reads = true;
    }
}

impl Read for ScriptedModem {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut script = self.script.lock();
        if script.fail_reads {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link broken"));
        }
        let n = buf.len().min(script.rx.len());
        for (slot, byte) in buf.iter_mut().zip(script.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for ScriptedModem {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut script = self.script.lock();
        if let Some(reply) = script.awaiting_payload.take() {
            script.payloads.push(buf.to_vec());
            script.rx.extend(reply);
            return Ok(buf.len());
        }
        for &byte in buf {
            script.line.push(byte);
            if script.line.ends_with(b"\r\n") {
                let raw = std::mem::take(&mut script.line);
                let command = String::from_utf8_lossy(&raw[..raw.len() - 2]).into_owned();
                script.answer(command);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Output pin recording every level it was driven to.
#[derive(Clone, Default)]
pub struct MockPin {
    levels: Arc<Mutex<Vec<bool>>>,
}

impl MockPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn levels(&self) -> Vec<bool> {
        self.levels.lock().clone()
    }
}

impl OutputPin for MockPin {
    fn set_high(&mut self) -> Result<()> {
        self.levels.lock().push(true);
        Ok(())
    }

    fn set_low(&mut self) -> Result<()> {
        self.levels.lock().push(false);
        Ok(())
    }
}

/// Status input whose level is driven by the test.
#[derive(Clone)]
pub struct MockStatusLine {
    level: Arc<AtomicBool>,
    subscribers: Arc<Mutex<Vec<Sender<PinEdge>>>>,
}

impl MockStatusLine {
    pub fn new(high: bool) -> Self {
        Self {
            level: Arc::new(AtomicBool::new(high)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Change the level and fire an edge if it actually changed.
    pub fn set_level(&self, high: bool) {
        let previous = self.level.swap(high, Ordering::SeqCst);
        if previous == high {
            return;
        }
        let edge = if high {
            PinEdge::Rising
        } else {
            PinEdge::Falling
        };
        for tx in self.subscribers.lock().iter() {
            let _ = tx.try_send(edge);
        }
    }
}

impl StatusLine for MockStatusLine {
    fn is_high(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    fn subscribe(&self, edges: Sender<PinEdge>) -> Result<()> {
        self.subscribers.lock().push(edges);
        Ok(())
    }
}

use std::{
    io::{ErrorKind as IoErrorKind, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bytes::Bytes;
use flume::{Receiver, Sender};
use parking_lot::Mutex;

use super::{
    error::{ModemError, Result},
    hal::SerialChannel,
    ring_buffer::RingBuffer,
    urc::{HandlerTable, Notification, NotificationHandler, Urc},
};
use crate::utils::escape_bytes;

/// Line terminator appended to every command.
pub const LINE_END: &[u8] = b"\r\n";

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub buffer_capacity: usize,
    /// Sleep between drain cycles.
    pub poll_interval: Duration,
    /// Bounded wait on the link lock, for both writers and the drain loop.
    pub lock_timeout: Duration,
    pub read_chunk: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 4096,
            poll_interval: Duration::from_millis(5),
            lock_timeout: Duration::from_millis(100),
            read_chunk: 256,
        }
    }
}

#[derive(Debug)]
enum TransportCommand {
    Stop,
}

/// Reported by the drain loop to whoever watches the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Fault(String),
    Stopped,
}

type SharedLink = Arc<Mutex<Box<dyn SerialChannel>>>;

/// Single owner of the half-duplex serial link.
///
/// Writers serialize on the link lock with a short bounded wait. A background
/// thread drains input into the shared [`RingBuffer`] and dispatches every
/// recognised notification to its handler.
pub struct TransportProcessor {
    link: SharedLink,
    buffer: Arc<Mutex<RingBuffer>>,
    handlers: Mutex<HandlerTable>,
    passthrough: Arc<AtomicBool>,
    running: AtomicBool,
    cmd_tx: Mutex<Option<Sender<TransportCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    evt_tx: Sender<TransportEvent>,
    evt_rx: Receiver<TransportEvent>,
    config: TransportConfig,
}

impl std::fmt::Debug for TransportProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportProcessor")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl TransportProcessor {
    pub fn new(channel: Box<dyn SerialChannel>, config: TransportConfig) -> Self {
        let (evt_tx, evt_rx) = flume::unbounded();
        Self {
            link: Arc::new(Mutex::new(channel)),
            buffer: Arc::new(Mutex::new(RingBuffer::new(config.buffer_capacity))),
            handlers: Mutex::new(HandlerTable::default()),
            passthrough: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            cmd_tx: Mutex::new(None),
            worker: Mutex::new(None),
            evt_tx,
            evt_rx,
            config,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register the handler for one notification. Only allowed before [`start`](Self::start).
    pub fn register(&self, notification: Notification, handler: NotificationHandler) -> Result<()> {
        if self.is_running() {
            return Err(ModemError::ContractViolation(format!(
                "handler for {notification} registered after the drain loop started"
            )));
        }
        self.handlers.lock().insert(notification, handler);
        Ok(())
    }

    /// Start the background drain loop. Idempotent.
    ///
    /// Fails with a contract violation when any notification lacks a handler.
    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let handlers = self.handlers.lock().clone();
        let missing = handlers.missing();
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|n| n.to_string()).collect();
            log::error!("Refusing to start transport, unhandled notifications: {names:?}");
            return Err(ModemError::ContractViolation(format!(
                "no handler registered for {}",
                names.join(", ")
            )));
        }

        let (cmd_tx, cmd_rx) = flume::unbounded();
        let ctx = DrainContext {
            link: Arc::clone(&self.link),
            buffer: Arc::clone(&self.buffer),
            handlers,
            passthrough: Arc::clone(&self.passthrough),
            evt_tx: self.evt_tx.clone(),
            config: self.config.clone(),
        };
        let handle = thread::Builder::new()
            .name("atmux-drain".into())
            .spawn(move || drain_loop(ctx, cmd_rx))?;
        *self.cmd_tx.lock() = Some(cmd_tx);
        *self.worker.lock() = Some(handle);
        self.running.store(true, Ordering::SeqCst);
        log::info!(
            "Transport drain loop started (buffer {} bytes, poll {:?})",
            self.config.buffer_capacity,
            self.config.poll_interval
        );
        Ok(())
    }

    /// Stop the drain loop and wait for it to exit.
    pub fn stop(&self) {
        if let Some(tx) = self.cmd_tx.lock().take() {
            let _ = tx.send(TransportCommand::Stop);
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("Transport drain thread panicked");
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Write `command` followed by the line terminator.
    ///
    /// Returns [`ModemError::Busy`] when the link lock cannot be taken within
    /// the configured bounded wait.
    pub fn write(&self, command: &str) -> Result<()> {
        let mut line = Vec::with_capacity(command.len() + LINE_END.len());
        line.extend_from_slice(command.as_bytes());
        line.extend_from_slice(LINE_END);
        self.write_raw(&line)
    }

    /// Write bytes verbatim (payloads following a prompt).
    pub fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let Some(mut link) = self.link.try_lock_for(self.config.lock_timeout) else {
            log::warn!("Serial link busy, write of {} bytes deferred", bytes.len());
            return Err(ModemError::Busy);
        };
        link.write_all(bytes)?;
        link.flush()?;
        log::debug!("> {}", escape_bytes(bytes));
        Ok(())
    }

    /// Run `f` with exclusive access to the receive buffer.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut RingBuffer) -> R) -> R {
        let mut buffer = self.buffer.lock();
        f(&mut buffer)
    }

    pub fn buffered(&self) -> Bytes {
        self.buffer.lock().snapshot()
    }

    /// Suspend (`true`) or resume (`false`) notification parsing. Bytes keep
    /// being buffered either way.
    pub fn set_passthrough(&self, enabled: bool) {
        let previous = self.passthrough.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            log::debug!("Raw pass-through {}", if enabled { "on" } else { "off" });
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough.load(Ordering::SeqCst)
    }

    /// Faults and shutdown reported by the drain loop.
    pub fn events(&self) -> Receiver<TransportEvent> {
        self.evt_rx.clone()
    }
}

impl Drop for TransportProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Guard that keeps raw pass-through enabled while alive.
pub struct PassthroughGuard<'a> {
    transport: &'a TransportProcessor,
}

impl<'a> PassthroughGuard<'a> {
    pub fn new(transport: &'a TransportProcessor) -> Self {
        transport.set_passthrough(true);
        Self { transport }
    }
}

impl Drop for PassthroughGuard<'_> {
    fn drop(&mut self) {
        self.transport.set_passthrough(false);
    }
}

struct DrainContext {
    link: SharedLink,
    buffer: Arc<Mutex<RingBuffer>>,
    handlers: HandlerTable,
    passthrough: Arc<AtomicBool>,
    evt_tx: Sender<TransportEvent>,
    config: TransportConfig,
}

const MAX_CONSECUTIVE_FAULTS: u32 = 5;

fn drain_loop(ctx: DrainContext, cmd_rx: Receiver<TransportCommand>) {
    let mut chunk = vec![0u8; ctx.config.read_chunk.max(1)];
    let mut faults = 0u32;
    loop {
        match cmd_rx.try_recv() {
            Ok(TransportCommand::Stop) | Err(flume::TryRecvError::Disconnected) => {
                log::info!("Transport drain loop stopping");
                let _ = ctx.evt_tx.send(TransportEvent::Stopped);
                return;
            }
            Err(flume::TryRecvError::Empty) => {}
        }

        // raw transfers leave unread bytes in the link rather than evict buffered ones
        let room = if ctx.passthrough.load(Ordering::SeqCst) {
            let buffer = ctx.buffer.lock();
            (buffer.capacity() - buffer.len()).min(chunk.len())
        } else {
            chunk.len()
        };

        // a busy link just skips this cycle
        let link = if room == 0 {
            None
        } else {
            ctx.link.try_lock_for(ctx.config.lock_timeout)
        };
        let read = match link {
            Some(mut link) => match link.read(&mut chunk[..room]) {
                Ok(n) => {
                    faults = 0;
                    n
                }
                Err(e) if matches!(e.kind(), IoErrorKind::TimedOut | IoErrorKind::WouldBlock) => 0,
                Err(e) => {
                    faults += 1;
                    if faults == 1 {
                        log::error!("Serial read failed: {e}");
                    }
                    if faults == MAX_CONSECUTIVE_FAULTS {
                        log::error!("Serial read failed {faults} times in a row, reporting fault");
                        let _ = ctx
                            .evt_tx
                            .send(TransportEvent::Fault(format!("read error: {e}")));
                    }
                    0
                }
            },
            None => 0,
        };

        let fired = {
            let mut buffer = ctx.buffer.lock();
            if read > 0 {
                log::debug!("< {}", escape_bytes(&chunk[..read]));
                buffer.extend_from_slice(&chunk[..read]);
            }
            if ctx.passthrough.load(Ordering::SeqCst) {
                Vec::new()
            } else {
                collect_notifications(&mut buffer)
            }
        };

        // handlers run without the buffer lock so they may touch device state
        for (notification, outcome) in fired {
            match outcome {
                Ok(urc) => dispatch(&ctx.handlers, notification, urc),
                Err(err) => log::warn!("Dropped malformed {notification} notification: {err}"),
            }
        }

        let backoff = if faults >= MAX_CONSECUTIVE_FAULTS {
            ctx.config.poll_interval * 20
        } else {
            ctx.config.poll_interval
        };
        thread::sleep(backoff);
    }
}

fn collect_notifications(buffer: &mut RingBuffer) -> Vec<(Notification, Result<Urc>)> {
    use strum::IntoEnumIterator;

    let mut fired = Vec::new();
    for notification in Notification::iter() {
        while let Some(outcome) = notification.extract(buffer) {
            fired.push((notification, outcome));
        }
    }
    fired
}

fn dispatch(handlers: &HandlerTable, notification: Notification, urc: Urc) {
    match handlers.get(notification) {
        Some(handler) => {
            log::debug!("Notification {notification}: {urc:?}");
            handler(urc);
        }
        // start() refuses an incomplete table, so this is a broken invariant
        None => log::error!("No handler for {notification}, notification lost"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::hal::mock::ScriptedModem;
    use crate::utils::Deadline;
    use strum::IntoEnumIterator;

    fn fast() -> TransportConfig {
        TransportConfig {
            poll_interval: Duration::from_millis(1),
            lock_timeout: Duration::from_millis(20),
            ..TransportConfig::default()
        }
    }

    fn register_all(transport: &TransportProcessor, tx: Sender<Urc>) {
        for n in Notification::iter() {
            let tx = tx.clone();
            transport
                .register(n, Arc::new(move |urc: Urc| {
                    let _ = tx.send(urc);
                }))
                .unwrap();
        }
    }

    #[test]
    fn test_start_requires_every_handler() {
        let transport = TransportProcessor::new(Box::new(ScriptedModem::new()), fast());
        transport
            .register(Notification::Ready, Arc::new(|_: Urc| {}))
            .unwrap();
        assert!(matches!(
            transport.start(),
            Err(ModemError::ContractViolation(_))
        ));
        assert!(!transport.is_running());
    }

    #[test]
    fn test_register_after_start_is_rejected() {
        let transport = TransportProcessor::new(Box::new(ScriptedModem::new()), fast());
        let (tx, _rx) = flume::unbounded();
        register_all(&transport, tx);
        transport.start().unwrap();
        assert!(transport
            .register(Notification::Ready, Arc::new(|_: Urc| {}))
            .is_err());
        transport.stop();
    }

    #[test]
    fn test_write_appends_terminator() {
        let modem = ScriptedModem::new();
        let transport = TransportProcessor::new(Box::new(modem.clone()), fast());
        transport.write("AT").unwrap();
        assert_eq!(modem.commands(), vec!["AT".to_string()]);
    }

    #[test]
    fn test_notifications_dispatched_and_replies_left() {
        let modem = ScriptedModem::new();
        let transport = TransportProcessor::new(Box::new(modem.clone()), fast());
        let (tx, rx) = flume::unbounded();
        register_all(&transport, tx);
        transport.start().unwrap();

        modem.inject("\r\n+QMTSTAT: 0,1\r\n\r\nOK\r\n\r\nRDY\r\n");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).ok(),
            Some(Urc::MqttState { socket: 0, code: 1 })
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).ok(), Some(Urc::Ready));
        let deadline = Deadline::after(Duration::from_secs(1));
        while !transport.with_buffer(|rb| rb.has_pattern(b"OK\r\n")) && !deadline.expired() {
            deadline.pause(Duration::from_millis(1));
        }
        assert!(transport.with_buffer(|rb| rb.has_pattern(b"OK\r\n")));
        transport.stop();
    }

    #[test]
    fn test_passthrough_suspends_parsing() {
        let modem = ScriptedModem::new();
        let transport = TransportProcessor::new(Box::new(modem.clone()), fast());
        let (tx, rx) = flume::unbounded();
        register_all(&transport, tx);
        transport.start().unwrap();

        {
            let _raw = PassthroughGuard::new(&transport);
            modem.inject("RDY\r\n");
            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
            assert!(transport.with_buffer(|rb| rb.has_pattern(b"RDY")));
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).ok(), Some(Urc::Ready));
        transport.stop();
    }

    #[test]
    fn test_read_fault_is_reported() {
        let modem = ScriptedModem::new();
        let transport = TransportProcessor::new(Box::new(modem.clone()), fast());
        let (tx, _rx) = flume::unbounded();
        register_all(&transport, tx);
        let events = transport.events();
        transport.start().unwrap();
        modem.break_link();
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(1)),
            Ok(TransportEvent::Fault(_))
        ));
        transport.stop();
    }
}

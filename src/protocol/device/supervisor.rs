use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use flume::{Receiver, Sender};
use parking_lot::Mutex;

use super::state::{ConnStep, DeviceState, DeviceStatus};
use crate::protocol::{
    error::Result,
    hal::{PinEdge, StatusLine},
    transport::TransportEvent,
};

enum Wake {
    Edge(PinEdge),
    Transport(TransportEvent),
    Stop,
}

/// Consumer of status-line edges and transport faults.
///
/// Interrupt context only enqueues the edge; debouncing and every state
/// mutation happen here, under the same status lock the foreground uses.
pub struct Supervisor {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
    // keeps the edge channel open when the line never sends
    _edges_tx: Sender<PinEdge>,
}

impl Supervisor {
    pub fn spawn(
        status: Arc<Mutex<DeviceStatus>>,
        line: Arc<dyn StatusLine>,
        transport_events: Receiver<TransportEvent>,
        debounce: Duration,
    ) -> Result<Self> {
        let (edges_tx, edges_rx) = flume::unbounded();
        line.subscribe(edges_tx.clone())
            .map_err(|e| crate::protocol::error::ModemError::DeviceFailure(e.to_string()))?;
        let (stop_tx, stop_rx) = flume::bounded(1);

        let handle = thread::Builder::new()
            .name("atmux-supervisor".into())
            .spawn(move || {
                run(
                    &status,
                    line.as_ref(),
                    &edges_rx,
                    &transport_events,
                    &stop_rx,
                    debounce,
                )
            })?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
            _edges_tx: edges_tx,
        })
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Supervisor thread panicked");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    status: &Mutex<DeviceStatus>,
    line: &dyn StatusLine,
    edges: &Receiver<PinEdge>,
    transport_events: &Receiver<TransportEvent>,
    stop: &Receiver<()>,
    debounce: Duration,
) {
    loop {
        let wake = flume::Selector::new()
            .recv(edges, |edge| edge.map(Wake::Edge).unwrap_or(Wake::Stop))
            .recv(transport_events, |evt| {
                evt.map(Wake::Transport).unwrap_or(Wake::Stop)
            })
            .recv(stop, |_| Wake::Stop)
            .wait();

        match wake {
            Wake::Stop => return,
            Wake::Edge(edge) => {
                thread::sleep(debounce);
                // collapse the bounce burst, only the settled level matters
                let bounced = edges.drain().count();
                let high = line.is_high();
                log::debug!("Status line {edge:?} (+{bounced} bounces), settled high={high}");
                apply_level(status, high);
            }
            Wake::Transport(TransportEvent::Fault(reason)) => {
                log::error!("Serial link fault: {reason}");
                status
                    .lock()
                    .transition(DeviceState::Failed(format!("serial link fault: {reason}")));
            }
            Wake::Transport(TransportEvent::Stopped) => {
                log::debug!("Transport stopped, supervisor keeps watching the status line");
            }
        }
    }
}

fn apply_level(status: &Mutex<DeviceStatus>, high: bool) {
    let mut status = status.lock();
    if high {
        status.mark_conn(ConnStep::StatusHealthy);
        return;
    }
    status.unmark_conn(ConnStep::StatusHealthy);
    if !matches!(
        status.state(),
        DeviceState::Uninitialized | DeviceState::Disconnected
    ) {
        log::warn!("Status line low, modem considered down");
        status.transition(DeviceState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        device::state::InitStep,
        hal::mock::MockStatusLine,
    };
    use crate::utils::Deadline;
    use strum::IntoEnumIterator;

    fn started() -> Arc<Mutex<DeviceStatus>> {
        let mut status = DeviceStatus::default();
        status.transition(DeviceState::Initializing);
        for step in InitStep::iter() {
            status.mark_init(step);
        }
        status.mark_conn(ConnStep::StatusHealthy);
        Arc::new(Mutex::new(status))
    }

    #[test]
    fn test_debounced_low_disconnects() {
        let status = started();
        let line = MockStatusLine::new(true);
        let (_evt_tx, evt_rx) = flume::unbounded();
        let mut supervisor = Supervisor::spawn(
            Arc::clone(&status),
            Arc::new(line.clone()),
            evt_rx,
            Duration::from_millis(5),
        )
        .unwrap();

        line.set_level(false);
        let deadline = Deadline::after(Duration::from_secs(1));
        while status.lock().state() != &DeviceState::Disconnected && !deadline.expired() {
            deadline.pause(Duration::from_millis(1));
        }
        let snapshot = status.lock().clone();
        assert_eq!(snapshot.state(), &DeviceState::Disconnected);
        assert!(!snapshot.conn.contains(ConnStep::StatusHealthy));
        assert!(!snapshot.init.contains(InitStep::AppReady));
        supervisor.stop();
    }

    #[test]
    fn test_glitch_shorter_than_debounce_is_ignored() {
        let status = started();
        let line = MockStatusLine::new(true);
        let (_evt_tx, evt_rx) = flume::unbounded();
        let mut supervisor = Supervisor::spawn(
            Arc::clone(&status),
            Arc::new(line.clone()),
            evt_rx,
            Duration::from_millis(50),
        )
        .unwrap();

        line.set_level(false);
        line.set_level(true);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(status.lock().state(), &DeviceState::Started);
        supervisor.stop();
    }

    #[test]
    fn test_transport_fault_fails_device() {
        let status = started();
        let (evt_tx, evt_rx) = flume::unbounded();
        let mut supervisor = Supervisor::spawn(
            Arc::clone(&status),
            Arc::new(MockStatusLine::new(true)),
            evt_rx,
            Duration::from_millis(1),
        )
        .unwrap();
        evt_tx.send(TransportEvent::Fault("broken pipe".into())).unwrap();
        let deadline = Deadline::after(Duration::from_secs(1));
        while !status.lock().state().is_down() && !deadline.expired() {
            deadline.pause(Duration::from_millis(1));
        }
        assert!(matches!(status.lock().state(), DeviceState::Failed(_)));
        supervisor.stop();
    }
}

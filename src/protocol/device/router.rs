use std::collections::HashMap;

use bytes::Bytes;
use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

/// Per-session notification forwarded to the client that owns the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Received {
        msg_id: u16,
        topic: String,
        payload: Bytes,
    },
    /// `+QMTSTAT` error code; the session is gone.
    StateChanged { code: u8 },
}

/// Routes session notifications by socket id. Runs on the drain thread, so
/// delivery never blocks: a full queue drops the event with a warning.
#[derive(Debug)]
pub struct SessionRouter {
    routes: Mutex<HashMap<u8, Sender<SessionEvent>>>,
    capacity: usize,
}

impl SessionRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Claim `socket`; a previous claim on the same socket stops receiving.
    pub fn attach(&self, socket: u8) -> Receiver<SessionEvent> {
        let (tx, rx) = flume::bounded(self.capacity);
        if self.routes.lock().insert(socket, tx).is_some() {
            log::warn!("Socket {socket} re-attached, previous receiver detached");
        }
        rx
    }

    pub fn detach(&self, socket: u8) {
        self.routes.lock().remove(&socket);
    }

    pub fn deliver(&self, socket: u8, event: SessionEvent) {
        let routes = self.routes.lock();
        let Some(tx) = routes.get(&socket) else {
            log::warn!("Dropping {event:?} for unattached socket {socket}");
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log::warn!("Inbound queue of socket {socket} full, dropping {event:?}")
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("Receiver of socket {socket} gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_by_socket() {
        let router = SessionRouter::new(4);
        let zero = router.attach(0);
        let one = router.attach(1);
        router.deliver(1, SessionEvent::StateChanged { code: 1 });
        assert!(zero.try_recv().is_err());
        assert_eq!(one.try_recv().ok(), Some(SessionEvent::StateChanged { code: 1 }));
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let router = SessionRouter::new(1);
        let rx = router.attach(0);
        router.deliver(0, SessionEvent::StateChanged { code: 1 });
        router.deliver(0, SessionEvent::StateChanged { code: 2 });
        assert_eq!(rx.try_recv().ok(), Some(SessionEvent::StateChanged { code: 1 }));
        assert!(rx.try_recv().is_err());
    }
}

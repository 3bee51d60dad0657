use std::time::{Duration, Instant};

use derive_more::Display;
use parking_lot::Mutex;

/// Monotonic id assigned to every command written through the controller.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("req-{_0}")]
pub struct RequestTag(pub u64);

/// Identity of a reply frame that outlives its command, such as the
/// `+QMTPUB` acknowledgement of message id 3 on socket 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Correlation {
    pub label: &'static str,
    pub socket: u8,
    pub id: u32,
}

impl Correlation {
    pub fn new(label: &'static str, socket: u8, id: u32) -> Self {
        Self { label, socket, id }
    }
}

#[derive(Debug)]
struct Abandoned {
    key: Correlation,
    tag: RequestTag,
    until: Instant,
}

/// Correlations whose waiters gave up before the reply arrived.
///
/// A late frame matching an entry is discarded rather than handed to
/// whichever unrelated wait happens to be scanning the buffer.
#[derive(Debug)]
pub struct AbandonedRequests {
    entries: Mutex<Vec<Abandoned>>,
    ttl: Duration,
}

impl AbandonedRequests {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            ttl,
        }
    }

    pub fn abandon(&self, key: Correlation, tag: RequestTag) {
        log::warn!(
            "Abandoning {} socket {} id {} ({tag}), late reply will be discarded",
            key.label,
            key.socket,
            key.id
        );
        let mut entries = self.entries.lock();
        entries.retain(|e| e.key != key);
        entries.push(Abandoned {
            key,
            tag,
            until: Instant::now() + self.ttl,
        });
    }

    /// Consume the entry for `key`, returning the tag of the request that gave up on it.
    pub fn claim(&self, key: &Correlation) -> Option<RequestTag> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|e| e.until > now);
        let index = entries.iter().position(|e| &e.key == key)?;
        Some(entries.swap_remove(index).tag)
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().iter().filter(|e| e.until > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_once() {
        let registry = AbandonedRequests::new(Duration::from_secs(10));
        let key = Correlation::new("+QMTPUB", 0, 3);
        registry.abandon(key.clone(), RequestTag(7));
        assert_eq!(registry.claim(&key), Some(RequestTag(7)));
        assert_eq!(registry.claim(&key), None);
    }

    #[test]
    fn test_entries_expire() {
        let registry = AbandonedRequests::new(Duration::ZERO);
        let key = Correlation::new("+QMTSUB", 1, 9);
        registry.abandon(key.clone(), RequestTag(1));
        assert!(registry.is_empty());
        assert_eq!(registry.claim(&key), None);
    }

    #[test]
    fn test_other_keys_untouched() {
        let registry = AbandonedRequests::new(Duration::from_secs(10));
        registry.abandon(Correlation::new("+QMTPUB", 0, 3), RequestTag(1));
        assert_eq!(registry.claim(&Correlation::new("+QMTPUB", 1, 3)), None);
        assert_eq!(registry.len(), 1);
    }
}

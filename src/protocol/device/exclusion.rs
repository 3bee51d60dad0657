use std::time::{Duration, Instant};

use derive_more::Display;
use parking_lot::{Condvar, Mutex};

use crate::protocol::error::{ModemError, Result};

/// Opaque handle proving the caller holds the command channel.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("#{_0}")]
pub struct MutexToken(u64);

impl MutexToken {
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct Holder {
    held: bool,
    current: u64,
    since: Instant,
}

/// Binary exclusion over the command channel with monotonically increasing
/// tokens.
///
/// A waiter that cannot acquire within its bounded wait gets
/// [`ModemError::Busy`], unless the current holder has not used the channel
/// for `max_hold`; such a holder is considered abandoned and is preempted,
/// which makes its token stale. Every [`renew`](Self::renew) by the holder
/// restarts that clock, so long multi-step operations keep their lease.
#[derive(Debug)]
pub struct CommandMutex {
    holder: Mutex<Holder>,
    freed: Condvar,
    max_hold: Duration,
}

impl CommandMutex {
    pub fn new(max_hold: Duration) -> Self {
        Self {
            holder: Mutex::new(Holder {
                held: false,
                current: 0,
                since: Instant::now(),
            }),
            freed: Condvar::new(),
            max_hold,
        }
    }

    pub fn take(&self, wait: Duration) -> Result<MutexToken> {
        let deadline = Instant::now() + wait;
        let mut holder = self.holder.lock();
        while holder.held {
            if self.freed.wait_until(&mut holder, deadline).timed_out() {
                if !holder.held {
                    break;
                }
                let age = holder.since.elapsed();
                if age < self.max_hold {
                    return Err(ModemError::Busy);
                }
                log::warn!(
                    "Preempting command channel held by #{} for {:?}",
                    holder.current,
                    age
                );
                break;
            }
        }
        holder.held = true;
        holder.current += 1;
        holder.since = Instant::now();
        Ok(MutexToken(holder.current))
    }

    /// Fail with [`ModemError::StaleToken`] unless `token` is the live one.
    pub fn validate(&self, token: MutexToken) -> Result<()> {
        let holder = self.holder.lock();
        if holder.held && holder.current == token.0 {
            Ok(())
        } else {
            Err(ModemError::StaleToken {
                presented: token.0,
                current: holder.current,
            })
        }
    }

    /// [`validate`](Self::validate), then mark the holder as active.
    pub fn renew(&self, token: MutexToken) -> Result<()> {
        let mut holder = self.holder.lock();
        if holder.held && holder.current == token.0 {
            holder.since = Instant::now();
            Ok(())
        } else {
            Err(ModemError::StaleToken {
                presented: token.0,
                current: holder.current,
            })
        }
    }

    pub fn is_current(&self, token: MutexToken) -> bool {
        self.validate(token).is_ok()
    }

    /// Release the channel if `token` still holds it. Stale releases are ignored.
    pub fn release(&self, token: MutexToken) {
        let mut holder = self.holder.lock();
        if holder.held && holder.current == token.0 {
            holder.held = false;
            drop(holder);
            self.freed.notify_one();
        } else {
            log::debug!("Ignoring release of stale token {token}");
        }
    }

    pub fn is_held(&self) -> bool {
        self.holder.lock().held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_tokens_are_unique_and_increasing() {
        let mutex = CommandMutex::new(Duration::from_secs(60));
        let a = mutex.take(Duration::from_millis(10)).unwrap();
        mutex.release(a);
        let b = mutex.take(Duration::from_millis(10)).unwrap();
        assert_ne!(a, b);
        assert!(b.value() > a.value());
        assert!(mutex.validate(a).is_err());
        assert!(mutex.validate(b).is_ok());
    }

    #[test]
    fn test_busy_while_held() {
        let mutex = CommandMutex::new(Duration::from_secs(60));
        let _a = mutex.take(Duration::from_millis(10)).unwrap();
        assert_eq!(mutex.take(Duration::from_millis(20)), Err(ModemError::Busy));
    }

    #[test]
    fn test_abandoned_holder_is_preempted() {
        let mutex = CommandMutex::new(Duration::ZERO);
        let a = mutex.take(Duration::from_millis(10)).unwrap();
        let b = mutex.take(Duration::from_millis(10)).unwrap();
        assert!(matches!(
            mutex.validate(a),
            Err(ModemError::StaleToken { presented, current }) if presented == a.value() && current == b.value()
        ));
        // the stale holder cannot release the new lease
        mutex.release(a);
        assert!(mutex.validate(b).is_ok());
    }

    #[test]
    fn test_active_holder_is_not_preempted() {
        let mutex = CommandMutex::new(Duration::from_millis(60));
        let a = mutex.take(Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(40));
        mutex.renew(a).unwrap();
        thread::sleep(Duration::from_millis(40));
        // held for 80ms but last active 40ms ago
        assert_eq!(mutex.take(Duration::from_millis(5)), Err(ModemError::Busy));
        assert!(mutex.validate(a).is_ok());
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let mutex = Arc::new(CommandMutex::new(Duration::from_secs(60)));
        let a = mutex.take(Duration::from_millis(10)).unwrap();
        let waiter = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || mutex.take(Duration::from_secs(2)))
        };
        thread::sleep(Duration::from_millis(20));
        mutex.release(a);
        assert!(waiter.join().unwrap().is_ok());
    }
}

//! Named binary signals shared across the connection's threads.
//!
//! Every state transition that one thread needs to observe from another is
//! funneled through this registry: the I/O worker signals socket and
//! handshake progress, user threads request shutdown, and the heartbeat
//! monitor watches for teardown. Signals are edge-triggered from clear to
//! set; waiting returns whether the signal was set within the timeout.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// The fixed set of cross-thread signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// The socket is connected
    SocketOpened,
    /// A thread has requested that the I/O worker close the socket
    SocketClose,
    /// The I/O worker has torn the socket down and exited
    SocketClosed,
    /// The connection handshake completed and channel 0 is open
    Channel0Opened,
    /// A close of channel 0 has been requested
    Channel0Close,
    /// Channel 0 finished its close handshake
    Channel0Closed,
    /// The broker sent `Connection.Blocked`
    ConnectionBlocked,
    /// The broker sent `Connection.Unblocked`
    ConnectionUnblocked,
    /// An error was pushed into the exception queue
    ExceptionRaised,
}

const EVENT_COUNT: usize = 9;

impl Event {
    fn index(self) -> usize {
        match self {
            Event::SocketOpened => 0,
            Event::SocketClose => 1,
            Event::SocketClosed => 2,
            Event::Channel0Opened => 3,
            Event::Channel0Close => 4,
            Event::Channel0Closed => 5,
            Event::ConnectionBlocked => 6,
            Event::ConnectionUnblocked => 7,
            Event::ExceptionRaised => 8,
        }
    }
}

/// Thread-safe registry of [`Event`] signals.
#[derive(Debug, Default)]
pub(crate) struct Events {
    flags: Mutex<[bool; EVENT_COUNT]>,
    cond: Condvar,
}

impl Events {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Set the signal and wake every waiter.
    pub(crate) fn set(&self, event: Event) {
        let mut flags = self.flags.lock();
        if !flags[event.index()] {
            flags[event.index()] = true;
            self.cond.notify_all();
        }
    }

    /// Reset the signal to clear.
    pub(crate) fn clear(&self, event: Event) {
        self.flags.lock()[event.index()] = false;
    }

    /// Non-blocking check.
    pub(crate) fn is_set(&self, event: Event) -> bool {
        self.flags.lock()[event.index()]
    }

    /// Block until the signal is set or the timeout elapses. Returns `true`
    /// iff the signal was set within the timeout.
    pub(crate) fn wait(&self, event: Event, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flags = self.flags.lock();
        while !flags[event.index()] {
            if self.cond.wait_until(&mut flags, deadline).timed_out() {
                return flags[event.index()];
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn signals_are_independent() {
        let events = Events::new();
        events.set(Event::SocketOpened);
        assert!(events.is_set(Event::SocketOpened));
        assert!(!events.is_set(Event::SocketClosed));
        assert!(!events.is_set(Event::Channel0Opened));
    }

    #[test]
    fn set_clear_set_edges() {
        let events = Events::new();
        events.set(Event::ConnectionBlocked);
        assert!(events.is_set(Event::ConnectionBlocked));
        events.clear(Event::ConnectionBlocked);
        assert!(!events.is_set(Event::ConnectionBlocked));
        events.set(Event::ConnectionBlocked);
        assert!(events.is_set(Event::ConnectionBlocked));
    }

    #[test]
    fn wait_times_out_when_never_set() {
        let events = Events::new();
        assert!(!events.wait(Event::Channel0Opened, Duration::from_millis(20)));
    }

    #[test]
    fn wait_returns_immediately_when_already_set() {
        let events = Events::new();
        events.set(Event::SocketClosed);
        assert!(events.wait(Event::SocketClosed, Duration::from_millis(1)));
    }

    #[test]
    fn wait_observes_set_from_another_thread() {
        let events = Arc::new(Events::new());
        let setter = Arc::clone(&events);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            setter.set(Event::SocketOpened);
        });
        assert!(events.wait(Event::SocketOpened, Duration::from_secs(2)));
        handle.join().unwrap();
    }
}

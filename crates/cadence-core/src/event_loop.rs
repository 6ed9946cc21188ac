//! A thin poll-based event core shared by every component: fds are
//! registered with an interest set, ready fds are reported back to the
//! caller, and one-shot timers fire after their deadline.
//!
//! Built on `mio`'s cross-platform epoll/kqueue abstraction. Since the
//! framed IPC substrate needs raw `recvmsg`/`sendmsg` for fd-passing, raw
//! fds are registered via [`mio::unix::SourceFd`] rather than mio's own
//! socket types.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken(pub usize);

#[derive(Debug)]
pub enum Readiness {
    Io { token: IoToken, readable: bool, writable: bool },
    Timer(TimerId),
}

pub struct EventCore {
    poll: Poll,
    events: Events,
    next_token: usize,
    timers: BinaryHeap<Reverse<(Instant, TimerId)>>,
    next_timer: u64,
}

impl EventCore {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            next_token: 0,
            timers: BinaryHeap::new(),
            next_timer: 0,
        })
    }

    pub fn register(&mut self, fd: RawFd, readable: bool, writable: bool) -> io::Result<IoToken> {
        let token_id = self.next_token;
        self.next_token += 1;
        let token = Token(token_id);
        self.poll.registry().register(&mut SourceFd(&fd), token, interest_for(readable, writable))?;
        Ok(IoToken(token_id))
    }

    pub fn reregister(&mut self, fd: RawFd, token: IoToken, readable: bool, writable: bool) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(token.0), interest_for(readable, writable))
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Arm a one-shot timer; it fires exactly once, the next time
    /// [`EventCore::poll`] is called at or after `after` has elapsed.
    pub fn arm_timer(&mut self, after: Duration) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.timers.push(Reverse((Instant::now() + after, id)));
        id
    }

    /// Block until at least one fd is ready or a timer fires, then report
    /// every readiness event via `out`. Never blocks longer than the
    /// nearest timer deadline.
    pub fn poll(&mut self, out: &mut Vec<Readiness>) -> io::Result<()> {
        out.clear();

        let timeout = self.timers.peek().map(|Reverse((deadline, _))| {
            deadline.saturating_duration_since(Instant::now())
        });

        self.poll.poll(&mut self.events, timeout)?;

        for event in self.events.iter() {
            out.push(Readiness::Io {
                token: IoToken(event.token().0),
                readable: event.is_readable(),
                writable: event.is_writable(),
            });
        }

        let now = Instant::now();
        while let Some(&Reverse((deadline, id))) = self.timers.peek() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            out.push(Readiness::Timer(id));
        }

        Ok(())
    }
}

fn interest_for(readable: bool, writable: bool) -> Interest {
    match (readable, writable) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => Interest::READABLE,
    }
}

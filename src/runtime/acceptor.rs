//! Acceptor reactor: the listener socket and the signal funnel.
//!
//! Accepted sockets are admission-checked, placed into their fd slot, and
//! registered one-shot readable with a round-robin chosen sub-reactor.
//! The slot is fully initialized before registration; the moment the fd is
//! registered another thread may receive its first event.

use super::poller::{Events, Interest, Poller};
use super::signal::SignalFunnel;
use super::Shared;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

/// Answer sent before closing when admission control rejects a socket.
const BUSY_MESSAGE: &[u8] = b"Internal server busy";

const EVENT_CAPACITY: usize = 1024;

pub struct Acceptor {
    poller: Poller,
    listener: TcpListener,
    funnel: SignalFunnel,
    next_reactor: usize,
}

impl Acceptor {
    pub fn new(listener: TcpListener, funnel: SignalFunnel) -> io::Result<Acceptor> {
        let poller = Poller::new()?;
        poller.register(listener.as_raw_fd(), Interest::Readable, false)?;
        poller.register(funnel.rx_fd(), Interest::Readable, false)?;
        Ok(Acceptor {
            poller,
            listener,
            funnel,
            next_reactor: 0,
        })
    }

    /// Run until a shutdown signal (or handle write) arrives.
    pub fn run(&mut self, shared: &Shared) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let listener_fd = self.listener.as_raw_fd();
        let funnel_fd = self.funnel.rx_fd();

        loop {
            match self.poller.wait(&mut events, None) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Acceptor poll failed");
                    return;
                }
            }
            for event in events.iter() {
                if event.fd() == funnel_fd {
                    if self.funnel.drain() {
                        info!("Shutdown requested");
                        return;
                    }
                } else if event.fd() == listener_fd {
                    self.accept_pending(shared);
                }
            }
        }
    }

    /// Drain the accept queue; edge-triggered listeners must reach
    /// WouldBlock before returning.
    fn accept_pending(&mut self, shared: &Shared) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer, shared),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr, shared: &Shared) {
        let fd = stream.as_raw_fd();
        let capacity = shared.slots.capacity();
        if shared.slots.active_count() >= capacity || fd as usize >= capacity {
            warn!(fd, peer = %peer, "Connection limit reached");
            turn_away(stream);
            return;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            error!(fd, error = %e, "Failed to make socket non-blocking");
            return;
        }

        let owner = self.next_reactor;
        self.next_reactor = (self.next_reactor + 1) % shared.pollers.len();

        // The slot lock is held across registration, so the first event
        // cannot observe a half-initialized slot.
        let slot = match shared.slots.get(fd) {
            Some(slot) => slot,
            None => return,
        };
        let mut conn = slot.lock().unwrap();
        conn.activate(stream, peer, owner);
        shared.slots.counter().fetch_add(1, Ordering::Relaxed);

        if let Err(e) = shared.pollers[owner].register(fd, Interest::Readable, true) {
            error!(fd, error = %e, "Readiness registration failed");
            conn.close(&shared.pollers[owner], shared.slots.counter());
            return;
        }
        debug!(fd, peer = %peer, reactor = owner, "Accepted connection");
    }
}

fn turn_away(mut stream: TcpStream) {
    let _ = stream.write_all(BUSY_MESSAGE);
}

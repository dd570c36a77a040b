//! Sub-reactor: per-worker-reactor event loop.
//!
//! Each sub-reactor owns one poller and the disjoint set of connections
//! registered with it. Readable connections are drained and handed to the
//! work queue; writable connections are flushed; every one-shot event path
//! ends by re-arming the fd or closing it.

use super::poller::{Events, Interest};
use super::Shared;
use crate::http::{HttpCode, WriteProgress};
use crate::pool::WorkQueue;
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info};

const EVENT_CAPACITY: usize = 1024;

/// Run reactor `id` until the wake pipe reports shutdown.
pub fn run(id: usize, shared: &Shared, queue: &WorkQueue, wake: &UnixStream) {
    let poller = &shared.pollers[id];
    let wake_fd = wake.as_raw_fd();
    if let Err(e) = poller.register(wake_fd, Interest::Readable, false) {
        error!(reactor = id, error = %e, "Wake pipe registration failed");
        return;
    }

    let mut events = Events::with_capacity(EVENT_CAPACITY);
    info!(reactor = id, "Sub-reactor started");

    loop {
        match poller.wait(&mut events, None) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(reactor = id, error = %e, "Sub-reactor poll failed");
                return;
            }
        }
        for event in events.iter() {
            let fd = event.fd();
            if fd == wake_fd {
                drain_wake(wake);
                if !shared.running.load(Ordering::Acquire) {
                    info!(reactor = id, "Sub-reactor stopping");
                    return;
                }
                continue;
            }
            handle_connection_event(id, event, shared, queue);
        }
    }
}

fn handle_connection_event(
    id: usize,
    event: super::poller::Event,
    shared: &Shared,
    queue: &WorkQueue,
) {
    let fd = event.fd();
    let Some(slot) = shared.slots.get(fd) else {
        return;
    };
    let poller = &shared.pollers[id];
    let mut conn = slot.lock().unwrap();

    // A stale event can outlive its connection: the slot may be free
    // again, or already recycled onto another reactor.
    if !conn.is_active() || conn.owner() != id {
        return;
    }

    if event.is_hangup() || event.is_error() {
        debug!(fd, peer = ?conn.peer(), "Peer hung up");
        conn.close(poller, shared.slots.counter());
        return;
    }

    if event.is_readable() {
        match conn.read_nonblock() {
            Ok(_) => {
                // Hand-off: the worker relocks the slot; no event can fire
                // for this fd until somebody re-arms it.
                drop(conn);
                if !queue.append(fd) {
                    let mut conn = slot.lock().unwrap();
                    debug!(fd, "Work queue full, answering 503");
                    conn.write_respond(
                        HttpCode::ServiceUnavailable,
                        true,
                        poller,
                        shared.slots.counter(),
                    );
                }
            }
            Err(e) => {
                debug!(fd, error = %e, "Read failed");
                conn.close(poller, shared.slots.counter());
            }
        }
        return;
    }

    if event.is_writable() {
        match conn.write_nonblock() {
            Ok(WriteProgress::Complete { keep_alive: true }) => {
                conn.reset();
                if let Err(e) = poller.rearm(fd, Interest::Readable) {
                    debug!(fd, error = %e, "Read rearm failed");
                    conn.close(poller, shared.slots.counter());
                }
            }
            Ok(WriteProgress::Complete { keep_alive: false }) => {
                // Half-close; the peer's EOF arrives as a hangup event and
                // closes the slot.
                if let Err(e) = poller.rearm(fd, Interest::Readable) {
                    debug!(fd, error = %e, "Read rearm failed");
                    conn.close(poller, shared.slots.counter());
                } else {
                    debug!(fd, "Response sent, half-closing");
                    conn.half_close_write();
                }
            }
            Ok(WriteProgress::Again) => {
                if let Err(e) = poller.rearm(fd, Interest::Writable) {
                    debug!(fd, error = %e, "Write rearm failed");
                    conn.close(poller, shared.slots.counter());
                }
            }
            Err(e) => {
                debug!(fd, error = %e, "Write failed");
                conn.close(poller, shared.slots.counter());
            }
        }
    }
}

fn drain_wake(wake: &UnixStream) {
    let mut buf = [0u8; 16];
    loop {
        match (&*wake).read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

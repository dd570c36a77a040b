//! Signal funnel: asynchronous signals become ordinary readable events.
//!
//! Handlers do exactly one async-signal-safe thing: write the signal
//! number as a single byte into a non-blocking socketpair. The acceptor
//! reactor owns the read end and treats SIGINT/SIGTERM bytes as a shutdown
//! request. A `ShutdownHandle` writes the same byte, so orderly shutdown
//! is reachable without raising a signal.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, Ordering};

/// Write end the installed handlers funnel into; lives for the process.
static FUNNEL_TX: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signum: libc::c_int) {
    let fd = FUNNEL_TX.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        unsafe {
            libc::send(
                fd,
                &byte as *const u8 as *const libc::c_void,
                1,
                libc::MSG_DONTWAIT,
            );
        }
    }
}

pub struct SignalFunnel {
    rx: UnixStream,
    tx: UnixStream,
}

impl SignalFunnel {
    pub fn new() -> io::Result<SignalFunnel> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok(SignalFunnel { rx, tx })
    }

    pub fn rx_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    /// Drain pending signal bytes; true when shutdown was requested.
    pub fn drain(&self) -> bool {
        let mut shutdown = false;
        let mut buf = [0u8; 64];
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &code in &buf[..n] {
                        if code == libc::SIGINT as u8 || code == libc::SIGTERM as u8 {
                            shutdown = true;
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        shutdown
    }

    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle {
            tx: self.tx.try_clone()?,
        })
    }

    #[cfg(test)]
    fn send_raw(&self, code: u8) {
        let _ = (&self.tx).write(&[code]);
    }
}

/// Requests orderly shutdown the same way a delivered SIGTERM would.
pub struct ShutdownHandle {
    tx: UnixStream,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = (&self.tx).write(&[libc::SIGTERM as u8]);
    }
}

/// Route SIGINT and SIGTERM into the funnel and ignore SIGPIPE.
pub fn install_handlers(funnel: &SignalFunnel) -> io::Result<()> {
    let tx = funnel.tx.try_clone()?;
    FUNNEL_TX.store(tx.into_raw_fd(), Ordering::Relaxed);

    install(libc::SIGINT, forward_signal as libc::sighandler_t)?;
    install(libc::SIGTERM, forward_signal as libc::sighandler_t)?;
    install(libc::SIGPIPE, libc::SIG_IGN)?;
    Ok(())
}

fn install(signum: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut action.sa_mask);
        if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_handle_requests_shutdown() {
        let funnel = SignalFunnel::new().unwrap();
        assert!(!funnel.drain());

        let handle = funnel.shutdown_handle().unwrap();
        handle.shutdown();
        assert!(funnel.drain());

        // Drained; nothing further pending.
        assert!(!funnel.drain());
    }

    #[test]
    fn test_other_signals_do_not_stop_the_loop() {
        let funnel = SignalFunnel::new().unwrap();
        funnel.send_raw(libc::SIGHUP as u8);
        funnel.send_raw(libc::SIGUSR1 as u8);
        assert!(!funnel.drain());

        funnel.send_raw(libc::SIGINT as u8);
        assert!(funnel.drain());
    }

    #[test]
    fn test_installed_handler_forwards_sigterm() {
        let funnel = SignalFunnel::new().unwrap();
        install_handlers(&funnel).unwrap();

        unsafe {
            libc::raise(libc::SIGTERM);
        }
        assert!(funnel.drain());
    }
}

//! Trivial TCP accept-loop server.
//!
//! A façade over the hooked [`crate::hook::accept`]/[`crate::hook::read`]/
//! [`crate::hook::write`] functions: bind, accept in a loop, spawn one
//! fiber per connection. Deliberately not a protocol server — framing,
//! request/response shapes, and connection pooling are the application's
//! job; this only owns the listening socket and the accept loop, mirroring
//! the shape of the source's `TcpServer` (bind/start/stop plus a
//! configurable receive timeout) without its direct subclass-and-override
//! dispatch.

use crate::hook;
use crate::io_manager::IoManager;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct TcpServer {
    io: Arc<IoManager>,
    listen_fd: RawFd,
    stopping: Arc<AtomicBool>,
    recv_timeout_ms: u64,
}

impl TcpServer {
    /// Creates, binds, and starts listening on a `SOCK_STREAM` socket for
    /// `addr`. The socket is marked non-blocking and handed to the reactor
    /// the same way [`hook::socket`]/[`hook::accept`] mark any socket.
    pub fn bind(io: Arc<IoManager>, addr: SocketAddr) -> io::Result<Self> {
        let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        let fd = hook::socket(domain, libc::SOCK_STREAM, 0)?;

        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            let _ = hook::close(fd);
            return Err(err);
        }

        let (storage, len) = hook::sockaddr_from(addr);
        let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            let _ = hook::close(fd);
            return Err(err);
        }

        let rc = unsafe { libc::listen(fd, 128) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            let _ = hook::close(fd);
            return Err(err);
        }

        Ok(TcpServer {
            io,
            listen_fd: fd,
            stopping: Arc::new(AtomicBool::new(false)),
            recv_timeout_ms: crate::clock::INFINITE,
        })
    }

    /// The address actually bound, useful when `addr` asked for an
    /// ephemeral port.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.listen_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(hook::sockaddr_to_std(&storage))
        }
    }

    /// Sets how long an accepted connection's socket waits for data before
    /// a hooked read times out. Applied to each connection as it's
    /// accepted; does not affect connections already accepted.
    pub fn set_recv_timeout_ms(&mut self, ms: u64) {
        self.recv_timeout_ms = ms;
    }

    /// Runs the accept loop on the calling fiber until [`TcpServer::stop`]
    /// is called from elsewhere, spawning `handler` as a fresh fiber per
    /// accepted connection. Opts the calling OS thread into hooked I/O,
    /// since a server that didn't would just block on `accept`.
    pub fn serve<H>(&self, handler: H)
    where
        H: Fn(RawFd, SocketAddr) + Send + Sync + 'static,
    {
        hook::enable();
        let handler = Arc::new(handler);
        loop {
            match hook::accept(self.listen_fd) {
                Ok((fd, peer)) => {
                    if let Some(io_manager) = IoManager::current() {
                        io_manager
                            .fds()
                            .with_or_create(fd, |ctx| ctx.recv_timeout_ms = self.recv_timeout_ms);
                    }
                    let handler = Arc::clone(&handler);
                    self.io.scheduler().spawn(move || handler(fd, peer), None);
                }
                Err(_) if self.stopping.load(Ordering::SeqCst) => break,
                Err(e) => {
                    log::warn!("accept failed, stopping server: {e}");
                    break;
                }
            }
        }
    }

    /// Unblocks a concurrently running [`TcpServer::serve`] call by closing
    /// the listening socket; its next `accept` attempt fails and the loop
    /// exits.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = hook::close(self.listen_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_an_ephemeral_port_and_reports_it() {
        let io = IoManager::new(1).unwrap();
        let server = TcpServer::bind(Arc::clone(&io), "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        assert_eq!(addr.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_ne!(addr.port(), 0);
        io.stop();
    }
}

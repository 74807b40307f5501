// src/server.rs
//
// Reactor: single thread owning the listener, the epoll instance, and the
// connection table. Readiness events drive non-blocking I/O on the reactor
// thread; completed reads are handed to the worker pool for parsing and
// response assembly.

use crate::config::Config;
use crate::conn::Connection;
use crate::error::{ServerError, ServerResult};
use crate::pool::ThreadPool;
use crate::syscalls::{
    self, Epoll, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event,
};
use crate::table::FdTable;
use libc::c_int;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Descriptor-number ceiling for the connection table.
const MAX_FD: usize = 65_536;
/// Events fetched per epoll_wait call.
const MAX_EVENTS: usize = 1024;
/// Bounded wait so the loop notices the shutdown flag promptly.
const WAIT_TIMEOUT_MS: i32 = 500;

/// Sent to accepted sockets over the connection ceiling, bypassing the
/// parser entirely.
const BUSY_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 12\r\nConnection: close\r\n\r\nserver busy\n";

/// State shared between the reactor and every connection: the epoll instance
/// connections re-arm themselves against, and the live-connection count the
/// accept path checks against the configured ceiling.
pub struct ServerShared {
    pub epoll: Epoll,
    pub live: AtomicUsize,
}

pub struct Server {
    config: Config,
    listen_fd: c_int,
}

impl Server {
    /// Bind the listening socket. Port 0 asks the kernel for an ephemeral
    /// port; `local_addr` reports which one.
    pub fn bind(config: Config) -> ServerResult<Self> {
        let listen_fd = syscalls::create_listen_socket(&config.host, config.port)?;
        Ok(Self { config, listen_fd })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        syscalls::local_addr(self.listen_fd)
    }

    /// Run until SIGINT/SIGTERM.
    pub fn serve(self) -> ServerResult<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::Release);
        })
        .map_err(|e| ServerError::Other(format!("failed to install signal handler: {}", e)))?;

        self.run(shutdown)
    }

    /// The event loop. Returns once `shutdown` is observed true.
    pub fn run(self, shutdown: Arc<AtomicBool>) -> ServerResult<()> {
        // A peer resetting mid-write must surface as EPIPE, not kill the
        // process.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let shared = Arc::new(ServerShared {
            epoll: Epoll::new()?,
            live: AtomicUsize::new(0),
        });
        let pool: ThreadPool<Mutex<Connection>> =
            ThreadPool::new(self.config.effective_workers(), self.config.queue_depth)?;
        let mut table: FdTable<Arc<Mutex<Connection>>> = FdTable::new(MAX_FD);
        let doc_root = Arc::new(self.config.doc_root.clone());

        shared.epoll.add(self.listen_fd, EPOLLIN, false)?;
        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            doc_root = %doc_root.display(),
            workers = self.config.effective_workers(),
            "listening"
        );

        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        while !shutdown.load(Ordering::Acquire) {
            let ready = shared.epoll.wait(&mut events, WAIT_TIMEOUT_MS)?;

            for event in &events[..ready] {
                let fd = event.u64 as c_int;
                let bits = event.events;

                if fd == self.listen_fd {
                    self.accept_ready(&shared, &mut table, &doc_root);
                } else if bits & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
                    teardown(&mut table, fd);
                } else if bits & EPOLLIN as u32 != 0 {
                    let Some(conn) = table.get(fd).cloned() else {
                        continue;
                    };
                    let readable = match conn.lock() {
                        Ok(mut guard) => guard.read(),
                        Err(_) => {
                            tracing::warn!(fd, "connection lock poisoned by a worker panic");
                            false
                        }
                    };
                    if readable {
                        if !pool.submit(conn) {
                            // One-shot interest is already consumed, so an
                            // unqueued connection would stall forever. Shed it.
                            tracing::warn!(fd, "worker queue full, shedding connection");
                            teardown(&mut table, fd);
                        }
                    } else {
                        teardown(&mut table, fd);
                    }
                } else if bits & EPOLLOUT as u32 != 0 {
                    let Some(conn) = table.get(fd).cloned() else {
                        continue;
                    };
                    let alive = match conn.lock() {
                        Ok(mut guard) => guard.write(),
                        Err(_) => {
                            tracing::warn!(fd, "connection lock poisoned by a worker panic");
                            false
                        }
                    };
                    if !alive {
                        teardown(&mut table, fd);
                    }
                }
            }
        }

        if !table.is_empty() {
            tracing::info!(
                open_connections = table.len(),
                "dropping open connections on shutdown"
            );
        }
        syscalls::close_fd(self.listen_fd);
        tracing::info!("server shut down");
        Ok(())
    }

    /// Drain the accept backlog. Edge-triggered listener events only fire on
    /// new arrivals, so stopping early would strand queued connections.
    fn accept_ready(
        &self,
        shared: &Arc<ServerShared>,
        table: &mut FdTable<Arc<Mutex<Connection>>>,
        doc_root: &Arc<PathBuf>,
    ) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    let live = shared.live.load(Ordering::Acquire);
                    if live >= self.config.max_connections || fd as usize >= table.capacity() {
                        tracing::warn!(fd, %peer, live, "connection ceiling reached, rejecting");
                        let _ = syscalls::send_nonblocking(fd, BUSY_RESPONSE);
                        syscalls::close_fd(fd);
                        continue;
                    }
                    match Connection::open(fd, peer, shared.clone(), doc_root.clone()) {
                        Ok(conn) => {
                            table.insert(fd, Arc::new(Mutex::new(conn)));
                        }
                        Err(e) => {
                            tracing::warn!(fd, %peer, error = %e, "failed to register connection");
                            syscalls::close_fd(fd);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

fn teardown(table: &mut FdTable<Arc<Mutex<Connection>>>, fd: c_int) {
    if let Some(conn) = table.remove(fd) {
        // Teardown must run even when a worker panicked while holding the
        // connection, so recover the guard from a poisoned lock.
        conn.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Task;
    use crate::syscalls::Epoll;
    use std::thread;

    fn poisoned_connection() -> (Arc<Mutex<Connection>>, c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);

        let shared = Arc::new(ServerShared {
            epoll: Epoll::new().unwrap(),
            live: AtomicUsize::new(0),
        });
        let conn = Connection::open(
            fds[0],
            "127.0.0.1:0".parse().unwrap(),
            shared,
            Arc::new(std::env::temp_dir()),
        )
        .unwrap();
        let conn = Arc::new(Mutex::new(conn));

        let victim = conn.clone();
        let _ = thread::spawn(move || {
            let _guard = victim.lock().unwrap();
            panic!("worker died mid-request");
        })
        .join();
        assert!(conn.is_poisoned());

        (conn, fds[0], fds[1])
    }

    #[test]
    fn poisoned_connection_tears_down_without_panicking() {
        let (conn, fd, peer_fd) = poisoned_connection();

        // Worker entry point skips the poisoned connection instead of
        // cascading the panic.
        conn.process();

        let mut table: FdTable<Arc<Mutex<Connection>>> =
            FdTable::new((fd as usize + 1).max(16));
        assert!(table.insert(fd, conn));
        teardown(&mut table, fd);
        assert!(table.get(fd).is_none());

        syscalls::close_fd(peer_fd);
    }
}

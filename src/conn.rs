// src/conn.rs
//
// Connection wrapper: binds one accepted socket and its peer address to a
// parser instance. The reactor calls `read`/`write` on readiness events, a
// pool worker calls `process` exactly once per completed read; the one-shot
// re-arm protocol guarantees only one thread touches a connection at a time.

use crate::error::ServerResult;
use crate::parser::{Parser, RequestStatus};
use crate::pool::Task;
use crate::server::ServerShared;
use crate::syscalls::{self, EPOLLIN, EPOLLOUT};
use libc::c_int;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

pub struct Connection {
    fd: c_int,
    peer: SocketAddr,
    parser: Parser,
    shared: Arc<ServerShared>,
}

impl Connection {
    /// Install a freshly accepted socket: register read interest
    /// (edge-triggered, one-shot, with hangup notification) and bump the
    /// live-connection count. A failed registration is fatal to this
    /// connection only; the caller closes the descriptor.
    pub fn open(
        fd: c_int,
        peer: SocketAddr,
        shared: Arc<ServerShared>,
        doc_root: Arc<PathBuf>,
    ) -> ServerResult<Self> {
        shared.epoll.add(fd, EPOLLIN, true)?;
        shared.live.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(fd, peer = %peer, "connection opened");
        Ok(Self {
            fd,
            peer,
            parser: Parser::new(doc_root),
            shared,
        })
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        self.fd == -1
    }

    /// Drain the socket into the parser's buffer until the OS reports no
    /// more data. False means the peer closed, a fatal socket error
    /// occurred, or the request overran the buffer; the caller tears down.
    pub fn read(&mut self) -> bool {
        loop {
            let Some(slot) = self.parser.read_slot() else {
                tracing::debug!(fd = self.fd, "read buffer full without a complete request");
                return false;
            };
            match syscalls::recv_nonblocking(self.fd, slot) {
                Ok(0) => return false,
                Ok(n) => self.parser.advance_read(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(fd = self.fd, error = %e, "recv failed");
                    return false;
                }
            }
        }
        true
    }

    /// Entry point for pool workers: drive the parser over the bytes read so
    /// far and build the response. Re-arms the descriptor for the next event.
    pub fn process(&mut self) {
        let status = self.parser.process_read();
        if status == RequestStatus::Incomplete {
            if self.rearm(EPOLLIN).is_err() {
                self.close();
            }
            return;
        }

        if !self.parser.process_write(status) {
            self.close();
            return;
        }
        if self.rearm(EPOLLOUT).is_err() {
            self.close();
        }
    }

    /// Flush pending response segments with vectored writes. Returns false
    /// once the connection is done (non-keep-alive response fully sent) or a
    /// fatal error occurred; the caller tears down. A would-block leaves the
    /// descriptor armed for the next write event.
    pub fn write(&mut self) -> bool {
        if self.parser.bytes_to_send() == 0 {
            // Spurious write readiness with nothing pending.
            self.parser.reset();
            return self.rearm(EPOLLIN).is_ok();
        }

        loop {
            let res = {
                let (head, file) = self.parser.pending();
                if head.is_none() && file.is_none() {
                    break;
                }
                let mut iov: [&[u8]; 2] = [&[], &[]];
                let mut count = 0;
                if let Some(h) = head {
                    iov[count] = h;
                    count += 1;
                }
                if let Some(f) = file {
                    iov[count] = f;
                    count += 1;
                }
                syscalls::writev_nonblocking(self.fd, &iov[..count])
            };

            match res {
                Ok(n) => self.parser.advance_sent(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return self.rearm(EPOLLOUT).is_ok();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(fd = self.fd, error = %e, "writev failed");
                    self.parser.release_file();
                    return false;
                }
            }
        }

        self.parser.release_file();
        if self.parser.keep_alive() {
            // Next pipelined request starts from the freshly-initialized state.
            self.parser.reset();
            self.rearm(EPOLLIN).is_ok()
        } else {
            false
        }
    }

    fn rearm(&self, interest: i32) -> ServerResult<()> {
        self.shared.epoll.rearm(self.fd, interest).inspect_err(|e| {
            tracing::debug!(fd = self.fd, error = %e, "failed to re-arm descriptor");
        })
    }

    /// Idempotent teardown: deregister, close the socket, release the file
    /// mapping, decrement the live count.
    pub fn close(&mut self) {
        if self.fd == -1 {
            return;
        }
        tracing::debug!(fd = self.fd, peer = %self.peer, "closing connection");
        let _ = self.shared.epoll.delete(self.fd);
        syscalls::close_fd(self.fd);
        self.fd = -1;
        self.parser.release_file();
        self.shared.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl Task for Mutex<Connection> {
    fn process(&self) {
        // A poisoned lock means a previous worker panicked mid-process; skip
        // the work and let the reactor tear the connection down.
        if let Ok(mut conn) = self.lock() {
            conn.process();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscalls::Epoll;
    use std::sync::atomic::AtomicUsize;

    fn socketpair() -> (c_int, c_int) {
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
        (fds[0], fds[1])
    }

    fn shared() -> Arc<ServerShared> {
        Arc::new(ServerShared {
            epoll: Epoll::new().unwrap(),
            live: AtomicUsize::new(0),
        })
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("staticd-conn-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn send_all(fd: c_int, bytes: &[u8]) {
        let n = syscalls::send_nonblocking(fd, bytes).unwrap();
        assert_eq!(n, bytes.len());
    }

    fn drain(fd: c_int, sink: &mut Vec<u8>) {
        let mut buf = [0u8; 4096];
        loop {
            match syscalls::recv_nonblocking(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => sink.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("drain failed: {}", e),
            }
        }
    }

    #[test]
    fn read_drains_multiple_segments() {
        let (ours, theirs) = socketpair();
        let shared = shared();
        let root = temp_root("read");
        let mut conn =
            Connection::open(ours, peer(), shared.clone(), Arc::new(root)).unwrap();
        assert_eq!(shared.live.load(Ordering::Acquire), 1);

        send_all(theirs, b"GET /index.html");
        send_all(theirs, b" HTTP/1.1\r\n");
        assert!(conn.read());

        conn.close();
        assert_eq!(shared.live.load(Ordering::Acquire), 0);
        syscalls::close_fd(theirs);
    }

    #[test]
    fn read_reports_peer_close() {
        let (ours, theirs) = socketpair();
        let mut conn = Connection::open(ours, peer(), shared(), Arc::new(temp_root("eof"))).unwrap();

        syscalls::close_fd(theirs);
        assert!(!conn.read());
    }

    #[test]
    fn process_and_write_produce_full_response() {
        let root = temp_root("full");
        std::fs::write(root.join("page.html"), b"<p>hi</p>").unwrap();

        let (ours, theirs) = socketpair();
        let mut conn = Connection::open(ours, peer(), shared(), Arc::new(root)).unwrap();

        send_all(theirs, b"GET /page.html HTTP/1.1\r\nHost: t\r\n\r\n");
        assert!(conn.read());
        conn.process();

        // Non-keep-alive: write reports done-close after flushing everything.
        let expected = conn.parser.bytes_to_send();
        assert!(expected > 9);
        assert!(!conn.write());

        let mut response = Vec::new();
        drain(theirs, &mut response);
        assert_eq!(response.len(), expected);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("<p>hi</p>"));

        conn.close();
        syscalls::close_fd(theirs);
    }

    #[test]
    fn vectored_write_resumes_across_would_block() {
        let root = temp_root("resume");
        let body = vec![b'x'; 1 << 20];
        std::fs::write(root.join("big.bin"), &body).unwrap();

        let (ours, theirs) = socketpair();
        // Shrink the send buffer so the response cannot go out in one writev.
        let size: c_int = 4096;
        unsafe {
            libc::setsockopt(
                ours,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of_val(&size) as libc::socklen_t,
            );
        }

        let mut conn = Connection::open(ours, peer(), shared(), Arc::new(root)).unwrap();
        send_all(theirs, b"GET /big.bin HTTP/1.1\r\n\r\n");
        assert!(conn.read());
        conn.process();

        let expected = conn.parser.bytes_to_send();
        let header_len = conn.parser.pending().0.map_or(0, |h| h.len());
        assert_eq!(expected, header_len + body.len());

        let mut received = Vec::new();
        let mut rounds = 0;
        loop {
            let alive = conn.write();
            drain(theirs, &mut received);
            rounds += 1;
            if !alive {
                break;
            }
            assert!(rounds < 10_000, "write never completed");
        }
        drain(theirs, &mut received);

        // Exactly header + file bytes, never fewer, never duplicated.
        assert_eq!(received.len(), expected);
        assert!(rounds > 1, "expected at least one would-block round");
        assert!(received.ends_with(&body[body.len() - 64..]));

        conn.close();
        syscalls::close_fd(theirs);
    }

    #[test]
    fn keep_alive_write_resets_for_next_request() {
        let root = temp_root("ka");
        std::fs::write(root.join("a.html"), b"first").unwrap();
        std::fs::write(root.join("b.html"), b"second").unwrap();

        let (ours, theirs) = socketpair();
        let mut conn = Connection::open(ours, peer(), shared(), Arc::new(root)).unwrap();

        send_all(theirs, b"GET /a.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert!(conn.read());
        conn.process();
        assert!(conn.write());

        let mut first = Vec::new();
        drain(theirs, &mut first);
        let text = String::from_utf8_lossy(&first);
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("first"));

        // Second pipelined request on the same connection.
        send_all(theirs, b"GET /b.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert!(conn.read());
        conn.process();
        assert!(conn.write());

        let mut second = Vec::new();
        drain(theirs, &mut second);
        assert!(String::from_utf8_lossy(&second).ends_with("second"));

        conn.close();
        syscalls::close_fd(theirs);
    }
}

// src/parser.rs
//
// Per-connection HTTP/1.1 request state machine and response assembly.
//
// Bytes arrive incrementally: the reactor drains the socket into `read_buf`
// and a worker calls `process_read`, which resumes wherever the last call
// left off. A line sub-machine scans `check_idx..read_idx` for terminators
// ahead of the main RequestLine -> Header -> Body machine. Responses are
// built into a bounded `write_buf`; file bodies are memory-mapped and sent
// as a second scatter-gather segment, never copied.

use crate::mmap::MappedFile;
use std::fmt::{self, Write as _};
use std::ops::Range;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

const OK_200_TITLE: &str = "OK";
const ERROR_400_TITLE: &str = "Bad Request";
pub const ERROR_400_FORM: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
const ERROR_403_TITLE: &str = "Forbidden";
pub const ERROR_403_FORM: &str =
    "You do not have permission to get the file from this server.\n";
const ERROR_404_TITLE: &str = "Not Found";
pub const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
const ERROR_500_TITLE: &str = "Internal Error";
pub const ERROR_500_FORM: &str = "There was an unusual problem serving the requested file.\n";

/// Body substituted for zero-length resources.
pub const EMPTY_PAGE: &str = "<html><body></body></html>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        if b.eq_ignore_ascii_case(b"GET") {
            Method::Get
        } else if b.eq_ignore_ascii_case(b"POST") {
            Method::Post
        } else if b.eq_ignore_ascii_case(b"PUT") {
            Method::Put
        } else if b.eq_ignore_ascii_case(b"DELETE") {
            Method::Delete
        } else if b.eq_ignore_ascii_case(b"PATCH") {
            Method::Patch
        } else if b.eq_ignore_ascii_case(b"HEAD") {
            Method::Head
        } else if b.eq_ignore_ascii_case(b"OPTIONS") {
            Method::Options
        } else if b.eq_ignore_ascii_case(b"TRACE") {
            Method::Trace
        } else if b.eq_ignore_ascii_case(b"CONNECT") {
            Method::Connect
        } else {
            Method::Unknown
        }
    }
}

/// Main state machine position. Advances forward only within one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckState {
    RequestLine,
    Header,
    Body,
}

/// Line extraction result.
enum LineStatus {
    /// Terminator found; the range covers the line without its terminator.
    Ok(Range<usize>),
    /// Buffer exhausted mid-line; read more before retrying.
    Open,
    /// Malformed terminator sequence, fatal to the request.
    Bad,
}

/// Outcome of driving the request machine over the bytes read so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Need more input.
    Incomplete,
    /// Request complete and resolved; response segments are ready to build.
    Serve,
    /// Unparseable request line, headers, or body framing (400).
    Malformed,
    /// Target does not resolve under the document root (404).
    Missing,
    /// Target exists but is not world-readable (403).
    Forbidden,
    /// State machine reached an invalid state (500).
    Internal,
}

/// Bounded formatter over the response buffer. Fails instead of overflowing.
struct BufWriter<'a> {
    buf: &'a mut [u8; WRITE_BUFFER_SIZE],
    pos: usize,
}

impl fmt::Write for BufWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}

pub struct Parser {
    doc_root: Arc<PathBuf>,

    read_buf: [u8; READ_BUFFER_SIZE],
    /// Next write position for incoming bytes.
    read_idx: usize,
    /// Scan cursor of the line sub-machine. Invariant:
    /// 0 <= check_idx <= read_idx <= READ_BUFFER_SIZE.
    check_idx: usize,
    /// Start offset of the line currently being scanned.
    start_line: usize,

    write_buf: [u8; WRITE_BUFFER_SIZE],
    /// Bytes of response header (and inline error body) built so far.
    write_idx: usize,

    state: CheckState,
    method: Method,
    target: String,
    host: Option<String>,
    content_length: usize,
    keep_alive: bool,

    /// Mapped target file. At most one mapping exists per connection.
    file: Option<MappedFile>,
    file_size: usize,

    bytes_to_send: usize,
    bytes_sent: usize,
}

impl Parser {
    pub fn new(doc_root: Arc<PathBuf>) -> Self {
        Self {
            doc_root,
            read_buf: [0; READ_BUFFER_SIZE],
            read_idx: 0,
            check_idx: 0,
            start_line: 0,
            write_buf: [0; WRITE_BUFFER_SIZE],
            write_idx: 0,
            state: CheckState::RequestLine,
            method: Method::Get,
            target: String::new(),
            host: None,
            content_length: 0,
            keep_alive: false,
            file: None,
            file_size: 0,
            bytes_to_send: 0,
            bytes_sent: 0,
        }
    }

    /// Restore the freshly-initialized state for the next request on a
    /// kept-alive connection. Releases any file mapping.
    pub fn reset(&mut self) {
        self.read_buf.fill(0);
        self.read_idx = 0;
        self.check_idx = 0;
        self.start_line = 0;
        self.write_buf.fill(0);
        self.write_idx = 0;
        self.state = CheckState::RequestLine;
        self.method = Method::Get;
        self.target.clear();
        self.host = None;
        self.content_length = 0;
        self.keep_alive = false;
        self.file = None;
        self.file_size = 0;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
    }

    /// The unused tail of the read buffer, or None when it is full. The
    /// buffer never grows: a request exceeding it is rejected, not streamed.
    pub fn read_slot(&mut self) -> Option<&mut [u8]> {
        if self.read_idx >= READ_BUFFER_SIZE {
            None
        } else {
            Some(&mut self.read_buf[self.read_idx..])
        }
    }

    pub fn advance_read(&mut self, n: usize) {
        self.read_idx += n;
        debug_assert!(self.read_idx <= READ_BUFFER_SIZE);
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Scan for the next line terminator from the checkpoint.
    fn next_line(&mut self) -> LineStatus {
        while self.check_idx < self.read_idx {
            let byte = self.read_buf[self.check_idx];
            if byte == b'\r' {
                if self.check_idx + 1 == self.read_idx {
                    // CR is the last byte read so far; LF may still arrive.
                    return LineStatus::Open;
                }
                if self.read_buf[self.check_idx + 1] == b'\n' {
                    let line = self.start_line..self.check_idx;
                    self.check_idx += 2;
                    self.start_line = self.check_idx;
                    return LineStatus::Ok(line);
                }
                return LineStatus::Bad;
            } else if byte == b'\n' {
                // LF whose CR landed at the end of a previous read.
                if self.check_idx > 0 && self.read_buf[self.check_idx - 1] == b'\r' {
                    let line = self.start_line..self.check_idx - 1;
                    self.check_idx += 1;
                    self.start_line = self.check_idx;
                    return LineStatus::Ok(line);
                }
                return LineStatus::Bad;
            }
            self.check_idx += 1;
        }
        LineStatus::Open
    }

    /// Drive the request machine over everything read so far.
    ///
    /// Incomplete means the caller must wait for more bytes and call again;
    /// any other status is terminal for this request.
    pub fn process_read(&mut self) -> RequestStatus {
        loop {
            if self.state == CheckState::Body {
                // Complete once the buffer holds the declared body length
                // past the header checkpoint.
                if self.read_idx >= self.check_idx + self.content_length {
                    return self.resolve_target();
                }
                return RequestStatus::Incomplete;
            }

            let range = match self.next_line() {
                LineStatus::Ok(r) => r,
                LineStatus::Open => return RequestStatus::Incomplete,
                LineStatus::Bad => return RequestStatus::Malformed,
            };

            let status = match self.state {
                CheckState::RequestLine => self.parse_request_line(range),
                CheckState::Header => self.parse_header(range),
                CheckState::Body => RequestStatus::Internal,
            };

            match status {
                RequestStatus::Incomplete => continue,
                terminal => return terminal,
            }
        }
    }

    /// METHOD SP TARGET SP VERSION. Only GET over HTTP/1.1 is served.
    fn parse_request_line(&mut self, range: Range<usize>) -> RequestStatus {
        let line = &self.read_buf[range];
        let mut fields = line
            .split(|&b| b == b' ' || b == b'\t')
            .filter(|f| !f.is_empty());

        let (Some(method), Some(target), Some(version)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return RequestStatus::Malformed;
        };
        if fields.next().is_some() {
            return RequestStatus::Malformed;
        }

        let method = Method::from_bytes(method);
        if method != Method::Get {
            return RequestStatus::Malformed;
        }
        if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
            return RequestStatus::Malformed;
        }

        // Absolute-form targets carry a scheme and host prefix.
        let mut target = target;
        if target.len() >= 7 && target[..7].eq_ignore_ascii_case(b"http://") {
            match target[7..].iter().position(|&b| b == b'/') {
                Some(pos) => target = &target[7 + pos..],
                None => return RequestStatus::Malformed,
            }
        }
        if target.first() != Some(&b'/') {
            return RequestStatus::Malformed;
        }
        let Ok(target) = std::str::from_utf8(target) else {
            return RequestStatus::Malformed;
        };
        let target = target.to_string();

        self.method = method;
        self.target = target;
        self.state = CheckState::Header;
        RequestStatus::Incomplete
    }

    /// One header line; an empty line ends the block.
    fn parse_header(&mut self, range: Range<usize>) -> RequestStatus {
        if range.is_empty() {
            if self.content_length != 0 {
                self.state = CheckState::Body;
                return RequestStatus::Incomplete;
            }
            return self.resolve_target();
        }

        let line = &self.read_buf[range];
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            tracing::debug!(line = %String::from_utf8_lossy(line), "ignoring header line without colon");
            return RequestStatus::Incomplete;
        };
        let name = &line[..colon];
        let mut value = &line[colon + 1..];
        while value.first().is_some_and(|&b| b == b' ' || b == b'\t') {
            value = &value[1..];
        }

        if name.eq_ignore_ascii_case(b"Connection") {
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        } else if name.eq_ignore_ascii_case(b"Content-Length") {
            let parsed = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.parse::<usize>().ok());
            match parsed {
                // A declared body that cannot fit the fixed read buffer can
                // never complete; reject it up front. This also keeps the
                // completeness arithmetic in process_read bounded.
                Some(n) if n <= READ_BUFFER_SIZE => self.content_length = n,
                _ => return RequestStatus::Malformed,
            }
        } else if name.eq_ignore_ascii_case(b"Host") {
            self.host = Some(String::from_utf8_lossy(value).into_owned());
        } else {
            tracing::debug!(header = %String::from_utf8_lossy(name), "ignoring unrecognized header");
        }
        RequestStatus::Incomplete
    }

    /// Map the completed request's target to a file under the document root.
    fn resolve_target(&mut self) -> RequestStatus {
        tracing::debug!(method = ?self.method, target = %self.target, "resolving request");
        if self.target.split('/').any(|seg| seg == "..") {
            return RequestStatus::Forbidden;
        }
        let path = self.doc_root.join(self.target.trim_start_matches('/'));

        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => return RequestStatus::Missing,
        };
        if meta.mode() & 0o004 == 0 {
            return RequestStatus::Forbidden;
        }
        if meta.is_dir() {
            return RequestStatus::Malformed;
        }

        self.file_size = meta.len() as usize;
        if self.file_size > 0 {
            match MappedFile::map(&path, self.file_size) {
                Ok(map) => self.file = Some(map),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "failed to map target file");
                    return RequestStatus::Internal;
                }
            }
        }
        RequestStatus::Serve
    }

    // ---- Response assembly ----

    fn add_response(&mut self, args: fmt::Arguments<'_>) -> bool {
        if self.write_idx >= WRITE_BUFFER_SIZE {
            return false;
        }
        let mut writer = BufWriter {
            buf: &mut self.write_buf,
            pos: self.write_idx,
        };
        if writer.write_fmt(args).is_err() {
            return false;
        }
        self.write_idx = writer.pos;
        true
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_response(format_args!("HTTP/1.1 {} {}\r\n", status, title))
    }

    fn add_content_length(&mut self, content_len: usize) -> bool {
        self.add_response(format_args!("Content-Length: {}\r\n", content_len))
    }

    fn add_date(&mut self) -> bool {
        self.add_response(format_args!(
            "Date: {}\r\n",
            httpdate::fmt_http_date(SystemTime::now())
        ))
    }

    fn add_linger(&mut self) -> bool {
        self.add_response(format_args!(
            "Connection: {}\r\n",
            if self.keep_alive { "keep-alive" } else { "close" }
        ))
    }

    fn add_blank_line(&mut self) -> bool {
        self.add_response(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{}", content))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        self.add_content_length(content_len)
            && self.add_date()
            && self.add_linger()
            && self.add_blank_line()
    }

    fn add_error_page(&mut self, status: u16, title: &str, form: &str) -> bool {
        self.add_status_line(status, title) && self.add_headers(form.len()) && self.add_content(form)
    }

    /// Build the response for a terminal parse status. Any assembly failure
    /// is an unconditional fast-fail: the caller closes the connection.
    pub fn process_write(&mut self, status: RequestStatus) -> bool {
        let ok = match status {
            RequestStatus::Internal => self.add_error_page(500, ERROR_500_TITLE, ERROR_500_FORM),
            RequestStatus::Malformed => self.add_error_page(400, ERROR_400_TITLE, ERROR_400_FORM),
            RequestStatus::Missing => self.add_error_page(404, ERROR_404_TITLE, ERROR_404_FORM),
            RequestStatus::Forbidden => self.add_error_page(403, ERROR_403_TITLE, ERROR_403_FORM),
            RequestStatus::Serve => {
                if !self.add_status_line(200, OK_200_TITLE) {
                    false
                } else if self.file_size != 0 {
                    // Two segments: header buffer + mapped file region.
                    if self.add_headers(self.file_size) {
                        self.bytes_to_send = self.write_idx + self.file_size;
                        self.bytes_sent = 0;
                        return true;
                    }
                    false
                } else {
                    let n = EMPTY_PAGE.len();
                    self.add_headers(n) && self.add_content(EMPTY_PAGE)
                }
            }
            RequestStatus::Incomplete => false,
        };

        if !ok {
            self.release_file();
            return false;
        }
        self.bytes_to_send = self.write_idx;
        self.bytes_sent = 0;
        true
    }

    /// The unsent tails of the header segment and the mapped file segment.
    pub fn pending(&self) -> (Option<&[u8]>, Option<&[u8]>) {
        if self.bytes_sent >= self.bytes_to_send {
            return (None, None);
        }
        let header_len = self.write_idx;
        let head = if self.bytes_sent < header_len {
            Some(&self.write_buf[self.bytes_sent..header_len])
        } else {
            None
        };
        let file = self.file.as_ref().and_then(|map| {
            let offset = self.bytes_sent.saturating_sub(header_len);
            let slice = map.as_slice();
            if offset < slice.len() {
                Some(&slice[offset..])
            } else {
                None
            }
        });
        (head, file)
    }

    pub fn advance_sent(&mut self, n: usize) {
        self.bytes_sent += n;
        debug_assert!(self.bytes_sent <= self.bytes_to_send);
    }

    pub fn fully_sent(&self) -> bool {
        self.bytes_sent >= self.bytes_to_send
    }

    pub fn bytes_to_send(&self) -> usize {
        self.bytes_to_send
    }

    pub fn release_file(&mut self) {
        self.file = None;
    }
}

// src/lib.rs
//
// staticd: an epoll-based HTTP/1.1 static file server.
//
// One reactor thread multiplexes every socket through an edge-triggered,
// one-shot epoll instance; a bounded worker pool parses requests and builds
// responses; files go out as mmap-backed segments of a vectored write.

pub mod config;
pub mod conn;
pub mod error;
pub mod mmap;
pub mod parser;
pub mod pool;
pub mod server;
pub mod sync;
pub mod syscalls;
pub mod table;

pub use config::Config;
pub use error::{ServerError, ServerResult};
pub use server::Server;

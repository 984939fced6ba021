//! Centralized line-oriented log ingestion server.
//!
//! Clients open plain TCP connections and send one log record per line;
//! records are parsed, buffered in a bounded ring with a priority-aware
//! back-pressure policy, and drained by a pool of batching workers into
//! per-application, daily-rotated files.
//!
//! ```text
//!   TCP clients
//!       │
//!       v
//!   ┌──────────────┐      ┌──────────────┐      ┌──────────────┐
//!   │   Acceptor   │────▶ │  Connection  │────▶ │   Circular   │
//!   │              │  (N) │   Handlers   │      │    Buffer    │
//!   └──────────────┘      └──────────────┘      └──────┬───────┘
//!                                                      │
//!                                                      v
//!                         ┌──────────────┐      ┌──────────────┐
//!                         │ File Storage │ ◀────│  Processor   │
//!                         │    Sink      │      │    Pool (P)  │
//!                         └──────────────┘      └──────────────┘
//! ```
//!
//! The buffer never blocks producers: under saturation it evicts the
//! oldest low-severity record to make room, and tells the client when a
//! record could not be accepted. The system is lossy but live under
//! overload.

pub mod buffer;
pub mod config;
pub mod errors;
pub mod handler;
pub mod parser;
pub mod processor;
pub mod record;
pub mod server;
pub mod storage;

pub use buffer::CircularBuffer;
pub use config::Config;
pub use record::{LogLevel, LogRecord};
pub use server::LogServer;
pub use storage::FileStorage;

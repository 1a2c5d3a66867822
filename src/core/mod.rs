//! Core terminal session components.
//!
//! This module contains the connection and decoding logic:
//!
//! - **transport**: SSH capability trait, connection profiles, errors
//! - **ssh**: libssh2-backed transport implementation
//! - **term**: incremental ANSI decoder producing styled runs
//! - **session**: per-connection state machine with read pump
//! - **registry**: process-wide session owner + connected live view
//!
//! # Architecture
//!
//! ```text
//! SessionRegistry
//! ├── LiveView (connected roster, pushed to watchers)
//! └── TerminalSession (one per connection id)
//!     ├── Transport (SSH channel I/O)
//!     ├── AnsiDecoder (bytes -> styled runs)
//!     └── pump + writer threads
//! ```

pub mod registry;
pub mod session;
pub mod ssh;
pub mod term;
pub mod transport;

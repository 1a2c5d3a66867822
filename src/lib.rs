//! sshterm - interactive SSH terminal sessions as a library
//!
//! sshterm keeps long-lived shell sessions to remote hosts and turns their
//! raw output into styled text runs a UI can render directly. It is the
//! terminal backend of an SSH client: the embedding app supplies connection
//! profiles and a display surface, this crate supplies everything between
//! the socket and the styled text.
//!
//! # Features
//!
//! - **Session registry**: one durable session per saved connection,
//!   created on first use and reusable across reconnects
//! - **Single-flight connect**: concurrent connect calls for the same
//!   connection collapse into one transport
//! - **Background streaming**: a read pump decodes output as it arrives;
//!   snapshots and subscriber events keep the UI current
//! - **ANSI decoding**: SGR colors (16/256/truecolor), bold, italic,
//!   underline, inverse, and carriage-return overwrite semantics
//! - **Live view**: a synchronously-updated roster of connected sessions
//! - **One-shot exec**: run commands on a side channel of a live
//!   connection, for resource polling
//!
//! # Quick Start
//!
//! ```no_run
//! use sshterm::{ConnectionId, ConnectProfile, Credential, SessionRegistry, Settings};
//!
//! let registry = SessionRegistry::new(Settings::load());
//! let profile = ConnectProfile {
//!     display_name: "build box".into(),
//!     host: "build.example.com".into(),
//!     port: 22,
//!     username: "ci".into(),
//!     credential: Credential::Password("secret".into()),
//! };
//!
//! let id = ConnectionId(1);
//! registry.connect_if_needed(id, &profile)?;
//!
//! let session = registry.get_or_create(id);
//! session.send_command("uname -a");
//! for run in session.snapshot().runs {
//!     print!("{}", run.text);
//! }
//! # Ok::<(), sshterm::TerminalError>(())
//! ```

mod config;
mod core;

pub use crate::config::Settings;
pub use crate::core::registry::{LiveView, SessionRegistry, TerminalConnectionSummary};
pub use crate::core::session::{
    ConnectionId, OutputSnapshot, SessionEvent, SessionState, TerminalSession, TransportFactory,
};
pub use crate::core::ssh::SshTransport;
pub use crate::core::term::{AnsiDecoder, Color, StyleFlags, StyledRun, TextStyle};
pub use crate::core::transport::{
    ConnectProfile, Credential, Result, TerminalError, Transport, TransportCloser,
};

//! libssh2-backed transport
//!
//! Concrete [`Transport`] over the `ssh2` crate. The handshake and
//! authentication run blocking with a bounded timeout; once the shell
//! channel is open the session switches to non-blocking so the read half
//! can be polled without stalling the write half. Both halves share the
//! channel behind a mutex; cancellation shuts down a cloned socket
//! handle, which aborts any in-flight channel I/O.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ssh2::Session;
use tracing::debug;

use super::transport::{Credential, Result, TerminalError, Transport, TransportCloser};

/// Sleep between write retries while the channel reports `WouldBlock`
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(5);

fn transport_err(e: ssh2::Error) -> TerminalError {
    TerminalError::Transport(e.to_string())
}

/// libssh2 takes its timeout as u32 milliseconds; clamp oversized
/// configured timeouts instead of truncating them
fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

/// Retry an ssh2 call while the non-blocking session reports EAGAIN.
/// Needed for channels opened after the shell switched the session to
/// non-blocking mode.
fn retry_would_block<T>(
    mut op: impl FnMut() -> std::result::Result<T, ssh2::Error>,
) -> Result<T> {
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                let io_err = io::Error::from(e);
                if io_err.kind() == io::ErrorKind::WouldBlock {
                    thread::sleep(WRITE_RETRY_INTERVAL);
                } else {
                    return Err(TerminalError::Transport(io_err.to_string()));
                }
            }
        }
    }
}

/// SSH transport for one connection.
pub struct SshTransport {
    term: String,
    session: Option<Session>,
    /// Cloned socket handle kept for cross-thread shutdown
    socket: Option<TcpStream>,
}

impl SshTransport {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            session: None,
            socket: None,
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| TerminalError::Transport("not connected".into()))
    }
}

impl Transport for SshTransport {
    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| TerminalError::Transport(format!("resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| TerminalError::Transport(format!("no address for {host}")))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| TerminalError::Transport(format!("connect {addr}: {e}")))?;
        let cancel = tcp
            .try_clone()
            .map_err(|e| TerminalError::Transport(e.to_string()))?;

        let mut session = Session::new().map_err(transport_err)?;
        // Bounds the handshake and every subsequent blocking call
        session.set_timeout(timeout_millis(timeout));
        session.set_tcp_stream(tcp);
        session.handshake().map_err(transport_err)?;

        self.session = Some(session);
        self.socket = Some(cancel);
        Ok(())
    }

    fn authenticate(&mut self, username: &str, credential: &Credential) -> Result<()> {
        let session = self.session()?;
        let attempt = match credential {
            Credential::Password(password) => session.userauth_password(username, password),
            Credential::Key {
                private_key,
                passphrase,
            } => {
                // Key material goes straight to libssh2; nothing is staged
                // on disk, so teardown needs no credential cleanup
                session.userauth_pubkey_memory(username, None, private_key, passphrase.as_deref())
            }
        };
        attempt.map_err(|e| TerminalError::Auth(e.to_string()))?;
        if !session.authenticated() {
            return Err(TerminalError::Auth("server rejected credentials".into()));
        }
        Ok(())
    }

    fn open_shell(&mut self) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        let session = self.session()?;
        let mut channel = session.channel_session().map_err(transport_err)?;
        channel
            .request_pty(&self.term, None, None)
            .map_err(transport_err)?;
        channel.shell().map_err(transport_err)?;

        // Steady state is polled: reads return WouldBlock when idle
        session.set_blocking(false);
        session.set_timeout(0);

        let shared = Arc::new(Mutex::new(channel));
        Ok((
            Box::new(ChannelReader(shared.clone())),
            Box::new(ChannelWriter(shared)),
        ))
    }

    fn open_exec(&mut self, command: &str) -> Result<Box<dyn Read + Send>> {
        let session = self.session()?;
        let mut channel = retry_would_block(|| session.channel_session())?;
        retry_would_block(|| channel.exec(command))?;
        Ok(Box::new(ChannelReader(Arc::new(Mutex::new(channel)))))
    }

    fn closer(&self) -> Box<dyn TransportCloser> {
        let socket = self.socket.as_ref().and_then(|s| s.try_clone().ok());
        Box::new(SocketCloser(socket))
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.disconnect(None, "closing", None) {
                debug!("ssh disconnect: {e}");
            }
        }
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

struct SocketCloser(Option<TcpStream>);

impl TransportCloser for SocketCloser {
    fn close(&self) {
        if let Some(socket) = &self.0 {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

fn lock_channel(channel: &Mutex<ssh2::Channel>) -> io::Result<std::sync::MutexGuard<'_, ssh2::Channel>> {
    channel
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "channel lock poisoned"))
}

/// Read half of a shell channel. `Ok(0)` means remote EOF.
struct ChannelReader(Arc<Mutex<ssh2::Channel>>);

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut channel = lock_channel(&self.0)?;
        if channel.eof() {
            return Ok(0);
        }
        channel.read(buf)
    }
}

/// Write half of a shell channel. Retries `WouldBlock` internally so the
/// writer thread can use plain `write_all`.
struct ChannelWriter(Arc<Mutex<ssh2::Channel>>);

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let result = lock_channel(&self.0)?.write(buf);
            match result {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(WRITE_RETRY_INTERVAL);
                }
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        loop {
            let result = lock_channel(&self.0)?.flush();
            match result {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(WRITE_RETRY_INTERVAL);
                }
                other => return other,
            }
        }
    }
}

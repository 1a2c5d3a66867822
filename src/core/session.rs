//! Terminal session lifecycle
//!
//! One [`TerminalSession`] exists per saved connection for the process
//! lifetime; its state cycles through Disconnected/Connecting/Connected/
//! Closing while the object identity stays stable, so observers can hold
//! a long-lived `Arc`.
//!
//! Each connected session runs two threads: a read pump that polls the
//! shell channel, feeds the decoder and publishes output, and a writer
//! that drains an input queue so a stalled write can never block reads.
//! Transitions are serialized by a per-session mutex held across the
//! whole connect/disconnect, which is what makes `connect` single-flight:
//! concurrent callers for the same id line up behind the in-flight
//! attempt instead of opening a second transport.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::registry::LiveView;
use super::term::{AnsiDecoder, StyledRun};
use super::transport::{ConnectProfile, Result, TerminalError, Transport, TransportCloser};
use crate::config::Settings;

/// Sleep between pump polls while the channel reports `WouldBlock`
const READ_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Stable identifier of a saved connection profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub i64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Session lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Events published to session subscribers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// New output was appended to the buffer
    Output,
    /// The session changed state
    StateChanged(SessionState),
}

/// Read-only projection of a session's output and status.
#[derive(Clone, Debug)]
pub struct OutputSnapshot {
    /// Completed runs plus the decoder's pending unterminated line
    pub runs: Vec<StyledRun>,
    pub state: SessionState,
    /// Incremented on each successful `Connected` transition
    pub generation: u64,
}

impl OutputSnapshot {
    pub fn plain_text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }
}

/// Factory producing a fresh transport per connection attempt.
pub type TransportFactory = dyn Fn() -> Box<dyn Transport> + Send + Sync;

/// A terminal session bound to one connection id.
pub struct TerminalSession {
    id: ConnectionId,
    settings: Settings,
    factory: Arc<TransportFactory>,
    live: Arc<LiveView>,
    /// Serializes connect/disconnect transitions (single-flight)
    transition: Mutex<()>,
    inner: Mutex<Inner>,
    /// Transport behind its own lock: opening a one-shot channel can block
    /// on the network and must not stall state readers or the pump
    transport: Mutex<Option<Box<dyn Transport>>>,
    generation: AtomicU64,
    running: Arc<AtomicBool>,
}

struct Inner {
    state: SessionState,
    decoder: AnsiDecoder,
    /// Completed styled runs since the last clear; unbounded by design
    buffer: Vec<StyledRun>,
    closer: Option<Box<dyn TransportCloser>>,
    writer_tx: Option<Sender<Vec<u8>>>,
    pump: Option<JoinHandle<()>>,
    writer_thread: Option<JoinHandle<()>>,
    subscribers: Vec<Sender<SessionEvent>>,
}

impl TerminalSession {
    pub(crate) fn new(
        id: ConnectionId,
        live: Arc<LiveView>,
        factory: Arc<TransportFactory>,
        settings: Settings,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            settings,
            factory,
            live,
            transition: Mutex::new(()),
            inner: Mutex::new(Inner {
                state: SessionState::Disconnected,
                decoder: AnsiDecoder::new(),
                buffer: Vec::new(),
                closer: None,
                writer_tx: None,
                pump: None,
                writer_thread: None,
                subscribers: Vec::new(),
            }),
            transport: Mutex::new(None),
            generation: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Generation of the current (or last) connection. Observers compare
    /// this to detect a fresh connection without looking at timestamps.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Establish a connection if there is none.
    ///
    /// Returns `Ok(true)` when a new connection was established and
    /// `Ok(false)` when the session was already connected. On failure the
    /// transport is released and the session settles at `Disconnected`
    /// before the error is returned, so a retry is always safe.
    ///
    /// Output streaming has begun by the time this returns: the read pump
    /// and writer thread start as part of entering `Connected`.
    pub fn connect(self: &Arc<Self>, profile: &ConnectProfile) -> Result<bool> {
        let _flight = lock_transition(&self.transition);

        // Reap threads left behind by a remote-initiated close
        let stale = {
            let mut inner = self.lock();
            if inner.state == SessionState::Connected {
                debug!("session {}: already connected", self.id);
                return Ok(false);
            }
            inner.set_state(SessionState::Connecting);
            (inner.pump.take(), inner.writer_thread.take())
        };
        join_quietly(stale.0);
        join_quietly(stale.1);

        let mut transport = (self.factory)();
        let (reader, writer) = match Self::establish(transport.as_mut(), profile, &self.settings) {
            Ok(halves) => halves,
            Err(e) => {
                transport.close();
                self.lock().set_state(SessionState::Disconnected);
                warn!("session {}: connect failed: {e}", self.id);
                return Err(e);
            }
        };

        let closer = transport.closer();
        let (writer_tx, writer_rx) = mpsc::channel::<Vec<u8>>();
        let writer_thread = thread::spawn(move || write_loop(writer, writer_rx));

        self.running.store(true, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        *self.transport_slot() = Some(transport);
        {
            let mut inner = self.lock();
            inner.closer = Some(closer);
            inner.writer_tx = Some(writer_tx);
            inner.writer_thread = Some(writer_thread);
            inner.set_state(SessionState::Connected);
        }
        self.live.publish(self.id, profile.display_name.clone());

        let pump = {
            let session = Arc::clone(self);
            thread::spawn(move || session.pump_loop(reader))
        };
        self.lock().pump = Some(pump);

        info!(
            "session {}: connected to {}:{} (generation {generation})",
            self.id, profile.host, profile.port
        );
        Ok(true)
    }

    fn establish(
        transport: &mut dyn Transport,
        profile: &ConnectProfile,
        settings: &Settings,
    ) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        transport.connect(&profile.host, profile.port, settings.connect_timeout())?;
        transport.authenticate(&profile.username, &profile.credential)?;
        transport.open_shell()
    }

    /// Tear down the connection. Best-effort: close errors are swallowed
    /// and the session always settles at `Disconnected`.
    pub fn disconnect(&self) {
        let _flight = lock_transition(&self.transition);

        let (pump, writer_thread) = {
            let mut inner = self.lock();
            if inner.state != SessionState::Disconnected {
                inner.set_state(SessionState::Closing);
            }
            self.running.store(false, Ordering::SeqCst);
            // Closing the transport handle is the cancellation signal for
            // a pump blocked on a silent remote
            if let Some(closer) = inner.closer.take() {
                closer.close();
            }
            inner.writer_tx = None;
            (inner.pump.take(), inner.writer_thread.take())
        };
        join_quietly(pump);
        join_quietly(writer_thread);

        if let Some(mut transport) = self.transport_slot().take() {
            transport.close();
        }

        let mut inner = self.lock();
        let changed = inner.state != SessionState::Disconnected;
        if changed {
            inner.set_state(SessionState::Disconnected);
        }
        drop(inner);
        self.live.remove(self.id);
        if changed {
            info!("session {}: disconnected", self.id);
        }
    }

    /// Queue a command line for the remote shell, with a trailing newline.
    pub fn send_command(&self, text: &str) {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.send_input(&line);
    }

    /// Queue raw input bytes for the remote shell. Non-blocking; silently
    /// dropped unless connected, since a disconnect can race user input.
    pub fn send_input(&self, text: &str) {
        let inner = self.lock();
        if inner.state != SessionState::Connected {
            return;
        }
        if let Some(tx) = &inner.writer_tx {
            let _ = tx.send(text.as_bytes().to_vec());
        }
    }

    /// Run a one-shot command on a separate channel of the live connection
    /// and collect its output. Used by resource polling, not the shell pane.
    pub fn exec(&self, command: &str) -> Result<String> {
        if self.lock().state != SessionState::Connected {
            return Err(TerminalError::Transport("not connected".into()));
        }
        // Only the transport slot is held while the channel opens; snapshots,
        // input and the read pump go through the inner lock and stay live
        let mut reader = {
            let mut slot = self.transport_slot();
            let transport = slot
                .as_mut()
                .ok_or_else(|| TerminalError::Transport("not connected".into()))?;
            transport.open_exec(command)?
        };

        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted =>
                {
                    thread::sleep(READ_POLL_INTERVAL);
                }
                Err(e) => return Err(TerminalError::Transport(e.to_string())),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Reset the output buffer without touching session state or the
    /// decoder's carried style, so a clear mid-escape-application does not
    /// visually reset color context.
    pub fn clear_output(&self) {
        let mut inner = self.lock();
        inner.buffer.clear();
        inner.decoder.clear_pending();
        notify(&mut inner.subscribers, SessionEvent::Output);
    }

    /// Current output, state and generation as one consistent snapshot.
    pub fn snapshot(&self) -> OutputSnapshot {
        let inner = self.lock();
        let mut runs = inner.buffer.clone();
        runs.extend(inner.decoder.pending());
        OutputSnapshot {
            runs,
            state: inner.state,
            generation: self.generation.load(Ordering::SeqCst),
        }
    }

    /// Subscribe to output and state-change events.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().subscribers.push(tx);
        rx
    }

    fn pump_loop(&self, mut reader: Box<dyn Read + Send>) {
        let mut buf = vec![0u8; self.settings.read_buffer_size.max(1)];
        let reason = loop {
            if !self.running.load(Ordering::SeqCst) {
                break None;
            }
            match reader.read(&mut buf) {
                Ok(0) => {
                    // A local disconnect shuts the socket, which can also
                    // surface as EOF; only a live session treats it as a
                    // remote close
                    if !self.running.load(Ordering::SeqCst) {
                        break None;
                    }
                    break Some(TerminalError::RemoteClosed);
                }
                Ok(n) => self.ingest(&buf[..n]),
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted =>
                {
                    thread::sleep(READ_POLL_INTERVAL);
                }
                Err(e) => {
                    // A shutdown-induced error during teardown is not a failure
                    if !self.running.load(Ordering::SeqCst) {
                        break None;
                    }
                    break Some(TerminalError::Transport(e.to_string()));
                }
            }
        };
        if let Some(err) = reason {
            self.remote_teardown(err);
        }
    }

    fn ingest(&self, bytes: &[u8]) {
        let mut inner = self.lock();
        let runs = inner.decoder.decode(bytes);
        inner.buffer.extend(runs);
        notify(&mut inner.subscribers, SessionEvent::Output);
    }

    /// Pump exit path for remote close or steady-state I/O errors: the
    /// error is folded into the buffer as a diagnostic run, never thrown
    /// at callers. No automatic reconnect; retry is caller-initiated.
    fn remote_teardown(&self, err: TerminalError) {
        self.running.store(false, Ordering::SeqCst);

        {
            let mut inner = self.lock();
            inner.set_state(SessionState::Closing);
            let tail = inner.decoder.flush();
            inner.buffer.extend(tail);
            let mut diagnostic = StyledRun::plain(format!("\n[{err}]\n"));
            diagnostic.bold = true;
            inner.buffer.push(diagnostic);
            inner.closer = None;
            inner.writer_tx = None;
            notify(&mut inner.subscribers, SessionEvent::Output);
        }

        if let Some(mut transport) = self.transport_slot().take() {
            transport.close();
        }
        self.lock().set_state(SessionState::Disconnected);

        self.live.remove(self.id);
        info!("session {}: {err}", self.id);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transport_slot(&self) -> MutexGuard<'_, Option<Box<dyn Transport>>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        self.state = next;
        notify(&mut self.subscribers, SessionEvent::StateChanged(next));
    }
}

fn lock_transition(transition: &Mutex<()>) -> MutexGuard<'_, ()> {
    transition.lock().unwrap_or_else(PoisonError::into_inner)
}

fn notify(subscribers: &mut Vec<Sender<SessionEvent>>, event: SessionEvent) {
    subscribers.retain(|tx| tx.send(event.clone()).is_ok());
}

fn join_quietly(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        let _ = handle.join();
    }
}

fn write_loop(mut writer: Box<dyn Write + Send>, rx: Receiver<Vec<u8>>) {
    while let Ok(chunk) = rx.recv() {
        if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
            debug!("input write failed: {e}");
            break;
        }
    }
}

/// Channel-backed mock transport shared by session and registry tests.
#[cfg(test)]
pub(crate) mod mock {
    use std::io::{self, Cursor, Read, Write};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::config::Settings;
    use crate::core::registry::SessionRegistry;
    use crate::core::transport::{
        ConnectProfile, Credential, Result, TerminalError, Transport, TransportCloser,
    };

    #[derive(Clone, Default)]
    pub struct MockBehavior {
        pub connect_delay: Duration,
        /// Simulated network latency while an exec channel opens
        pub exec_delay: Duration,
        pub fail_connect: bool,
        pub fail_auth: bool,
        pub exec_output: String,
    }

    /// Test-side handle to one created transport.
    pub struct MockHandle {
        pub data_tx: Sender<Vec<u8>>,
        pub written: Arc<Mutex<Vec<u8>>>,
        pub closed: Arc<AtomicBool>,
        pub eof: Arc<AtomicBool>,
    }

    pub struct MockTransport {
        behavior: MockBehavior,
        data_rx: Option<Receiver<Vec<u8>>>,
        written: Arc<Mutex<Vec<u8>>>,
        closed: Arc<AtomicBool>,
        eof: Arc<AtomicBool>,
    }

    impl Transport for MockTransport {
        fn connect(&mut self, _host: &str, _port: u16, _timeout: Duration) -> Result<()> {
            if !self.behavior.connect_delay.is_zero() {
                thread::sleep(self.behavior.connect_delay);
            }
            if self.behavior.fail_connect {
                return Err(TerminalError::Transport("connection refused".into()));
            }
            Ok(())
        }

        fn authenticate(&mut self, _username: &str, _credential: &Credential) -> Result<()> {
            if self.behavior.fail_auth {
                return Err(TerminalError::Auth("bad credential".into()));
            }
            Ok(())
        }

        fn open_shell(&mut self) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
            let rx = self
                .data_rx
                .take()
                .ok_or_else(|| TerminalError::Transport("shell already open".into()))?;
            Ok((
                Box::new(MockReader {
                    rx,
                    closed: self.closed.clone(),
                    eof: self.eof.clone(),
                }),
                Box::new(MockWriter {
                    written: self.written.clone(),
                }),
            ))
        }

        fn open_exec(&mut self, _command: &str) -> Result<Box<dyn Read + Send>> {
            if !self.behavior.exec_delay.is_zero() {
                thread::sleep(self.behavior.exec_delay);
            }
            Ok(Box::new(Cursor::new(
                self.behavior.exec_output.clone().into_bytes(),
            )))
        }

        fn closer(&self) -> Box<dyn TransportCloser> {
            Box::new(MockCloser(self.closed.clone()))
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct MockReader {
        rx: Receiver<Vec<u8>>,
        closed: Arc<AtomicBool>,
        eof: Arc<AtomicBool>,
    }

    impl Read for MockReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.eof.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            match self.rx.try_recv() {
                Ok(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Err(TryRecvError::Empty) => {
                    Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
                }
                Err(TryRecvError::Disconnected) => Ok(0),
            }
        }
    }

    struct MockWriter {
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for MockWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct MockCloser(Arc<AtomicBool>);

    impl TransportCloser for MockCloser {
        fn close(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Route session tracing through the test harness; `RUST_LOG` filters.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Registry wired to mock transports, plus the handles and a counter
    /// of transports created so far.
    pub fn mock_registry(
        behavior: MockBehavior,
    ) -> (
        SessionRegistry,
        Arc<Mutex<Vec<MockHandle>>>,
        Arc<AtomicUsize>,
    ) {
        init_tracing();
        let handles: Arc<Mutex<Vec<MockHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let created = Arc::new(AtomicUsize::new(0));

        let factory = {
            let handles = handles.clone();
            let created = created.clone();
            Arc::new(move || {
                created.fetch_add(1, Ordering::SeqCst);
                let (data_tx, data_rx) = mpsc::channel();
                let written = Arc::new(Mutex::new(Vec::new()));
                let closed = Arc::new(AtomicBool::new(false));
                let eof = Arc::new(AtomicBool::new(false));
                handles.lock().unwrap().push(MockHandle {
                    data_tx,
                    written: written.clone(),
                    closed: closed.clone(),
                    eof: eof.clone(),
                });
                Box::new(MockTransport {
                    behavior: behavior.clone(),
                    data_rx: Some(data_rx),
                    written,
                    closed,
                    eof,
                }) as Box<dyn Transport>
            })
        };

        (
            SessionRegistry::with_factory(Settings::default(), factory),
            handles,
            created,
        )
    }

    pub fn profile(name: &str) -> ConnectProfile {
        ConnectProfile {
            display_name: name.into(),
            host: "host.example.com".into(),
            port: 22,
            username: "user".into(),
            credential: Credential::Password("pw".into()),
        }
    }

    /// Poll a condition with a hard deadline; panics on timeout.
    pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {what}");
    }
}

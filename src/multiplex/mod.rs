//! The stream multiplexer (§4.6): one reader thread owns the transport's
//! receive half, a locked stream table routes inbound frames, writes are
//! serialised through a single mutex. Generalises the teacher's
//! reader/writer/dispatch thread trio and `Arc<RwLock<HashMap<..>>>` stream
//! table down to one reader thread plus per-stream condvars, since this
//! crate's OKAY-gating and close semantics don't need a separate dispatch hop.

pub mod stream;

pub use stream::Stream;

use crate::codec::{Command, Frame};
use crate::error::{AdbError, ProtocolErrorReason, Result};
use crate::handshake::Connected;
use crate::transport::Transport;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Phase {
    Opening,
    Open,
    HalfClosed,
    Closed,
}

/// Why a stream ended up `Closed`, kept as a small `Copy` tag since `AdbError`
/// itself isn't `Clone` (it wraps `std::io::Error`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CloseCause {
    Local,
    Remote,
    Refused,
    ConnectionLost,
    Protocol(ProtocolErrorReason),
}

impl CloseCause {
    fn into_error(self) -> AdbError {
        match self {
            CloseCause::Refused => AdbError::ConnectionRefused,
            CloseCause::Local | CloseCause::Remote => AdbError::StreamClosed,
            CloseCause::ConnectionLost => AdbError::TransportClosed,
            CloseCause::Protocol(reason) => AdbError::ProtocolError(reason),
        }
    }
}

pub(crate) struct StreamInner {
    pub(crate) remote_id: u32,
    pub(crate) phase: Phase,
    pub(crate) read_queue: VecDeque<u8>,
    pub(crate) write_permit: bool,
    pub(crate) close_cause: Option<CloseCause>,
}

enum OpenOutcome {
    Opened { remote_id: u32 },
    Refused,
}

pub(crate) struct StreamShared {
    pub(crate) local_id: u32,
    pub(crate) inner: Mutex<StreamInner>,
    pub(crate) cv: Condvar,
    open_waiter: Mutex<Option<SyncSender<OpenOutcome>>>,
    shared: Arc<Shared>,
}

struct Shared {
    writer: Mutex<Box<dyn Transport>>,
    active_version: u32,
    active_max_data: u32,
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    next_local_id: Mutex<u32>,
    remote_banner: Vec<u8>,
}

impl Shared {
    fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        frame.write_to(writer.as_mut(), self.active_version)
    }

    fn fail_all_streams(&self, cause: CloseCause) {
        let streams = self.streams.lock().unwrap();
        for stream in streams.values() {
            let mut inner = stream.inner.lock().unwrap();
            if inner.phase != Phase::Closed {
                inner.phase = Phase::Closed;
                inner.close_cause = Some(cause);
            }
            stream.cv.notify_all();
            if let Some(tx) = stream.open_waiter.lock().unwrap().take() {
                let _ = tx.send(OpenOutcome::Refused);
            }
        }
    }
}

/// Owns the connection after the handshake completes. `open` takes `&self`,
/// so wrap in an `Arc` to share across caller threads; dropping the
/// `Multiplexer` tears the connection down (see `Drop`).
pub struct Multiplexer {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl Multiplexer {
    /// Start the reader thread and return a multiplexer ready to `open` streams.
    ///
    /// Requires a transport that supports [`Transport::try_clone`]: the reader
    /// thread keeps the original handle exclusively for `recv_exact`, while a
    /// cloned handle backs the `Mutex<Box<dyn Transport>>` writer, so a reader
    /// blocked waiting for the next frame never holds up a concurrent `open`,
    /// `write` or `close` (§5).
    pub fn start(connected: Connected) -> Result<Self> {
        let write_half = connected.transport.try_clone()?;
        let read_half = connected.transport;

        let shared = Arc::new(Shared {
            writer: Mutex::new(write_half),
            active_version: connected.active_version,
            active_max_data: connected.active_max_data,
            streams: Mutex::new(HashMap::new()),
            next_local_id: Mutex::new(1),
            remote_banner: connected.remote_banner,
        });

        let reader_shared = shared.clone();
        let reader = thread::spawn(move || reader_loop(reader_shared, read_half));

        Ok(Self {
            shared,
            reader: Some(reader),
        })
    }

    pub fn remote_banner(&self) -> &[u8] {
        &self.shared.remote_banner
    }

    pub fn active_max_data(&self) -> u32 {
        self.shared.active_max_data
    }

    /// Open a new stream to `destination` (e.g. `"shell:echo hi"`), blocking
    /// until the daemon answers with OKAY or CLSE, or until `timeout` elapses.
    pub fn open(&self, destination: &str, timeout: Option<Duration>) -> Result<Stream> {
        let local_id = {
            let mut next = self.shared.next_local_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };

        let (tx, rx) = sync_channel::<OpenOutcome>(1);
        let stream_shared = Arc::new(StreamShared {
            local_id,
            inner: Mutex::new(StreamInner {
                remote_id: 0,
                phase: Phase::Opening,
                read_queue: VecDeque::new(),
                write_permit: false,
                close_cause: None,
            }),
            cv: Condvar::new(),
            open_waiter: Mutex::new(Some(tx)),
            shared: self.shared.clone(),
        });

        self.shared
            .streams
            .lock()
            .unwrap()
            .insert(local_id, stream_shared.clone());

        log::debug!("multiplex: open local_id={local_id} destination={destination}");
        self.shared
            .send_frame(&Frame::open(local_id, destination))?;

        let outcome = match timeout {
            Some(d) => rx
                .recv_timeout(d)
                .map_err(|_| AdbError::Timeout)?,
            None => rx.recv().map_err(|_| AdbError::TransportClosed)?,
        };

        match outcome {
            OpenOutcome::Opened { remote_id } => {
                log::debug!("multiplex: stream {local_id} opened, remote_id={remote_id}");
                Ok(Stream::new(stream_shared))
            }
            OpenOutcome::Refused => {
                self.shared.streams.lock().unwrap().remove(&local_id);
                log::debug!("multiplex: open refused for local_id={local_id}");
                Err(AdbError::ConnectionRefused)
            }
        }
    }

    /// Tear the connection down: CLSE every open stream, close the transport,
    /// fail all pending operations.
    pub fn shutdown(&self) {
        log::debug!("multiplex: shutdown");
        let local_ids: Vec<u32> = self.shared.streams.lock().unwrap().keys().copied().collect();
        for local_id in local_ids {
            let remote_id = {
                let streams = self.shared.streams.lock().unwrap();
                streams.get(&local_id).map(|s| s.inner.lock().unwrap().remote_id)
            };
            if let Some(remote_id) = remote_id {
                let _ = self.shared.send_frame(&Frame::clse(local_id, remote_id));
            }
        }
        self.shared.fail_all_streams(CloseCause::Local);
        let mut writer = self.shared.writer.lock().unwrap();
        let _ = writer.close();
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn reader_loop(shared: Arc<Shared>, mut read_half: Box<dyn Transport>) {
    loop {
        let frame = Frame::read_from(
            read_half.as_mut(),
            shared.active_version,
            shared.active_max_data,
        );

        match frame {
            Ok(frame) => {
                if let Err(err) = dispatch(&shared, frame) {
                    log::warn!("multiplex: fatal protocol error: {err}");
                    shared.fail_all_streams(close_cause_for(&err));
                    return;
                }
            }
            Err(AdbError::TransportClosed) => {
                log::debug!("multiplex: transport closed, shutting down");
                shared.fail_all_streams(CloseCause::ConnectionLost);
                return;
            }
            Err(err) => {
                log::warn!("multiplex: reader error: {err}");
                shared.fail_all_streams(close_cause_for(&err));
                return;
            }
        }
    }
}

/// Preserve the real failure kind (§7: pending operations observe it, never a
/// string) rather than collapsing every fatal reader-loop error down to
/// "transport closed".
fn close_cause_for(err: &AdbError) -> CloseCause {
    match err {
        AdbError::ProtocolError(reason) => CloseCause::Protocol(*reason),
        _ => CloseCause::ConnectionLost,
    }
}

fn dispatch(shared: &Arc<Shared>, frame: Frame) -> Result<()> {
    match frame.command {
        Command::Okay => {
            let local_id = frame.arg1;
            let remote_id = frame.arg0;
            let stream = shared.streams.lock().unwrap().get(&local_id).cloned();
            let Some(stream) = stream else {
                log::warn!("multiplex: OKAY for unknown stream local_id={local_id}");
                return Ok(());
            };
            let mut inner = stream.inner.lock().unwrap();
            match inner.phase {
                Phase::Opening => {
                    inner.remote_id = remote_id;
                    inner.phase = Phase::Open;
                    inner.write_permit = true;
                    drop(inner);
                    if let Some(tx) = stream.open_waiter.lock().unwrap().take() {
                        let _ = tx.send(OpenOutcome::Opened { remote_id });
                    }
                    stream.cv.notify_all();
                }
                _ => {
                    inner.write_permit = true;
                    drop(inner);
                    stream.cv.notify_all();
                }
            }
            Ok(())
        }
        Command::Wrte => {
            let local_id = frame.arg1;
            let remote_id = frame.arg0;
            let stream = shared.streams.lock().unwrap().get(&local_id).cloned();
            match stream {
                Some(stream) => {
                    let mut inner = stream.inner.lock().unwrap();
                    if inner.phase == Phase::Closed {
                        drop(inner);
                        let _ = shared.send_frame(&Frame::clse(local_id, remote_id));
                        return Ok(());
                    }
                    inner.read_queue.extend(frame.payload.iter().copied());
                    drop(inner);
                    stream.cv.notify_all();
                    shared.send_frame(&Frame::okay(local_id, remote_id))?;
                }
                None => {
                    log::warn!("multiplex: WRTE for unknown stream local_id={local_id}");
                    shared.send_frame(&Frame::clse(local_id, remote_id))?;
                }
            }
            Ok(())
        }
        Command::Clse => {
            let local_id = frame.arg1;
            let stream = shared.streams.lock().unwrap().get(&local_id).cloned();
            let Some(stream) = stream else {
                return Ok(());
            };
            // A still-pending OPEN has an open_waiter installed; a CLSE arriving
            // while it's still set is the refusal case (daemon's arg0/remote_id
            // is 0 since no remote stream was ever created), regardless of the
            // stream's nominal phase.
            if let Some(tx) = stream.open_waiter.lock().unwrap().take() {
                let _ = tx.send(OpenOutcome::Refused);
                shared.streams.lock().unwrap().remove(&local_id);
                return Ok(());
            }
            let mut inner = stream.inner.lock().unwrap();
            // Peer will send no more frames for this stream; any payload
            // already queued is still delivered to the caller before `read`
            // reports EOF (see `Stream::read`, which promotes HalfClosed to
            // Closed once the queue drains).
            inner.phase = Phase::HalfClosed;
            inner.close_cause = Some(CloseCause::Remote);
            drop(inner);
            stream.cv.notify_all();
            Ok(())
        }
        Command::Auth | Command::Cnxn | Command::Stls => Err(AdbError::ProtocolError(
            ProtocolErrorReason::UnexpectedCommandInState,
        )),
        Command::Sync | Command::Open => {
            log::warn!("multiplex: unexpected inbound {:?}", frame.command);
            Err(AdbError::ProtocolError(
                ProtocolErrorReason::UnexpectedCommandInState,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::duplex::duplex_pair;
    use crate::version::V_MIN;
    use std::thread;

    /// A genuine protocol violation mid-session (here, a stray CNXN after the
    /// handshake is already done) must fail pending stream operations with
    /// `ProtocolError`, not the generic `TransportClosed` a real disconnect
    /// would report (§7: callers match on the real failure kind).
    #[test]
    fn fatal_protocol_error_surfaces_to_blocked_stream_reads() {
        let (host, mut daemon) = duplex_pair();
        let connected = Connected {
            transport: Box::new(host),
            active_version: V_MIN,
            active_max_data: 0x1000,
            remote_banner: b"device::".to_vec(),
        };
        let mux = Multiplexer::start(connected).unwrap();

        let daemon_thread = thread::spawn(move || {
            let open = Frame::read_from(&mut daemon, V_MIN, 0x1000).unwrap();
            assert_eq!(open.command, Command::Open);
            Frame::okay(7, open.arg0).write_to(&mut daemon, V_MIN).unwrap();

            // Stray CNXN: not valid once the handshake has already completed.
            Frame::cnxn(V_MIN, 0x1000, "device::\0")
                .write_to(&mut daemon, V_MIN)
                .unwrap();
        });

        let mut stream = mux.open("shell:echo hi", None).unwrap();
        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf, None).unwrap_err();
        assert!(matches!(
            err,
            AdbError::ProtocolError(ProtocolErrorReason::UnexpectedCommandInState)
        ));

        daemon_thread.join().unwrap();
    }
}

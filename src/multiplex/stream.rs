//! Per-stream read/write/close façade over a [`super::StreamShared`] record.

use super::{CloseCause, Phase, StreamShared};
use crate::codec::Frame;
use crate::error::{AdbError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One multiplexed logical connection (a shell session, a sync session, a
/// forwarded port, ...) over the shared ADB transport.
pub struct Stream {
    shared: Arc<StreamShared>,
    closed_locally: bool,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self {
            shared,
            closed_locally: false,
        }
    }

    pub fn local_id(&self) -> u32 {
        self.shared.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.shared.inner.lock().unwrap().remote_id
    }

    /// Read available bytes into `buf`, blocking until data arrives, the
    /// stream reaches EOF (returns `Ok(0)`), or `timeout` elapses.
    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let mut inner = self.shared.inner.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if !inner.read_queue.is_empty() {
                let n = std::cmp::min(buf.len(), inner.read_queue.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = inner.read_queue.pop_front().unwrap();
                }
                return Ok(n);
            }
            if inner.phase == Phase::HalfClosed {
                // Peer closed and the queue just drained: promote to fully
                // Closed now that there's nothing left to deliver.
                inner.phase = Phase::Closed;
            }
            if inner.phase == Phase::Closed {
                return match inner.close_cause {
                    Some(CloseCause::Remote) | None => Ok(0),
                    Some(cause) => Err(cause.into_error()),
                };
            }
            inner = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(AdbError::Timeout);
                    }
                    let (guard, result) = self.shared.cv.wait_timeout(inner, d - now).unwrap();
                    if result.timed_out() {
                        return Err(AdbError::Timeout);
                    }
                    guard
                }
                None => self.shared.cv.wait(inner).unwrap(),
            };
        }
    }

    /// Write `buf`, chunked to the negotiated `max_data`, blocking per chunk
    /// on the write permit (closed after each WRTE, reopened on the matching
    /// OKAY).
    pub fn write(&self, buf: &[u8], timeout: Option<Duration>) -> Result<()> {
        let max_data = self.shared.shared.active_max_data.max(1) as usize;
        let deadline = timeout.map(|d| Instant::now() + d);
        if buf.is_empty() {
            return self.write_chunk(&[], deadline);
        }
        for chunk in buf.chunks(max_data) {
            self.write_chunk(chunk, deadline)?;
        }
        Ok(())
    }

    fn write_chunk(&self, chunk: &[u8], deadline: Option<Instant>) -> Result<()> {
        let (remote_id, local_id) = {
            let mut inner = self.shared.inner.lock().unwrap();
            loop {
                if matches!(inner.phase, Phase::Closed | Phase::HalfClosed) {
                    return Err(inner
                        .close_cause
                        .map(CloseCause::into_error)
                        .unwrap_or(AdbError::StreamClosed));
                }
                if inner.write_permit {
                    inner.write_permit = false;
                    break (inner.remote_id, self.shared.local_id);
                }
                inner = match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return Err(AdbError::Timeout);
                        }
                        let (guard, result) = self.shared.cv.wait_timeout(inner, d - now).unwrap();
                        if result.timed_out() {
                            return Err(AdbError::Timeout);
                        }
                        guard
                    }
                    None => self.shared.cv.wait(inner).unwrap(),
                };
            }
        };

        self.shared
            .shared
            .send_frame(&Frame::wrte(local_id, remote_id, chunk.to_vec()))
    }

    /// Close this stream: send CLSE, wake any blocked readers/writers with
    /// `StreamClosed`. Idempotent.
    ///
    /// Always drops the stream table's entry for this stream, breaking the
    /// `Shared.streams` ↔ `StreamShared.shared` `Arc` cycle — otherwise a
    /// long-lived `Multiplexer` would accumulate one unreclaimable entry per
    /// stream ever opened.
    pub fn close(&mut self) -> Result<()> {
        if self.closed_locally {
            return Ok(());
        }
        self.closed_locally = true;
        let (local_id, remote_id, already_closed) = {
            let mut inner = self.shared.inner.lock().unwrap();
            let already_closed = matches!(inner.phase, Phase::Closed | Phase::HalfClosed);
            if !already_closed {
                inner.phase = Phase::Closed;
                inner.close_cause = Some(CloseCause::Local);
            }
            (self.shared.local_id, inner.remote_id, already_closed)
        };
        self.shared.cv.notify_all();
        self.shared.shared.streams.lock().unwrap().remove(&local_id);
        if already_closed {
            return Ok(());
        }
        self.shared.shared.send_frame(&Frame::clse(local_id, remote_id))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pipes: paired byte streams whose endpoints live on different peers.
//!
//! One half is created locally; a serializable [`PipeToken`] travels inside
//! a user payload and the peer constructs the other half when it accepts
//! the token. For a local-to-remote pipe the acceptor exports the sink and
//! links the two halves with a `PipeConnect` command; until that arrives,
//! locally written bytes buffer up to one window. Bytes written before a
//! request's response are observable at the caller before the response
//! (the pipe-writer executor enforces this).

use std::io;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;

use rkyv::Archive;
use rkyv::Deserialize;
use rkyv::Serialize;

use crate::channel::Shared;
use crate::command::Command;
use crate::command::Oid;
use crate::command::StreamChunk;
use crate::command::StreamEof;
use crate::command::StreamWindow;
use crate::prelude::*;
use crate::stream::InBuffer;
use crate::stream::Window;

/// Serializable pipe end, embedded in user payloads.
///
/// `sink == None`: the creator writes, the acceptor reads (and exports the
/// sink when accepting). `sink == Some`: the creator reads from an already
/// exported buffer and the acceptor writes straight at it.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PipeToken {
    pub pipe: u64,
    pub window: u32,
    pub sink: Option<Oid>,
}

pub(crate) enum PipeInner {
    Pending {
        buf: Vec<u8>,
        eof: Option<Option<String>>,
    },
    Connected {
        oid: Oid,
        window: Option<Arc<Window>>,
    },
    Dead,
}

/// Creator-side state of a local-to-remote pipe, shared between the writer
/// half and the channel (which flips it on `PipeConnect`).
pub(crate) struct PipeState {
    pub(crate) inner: Mutex<PipeInner>,
    pub(crate) cond: Condvar,
    window_limit: u32,
}

impl PipeState {
    pub fn new(window_limit: u32) -> Self {
        Self {
            inner: Mutex::new(PipeInner::Pending {
                buf: Vec::new(),
                eof: None,
            }),
            cond: Condvar::new(),
            window_limit,
        }
    }

    /// Links the pipe to the peer's sink export and drains what buffered.
    /// The buffer never exceeds one window, so the drain cannot block.
    pub fn connect(&self, shared: &Arc<Shared>, sink_oid: Oid, chunk: usize) {
        let (buf, eof, window) = {
            let mut inner = self.inner.lock().unwrap();
            let PipeInner::Pending { buf, eof } = &mut *inner else {
                warn!("duplicate PipeConnect for {sink_oid}");
                return;
            };
            let drained = (std::mem::take(buf), eof.take());
            let window = shared.pipe_window(sink_oid, self.window_limit);
            *inner = PipeInner::Connected {
                oid: sink_oid,
                window: window.clone(),
            };
            self.cond.notify_all();
            (drained.0, drained.1, window)
        };

        // A fresh window holds a full limit of credit and the buffer never
        // exceeded it, so these acquires cannot block.
        for piece in buf.chunks(chunk.max(1)) {
            if let Some(window) = &window {
                _ = window.acquire(piece.len());
            }
            log_and_return!(shared.send_io(Command::StreamChunk(StreamChunk {
                oid: sink_oid,
                data: piece.to_vec(),
            })));
        }
        if let Some(error) = eof {
            _ = shared.send_io(Command::StreamEof(StreamEof {
                oid: sink_oid,
                error,
            }));
        }
    }

    /// Teardown: unblock the writer for good.
    pub fn fail(&self) {
        *self.inner.lock().unwrap() = PipeInner::Dead;
        self.cond.notify_all();
    }
}

/// Writer half of a pipe, `io::Write` on the creating side.
pub struct PipeWriter {
    shared: Weak<Shared>,
    state: Arc<PipeState>,
    chunk: usize,
    closed: bool,
}

impl PipeWriter {
    pub(crate) fn new(shared: Weak<Shared>, state: Arc<PipeState>, chunk: usize) -> Self {
        Self {
            shared,
            state,
            chunk: chunk.max(1),
            closed: false,
        }
    }

    /// A writer half already linked to a known remote sink.
    pub(crate) fn connected(
        shared: Weak<Shared>,
        oid: Oid,
        window: Option<Arc<Window>>,
        chunk: usize,
    ) -> Self {
        let state = Arc::new(PipeState::new(0));
        *state.inner.lock().unwrap() = PipeInner::Connected { oid, window };
        Self::new(shared, state, chunk)
    }

    fn send_eof(&mut self, error: Option<String>) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut inner = self.state.inner.lock().unwrap();
        match &mut *inner {
            PipeInner::Pending { eof, .. } => {
                // Not linked yet; the eof rides out right after connect.
                *eof = Some(error);
                Ok(())
            },
            PipeInner::Connected { oid, window } => {
                if let Some(window) = window {
                    window.close();
                }
                let oid = *oid;
                drop(inner);
                let Some(shared) = self.shared.upgrade() else {
                    return Ok(());
                };
                shared.unregister_window(oid);
                shared
                    .send_io(Command::StreamEof(StreamEof { oid, error }))
                    .map_err(io::Error::other)
            },
            PipeInner::Dead => Ok(()),
        }
    }

    /// Closes the pipe, surfacing `message` on the peer's next read.
    pub fn close_with_error(mut self, message: &str) -> io::Result<()> {
        self.send_eof(Some(message.to_string()))
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::other("pipe already closed"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.chunk);

        let mut inner = self.state.inner.lock().unwrap();
        loop {
            match &mut *inner {
                PipeInner::Pending { buf: pending, .. } => {
                    let limit = self.state.window_limit as usize;
                    if pending.len() >= limit.max(1) {
                        inner = self.state.cond.wait(inner).unwrap();
                        continue;
                    }
                    let take = want.min(limit.max(1) - pending.len());
                    pending.extend_from_slice(&buf[..take]);
                    return Ok(take);
                },
                PipeInner::Connected { oid, window } => {
                    let oid = *oid;
                    let window = window.clone();
                    drop(inner);
                    let take = match &window {
                        Some(window) => window.acquire(want).map_err(io::Error::other)?,
                        None => want,
                    };
                    let shared = self
                        .shared
                        .upgrade()
                        .ok_or_else(|| io::Error::other("channel closed"))?;
                    shared
                        .send_io(Command::StreamChunk(StreamChunk {
                            oid,
                            data: buf[..take].to_vec(),
                        }))
                        .map_err(io::Error::other)?;
                    return Ok(take);
                },
                PipeInner::Dead => return Err(io::Error::other("channel closed")),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        _ = self.send_eof(None);
    }
}

/// Reader half of a pipe: drains the local buffer export, acking consumed
/// bytes so the writing side's window refills.
pub struct PipeReader {
    shared: Weak<Shared>,
    oid: Oid,
    buffer: Arc<InBuffer>,
    throttled: bool,
}

impl PipeReader {
    pub(crate) fn new(
        shared: Weak<Shared>,
        oid: Oid,
        buffer: Arc<InBuffer>,
        throttled: bool,
    ) -> Self {
        Self {
            shared,
            oid,
            buffer,
            throttled,
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.buffer.read_blocking(buf)?;
        if n > 0 && self.throttled {
            if let Some(shared) = self.shared.upgrade() {
                _ = shared.send_cmd(Command::StreamWindow(StreamWindow {
                    oid: self.oid,
                    credit: u32::try_from(n).unwrap_or(u32::MAX),
                }));
            }
        }
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release_local(self.oid);
        }
    }
}

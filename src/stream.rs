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

//! Proxied byte streams.
//!
//! Each proxied stream is an exported object: one side holds a forwarder
//! that turns `io::Write`/`io::Read` calls into commands, the other holds
//! the sink that performs the local I/O. Remote output is throttled by a
//! credit window refilled with `StreamWindow` acks; remote input is
//! demand-driven (`StreamRead`), with an optional one-request read-ahead.

use std::collections::VecDeque;
use std::io;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;

use crate::channel::Shared;
use crate::command::Command;
use crate::command::Oid;
use crate::command::Release;
use crate::command::StreamChunk;
use crate::command::StreamEof;
use crate::command::StreamRead;
use crate::error::Error;
use crate::prelude::*;

fn closed_err() -> io::Error {
    io::Error::other(Error::ChannelClosed)
}

/// Credit window for one outbound stream. Writers debit before sending and
/// block while no credit remains; acks from the consuming side refill it.
pub struct Window {
    state: Mutex<WindowState>,
    cond: Condvar,
}

struct WindowState {
    credit: i64,
    closed: bool,
}

impl Window {
    pub fn new(limit: u32) -> Self {
        Self {
            state: Mutex::new(WindowState {
                credit: i64::from(limit),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks until credit is available, then debits up to `want` bytes.
    pub fn acquire(&self, want: usize) -> std::result::Result<usize, Error> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(Error::ChannelClosed);
            }
            if state.credit > 0 {
                let take = want.min(usize::try_from(state.credit).unwrap_or(usize::MAX));
                state.credit -= take as i64;
                return Ok(take);
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    pub fn refill(&self, credit: u32) {
        let mut state = self.state.lock().unwrap();
        state.credit += i64::from(credit);
        self.cond.notify_all();
    }

    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }

    #[cfg(test)]
    pub fn credit(&self) -> i64 {
        self.state.lock().unwrap().credit
    }
}

/// Export-side sink of a remote output stream: applies chunks to a local
/// writer. Executed on the pipe-writer thread only, which preserves write
/// order per stream.
pub struct OutSink {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    consumed: Mutex<u64>,
    ack_threshold: u64,
    throttled: bool,
}

impl OutSink {
    pub fn new(writer: Box<dyn Write + Send>, window: u32, throttled: bool) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            consumed: Mutex::new(0),
            ack_threshold: u64::from(window / 2).max(1),
            throttled,
        }
    }

    /// Applies one chunk. Returns the credit to ack, if any is due.
    pub fn apply_chunk(&self, data: &[u8]) -> Result<Option<u32>> {
        let mut writer = self.writer.lock().unwrap();
        let sink = writer
            .as_mut()
            .ok_or_else(|| anyhow!("chunk after stream close"))?;
        sink.write_all(data).location()?;
        sink.flush().location()?;
        drop(writer);

        if !self.throttled {
            return Ok(None);
        }
        let mut consumed = self.consumed.lock().unwrap();
        *consumed += data.len() as u64;
        if *consumed >= self.ack_threshold {
            let ack = u32::try_from(*consumed).unwrap_or(u32::MAX);
            *consumed = 0;
            return Ok(Some(ack));
        }
        Ok(None)
    }

    pub fn apply_eof(&self, error: Option<&str>) {
        if let Some(message) = error {
            warn!("remote stream closed with error: {message}");
        }
        // Dropping the writer closes the local resource.
        *self.writer.lock().unwrap() = None;
    }
}

/// Export-side source of a remote input stream: reads from a local reader on
/// demand.
pub struct SourceState {
    reader: Mutex<Option<Box<dyn Read + Send>>>,
}

impl SourceState {
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Reads up to `max` bytes. `None` means the source hit EOF.
    pub fn read_chunk(&self, max: u32) -> Result<Option<Vec<u8>>> {
        let mut guard = self.reader.lock().unwrap();
        let Some(reader) = guard.as_mut() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; max.max(1) as usize];
        let n = reader.read(&mut buf).location()?;
        if n == 0 {
            *guard = None;
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}

/// Import-side buffer receiving chunks for a local reader.
pub struct InBuffer {
    state: Mutex<InState>,
    cond: Condvar,
}

struct InState {
    data: VecDeque<u8>,
    eof: bool,
    error: Option<String>,
    outstanding: bool,
}

impl InBuffer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InState {
                data: VecDeque::new(),
                eof: false,
                error: None,
                outstanding: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push_chunk(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.data.extend(bytes);
        state.outstanding = false;
        self.cond.notify_all();
    }

    pub fn push_eof(&self, error: Option<String>) {
        let mut state = self.state.lock().unwrap();
        state.eof = true;
        state.error = error;
        state.outstanding = false;
        self.cond.notify_all();
    }

    /// Channel teardown: unblock every reader with an error.
    pub fn fail(&self, message: &str) {
        let mut state = self.state.lock().unwrap();
        if !state.eof {
            state.eof = true;
            state.error = Some(message.to_string());
        }
        state.outstanding = false;
        self.cond.notify_all();
    }

    /// Blocking read; buffered bytes drain before an error surfaces.
    /// Returns the number of bytes served (0 = clean EOF).
    pub fn read_blocking(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.data.is_empty() {
                let n = buf.len().min(state.data.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.data.pop_front().unwrap();
                }
                return Ok(n);
            }
            if let Some(message) = &state.error {
                return Err(io::Error::other(message.clone()));
            }
            if state.eof {
                return Ok(0);
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    fn begin_request(&self) -> RequestState {
        let mut state = self.state.lock().unwrap();
        if !state.data.is_empty() {
            return RequestState::HasData;
        }
        if state.eof || state.error.is_some() {
            return RequestState::Finished;
        }
        if state.outstanding {
            return RequestState::Outstanding;
        }
        state.outstanding = true;
        RequestState::ShouldRequest
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.state.lock().unwrap().data.len()
    }
}

impl Default for InBuffer {
    fn default() -> Self {
        Self::new()
    }
}

enum RequestState {
    HasData,
    Finished,
    Outstanding,
    ShouldRequest,
}

/// Forwarder half of a remote output stream: `io::Write` whose bytes become
/// `StreamChunk` commands addressed at the peer's sink export.
pub struct RemoteOutPipe {
    shared: Weak<Shared>,
    oid: Oid,
    window: Option<Arc<Window>>,
    chunk: usize,
    closed: bool,
}

impl RemoteOutPipe {
    pub(crate) fn new(
        shared: Weak<Shared>,
        oid: Oid,
        window: Option<Arc<Window>>,
        chunk: usize,
    ) -> Self {
        Self {
            shared,
            oid,
            window,
            chunk: chunk.max(1),
            closed: false,
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    fn send_eof(&mut self, error: Option<String>) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        shared.unregister_window(self.oid);
        shared
            .send_io(Command::StreamEof(StreamEof {
                oid: self.oid,
                error,
            }))
            .map_err(io::Error::other)
    }

    /// Closes the stream, surfacing `message` on the peer's next read.
    pub fn close_with_error(mut self, message: &str) -> io::Result<()> {
        self.send_eof(Some(message.to_string()))
    }
}

impl Write for RemoteOutPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::other("stream already closed"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.chunk);
        let take = match &self.window {
            Some(window) => window.acquire(want).map_err(io::Error::other)?,
            None => want,
        };
        let shared = self.shared.upgrade().ok_or_else(closed_err)?;
        shared
            .send_io(Command::StreamChunk(StreamChunk {
                oid: self.oid,
                data: buf[..take].to_vec(),
            }))
            .map_err(io::Error::other)?;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        // The writer thread flushes after every command.
        Ok(())
    }
}

impl Drop for RemoteOutPipe {
    fn drop(&mut self) {
        _ = self.send_eof(None);
    }
}

/// Forwarder half of a remote input stream: `io::Read` served by
/// `StreamRead` round trips against the peer's source export.
pub struct RemoteInPipe {
    shared: Weak<Shared>,
    source: Oid,
    reply_oid: Oid,
    buffer: Arc<InBuffer>,
    request: u32,
    greedy: bool,
}

impl RemoteInPipe {
    pub(crate) fn new(
        shared: Weak<Shared>,
        source: Oid,
        reply_oid: Oid,
        buffer: Arc<InBuffer>,
        request: u32,
        greedy: bool,
    ) -> Self {
        Self {
            shared,
            source,
            reply_oid,
            buffer,
            request: request.max(1),
            greedy,
        }
    }

    fn issue_request(&self) -> io::Result<()> {
        let shared = self.shared.upgrade().ok_or_else(closed_err)?;
        shared
            .send_cmd(Command::StreamRead(StreamRead {
                oid: self.source,
                reply_oid: self.reply_oid,
                max: self.request,
            }))
            .map_err(io::Error::other)
    }
}

impl Read for RemoteInPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.buffer.begin_request() {
                RequestState::ShouldRequest => self.issue_request()?,
                RequestState::HasData | RequestState::Finished | RequestState::Outstanding => {}
            }
            let n = self.buffer.read_blocking(buf)?;
            if n > 0 {
                if self.greedy {
                    // Pipeline the next chunk while the caller works.
                    if let RequestState::ShouldRequest = self.buffer.begin_request() {
                        self.issue_request()?;
                    }
                }
                return Ok(n);
            }
            // 0 bytes is final only once the stream reported EOF.
            if let RequestState::Finished = self.buffer.begin_request() {
                return Ok(0);
            }
        }
    }
}

impl Drop for RemoteInPipe {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release_local(self.reply_oid);
            _ = shared.send_cmd(Command::Release(Release {
                oid: self.source,
                count: 1,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn window_blocks_until_refilled() {
        let window = Arc::new(Window::new(4));
        assert_eq!(window.acquire(10).unwrap(), 4);

        let blocked = Arc::new(AtomicUsize::new(0));
        let handle = {
            let window = Arc::clone(&window);
            let blocked = Arc::clone(&blocked);
            thread::spawn(move || {
                let n = window.acquire(2).unwrap();
                blocked.store(n, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(blocked.load(Ordering::SeqCst), 0);

        window.refill(8);
        handle.join().unwrap();
        assert_eq!(blocked.load(Ordering::SeqCst), 2);
        assert_eq!(window.credit(), 6);
    }

    #[test]
    fn window_close_unblocks_with_error() {
        let window = Arc::new(Window::new(1));
        window.acquire(1).unwrap();
        let handle = {
            let window = Arc::clone(&window);
            thread::spawn(move || window.acquire(1))
        };
        thread::sleep(Duration::from_millis(20));
        window.close();
        assert!(matches!(handle.join().unwrap(), Err(Error::ChannelClosed)));
    }

    #[test]
    fn out_sink_acks_after_half_window() {
        let sink = OutSink::new(Box::new(Vec::new()), 8, true);
        assert_eq!(sink.apply_chunk(&[0; 3]).unwrap(), None);
        assert_eq!(sink.apply_chunk(&[0; 3]).unwrap(), Some(6));
        // Counter reset after the ack.
        assert_eq!(sink.apply_chunk(&[0; 3]).unwrap(), None);
    }

    #[test]
    fn out_sink_unthrottled_never_acks() {
        let sink = OutSink::new(Box::new(Vec::new()), 8, false);
        assert_eq!(sink.apply_chunk(&[0; 100]).unwrap(), None);
    }

    #[test]
    fn out_sink_rejects_chunks_after_eof() {
        let sink = OutSink::new(Box::new(Vec::new()), 8, true);
        sink.apply_eof(None);
        assert!(sink.apply_chunk(&[1]).is_err());
    }

    #[test]
    fn in_buffer_serves_data_then_eof() {
        let buffer = InBuffer::new();
        buffer.push_chunk(b"hello");
        buffer.push_eof(None);

        let mut buf = [0u8; 3];
        assert_eq!(buffer.read_blocking(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(buffer.read_blocking(&mut buf).unwrap(), 2);
        assert_eq!(buffer.read_blocking(&mut buf).unwrap(), 0);
    }

    #[test]
    fn in_buffer_drains_before_error() {
        let buffer = InBuffer::new();
        buffer.push_chunk(b"xy");
        buffer.push_eof(Some("broken pipe".to_string()));

        let mut buf = [0u8; 8];
        assert_eq!(buffer.read_blocking(&mut buf).unwrap(), 2);
        let err = buffer.read_blocking(&mut buf).unwrap_err();
        assert!(err.to_string().contains("broken pipe"));
    }

    #[test]
    fn in_buffer_wakes_blocked_reader() {
        let buffer = Arc::new(InBuffer::new());
        let handle = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut buf = [0u8; 4];
                buffer.read_blocking(&mut buf).map(|n| buf[..n].to_vec())
            })
        };
        thread::sleep(Duration::from_millis(20));
        buffer.push_chunk(b"ok");
        assert_eq!(handle.join().unwrap().unwrap(), b"ok");
    }

    #[test]
    fn source_reads_chunks_until_eof() {
        let source = SourceState::new(Box::new(std::io::Cursor::new(vec![1, 2, 3])));
        assert_eq!(source.read_chunk(2).unwrap().unwrap(), vec![1, 2]);
        assert_eq!(source.read_chunk(2).unwrap().unwrap(), vec![3]);
        assert!(source.read_chunk(2).unwrap().is_none());
        // Past EOF stays EOF.
        assert!(source.read_chunk(2).unwrap().is_none());
    }
}

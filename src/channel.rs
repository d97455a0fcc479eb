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

//! The channel: one peer-local endpoint of a full-duplex command stream.
//!
//! A channel owns a reader thread running the dispatch loop, a writer thread
//! draining the ordered write queue, the pipe-writer executor for stream
//! side effects, a worker pool for callable execution, and a capacity-1
//! executor for jar downloads. Responses complete on the reader thread
//! unless stream side effects they depend on are still queued, in which
//! case completion rides the pipe-writer so it cannot overtake them.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

use crate::capability;
use crate::capability::Capabilities;
use crate::capability::CapabilityBit;
use crate::command::Close;
use crate::command::Command;
use crate::command::Envelope;
use crate::command::JarPresent;
use crate::command::LoaderId;
use crate::command::MethodRef;
use crate::command::Oid;
use crate::command::PayloadBlob;
use crate::command::PipeConnect;
use crate::command::ReplyOutcome;
use crate::command::RequestId;
use crate::command::RpcOutcome;
use crate::command::RpcRequest;
use crate::command::RpcResponse;
use crate::command::SetProperty;
use crate::command::StreamChunk;
use crate::command::StreamEof;
use crate::command::StreamRead;
use crate::command::StreamWindow;
use crate::command::UserRequest;
use crate::command::UserResponse;
use crate::command::{Cancel as CancelCmd, ErrorPayload};
use crate::config::ChannelOptions;
use crate::error::Error;
use crate::error::RemoteError;
use crate::executor::IoExecutor;
use crate::executor::WorkerPool;
use crate::export::ExportHandle;
use crate::export::ExportKind;
use crate::export::ExportTable;
use crate::export::RemoteCallable;
use crate::filter::NameFilter;
use crate::framing::BlockRead;
use crate::framing::BlockWrite;
use crate::framing::FrameReader;
use crate::framing::FrameWriter;
use crate::jar_cache::Checksum;
use crate::jar_cache::DisabledJarCache;
use crate::jar_cache::JarCache;
use crate::pipe::PipeReader;
use crate::pipe::PipeState;
use crate::pipe::PipeToken;
use crate::pipe::PipeWriter;
use crate::prelude::*;
use crate::proxy::ImportCache;
use crate::proxy::RemoteRef;
use crate::request::CallHandle;
use crate::request::CallableRegistry;
use crate::request::CancelToken;
use crate::request::PendingCalls;
use crate::request::Promise;
use crate::request::RemoteCall;
use crate::request::ReplyBody;
use crate::resource::LOADER_INTERFACE;
use crate::resource::ProviderExport;
use crate::resource::RemoteLoader;
use crate::resource::ResourceLocation;
use crate::resource::ResourceProvider;
use crate::stream::InBuffer;
use crate::stream::OutSink;
use crate::stream::RemoteInPipe;
use crate::stream::RemoteOutPipe;
use crate::stream::SourceState;
use crate::stream::Window;
use crate::wire;
#[cfg(test)]
use crate::wire::Message;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A full-duplex stream whose read and write halves can run on separate
/// threads.
pub trait CloneableStream: Read + Write + Send + Sync + 'static {
    fn clone_stream(&self) -> std::io::Result<Self>
    where
        Self: Sized;

    fn shutdown_both(&self) -> std::io::Result<()>;
}

#[cfg(unix)]
impl CloneableStream for UnixStream {
    fn clone_stream(&self) -> std::io::Result<Self> {
        UnixStream::try_clone(self)
    }

    fn shutdown_both(&self) -> std::io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl CloneableStream for TcpStream {
    fn clone_stream(&self) -> std::io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown_both(&self) -> std::io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Open,
    ClosingOutbound,
    ClosingInbound,
    Closed,
}

enum WriteItem {
    Cmd(Envelope),
    Shutdown,
}

/// Everything both endpoints of the machinery share. Public API types hold
/// an `Arc` or `Weak` to this.
pub struct Shared {
    id: u64,
    name: String,
    caps: Capabilities,
    options: ChannelOptions,
    filter: NameFilter,

    state: Mutex<Lifecycle>,
    state_cond: Condvar,

    write_tx: Sender<WriteItem>,
    // Orders the io counter against queue insertion so a response's
    // last_io_id never references a chunk queued after it.
    send_lock: Mutex<()>,
    sent_io: AtomicU64,
    // Counted stream commands applied so far, in arrival order. This is the
    // receiving-side ordinal matching the peer's sent_io; the pipe-writer's
    // generic task ids also number uncounted work (PipeConnect, deferred
    // completions) and must not be compared against last_io_id.
    applied_io: AtomicU64,

    next_request: AtomicU64,
    next_pipe: AtomicU64,

    pending: PendingCalls,
    exports: ExportTable,
    imports: ImportCache,
    registry: CallableRegistry,

    windows: Mutex<HashMap<Oid, Arc<Window>>>,
    pipes: Mutex<HashMap<u64, Arc<PipeState>>>,
    exec_tokens: Mutex<HashMap<RequestId, CancelToken>>,

    props_local: Mutex<HashMap<String, String>>,
    props_remote: Mutex<HashMap<String, String>>,
    props_cond: Condvar,

    peer_jars: Mutex<HashSet<Checksum>>,
    jar_cache: Arc<dyn JarCache>,

    timeouts: Mutex<BinaryHeap<Reverse<(Instant, RequestId)>>>,
    timeouts_cond: Condvar,

    pipe_writer: IoExecutor,
    workers: WorkerPool,
    downloads: WorkerPool,

    root_loader: Mutex<Option<Arc<RemoteLoader>>>,
    loaders: Mutex<HashMap<LoaderId, Arc<RemoteLoader>>>,

    shutdown_transport: Box<dyn Fn() + Send + Sync>,
    self_weak: Weak<Shared>,
}

/// Context handed to executing callables and exported objects.
pub struct CallContext {
    shared: Arc<Shared>,
    request: RequestId,
    token: CancelToken,
}

impl CallContext {
    pub fn request_id(&self) -> RequestId {
        self.request
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn channel_name(&self) -> &str {
        &self.shared.name
    }

    /// Whether prefetch + jar caching is active on this channel.
    pub fn jar_caching(&self) -> bool {
        self.shared.caps.contains(CapabilityBit::PrefetchJarCache)
    }

    pub fn export(&self, callable: Arc<dyn RemoteCallable>) -> ExportHandle {
        self.shared.export_callable(callable)
    }

    pub fn import(&self, handle: &ExportHandle) -> std::result::Result<RemoteRef, Error> {
        self.shared.import_handle(handle)
    }

    /// Registers a handler, e.g. from a resource installer that has just
    /// fetched the definition of the callable being dispatched.
    pub fn register<C, F>(&self, f: F)
    where
        C: crate::request::RemoteCall,
        F: Fn(C, &CallContext) -> std::result::Result<C::Output, crate::error::RemoteError>
            + Send
            + Sync
            + 'static,
    {
        self.shared.registry_register::<C, F>(f);
    }

    pub fn remote_loader(&self) -> std::result::Result<Arc<RemoteLoader>, Error> {
        self.shared.loader_for(LoaderId::ROOT)
    }

    pub fn accept_pipe_reader(
        &self,
        token: &PipeToken,
    ) -> std::result::Result<PipeReader, Error> {
        self.shared.accept_pipe_reader(token)
    }

    pub fn accept_pipe_writer(
        &self,
        token: &PipeToken,
    ) -> std::result::Result<PipeWriter, Error> {
        self.shared.accept_pipe_writer(token)
    }

    pub fn export_writer(&self, writer: Box<dyn Write + Send>) -> ExportHandle {
        self.shared.export_writer(writer)
    }

    pub fn export_reader(&self, reader: Box<dyn Read + Send>) -> ExportHandle {
        self.shared.export_reader(reader)
    }

    pub fn remote_writer(
        &self,
        handle: &ExportHandle,
    ) -> std::result::Result<RemoteOutPipe, Error> {
        self.shared.remote_writer(handle)
    }

    pub fn remote_reader(&self, handle: &ExportHandle) -> RemoteInPipe {
        self.shared.remote_reader(handle)
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.shared.props_local.lock().unwrap().get(key).cloned()
    }
}

// Provider used when the application supplies none: every name is refused.
struct NullProvider;

impl ResourceProvider for NullProvider {
    fn locate(&self, _name: &str) -> ResourceLocation {
        ResourceLocation::Refused
    }

    fn jar(&self, _checksum: &Checksum) -> Option<Vec<u8>> {
        None
    }
}

impl Shared {
    // ---- lifecycle -----------------------------------------------------

    fn lifecycle(&self) -> Lifecycle {
        *self.state.lock().unwrap()
    }

    fn is_closed(&self) -> bool {
        self.lifecycle() == Lifecycle::Closed
    }

    fn ensure_open(&self) -> std::result::Result<(), Error> {
        match self.lifecycle() {
            Lifecycle::Open => Ok(()),
            _ => Err(Error::ChannelClosed),
        }
    }

    fn wait_closed(&self) {
        let mut state = self.state.lock().unwrap();
        while *state != Lifecycle::Closed {
            state = self.state_cond.wait(state).unwrap();
        }
    }

    fn poison(&self, err: &anyhow::Error) {
        if self.is_closed() {
            return;
        }
        error!("channel {:?} poisoned: {err:#}", self.name);
        let message = format!("{err:#}");
        let corrupted = matches!(
            err.downcast_ref::<Error>(),
            Some(Error::StreamCorruption(_))
        );
        self.teardown(move || {
            if corrupted {
                Error::StreamCorruption(message.clone())
            } else {
                Error::ChannelClosed
            }
        });
    }

    fn teardown(&self, make_error: impl Fn() -> Error) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == Lifecycle::Closed {
                return;
            }
            *state = Lifecycle::Closed;
            self.state_cond.notify_all();
        }
        debug!("tearing down channel {:?}", self.name);

        _ = self.write_tx.send(WriteItem::Shutdown);
        (self.shutdown_transport)();

        self.pending.fail_all(&make_error);

        // Interrupt executing workers, best-effort.
        let tokens: Vec<_> = self.exec_tokens.lock().unwrap().drain().collect();
        for (_, token) in tokens {
            token.cancel();
        }

        for kind in self.exports.drain() {
            match kind {
                ExportKind::InBuffer(buffer) => buffer.fail("channel closed"),
                ExportKind::OutSink(sink) => sink.apply_eof(Some("channel closed")),
                ExportKind::Callable(_) | ExportKind::Source(_) => {},
            }
        }
        for (_, window) in self.windows.lock().unwrap().drain() {
            window.close();
        }
        for (_, pipe) in self.pipes.lock().unwrap().drain() {
            pipe.fail();
        }
        self.imports.clear();
        self.loaders.lock().unwrap().clear();
        self.props_cond.notify_all();
        self.timeouts_cond.notify_all();

        self.pipe_writer.close();
        self.workers.close();
        self.downloads.close();
    }

    // ---- outbound ------------------------------------------------------

    fn envelope(&self, command: Command) -> Envelope {
        if self.options.record_origin {
            Envelope::with_origin(command)
        } else {
            Envelope::new(command)
        }
    }

    fn enqueue(&self, env: Envelope) -> std::result::Result<(), Error> {
        self.write_tx
            .send(WriteItem::Cmd(env))
            .map_err(|_| Error::ChannelClosed)
    }

    /// Sends an infrastructure command (allowed while closing).
    pub(crate) fn send_cmd(&self, command: Command) -> std::result::Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let env = self.envelope(command);
        let _order = self.send_lock.lock().unwrap();
        self.enqueue(env)
    }

    /// Sends a stream-I/O command, counting it for response ordering.
    pub(crate) fn send_io(&self, command: Command) -> std::result::Result<(), Error> {
        debug_assert!(command.is_stream_io());
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let env = self.envelope(command);
        let _order = self.send_lock.lock().unwrap();
        self.sent_io.fetch_add(1, Ordering::SeqCst);
        self.enqueue(env)
    }

    /// Sends a request or response stamped with the current io count,
    /// atomically with respect to concurrent stream sends. The receiver
    /// orders the command after the stamped stream side effects.
    fn send_stamped(
        &self,
        make: impl FnOnce(u64) -> Command,
    ) -> std::result::Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let _order = self.send_lock.lock().unwrap();
        let last_io = self.sent_io.load(Ordering::SeqCst);
        let env = self.envelope(make(last_io));
        self.enqueue(env)
    }

    fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request.fetch_add(1, Ordering::SeqCst) + 1)
    }

    // ---- user calls ----------------------------------------------------

    fn submit_user<C: RemoteCall>(
        self: &Arc<Self>,
        args: C,
    ) -> std::result::Result<CallHandle<C::Output>, Error> {
        self.ensure_open()?;
        let mut payload = PayloadBlob {
            loader: LoaderId::ROOT,
            tag: C::NAME.to_string(),
            data: args
                .to_wire()
                .map_err(|e| Error::Protocol(format!("{e:#}")))?,
        };
        for decorator in &self.options.decorators {
            decorator
                .outbound(&mut payload)
                .map_err(|e| Error::Protocol(format!("{e:#}")))?;
        }

        let id = self.next_request_id();
        let promise = Promise::new();
        self.pending.insert(id, Arc::clone(&promise))?;
        debug!("submitting user request {id} ({})", payload.tag);
        if let Err(e) = self.send_stamped(|last_io_id| {
            Command::UserRequest(UserRequest {
                id,
                last_io_id,
                payload,
            })
        }) {
            self.pending.forget(id);
            return Err(e);
        }
        Ok(CallHandle {
            id,
            promise,
            shared: Arc::downgrade(self),
            _out: std::marker::PhantomData,
        })
    }

    pub(crate) fn cancel_request(&self, id: RequestId, promise: &Arc<Promise>) {
        if promise.resolve(Err(Error::Cancelled)) {
            self.pending.forget(id);
            _ = self.send_cmd(Command::Cancel(CancelCmd { id }));
        }
    }

    fn arm_timeout(&self, id: RequestId, timeout: Duration) {
        let mut heap = self.timeouts.lock().unwrap();
        heap.push(Reverse((Instant::now() + timeout, id)));
        self.timeouts_cond.notify_all();
    }

    fn fire_timeout(&self, id: RequestId) {
        if let Some(promise) = self.pending.take(id) {
            if promise.resolve(Err(Error::Timeout)) {
                debug!("request {id} timed out; cancelling remotely");
                _ = self.send_cmd(Command::Cancel(CancelCmd { id }));
            }
        }
    }

    // ---- rpc ----------------------------------------------------------

    pub(crate) fn rpc_call(
        self: &Arc<Self>,
        oid: Oid,
        interface: &str,
        method: MethodRef,
        args: Vec<u8>,
    ) -> std::result::Result<(Vec<u8>, Option<u16>), Error> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let id = self.next_request_id();
        let promise = Promise::new();
        self.pending.insert(id, Arc::clone(&promise))?;
        let interface = interface.to_string();
        if let Err(e) = self.send_stamped(|last_io_id| {
            Command::RpcRequest(RpcRequest {
                id,
                last_io_id,
                oid,
                interface,
                method,
                args,
                one_way: false,
            })
        }) {
            self.pending.forget(id);
            return Err(e);
        }
        match promise.wait()? {
            ReplyBody::Rpc { result, method_id } => Ok((result, method_id)),
            ReplyBody::User(_) => Err(Error::Protocol("mismatched reply kind".into())),
        }
    }

    pub(crate) fn rpc_send_one_way(
        &self,
        oid: Oid,
        interface: &str,
        method: MethodRef,
        args: Vec<u8>,
    ) -> std::result::Result<(), Error> {
        let id = self.next_request_id();
        let interface = interface.to_string();
        self.send_stamped(|last_io_id| {
            Command::RpcRequest(RpcRequest {
                id,
                last_io_id,
                oid,
                interface,
                method,
                args,
                one_way: true,
            })
        })
    }

    // ---- exports, imports, loaders ------------------------------------

    pub(crate) fn export_callable(&self, callable: Arc<dyn RemoteCallable>) -> ExportHandle {
        let interfaces = callable.interfaces();
        let oid = self.exports.export(ExportKind::Callable(callable));
        ExportHandle { oid, interfaces }
    }

    pub(crate) fn import_handle(
        &self,
        handle: &ExportHandle,
    ) -> std::result::Result<RemoteRef, Error> {
        for interface in &handle.interfaces {
            self.check_name(interface)?;
        }
        let weak = self.self_weak.clone();
        let id = self.id;
        self.imports
            .get_or_insert(handle.oid, || RemoteRef::new(weak, id, handle, true))
    }

    pub(crate) fn release_local(&self, oid: Oid) {
        self.exports.release(oid, 1, None);
    }

    pub(crate) fn loader_for(
        &self,
        loader: LoaderId,
    ) -> std::result::Result<Arc<RemoteLoader>, Error> {
        if loader == LoaderId::ROOT {
            return self
                .root_loader
                .lock()
                .unwrap()
                .clone()
                .ok_or(Error::ChannelClosed);
        }
        if !self.caps.contains(CapabilityBit::MultiLoader) {
            return Err(Error::Protocol(
                "peer sent a non-root loader without the multi-loader capability".into(),
            ));
        }
        let mut loaders = self.loaders.lock().unwrap();
        if let Some(hit) = loaders.get(&loader) {
            return Ok(Arc::clone(hit));
        }
        let handle = ExportHandle {
            oid: loader.oid(),
            interfaces: vec![LOADER_INTERFACE.to_string()],
        };
        let proxy = self.import_handle(&handle)?;
        let fresh = Arc::new(RemoteLoader::new(self.self_weak.clone(), proxy));
        loaders.insert(loader, Arc::clone(&fresh));
        Ok(fresh)
    }

    pub(crate) fn check_name(&self, name: &str) -> std::result::Result<(), Error> {
        self.filter.check(name)
    }

    pub(crate) fn jar_cache(&self) -> Arc<dyn JarCache> {
        Arc::clone(&self.jar_cache)
    }

    pub(crate) fn run_download<R: Send + 'static>(
        &self,
        job: impl FnOnce() -> R + Send + 'static,
    ) -> Result<R> {
        self.downloads.run(job)
    }

    pub(crate) fn advertise_jars(&self, checksums: Vec<Checksum>) {
        if checksums.is_empty() || !self.caps.contains(CapabilityBit::PrefetchJarCache) {
            return;
        }
        _ = self.send_cmd(Command::JarPresent(JarPresent { checksums }));
    }

    pub(crate) fn peer_has_jar(&self, sum: &Checksum) -> bool {
        self.peer_jars.lock().unwrap().contains(sum)
    }

    // ---- streams and pipes --------------------------------------------

    fn throttle_proxies(&self) -> bool {
        self.caps.contains(CapabilityBit::ProxyWriterThrottling)
    }

    fn throttle_pipes(&self) -> bool {
        self.caps.contains(CapabilityBit::PipeThrottling)
    }

    fn register_window(&self, oid: Oid, limit: u32) -> Arc<Window> {
        let window = Arc::new(Window::new(limit));
        self.windows
            .lock()
            .unwrap()
            .insert(oid, Arc::clone(&window));
        window
    }

    pub(crate) fn unregister_window(&self, oid: Oid) {
        self.windows.lock().unwrap().remove(&oid);
    }

    /// Window for a freshly connected pipe, when pipe throttling is active.
    pub(crate) fn pipe_window(&self, oid: Oid, limit: u32) -> Option<Arc<Window>> {
        self.throttle_pipes()
            .then(|| self.register_window(oid, limit))
    }

    fn export_writer(&self, writer: Box<dyn Write + Send>) -> ExportHandle {
        let sink = OutSink::new(
            writer,
            self.options.stream_window,
            self.throttle_proxies(),
        );
        let oid = self.exports.export(ExportKind::OutSink(Arc::new(sink)));
        ExportHandle {
            oid,
            interfaces: vec!["OutputStream".to_string()],
        }
    }

    fn remote_writer(
        &self,
        handle: &ExportHandle,
    ) -> std::result::Result<RemoteOutPipe, Error> {
        let window = self
            .throttle_proxies()
            .then(|| self.register_window(handle.oid, self.options.stream_window));
        Ok(RemoteOutPipe::new(
            self.self_weak.clone(),
            handle.oid,
            window,
            self.options.stream_chunk as usize,
        ))
    }

    fn export_reader(&self, reader: Box<dyn Read + Send>) -> ExportHandle {
        let source = SourceState::new(reader);
        let oid = self.exports.export(ExportKind::Source(Arc::new(source)));
        ExportHandle {
            oid,
            interfaces: vec!["InputStream".to_string()],
        }
    }

    fn remote_reader(&self, handle: &ExportHandle) -> RemoteInPipe {
        let buffer = Arc::new(InBuffer::new());
        let reply_oid = self
            .exports
            .export(ExportKind::InBuffer(Arc::clone(&buffer)));
        RemoteInPipe::new(
            self.self_weak.clone(),
            handle.oid,
            reply_oid,
            buffer,
            self.options.stream_chunk,
            self.caps.contains(CapabilityBit::GreedyRemoteInput),
        )
    }

    fn pipe_to_remote(&self) -> (PipeWriter, PipeToken) {
        let pipe = self.next_pipe.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(PipeState::new(self.options.stream_window));
        self.pipes.lock().unwrap().insert(pipe, Arc::clone(&state));
        let writer = PipeWriter::new(
            self.self_weak.clone(),
            state,
            self.options.stream_chunk as usize,
        );
        let token = PipeToken {
            pipe,
            window: self.options.stream_window,
            sink: None,
        };
        (writer, token)
    }

    fn pipe_from_remote(&self) -> (PipeReader, PipeToken) {
        let pipe = self.next_pipe.fetch_add(1, Ordering::SeqCst) + 1;
        let buffer = Arc::new(InBuffer::new());
        let oid = self
            .exports
            .export(ExportKind::InBuffer(Arc::clone(&buffer)));
        let reader = PipeReader::new(
            self.self_weak.clone(),
            oid,
            buffer,
            self.throttle_pipes(),
        );
        let token = PipeToken {
            pipe,
            window: self.options.stream_window,
            sink: Some(oid),
        };
        (reader, token)
    }

    fn accept_pipe_reader(
        self: &Arc<Self>,
        token: &PipeToken,
    ) -> std::result::Result<PipeReader, Error> {
        if token.sink.is_some() {
            return Err(Error::Protocol(
                "pipe token carries a sink; accept the writer half instead".into(),
            ));
        }
        let buffer = Arc::new(InBuffer::new());
        let oid = self
            .exports
            .export(ExportKind::InBuffer(Arc::clone(&buffer)));
        self.send_cmd(Command::PipeConnect(PipeConnect {
            pipe: token.pipe,
            sink_oid: oid,
        }))?;
        Ok(PipeReader::new(
            self.self_weak.clone(),
            oid,
            buffer,
            self.throttle_pipes(),
        ))
    }

    fn accept_pipe_writer(
        self: &Arc<Self>,
        token: &PipeToken,
    ) -> std::result::Result<PipeWriter, Error> {
        let Some(sink) = token.sink else {
            return Err(Error::Protocol(
                "pipe token carries no sink; accept the reader half instead".into(),
            ));
        };
        let window = self
            .throttle_pipes()
            .then(|| self.register_window(sink, token.window));
        Ok(PipeWriter::connected(
            self.self_weak.clone(),
            sink,
            window,
            self.options.stream_chunk as usize,
        ))
    }

    // ---- dispatch ------------------------------------------------------

    fn dispatch(self: &Arc<Self>, command: Command) {
        trace!("dispatching {}", command.kind());
        match command {
            Command::UserResponse(resp) => {
                let outcome = match resp.outcome {
                    ReplyOutcome::Success(bytes) => Ok(ReplyBody::User(bytes)),
                    ReplyOutcome::Failure(ep) => {
                        Err(Error::RemoteInvocation(ep.into_remote()))
                    },
                };
                self.deliver(resp.id, resp.last_io_id, outcome);
            },
            Command::RpcResponse(resp) => {
                let outcome = match resp.outcome {
                    RpcOutcome::Success { result, method_id } => {
                        Ok(ReplyBody::Rpc { result, method_id })
                    },
                    RpcOutcome::Failure(ep) => {
                        Err(Error::RemoteInvocation(ep.into_remote()))
                    },
                };
                self.deliver(resp.id, resp.last_io_id, outcome);
            },
            Command::UserRequest(req) => {
                let token = CancelToken::new();
                self.exec_tokens
                    .lock()
                    .unwrap()
                    .insert(req.id, token.clone());
                let shared = Arc::clone(self);
                let last_io_id = req.last_io_id;
                self.schedule_exec(last_io_id, move || shared.execute_user(req, token));
            },
            Command::RpcRequest(req) => {
                let token = CancelToken::new();
                self.exec_tokens
                    .lock()
                    .unwrap()
                    .insert(req.id, token.clone());
                let shared = Arc::clone(self);
                let last_io_id = req.last_io_id;
                self.schedule_exec(last_io_id, move || shared.execute_rpc(req, token));
            },
            Command::Cancel(cancel) => {
                if let Some(token) = self.exec_tokens.lock().unwrap().get(&cancel.id) {
                    debug!("peer cancelled request {}", cancel.id);
                    token.cancel();
                }
            },
            Command::Release(release) => {
                self.exports.release(release.oid, release.count, None);
            },
            Command::StreamChunk(chunk) => {
                let shared = Arc::clone(self);
                self.pipe_writer.submit(move || shared.apply_chunk(chunk));
            },
            Command::StreamEof(eof) => {
                let shared = Arc::clone(self);
                self.pipe_writer.submit(move || shared.apply_eof(eof));
            },
            Command::StreamWindow(window) => {
                if let Some(win) = self.windows.lock().unwrap().get(&window.oid) {
                    win.refill(window.credit);
                }
            },
            Command::StreamRead(read) => {
                let shared = Arc::clone(self);
                if !self.workers.submit(move || shared.serve_read(read)) {
                    debug!("dropping stream read after close");
                }
            },
            Command::PipeConnect(connect) => {
                let shared = Arc::clone(self);
                self.pipe_writer.submit(move || {
                    let state = shared.pipes.lock().unwrap().remove(&connect.pipe);
                    match state {
                        Some(state) => state.connect(
                            &shared,
                            connect.sink_oid,
                            shared.options.stream_chunk as usize,
                        ),
                        None => warn!("PipeConnect for unknown pipe {}", connect.pipe),
                    }
                });
            },
            Command::JarPresent(present) => {
                debug!("peer advertised {} jars", present.checksums.len());
                self.peer_jars.lock().unwrap().extend(present.checksums);
            },
            Command::SetProperty(prop) => {
                let mut props = self.props_remote.lock().unwrap();
                match prop.value {
                    Some(value) => props.insert(prop.key, value),
                    None => props.remove(&prop.key),
                };
                self.props_cond.notify_all();
            },
            Command::Close(close) => self.on_remote_close(close.reason),
        }
    }

    /// Hands a request to the worker pool, after the stream side effects the
    /// caller emitted first have been applied.
    fn schedule_exec(self: &Arc<Self>, last_io_id: u64, job: impl FnOnce() + Send + 'static) {
        if self.applied_io.load(Ordering::SeqCst) >= last_io_id {
            if !self.workers.submit(job) {
                debug!("dropping request after close");
            }
            return;
        }
        // The chunks counted by last_io_id arrived before this request and
        // are already queued ahead of this task on the pipe-writer.
        let shared = Arc::clone(self);
        self.pipe_writer.submit(move || {
            if !shared.workers.submit(job) {
                debug!("dropping request after close");
            }
        });
    }

    /// Completes a pending call, after the stream side effects the responder
    /// emitted first have been applied.
    fn deliver(
        self: &Arc<Self>,
        id: RequestId,
        last_io_id: u64,
        outcome: std::result::Result<ReplyBody, Error>,
    ) {
        if self.applied_io.load(Ordering::SeqCst) >= last_io_id {
            self.pending.complete(id, outcome);
        } else {
            // The chunks counted by last_io_id arrived before this response
            // and are already queued ahead of this task, so it runs after
            // them.
            let shared = Arc::clone(self);
            self.pipe_writer.submit(move || {
                shared.pending.complete(id, outcome);
            });
        }
    }

    fn apply_chunk(self: &Arc<Self>, chunk: StreamChunk) {
        match self.exports.get(chunk.oid) {
            Some(ExportKind::OutSink(sink)) => match sink.apply_chunk(&chunk.data) {
                Ok(Some(ack)) => {
                    _ = self.send_cmd(Command::StreamWindow(StreamWindow {
                        oid: chunk.oid,
                        credit: ack,
                    }));
                },
                Ok(None) => {},
                Err(e) => warn!("stream {} sink failed: {e:#}", chunk.oid),
            },
            Some(ExportKind::InBuffer(buffer)) => buffer.push_chunk(&chunk.data),
            _ => warn!("chunk for unknown stream {}", chunk.oid),
        }
        // The sender counted this command whether or not the oid resolved.
        self.applied_io.fetch_add(1, Ordering::SeqCst);
    }

    fn apply_eof(self: &Arc<Self>, eof: StreamEof) {
        match self.exports.get(eof.oid) {
            Some(ExportKind::OutSink(sink)) => sink.apply_eof(eof.error.as_deref()),
            Some(ExportKind::InBuffer(buffer)) => buffer.push_eof(eof.error),
            _ => trace!("eof for unknown stream {}", eof.oid),
        }
        self.applied_io.fetch_add(1, Ordering::SeqCst);
    }

    fn serve_read(self: &Arc<Self>, read: StreamRead) {
        let reply = match self.exports.get(read.oid) {
            Some(ExportKind::Source(source)) => source.read_chunk(read.max),
            _ => Err(anyhow!("no such source {}", read.oid)),
        };
        let command = match reply {
            Ok(Some(data)) => Command::StreamChunk(StreamChunk {
                oid: read.reply_oid,
                data,
            }),
            Ok(None) => Command::StreamEof(StreamEof {
                oid: read.reply_oid,
                error: None,
            }),
            Err(e) => Command::StreamEof(StreamEof {
                oid: read.reply_oid,
                error: Some(format!("{e:#}")),
            }),
        };
        _ = self.send_io(command);
    }

    fn on_remote_close(self: &Arc<Self>, reason: Option<String>) {
        info!(
            "peer closed channel {:?}{}",
            self.name,
            reason.map(|r| format!(": {r}")).unwrap_or_default()
        );
        {
            let mut state = self.state.lock().unwrap();
            if *state == Lifecycle::Open {
                *state = Lifecycle::ClosingInbound;
            }
        }
        self.teardown(|| Error::ChannelClosed);
    }

    // ---- inbound execution --------------------------------------------

    fn error_payload(&self, err: RemoteError) -> ErrorPayload {
        if self.caps.contains(CapabilityBit::MimicException) {
            ErrorPayload::Structured(err)
        } else {
            ErrorPayload::Plain(err.to_string())
        }
    }

    fn resolve_handler(
        self: &Arc<Self>,
        payload: &PayloadBlob,
        ctx: &CallContext,
    ) -> std::result::Result<crate::request::Handler, RemoteError> {
        if let Some(handler) = self.registry.lookup(&payload.tag) {
            return Ok(handler);
        }
        let Some(installer) = &self.options.installer else {
            return Err(RemoteError::new(
                "unresolved",
                format!("no handler registered for {:?}", payload.tag),
            ));
        };

        // The definition is unknown here; fetch it from the loader the
        // sender named and let the installer register it.
        debug!("fetching definition of {:?}", payload.tag);
        let loader = self
            .loader_for(payload.loader)
            .map_err(|e| RemoteError::capture(&e))?;
        let fetched = loader
            .fetch(&payload.tag)
            .map_err(|e| RemoteError::capture(&e))?;
        installer
            .install(&payload.tag, &fetched, ctx)
            .map_err(|e| RemoteError::new("install", format!("{e:#}")))?;
        self.registry.lookup(&payload.tag).ok_or_else(|| {
            RemoteError::new(
                "unresolved",
                format!("installer did not register {:?}", payload.tag),
            )
        })
    }

    fn execute_user(self: &Arc<Self>, req: UserRequest, token: CancelToken) {
        let ctx = CallContext {
            shared: Arc::clone(self),
            request: req.id,
            token,
        };
        let tag = req.payload.tag.clone();
        let result = self.run_user(&req, &ctx);
        self.exec_tokens.lock().unwrap().remove(&req.id);

        let outcome = match result {
            Ok(bytes) => ReplyOutcome::Success(bytes),
            Err(err) => {
                debug!("user request {} ({tag}) failed: {err}", req.id);
                ReplyOutcome::Failure(self.error_payload(err))
            },
        };
        if let Err(e) = self.send_stamped(|last_io_id| {
            Command::UserResponse(UserResponse {
                id: req.id,
                last_io_id,
                outcome,
            })
        }) {
            debug!("response for {} not sent: {e}", req.id);
        }
    }

    fn run_user(
        self: &Arc<Self>,
        req: &UserRequest,
        ctx: &CallContext,
    ) -> std::result::Result<Vec<u8>, RemoteError> {
        self.check_name(&req.payload.tag)
            .map_err(|e| RemoteError::capture(&e))?;
        if req.payload.loader != LoaderId::ROOT
            && !self.caps.contains(CapabilityBit::MultiLoader)
        {
            return Err(RemoteError::new(
                "rejected",
                "multi-loader payloads are not enabled on this channel",
            ));
        }
        let handler = self.resolve_handler(&req.payload, ctx)?;

        for decorator in &self.options.decorators {
            decorator.before(&req.payload.tag);
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handler(&req.payload.data, ctx)
        }));
        for decorator in self.options.decorators.iter().rev() {
            decorator.after(&req.payload.tag);
        }
        match outcome {
            Ok(result) => result,
            Err(payload) => Err(RemoteError::from_panic(&*payload)),
        }
    }

    fn execute_rpc(self: &Arc<Self>, req: RpcRequest, token: CancelToken) {
        let ctx = CallContext {
            shared: Arc::clone(self),
            request: req.id,
            token,
        };
        let outcome = self.run_rpc(&req, &ctx);
        self.exec_tokens.lock().unwrap().remove(&req.id);

        if req.one_way {
            if let Err(err) = outcome {
                warn!("one-way rpc on {} failed: {err}", req.oid);
            }
            return;
        }
        let outcome = match outcome {
            Ok((result, method_id)) => RpcOutcome::Success { result, method_id },
            Err(err) => RpcOutcome::Failure(self.error_payload(err)),
        };
        if let Err(e) = self.send_stamped(|last_io_id| {
            Command::RpcResponse(RpcResponse {
                id: req.id,
                last_io_id,
                outcome,
            })
        }) {
            debug!("rpc response for {} not sent: {e}", req.id);
        }
    }

    fn run_rpc(
        self: &Arc<Self>,
        req: &RpcRequest,
        ctx: &CallContext,
    ) -> std::result::Result<(Vec<u8>, Option<u16>), RemoteError> {
        let reject = |e: Error| RemoteError::capture(&e);
        self.check_name(&req.interface).map_err(reject)?;

        let (method, assigned) = match &req.method {
            MethodRef::Name(name) => {
                self.check_name(name).map_err(reject)?;
                let id = self
                    .exports
                    .method_id(req.oid, &req.interface, name)
                    .map_err(|e| RemoteError::new("method", format!("{e:#}")))?;
                (name.clone(), Some(id))
            },
            MethodRef::Id(id) => {
                let name = self
                    .exports
                    .method_name(req.oid, &req.interface, *id)
                    .ok_or_else(|| {
                        RemoteError::new("method", format!("unknown method id {id}"))
                    })?;
                (name, None)
            },
        };

        let Some(ExportKind::Callable(target)) = self.exports.get(req.oid) else {
            return Err(RemoteError::new(
                "stale",
                format!("{} is not an invokable export", req.oid),
            ));
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            target.invoke(&req.interface, &method, &req.args, ctx)
        }));
        match outcome {
            Ok(Ok(result)) => Ok((result, assigned)),
            Ok(Err(err)) => Err(err),
            Err(payload) => Err(RemoteError::from_panic(&*payload)),
        }
    }
}

fn read_loop<R: Read + Send>(stream: R, shared: Arc<Shared>, chunked: bool) {
    let mut reader = FrameReader::new(stream, chunked);
    loop {
        match reader.read_block() {
            Ok(Some(block)) => {
                let envelope = match wire::decode::<Envelope>(&block) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        let err = anyhow::Error::from(Error::StreamCorruption(format!(
                            "undecodable command: {e:#}"
                        )));
                        shared.poison(&err);
                        return;
                    },
                };
                shared.dispatch(envelope.command);
                if shared.is_closed() {
                    return;
                }
            },
            Ok(None) => {
                debug!("peer closed the stream");
                shared.teardown(|| Error::ChannelClosed);
                return;
            },
            Err(e) => {
                if shared.is_closed() {
                    return;
                }
                shared.poison(&e);
                return;
            },
        }
    }
}

fn write_loop<W: Write + Send>(
    stream: W,
    rx: Receiver<WriteItem>,
    shared: Arc<Shared>,
    chunked: bool,
) {
    let buffered = BufWriter::new(stream);
    let mut writer = FrameWriter::new(buffered, chunked);
    while let Ok(item) = rx.recv() {
        let envelope = match item {
            WriteItem::Shutdown => {
                _ = writer.flush();
                break;
            },
            WriteItem::Cmd(envelope) => envelope,
        };
        trace!("writing {}", envelope.command.kind());
        let result = wire::encode(&envelope)
            .and_then(|bytes| writer.write_block(&bytes))
            .and_then(|()| writer.flush());
        if let Err(e) = result {
            if !shared.is_closed() {
                shared.poison(&e);
            }
            break;
        }
    }
    debug!("writer for {:?} exiting", shared.name);
}

fn timeout_loop(weak: Weak<Shared>) {
    loop {
        let Some(shared) = weak.upgrade() else { return };
        if shared.is_closed() {
            return;
        }
        let mut due = Vec::new();
        {
            let mut heap = shared.timeouts.lock().unwrap();
            let now = Instant::now();
            while let Some(Reverse((at, id))) = heap.peek().copied() {
                if at > now {
                    break;
                }
                heap.pop();
                due.push(id);
            }
            if due.is_empty() {
                let wait = heap
                    .peek()
                    .map(|Reverse((at, _))| at.saturating_duration_since(now))
                    .unwrap_or(Duration::from_millis(500));
                let _unused = shared
                    .timeouts_cond
                    .wait_timeout(heap, wait.min(Duration::from_millis(500)))
                    .unwrap();
            }
        }
        for id in due {
            shared.fire_timeout(id);
        }
    }
}

/// One endpoint of a connection; see the module docs.
pub struct Channel {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Channel {
    /// Runs the capability preamble on `stream` and brings up the channel.
    pub fn open<S: CloneableStream>(stream: S, options: ChannelOptions) -> Result<Self> {
        let mut offered = options.capabilities;
        if options.jar_cache.is_none() {
            // Nothing to cache into; don't invite jar references.
            offered = offered.without(CapabilityBit::PrefetchJarCache);
        }

        let mut handshake = stream.clone_stream().location()?;
        let (peer_caps, caps) = capability::exchange(&mut handshake, offered).location()?;
        drop(handshake);
        let chunked = caps.contains(CapabilityBit::ChunkedFraming);
        info!(
            "channel {:?} up, peer caps {peer_caps:?}, effective {caps:?}",
            options.name
        );

        let read_stream = stream.clone_stream().location()?;
        let write_stream = stream.clone_stream().location()?;

        let filter = match &options.safelist_path {
            Some(path) => NameFilter::from_file(path).location()?,
            None => NameFilter::default(),
        };
        let jar_cache: Arc<dyn JarCache> = options
            .jar_cache
            .clone()
            .unwrap_or_else(|| Arc::new(DisabledJarCache));
        let provider: Arc<dyn ResourceProvider> = options
            .provider
            .clone()
            .unwrap_or_else(|| Arc::new(NullProvider));

        let (write_tx, write_rx) = crossbeam_channel::unbounded();
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::SeqCst);
        let name = options.name.clone();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            id,
            name: name.clone(),
            caps,
            filter,
            state: Mutex::new(Lifecycle::Open),
            state_cond: Condvar::new(),
            write_tx,
            send_lock: Mutex::new(()),
            sent_io: AtomicU64::new(0),
            applied_io: AtomicU64::new(0),
            next_request: AtomicU64::new(0),
            next_pipe: AtomicU64::new(0),
            pending: PendingCalls::new(),
            exports: ExportTable::new(options.release_grace, options.export_diagnostics),
            imports: ImportCache::new(),
            registry: CallableRegistry::new(),
            windows: Mutex::new(HashMap::new()),
            pipes: Mutex::new(HashMap::new()),
            exec_tokens: Mutex::new(HashMap::new()),
            props_local: Mutex::new(HashMap::new()),
            props_remote: Mutex::new(HashMap::new()),
            props_cond: Condvar::new(),
            peer_jars: Mutex::new(HashSet::new()),
            jar_cache,
            timeouts: Mutex::new(BinaryHeap::new()),
            timeouts_cond: Condvar::new(),
            pipe_writer: IoExecutor::new(&format!("{name}-pipe-writer")),
            workers: WorkerPool::new(&format!("{name}-worker"), options.workers),
            downloads: WorkerPool::new(&format!("{name}-download"), 1),
            root_loader: Mutex::new(None),
            loaders: Mutex::new(HashMap::new()),
            shutdown_transport: Box::new(move || {
                _ = stream.shutdown_both();
            }),
            self_weak: weak.clone(),
            options,
        });

        // The provider is always the first export, so the peer can reach it
        // as oid 1 without negotiation.
        let provider_oid = shared
            .exports
            .export(ExportKind::Callable(Arc::new(ProviderExport::new(provider))));
        debug_assert_eq!(provider_oid, Oid(1));

        let root_handle = ExportHandle {
            oid: LoaderId::ROOT.oid(),
            interfaces: vec![LOADER_INTERFACE.to_string()],
        };
        let root_proxy = RemoteRef::new(shared.self_weak.clone(), id, &root_handle, false)
            .map_err(anyhow::Error::from)?;
        *shared.root_loader.lock().unwrap() = Some(Arc::new(RemoteLoader::new(
            shared.self_weak.clone(),
            root_proxy,
        )));

        let mut threads = Vec::new();
        {
            let shared = Arc::clone(&shared);
            threads.push(
                thread::Builder::new()
                    .name(format!("{name}-reader"))
                    .spawn(move || read_loop(read_stream, shared, chunked))
                    .location()?,
            );
        }
        {
            let shared = Arc::clone(&shared);
            threads.push(
                thread::Builder::new()
                    .name(format!("{name}-writer"))
                    .spawn(move || write_loop(write_stream, write_rx, shared, chunked))
                    .location()?,
            );
        }
        {
            let weak = shared.self_weak.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("{name}-timeouts"))
                    .spawn(move || timeout_loop(weak))
                    .location()?,
            );
        }

        shared.advertise_jars(shared.jar_cache.advertised());

        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    // ---- calls ---------------------------------------------------------

    /// Submits a callable and blocks for the decoded result.
    pub fn call<C: RemoteCall>(&self, args: C) -> std::result::Result<C::Output, Error> {
        self.shared.submit_user(args)?.wait()
    }

    /// Submits a callable and returns a future-like handle.
    pub fn call_async<C: RemoteCall>(
        &self,
        args: C,
    ) -> std::result::Result<CallHandle<C::Output>, Error> {
        self.shared.submit_user(args)
    }

    /// Submits with a deadline armed on the channel's timer: on expiry the
    /// call resolves as [`Error::Timeout`] and the remote side is cancelled.
    pub fn call_async_with_timeout<C: RemoteCall>(
        &self,
        args: C,
        timeout: Duration,
    ) -> std::result::Result<CallHandle<C::Output>, Error> {
        let handle = self.shared.submit_user(args)?;
        self.shared.arm_timeout(handle.id(), timeout);
        Ok(handle)
    }

    /// Registers a handler for inbound calls named `C::NAME`.
    pub fn register<C, F>(&self, f: F)
    where
        C: RemoteCall,
        F: Fn(C, &CallContext) -> std::result::Result<C::Output, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        self.shared.registry_register::<C, F>(f);
    }

    // ---- exports and streams -------------------------------------------

    pub fn export(&self, callable: Arc<dyn RemoteCallable>) -> ExportHandle {
        self.shared.export_callable(callable)
    }

    /// Counts another outbound serialization of an existing handle.
    pub fn retain_export(&self, handle: &ExportHandle) -> Result<()> {
        self.shared.exports.add_ref(handle.oid, None)
    }

    pub fn import(&self, handle: &ExportHandle) -> std::result::Result<RemoteRef, Error> {
        self.shared.import_handle(handle)
    }

    pub fn export_writer(&self, writer: Box<dyn Write + Send>) -> ExportHandle {
        self.shared.export_writer(writer)
    }

    pub fn remote_writer(
        &self,
        handle: &ExportHandle,
    ) -> std::result::Result<RemoteOutPipe, Error> {
        self.shared.remote_writer(handle)
    }

    pub fn export_reader(&self, reader: Box<dyn Read + Send>) -> ExportHandle {
        self.shared.export_reader(reader)
    }

    pub fn remote_reader(&self, handle: &ExportHandle) -> RemoteInPipe {
        self.shared.remote_reader(handle)
    }

    pub fn pipe_to_remote(&self) -> (PipeWriter, PipeToken) {
        self.shared.pipe_to_remote()
    }

    pub fn pipe_from_remote(&self) -> (PipeReader, PipeToken) {
        self.shared.pipe_from_remote()
    }

    pub fn accept_pipe_reader(
        &self,
        token: &PipeToken,
    ) -> std::result::Result<PipeReader, Error> {
        self.shared.accept_pipe_reader(token)
    }

    pub fn accept_pipe_writer(
        &self,
        token: &PipeToken,
    ) -> std::result::Result<PipeWriter, Error> {
        self.shared.accept_pipe_writer(token)
    }

    pub fn remote_loader(&self) -> std::result::Result<Arc<RemoteLoader>, Error> {
        self.shared.loader_for(LoaderId::ROOT)
    }

    // ---- properties ----------------------------------------------------

    /// Sets a local property and mirrors it to the peer.
    pub fn set_property(&self, key: &str, value: Option<String>) -> Result<()> {
        {
            let mut props = self.shared.props_local.lock().unwrap();
            match &value {
                Some(v) => props.insert(key.to_string(), v.clone()),
                None => props.remove(key),
            };
        }
        self.shared
            .send_cmd(Command::SetProperty(SetProperty {
                key: key.to_string(),
                value,
            }))
            .map_err(anyhow::Error::from)
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.shared.props_local.lock().unwrap().get(key).cloned()
    }

    pub fn remote_property(&self, key: &str) -> Option<String> {
        self.shared.props_remote.lock().unwrap().get(key).cloned()
    }

    /// Blocks until the peer sets `key`, or the timeout/teardown wakes us.
    pub fn wait_remote_property(&self, key: &str, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut props = self.shared.props_remote.lock().unwrap();
        loop {
            if let Some(value) = props.get(key) {
                return Some(value.clone());
            }
            if self.shared.is_closed() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .shared
                .props_cond
                .wait_timeout(props, deadline - now)
                .unwrap();
            props = guard;
        }
    }

    // ---- introspection -------------------------------------------------

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.shared.caps
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    pub fn export_count(&self) -> usize {
        self.shared.exports.size()
    }

    pub fn peer_has_jar(&self, sum: &Checksum) -> bool {
        self.shared.peer_has_jar(sum)
    }

    // ---- shutdown ------------------------------------------------------

    /// Orderly shutdown: sends `Close`, refuses new user requests, waits up
    /// to the configured timeout for in-flight requests, then tears down.
    pub fn close(&self) -> Result<()> {
        self.close_within(self.shared.options.close_timeout)
    }

    /// [`Channel::close`] with an explicit deadline for in-flight requests.
    pub fn close_within(&self, timeout: Duration) -> Result<()> {
        let proceed = {
            let mut state = self.shared.state.lock().unwrap();
            match *state {
                Lifecycle::Open => {
                    *state = Lifecycle::ClosingOutbound;
                    true
                },
                Lifecycle::ClosingInbound => true,
                Lifecycle::ClosingOutbound | Lifecycle::Closed => false,
            }
        };
        if !proceed {
            self.shared.wait_closed();
            return Ok(());
        }

        _ = self
            .shared
            .send_cmd(Command::Close(Close { reason: None }));
        let drained = self.shared.pending.wait_empty(timeout);
        if !drained {
            warn!(
                "closing {:?} with {} requests still in flight",
                self.shared.name,
                self.shared.pending.len()
            );
        }
        self.shared.teardown(move || {
            if drained {
                Error::ChannelClosed
            } else {
                Error::RequestAborted
            }
        });
        Ok(())
    }

    /// Waits for the channel's threads to finish. Call after `close`.
    pub fn join(&self) {
        for handle in self.threads.lock().unwrap().drain(..) {
            _ = handle.join();
        }
        self.shared.pipe_writer.join();
        self.shared.workers.join();
        self.shared.downloads.join();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.teardown(|| Error::ChannelClosed);
        self.join();
    }
}

impl Shared {
    fn registry_register<C, F>(&self, f: F)
    where
        C: RemoteCall,
        F: Fn(C, &CallContext) -> std::result::Result<C::Output, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        self.registry.register::<C, F>(f);
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;

    use rkyv::Archive;
    use rkyv::Deserialize;
    use rkyv::Serialize;

    use super::test_support::open_pair;
    use super::*;

    #[derive(Archive, Deserialize, Serialize, Debug, PartialEq)]
    struct Echo {
        x: i64,
    }

    impl RemoteCall for Echo {
        type Output = i64;
        const NAME: &'static str = "echo";
    }

    #[derive(Archive, Deserialize, Serialize, Debug, PartialEq)]
    struct Sleepy {
        millis: u64,
    }

    impl RemoteCall for Sleepy {
        type Output = bool;
        const NAME: &'static str = "sleepy";
    }

    fn pair() -> (Channel, Channel) {
        let options = || ChannelOptions::default().with_close_timeout(Duration::from_secs(1));
        open_pair(options().with_name("a"), options().with_name("b"))
    }

    #[test]
    fn echo_round_trip() {
        let (a, b) = pair();
        b.register::<Echo, _>(|args, _ctx| Ok(args.x + 1));

        assert_eq!(a.call(Echo { x: 41 }).unwrap(), 42);
        // And the other direction works on the same channel pair.
        a.register::<Echo, _>(|args, _ctx| Ok(args.x * 2));
        assert_eq!(b.call(Echo { x: 21 }).unwrap(), 42);
    }

    #[test]
    fn unregistered_callable_is_a_remote_invocation_error() {
        let (a, _b) = pair();
        match a.call(Echo { x: 1 }) {
            Err(Error::RemoteInvocation(err)) => {
                assert!(err.to_string().contains("echo"));
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn capabilities_intersect_across_the_pair() {
        let options_a = ChannelOptions::default().with_name("a").with_capabilities(
            Capabilities::current().without(CapabilityBit::GreedyRemoteInput),
        );
        let options_b = ChannelOptions::default().with_name("b").with_capabilities(
            Capabilities::current().without(CapabilityBit::MimicException),
        );
        let (a, b) = open_pair(options_a, options_b);
        assert_eq!(a.capabilities(), b.capabilities());
        assert!(!a.capabilities().contains(CapabilityBit::GreedyRemoteInput));
        assert!(!a.capabilities().contains(CapabilityBit::MimicException));
        assert!(a.capabilities().contains(CapabilityBit::ChunkedFraming));
    }

    #[test]
    fn cancel_resolves_locally_and_interrupts_remotely() {
        let (a, b) = pair();
        let observed_cancel = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&observed_cancel);
        b.register::<Sleepy, _>(move |args, ctx| {
            let deadline = Instant::now() + Duration::from_millis(args.millis);
            while Instant::now() < deadline {
                if ctx.is_cancelled() {
                    observed.store(true, Ordering::SeqCst);
                    return Ok(false);
                }
                thread::sleep(Duration::from_millis(5));
            }
            Ok(true)
        });

        let handle = a.call_async(Sleepy { millis: 10_000 }).unwrap();
        thread::sleep(Duration::from_millis(100));
        handle.cancel();
        let started = Instant::now();
        assert!(matches!(handle.wait(), Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));

        // The remote worker observes the interrupt shortly after.
        let deadline = Instant::now() + Duration::from_secs(2);
        while !observed_cancel.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(observed_cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn armed_timeout_fires_and_cancels() {
        let (a, b) = pair();
        b.register::<Sleepy, _>(|args, ctx| {
            let deadline = Instant::now() + Duration::from_millis(args.millis);
            while Instant::now() < deadline {
                if ctx.is_cancelled() {
                    return Ok(false);
                }
                thread::sleep(Duration::from_millis(5));
            }
            Ok(true)
        });

        let handle = a
            .call_async_with_timeout(Sleepy { millis: 10_000 }, Duration::from_millis(80))
            .unwrap();
        assert!(matches!(handle.wait(), Err(Error::Timeout)));
    }

    #[test]
    fn plain_timed_wait_does_not_cancel() {
        let (a, b) = pair();
        b.register::<Sleepy, _>(|args, _ctx| {
            thread::sleep(Duration::from_millis(args.millis));
            Ok(true)
        });

        let handle = a.call_async(Sleepy { millis: 200 }).unwrap();
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(20)),
            Err(Error::Timeout)
        ));
        // No cancel went out: the request is still in the pending map and
        // the channel keeps working.
        assert!(a.shared.pending.len() >= 1);
        b.register::<Echo, _>(|args, _ctx| Ok(args.x));
        assert_eq!(a.call(Echo { x: 7 }).unwrap(), 7);
    }

    #[test]
    fn rpc_proxy_negotiates_method_ids() {
        struct Adder;

        impl RemoteCallable for Adder {
            fn interfaces(&self) -> Vec<String> {
                vec!["Adder".to_string()]
            }

            fn invoke(
                &self,
                _interface: &str,
                method: &str,
                args: &[u8],
                _ctx: &CallContext,
            ) -> std::result::Result<Vec<u8>, RemoteError> {
                match method {
                    "add" => {
                        let (x, y) = <(i64, i64)>::from_wire(args)
                            .map_err(|e| RemoteError::new("decode", format!("{e:#}")))?;
                        (x + y)
                            .to_wire()
                            .map_err(|e| RemoteError::new("encode", format!("{e:#}")))
                    },
                    other => Err(RemoteError::new("method", format!("no method {other}"))),
                }
            }
        }

        let (a, b) = pair();
        let handle = b.export(Arc::new(Adder));
        let proxy = a.import(&handle).unwrap();

        let args = (2i64, 3i64).to_wire().unwrap();
        let sum = proxy.invoke("Adder", "add", &args).unwrap();
        assert_eq!(i64::from_wire(&sum).unwrap(), 5);

        // Second invocation goes by negotiated id; same result.
        let args = (10i64, 20i64).to_wire().unwrap();
        let sum = proxy.invoke("Adder", "add", &args).unwrap();
        assert_eq!(i64::from_wire(&sum).unwrap(), 30);
    }

    #[test]
    fn release_returns_export_table_to_prior_size() {
        struct Nop;

        impl RemoteCallable for Nop {
            fn interfaces(&self) -> Vec<String> {
                vec!["Nop".to_string()]
            }

            fn invoke(
                &self,
                _interface: &str,
                _method: &str,
                _args: &[u8],
                _ctx: &CallContext,
            ) -> std::result::Result<Vec<u8>, RemoteError> {
                Ok(Vec::new())
            }
        }

        let (a, b) = pair();
        let before = b.export_count();
        let handle = b.export(Arc::new(Nop));
        assert_eq!(b.export_count(), before + 1);

        let proxy = a.import(&handle).unwrap();
        proxy.release();

        let deadline = Instant::now() + Duration::from_secs(2);
        while b.export_count() != before && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(b.export_count(), before);
    }

    #[test]
    fn properties_mirror_to_the_peer() {
        let (a, b) = pair();
        a.set_property("agent.version", Some("7".to_string())).unwrap();
        assert_eq!(
            b.wait_remote_property("agent.version", Duration::from_secs(2)),
            Some("7".to_string())
        );
        assert_eq!(a.property("agent.version").as_deref(), Some("7"));
        assert_eq!(b.property("agent.version"), None);
    }

    #[test]
    fn close_resolves_in_flight_calls() {
        let (a, b) = pair();
        b.register::<Sleepy, _>(|args, ctx| {
            let deadline = Instant::now() + Duration::from_millis(args.millis);
            while Instant::now() < deadline && !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(true)
        });

        let handle = a.call_async(Sleepy { millis: 5_000 }).unwrap();
        thread::sleep(Duration::from_millis(50));

        let closer = thread::spawn(move || {
            a.close().unwrap();
            a
        });
        // The pending call resolves (aborted or closed), never hangs.
        match handle.wait() {
            Err(Error::RequestAborted | Error::ChannelClosed) => {},
            other => panic!("unexpected outcome: {other:?}"),
        }
        let a = closer.join().unwrap();
        assert_eq!(a.lifecycle(), Lifecycle::Closed);

        // The peer observed the close and tore down too.
        let deadline = Instant::now() + Duration::from_secs(2);
        while b.lifecycle() != Lifecycle::Closed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(b.lifecycle(), Lifecycle::Closed);
    }

    #[test]
    fn calls_after_close_fail_fast() {
        let (a, b) = pair();
        drop(b);
        let deadline = Instant::now() + Duration::from_secs(2);
        while a.lifecycle() != Lifecycle::Closed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(a.call(Echo { x: 1 }), Err(Error::ChannelClosed)));
    }

    #[test]
    fn decorators_wrap_execution_in_order() {
        struct Tracking {
            label: &'static str,
            log: Arc<Mutex<Vec<String>>>,
            outbound_seen: Arc<AtomicUsize>,
        }

        impl crate::request::CallDecorator for Tracking {
            fn outbound(&self, payload: &mut PayloadBlob) -> Result<()> {
                assert_eq!(payload.tag, "echo");
                self.outbound_seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            fn before(&self, tag: &str) {
                self.log.lock().unwrap().push(format!("{}<{tag}", self.label));
            }

            fn after(&self, tag: &str) {
                self.log.lock().unwrap().push(format!("{}>{tag}", self.label));
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let outbound_seen = Arc::new(AtomicUsize::new(0));

        let mk = |label| {
            Arc::new(Tracking {
                label,
                log: Arc::clone(&log),
                outbound_seen: Arc::clone(&outbound_seen),
            })
        };
        let options_a = ChannelOptions::default()
            .with_name("a")
            .with_decorator(mk("one"))
            .with_decorator(mk("two"));
        let options_b = ChannelOptions::default()
            .with_name("b")
            .with_decorator(mk("one"))
            .with_decorator(mk("two"));
        let (a, b) = open_pair(options_a, options_b);

        b.register::<Echo, _>(|args, _ctx| Ok(args.x));
        assert_eq!(a.call(Echo { x: 3 }).unwrap(), 3);

        assert_eq!(outbound_seen.load(Ordering::SeqCst), 1);
        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                "one<echo".to_string(),
                "two<echo".to_string(),
                "two>echo".to_string(),
                "one>echo".to_string(),
            ]
        );
    }

    #[test]
    fn panicking_handler_travels_as_remote_invocation() {
        let (a, b) = pair();
        b.register::<Echo, _>(|_args, _ctx| -> std::result::Result<i64, RemoteError> {
            panic!("handler exploded");
        });
        match a.call(Echo { x: 0 }) {
            Err(Error::RemoteInvocation(err)) => {
                assert!(err.to_string().contains("handler exploded"));
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}

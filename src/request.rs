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

//! Request/response correlation.
//!
//! A promise is registered under a fresh id before the request command is
//! queued; the first of {response, cancellation, channel teardown} resolves
//! it and later outcomes are dropped silently. A timed wait wakes the waiter
//! without cancelling the remote work; `cancel` does both.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use crate::channel::CallContext;
use crate::channel::Shared;
use crate::command::RequestId;
use crate::error::Error;
use crate::error::RemoteError;
use crate::prelude::*;
use crate::wire::Message;

/// What a response carries back to the waiting promise.
#[derive(Debug)]
pub(crate) enum ReplyBody {
    User(Vec<u8>),
    Rpc {
        result: Vec<u8>,
        method_id: Option<u16>,
    },
}

enum PromiseState {
    Waiting,
    Done(std::result::Result<ReplyBody, Error>),
    Taken,
}

pub(crate) struct Promise {
    state: Mutex<PromiseState>,
    cond: Condvar,
}

impl Promise {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PromiseState::Waiting),
            cond: Condvar::new(),
        })
    }

    /// First outcome wins; returns false if the promise was already settled.
    pub fn resolve(&self, outcome: std::result::Result<ReplyBody, Error>) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            PromiseState::Waiting => {
                *state = PromiseState::Done(outcome);
                self.cond.notify_all();
                true
            },
            _ => false,
        }
    }

    pub fn wait(&self) -> std::result::Result<ReplyBody, Error> {
        let mut state = self.state.lock().unwrap();
        loop {
            match std::mem::replace(&mut *state, PromiseState::Taken) {
                PromiseState::Done(outcome) => return outcome,
                PromiseState::Taken => return Err(Error::Protocol("result taken twice".into())),
                PromiseState::Waiting => {
                    *state = PromiseState::Waiting;
                    state = self.cond.wait(state).unwrap();
                },
            }
        }
    }

    /// Waits up to `timeout`. Elapsing wakes the waiter with
    /// [`Error::Timeout`] but settles nothing and sends nothing.
    pub fn wait_timeout(&self, timeout: Duration) -> std::result::Result<ReplyBody, Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            match std::mem::replace(&mut *state, PromiseState::Taken) {
                PromiseState::Done(outcome) => return outcome,
                PromiseState::Taken => return Err(Error::Protocol("result taken twice".into())),
                PromiseState::Waiting => {
                    *state = PromiseState::Waiting;
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                },
            }
        }
    }
}

/// Outstanding requests awaiting a response.
pub(crate) struct PendingCalls {
    inner: Mutex<PendingInner>,
    drained: Condvar,
}

struct PendingInner {
    map: HashMap<RequestId, Arc<Promise>>,
    closed: bool,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PendingInner {
                map: HashMap::new(),
                closed: false,
            }),
            drained: Condvar::new(),
        }
    }

    /// Registers a promise. Fails once the channel started closing, so a
    /// call racing teardown resolves instead of hanging.
    pub fn insert(&self, id: RequestId, promise: Arc<Promise>) -> std::result::Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(Error::ChannelClosed);
        }
        inner.map.insert(id, promise);
        Ok(())
    }

    /// Resolves the promise for `id`. A late or duplicate response finds
    /// nothing and is dropped silently.
    pub fn complete(&self, id: RequestId, outcome: std::result::Result<ReplyBody, Error>) -> bool {
        let promise = {
            let mut inner = self.inner.lock().unwrap();
            let promise = inner.map.remove(&id);
            if inner.map.is_empty() {
                self.drained.notify_all();
            }
            promise
        };
        match promise {
            Some(promise) => {
                promise.resolve(outcome);
                true
            },
            None => {
                trace!("dropping response for unknown request {id}");
                false
            },
        }
    }

    /// Detaches the promise for `id`, if it is still outstanding.
    pub fn take(&self, id: RequestId) -> Option<Arc<Promise>> {
        let mut inner = self.inner.lock().unwrap();
        let promise = inner.map.remove(&id);
        if inner.map.is_empty() {
            self.drained.notify_all();
        }
        promise
    }

    pub fn forget(&self, id: RequestId) {
        _ = self.take(id);
    }

    /// Teardown: fail every outstanding request and refuse new ones.
    pub fn fail_all(&self, make_error: impl Fn() -> Error) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            inner.map.drain().collect()
        };
        for (id, promise) in drained {
            trace!("failing pending request {id}");
            promise.resolve(Err(make_error()));
        }
        self.drained.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    /// Waits up to `timeout` for all in-flight requests to resolve.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while !inner.map.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.drained.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
        true
    }
}

/// Cooperative cancellation flag handed to executing callables.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A call submitted with `call_async`: resolves to the decoded result.
pub struct CallHandle<T: Message> {
    pub(crate) id: RequestId,
    pub(crate) promise: Arc<Promise>,
    pub(crate) shared: Weak<Shared>,
    pub(crate) _out: PhantomData<fn() -> T>,
}

impl<T: Message> CallHandle<T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    fn decode(outcome: std::result::Result<ReplyBody, Error>) -> std::result::Result<T, Error> {
        match outcome? {
            ReplyBody::User(bytes) => {
                T::from_wire(&bytes).map_err(|e| Error::Protocol(format!("{e:#}")))
            },
            ReplyBody::Rpc { .. } => Err(Error::Protocol("mismatched reply kind".into())),
        }
    }

    /// Blocks until one of {response, cancellation, close} settles the call.
    pub fn wait(self) -> std::result::Result<T, Error> {
        Self::decode(self.promise.wait())
    }

    /// Timed wait. Elapsing yields [`Error::Timeout`] without cancelling the
    /// remote work.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<T, Error> {
        Self::decode(self.promise.wait_timeout(timeout))
    }

    /// Resolves the call locally as [`Error::Cancelled`] and asks the peer
    /// to interrupt the work, best-effort. If cancellation loses the race
    /// the earlier outcome stands.
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.cancel_request(self.id, &self.promise);
        } else {
            self.promise.resolve(Err(Error::Cancelled));
        }
    }
}

/// A named operation invokable on the peer.
///
/// The implementing type is the argument payload; `NAME` is the registry key
/// the executing side resolves (and, on a miss, fetches through the resource
/// loader).
pub trait RemoteCall: Message {
    type Output: Message;
    const NAME: &'static str;
}

pub(crate) type Handler =
    Arc<dyn Fn(&[u8], &CallContext) -> std::result::Result<Vec<u8>, RemoteError> + Send + Sync>;

/// Name-keyed handlers for inbound user calls.
pub(crate) struct CallableRegistry {
    map: Mutex<HashMap<String, Handler>>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn register<C, F>(&self, f: F)
    where
        C: RemoteCall,
        F: Fn(C, &CallContext) -> std::result::Result<C::Output, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        let handler: Handler = Arc::new(move |bytes, ctx| {
            let args = C::from_wire(bytes)
                .map_err(|e| RemoteError::new("decode", format!("{e:#}")))?;
            let out = f(args, ctx)?;
            out.to_wire()
                .map_err(|e| RemoteError::new("encode", format!("{e:#}")))
        });
        self.map.lock().unwrap().insert(C::NAME.to_string(), handler);
    }

    pub fn lookup(&self, name: &str) -> Option<Handler> {
        self.map.lock().unwrap().get(name).cloned()
    }
}

/// Hooks wrapped around each user callable, applied in registration order on
/// the way out and around execution on the way in.
pub trait CallDecorator: Send + Sync {
    /// Outbound: may inspect or rewrite the payload before it is queued.
    fn outbound(&self, payload: &mut crate::command::PayloadBlob) -> Result<()> {
        let _ = payload;
        Ok(())
    }

    /// Inbound: runs before the callable executes.
    fn before(&self, tag: &str) {
        let _ = tag;
    }

    /// Inbound: runs after the callable finishes, in reverse order.
    fn after(&self, tag: &str) {
        let _ = tag;
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn promise_first_outcome_wins() {
        let promise = Promise::new();
        assert!(promise.resolve(Ok(ReplyBody::User(vec![1]))));
        assert!(!promise.resolve(Err(Error::Cancelled)));
        match promise.wait() {
            Ok(ReplyBody::User(bytes)) => assert_eq!(bytes, vec![1]),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn promise_wakes_blocked_waiter() {
        let promise = Promise::new();
        let waiter = {
            let promise = Arc::clone(&promise);
            thread::spawn(move || promise.wait())
        };
        thread::sleep(Duration::from_millis(20));
        promise.resolve(Err(Error::Cancelled));
        assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled)));
    }

    #[test]
    fn timed_wait_expires_without_settling() {
        let promise = Promise::new();
        assert!(matches!(
            promise.wait_timeout(Duration::from_millis(10)),
            Err(Error::Timeout)
        ));
        // The promise is still open: a later response lands normally.
        assert!(promise.resolve(Ok(ReplyBody::User(Vec::new()))));
    }

    #[test]
    fn pending_drops_late_responses_silently() {
        let pending = PendingCalls::new();
        let promise = Promise::new();
        pending.insert(RequestId(1), Arc::clone(&promise)).unwrap();
        assert!(pending.complete(RequestId(1), Ok(ReplyBody::User(vec![]))));
        // Second response for the same id finds nothing.
        assert!(!pending.complete(RequestId(1), Ok(ReplyBody::User(vec![9]))));
    }

    #[test]
    fn fail_all_rejects_later_inserts() {
        let pending = PendingCalls::new();
        let promise = Promise::new();
        pending.insert(RequestId(1), Arc::clone(&promise)).unwrap();
        pending.fail_all(|| Error::ChannelClosed);
        assert!(matches!(promise.wait(), Err(Error::ChannelClosed)));
        assert!(matches!(
            pending.insert(RequestId(2), Promise::new()),
            Err(Error::ChannelClosed)
        ));
    }

    #[test]
    fn wait_empty_observes_drain() {
        let pending = Arc::new(PendingCalls::new());
        let promise = Promise::new();
        pending.insert(RequestId(5), Arc::clone(&promise)).unwrap();

        let completer = {
            let pending = Arc::clone(&pending);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                pending.complete(RequestId(5), Ok(ReplyBody::User(vec![])));
            })
        };
        assert!(pending.wait_empty(Duration::from_secs(2)));
        completer.join().unwrap();
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}

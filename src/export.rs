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

//! The export table: local objects made remotely addressable by oid.
//!
//! An oid stays stable until its refcount reaches zero; after that it enters
//! a grace period during which stale releases for the old oid are ignored,
//! so an id is never confused across reuse.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use rkyv::Archive;
use rkyv::Deserialize;
use rkyv::Serialize;

use crate::channel::CallContext;
use crate::command::Oid;
use crate::error::RemoteError;
use crate::prelude::*;
use crate::stream::InBuffer;
use crate::stream::OutSink;
use crate::stream::SourceState;

/// An exported object that dispatches incoming RPC invocations.
///
/// No inheritance: the implementor matches on `(interface, method)` and
/// decodes its own argument bytes.
pub trait RemoteCallable: Send + Sync {
    fn interfaces(&self) -> Vec<String>;

    fn invoke(
        &self,
        interface: &str,
        method: &str,
        args: &[u8],
        ctx: &CallContext,
    ) -> std::result::Result<Vec<u8>, RemoteError>;
}

/// What an oid can point at. Proxied streams are exported objects too, so
/// they live in the same table and the same refcount lifecycle.
#[derive(Clone)]
pub enum ExportKind {
    Callable(std::sync::Arc<dyn RemoteCallable>),
    OutSink(std::sync::Arc<OutSink>),
    InBuffer(std::sync::Arc<InBuffer>),
    Source(std::sync::Arc<SourceState>),
}

/// Serializable stand-in for an export, embedded in user payloads.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ExportHandle {
    pub oid: Oid,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefEventKind {
    AddRef,
    Release,
}

#[derive(Debug)]
pub struct RefEvent {
    pub kind: RefEventKind,
    pub at: Instant,
    pub origin: Option<String>,
}

const EVENT_RING: usize = 64;

struct MethodTable {
    ids: HashMap<String, u16>,
    names: Vec<String>,
}

struct Entry {
    kind: ExportKind,
    ref_count: u32,
    created: Instant,
    methods: HashMap<String, MethodTable>,
    events: Option<VecDeque<RefEvent>>,
}

impl Entry {
    fn record(&mut self, kind: RefEventKind, origin: Option<String>) {
        if let Some(ring) = &mut self.events {
            if ring.len() == EVENT_RING {
                ring.pop_front();
            }
            ring.push_back(RefEvent {
                kind,
                at: Instant::now(),
                origin,
            });
        }
    }
}

struct Inner {
    entries: HashMap<Oid, Entry>,
    freed: HashMap<Oid, Instant>,
}

pub struct ExportTable {
    next: AtomicU64,
    inner: Mutex<Inner>,
    grace: Duration,
    diagnostics: bool,
}

impl ExportTable {
    pub fn new(grace: Duration, diagnostics: bool) -> Self {
        Self {
            next: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                freed: HashMap::new(),
            }),
            grace,
            diagnostics,
        }
    }

    /// Stores `kind` under a fresh oid with refcount 1.
    pub fn export(&self, kind: ExportKind) -> Oid {
        let oid = Oid(self.next.fetch_add(1, Ordering::SeqCst));
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(
            oid,
            Entry {
                kind,
                ref_count: 1,
                created: Instant::now(),
                methods: HashMap::new(),
                events: self.diagnostics.then(VecDeque::new),
            },
        );
        trace!("exported {oid}");
        oid
    }

    /// Called whenever a handle for `oid` is serialized outbound.
    pub fn add_ref(&self, oid: Oid, origin: Option<String>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get_mut(&oid)
            .ok_or_else(|| anyhow!("add_ref on unknown {oid}"))?;
        entry.ref_count += 1;
        entry.record(RefEventKind::AddRef, origin);
        Ok(())
    }

    /// Drops `count` references. Returns true when the entry was removed.
    /// Releases for an oid inside its post-zero grace period are ignored.
    pub fn release(&self, oid: Oid, count: u32, origin: Option<String>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.freed.retain(|_, freed_at| now - *freed_at < self.grace);

        if inner.freed.contains_key(&oid) {
            trace!("ignoring release for recently freed {oid}");
            return false;
        }
        let Some(entry) = inner.entries.get_mut(&oid) else {
            warn!("release for unknown {oid}");
            return false;
        };
        entry.record(RefEventKind::Release, origin);
        entry.ref_count = entry.ref_count.saturating_sub(count);
        if entry.ref_count > 0 {
            return false;
        }
        let entry = inner.entries.remove(&oid).unwrap();
        inner.freed.insert(oid, now);
        trace!(
            "dropped {oid} after {:?}",
            now.saturating_duration_since(entry.created)
        );
        true
    }

    pub fn get(&self, oid: Oid) -> Option<ExportKind> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&oid)
            .map(|e| e.kind.clone())
    }

    /// Assigns (or looks up) the method id for `(oid, interface, name)`.
    pub fn method_id(&self, oid: Oid, interface: &str, name: &str) -> Result<u16> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get_mut(&oid)
            .ok_or_else(|| anyhow!("method_id on unknown {oid}"))?;
        let table = entry
            .methods
            .entry(interface.to_string())
            .or_insert_with(|| MethodTable {
                ids: HashMap::new(),
                names: Vec::new(),
            });
        if let Some(id) = table.ids.get(name) {
            return Ok(*id);
        }
        let id = u16::try_from(table.names.len()).location_ctx("method table overflow")?;
        table.ids.insert(name.to_string(), id);
        table.names.push(name.to_string());
        Ok(id)
    }

    pub fn method_name(&self, oid: Oid, interface: &str, id: u16) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(&oid)?
            .methods
            .get(interface)?
            .names
            .get(id as usize)
            .cloned()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Channel teardown: drop every strong reference at once.
    pub fn drain(&self) -> Vec<ExportKind> {
        let mut inner = self.inner.lock().unwrap();
        inner.freed.clear();
        inner.entries.drain().map(|(_, e)| e.kind).collect()
    }

    /// Diagnostic snapshot of the refcount event ring for one export.
    pub fn events(&self, oid: Oid) -> Option<Vec<(RefEventKind, Option<String>)>> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(&oid)?.events.as_ref().map(|ring| {
            ring.iter()
                .map(|event| (event.kind, event.origin.clone()))
                .collect()
        })
    }
}

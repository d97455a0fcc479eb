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

//! Import-side proxies for remote exports.
//!
//! A [`RemoteRef`] is a thin dispatcher keyed by `(oid, method)`: invoking a
//! method sends an `RpcRequest` and blocks for the matching `RpcResponse`
//! (or returns immediately for one-way methods). Method ids are negotiated
//! on first use per `(oid, interface)` and cached. Identity is by oid:
//! equality and hashing never cross the wire.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::channel::Shared;
use crate::command::Command;
use crate::command::MethodRef;
use crate::command::Oid;
use crate::command::Release;
use crate::error::Error;
use crate::export::ExportHandle;
use crate::prelude::*;

/// Splits `"name@loader"` interface tags. A set that names more than one
/// loader namespace cannot be imported coherently.
fn loader_of(interface: &str) -> Option<&str> {
    interface.split_once('@').map(|(_, loader)| loader)
}

pub(crate) fn validate_interfaces(interfaces: &[String]) -> std::result::Result<(), Error> {
    let loaders: HashSet<&str> = interfaces.iter().filter_map(|i| loader_of(i)).collect();
    if loaders.len() > 1 {
        return Err(Error::IncompatibleLoader);
    }
    Ok(())
}

pub(crate) struct ProxyInner {
    shared: Weak<Shared>,
    channel_id: u64,
    oid: Oid,
    interfaces: Vec<String>,
    auto_release: AtomicBool,
    method_ids: Mutex<HashMap<(String, String), u16>>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if !self.auto_release.load(Ordering::SeqCst) {
            return;
        }
        trace!("releasing {} on proxy drop", self.oid);
        if let Some(shared) = self.shared.upgrade() {
            _ = shared.send_cmd(Command::Release(Release {
                oid: self.oid,
                count: 1,
            }));
        }
    }
}

/// Local stand-in for an object exported by the peer.
#[derive(Clone)]
pub struct RemoteRef {
    inner: Arc<ProxyInner>,
}

impl RemoteRef {
    pub(crate) fn new(
        shared: Weak<Shared>,
        channel_id: u64,
        handle: &ExportHandle,
        auto_release: bool,
    ) -> std::result::Result<Self, Error> {
        validate_interfaces(&handle.interfaces)?;
        Ok(Self {
            inner: Arc::new(ProxyInner {
                shared,
                channel_id,
                oid: handle.oid,
                interfaces: handle.interfaces.clone(),
                auto_release: AtomicBool::new(auto_release),
                method_ids: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn oid(&self) -> Oid {
        self.inner.oid
    }

    pub fn interfaces(&self) -> &[String] {
        &self.inner.interfaces
    }

    fn shared(&self) -> std::result::Result<Arc<Shared>, Error> {
        self.inner.shared.upgrade().ok_or(Error::ChannelClosed)
    }

    fn method_ref(&self, interface: &str, method: &str) -> MethodRef {
        let ids = self.inner.method_ids.lock().unwrap();
        match ids.get(&(interface.to_string(), method.to_string())) {
            Some(id) => MethodRef::Id(*id),
            None => MethodRef::Name(method.to_string()),
        }
    }

    fn check_interface(&self, interface: &str) -> std::result::Result<(), Error> {
        if self.inner.interfaces.iter().any(|i| i == interface) {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "{} does not implement {interface:?}",
                self.inner.oid
            )))
        }
    }

    /// Invokes a method and blocks for its result bytes.
    pub fn invoke(
        &self,
        interface: &str,
        method: &str,
        args: &[u8],
    ) -> std::result::Result<Vec<u8>, Error> {
        self.check_interface(interface)?;
        let shared = self.shared()?;
        let method_ref = self.method_ref(interface, method);
        let (result, method_id) =
            shared.rpc_call(self.inner.oid, interface, method_ref, args.to_vec())?;
        if let Some(id) = method_id {
            // First named call; the responder assigned the table entry.
            self.inner
                .method_ids
                .lock()
                .unwrap()
                .insert((interface.to_string(), method.to_string()), id);
        }
        Ok(result)
    }

    /// One-way invocation: queued and forgotten, no result is awaited.
    pub fn invoke_one_way(
        &self,
        interface: &str,
        method: &str,
        args: &[u8],
    ) -> std::result::Result<(), Error> {
        self.check_interface(interface)?;
        let shared = self.shared()?;
        let method_ref = self.method_ref(interface, method);
        shared.rpc_send_one_way(self.inner.oid, interface, method_ref, args.to_vec())
    }

    /// Releases the remote reference now and disables the release-on-drop.
    pub fn release(&self) {
        if self.inner.auto_release.swap(false, Ordering::SeqCst) {
            if let Some(shared) = self.inner.shared.upgrade() {
                _ = shared.send_cmd(Command::Release(Release {
                    oid: self.inner.oid,
                    count: 1,
                }));
            }
        }
    }

    /// Detaches the drop-time release, e.g. when the handle is re-sent.
    pub fn forget(&self) {
        self.inner.auto_release.store(false, Ordering::SeqCst);
    }

    pub(crate) fn channel_id(&self) -> u64 {
        self.inner.channel_id
    }
}

// Identity is (channel, oid); invoking equality on a proxy never crosses the
// wire.
impl PartialEq for RemoteRef {
    fn eq(&self, other: &Self) -> bool {
        self.inner.channel_id == other.inner.channel_id && self.inner.oid == other.inner.oid
    }
}

impl Eq for RemoteRef {}

impl std::hash::Hash for RemoteRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.channel_id.hash(state);
        self.inner.oid.hash(state);
    }
}

impl std::fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRef")
            .field("oid", &self.inner.oid)
            .field("interfaces", &self.inner.interfaces)
            .finish()
    }
}

/// Cache of live proxies so repeated handles for one oid share an identity.
pub(crate) struct ImportCache {
    map: Mutex<HashMap<Oid, Weak<ProxyInner>>>,
}

impl ImportCache {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_insert(
        &self,
        oid: Oid,
        make: impl FnOnce() -> std::result::Result<RemoteRef, Error>,
    ) -> std::result::Result<RemoteRef, Error> {
        let mut map = self.map.lock().unwrap();
        if let Some(inner) = map.get(&oid).and_then(Weak::upgrade) {
            return Ok(RemoteRef { inner });
        }
        let fresh = make()?;
        map.insert(oid, Arc::downgrade(&fresh.inner));
        Ok(fresh)
    }

    pub fn clear(&self) {
        self.map.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_set_with_one_loader_is_fine() {
        let set = vec!["Task".to_string(), "Diagnostics@7".to_string()];
        assert!(validate_interfaces(&set).is_ok());
    }

    #[test]
    fn conflicting_loaders_fail_import() {
        let set = vec!["Task@3".to_string(), "Diagnostics@7".to_string()];
        assert!(matches!(
            validate_interfaces(&set),
            Err(Error::IncompatibleLoader)
        ));
    }

    #[test]
    fn remote_ref_identity_is_by_oid() {
        let handle = ExportHandle {
            oid: Oid(4),
            interfaces: vec!["Task".to_string()],
        };
        let a = RemoteRef::new(Weak::new(), 1, &handle, false).unwrap();
        let b = RemoteRef::new(Weak::new(), 1, &handle, false).unwrap();
        let other_channel = RemoteRef::new(Weak::new(), 2, &handle, false).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, other_channel);
    }

    #[test]
    fn import_cache_shares_proxies() {
        let cache = ImportCache::new();
        let handle = ExportHandle {
            oid: Oid(9),
            interfaces: vec!["Task".to_string()],
        };
        let a = cache
            .get_or_insert(Oid(9), || RemoteRef::new(Weak::new(), 1, &handle, false))
            .unwrap();
        let b = cache
            .get_or_insert(Oid(9), || panic!("must reuse the live proxy"))
            .unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn invoke_on_dead_channel_reports_closed() {
        let handle = ExportHandle {
            oid: Oid(2),
            interfaces: vec!["Task".to_string()],
        };
        let proxy = RemoteRef::new(Weak::new(), 1, &handle, false).unwrap();
        assert!(matches!(
            proxy.invoke("Task", "run", &[]),
            Err(Error::ChannelClosed)
        ));
    }

    #[test]
    fn unknown_interface_is_rejected_locally() {
        let handle = ExportHandle {
            oid: Oid(2),
            interfaces: vec!["Task".to_string()],
        };
        let proxy = RemoteRef::new(Weak::new(), 1, &handle, false).unwrap();
        assert!(matches!(
            proxy.invoke("Other", "run", &[]),
            Err(Error::Protocol(_))
        ));
    }
}

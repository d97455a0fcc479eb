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

//! Remote resource loading.
//!
//! Each peer exports its [`ResourceProvider`] as its first export, so the
//! other side can fetch definitions it is missing: directly as bytes, as a
//! `{checksum, path}` reference into a jar resolved through the jar cache,
//! or as a refusal. A prefetch variant returns the transitive set the
//! provider predicts the peer will need, saving round trips.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use rkyv::Archive;
use rkyv::Deserialize;
use rkyv::Serialize;

use crate::channel::CallContext;
use crate::channel::Shared;
use crate::error::Error;
use crate::error::RemoteError;
use crate::export::RemoteCallable;
use crate::jar_cache::ArtifactUrl;
use crate::jar_cache::Checksum;
use crate::prelude::*;
use crate::proxy::RemoteRef;
use crate::wire::Message;

/// Interface name under which providers are exported.
pub const LOADER_INTERFACE: &str = "ResourceLoader";

/// Where a resource lives, as known to its provider.
#[derive(Debug, Clone)]
pub enum ResourceLocation {
    /// Only available as raw bytes.
    Inline(Vec<u8>),
    /// Lives in a jar; `inline` optionally carries the extracted bytes for
    /// peers that cannot take jar references.
    Jarred {
        checksum: Checksum,
        path: Option<String>,
        inline: Option<Vec<u8>>,
    },
    /// Policy forbids serving this name.
    Refused,
}

/// Application-supplied source of resources served to the peer.
pub trait ResourceProvider: Send + Sync {
    fn locate(&self, name: &str) -> ResourceLocation;

    /// Jar bytes for a checksum this provider has referenced.
    fn jar(&self, checksum: &Checksum) -> Option<Vec<u8>>;

    /// Names the peer will likely need next after `name` (transitive hint).
    fn prefetch_hints(&self, name: &str) -> Vec<String> {
        let _ = name;
        Vec::new()
    }
}

/// Reply shapes on the wire.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum ResourceReply {
    Direct(Vec<u8>),
    InJar {
        checksum: Checksum,
        path: Option<String>,
    },
    Refused,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PrefetchReply {
    pub entries: Vec<(String, ResourceReply)>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct JarReply {
    pub bytes: Option<Vec<u8>>,
}

/// Chooses the wire shape for a located resource. With jar caching active
/// the sender always prefers a reference (the receiver resolves it once and
/// reuses it); without it, only inline bytes can travel.
fn shape_reply(location: ResourceLocation, jar_caching: bool) -> ResourceReply {
    match location {
        ResourceLocation::Inline(bytes) => ResourceReply::Direct(bytes),
        ResourceLocation::Jarred {
            checksum,
            path,
            inline,
        } => {
            if jar_caching {
                ResourceReply::InJar { checksum, path }
            } else {
                match (inline, path) {
                    (Some(bytes), _) => ResourceReply::Direct(bytes),
                    // A whole-jar resource can still travel inline.
                    (None, None) => ResourceReply::Refused,
                    (None, Some(_)) => ResourceReply::Refused,
                }
            }
        },
        ResourceLocation::Refused => ResourceReply::Refused,
    }
}

/// The export wrapper dispatching loader RPCs onto a provider.
pub(crate) struct ProviderExport {
    provider: Arc<dyn ResourceProvider>,
}

impl ProviderExport {
    pub fn new(provider: Arc<dyn ResourceProvider>) -> Self {
        Self { provider }
    }

    fn fetch_reply(&self, name: &str, ctx: &CallContext) -> ResourceReply {
        let mut location = self.provider.locate(name);
        if let ResourceLocation::Jarred { checksum, inline, .. } = &mut location {
            if !ctx.jar_caching() && inline.is_none() {
                // Without a cache on the far side, fall back to shipping the
                // whole jar inline when the resource is the jar itself.
                *inline = self.provider.jar(checksum);
            }
        }
        shape_reply(location, ctx.jar_caching())
    }
}

impl RemoteCallable for ProviderExport {
    fn interfaces(&self) -> Vec<String> {
        vec![LOADER_INTERFACE.to_string()]
    }

    fn invoke(
        &self,
        _interface: &str,
        method: &str,
        args: &[u8],
        ctx: &CallContext,
    ) -> std::result::Result<Vec<u8>, RemoteError> {
        let encode_err = |e: anyhow::Error| RemoteError::new("encode", format!("{e:#}"));
        let decode_err = |e: anyhow::Error| RemoteError::new("decode", format!("{e:#}"));
        match method {
            "fetch" => {
                let name = String::from_wire(args).map_err(decode_err)?;
                self.fetch_reply(&name, ctx).to_wire().map_err(encode_err)
            },
            "prefetch" => {
                let name = String::from_wire(args).map_err(decode_err)?;
                let mut entries = vec![(name.clone(), self.fetch_reply(&name, ctx))];
                for hint in self.provider.prefetch_hints(&name) {
                    let reply = self.fetch_reply(&hint, ctx);
                    entries.push((hint, reply));
                }
                PrefetchReply { entries }.to_wire().map_err(encode_err)
            },
            "jar" => {
                let checksum = Checksum::from_wire(args).map_err(decode_err)?;
                JarReply {
                    bytes: self.provider.jar(&checksum),
                }
                .to_wire()
                .map_err(encode_err)
            },
            other => Err(RemoteError::new(
                "unsupported",
                format!("loader has no method {other:?}"),
            )),
        }
    }
}

/// A resolved resource on the importing side.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    /// Raw bytes, when the resource arrived inline or as a whole jar.
    pub bytes: Option<Vec<u8>>,
    /// Cached jar location, when it arrived as a reference.
    pub url: Option<ArtifactUrl>,
    /// Member path inside the jar, when the reference named one.
    pub member: Option<String>,
}

/// Import-side face of the peer's provider: fetches through the RPC proxy
/// and resolves jar references through the local cache.
pub struct RemoteLoader {
    shared: Weak<Shared>,
    proxy: RemoteRef,
    resolved: Mutex<HashMap<String, FetchedResource>>,
}

impl RemoteLoader {
    pub(crate) fn new(shared: Weak<Shared>, proxy: RemoteRef) -> Self {
        Self {
            shared,
            proxy,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    fn shared(&self) -> std::result::Result<Arc<Shared>, Error> {
        self.shared.upgrade().ok_or(Error::ChannelClosed)
    }

    /// Fetches one resource, consulting the local resolution cache first.
    pub fn fetch(&self, name: &str) -> std::result::Result<FetchedResource, Error> {
        if let Some(hit) = self.resolved.lock().unwrap().get(name) {
            return Ok(hit.clone());
        }
        let shared = self.shared()?;
        shared.check_name(name)?;

        let args = name
            .to_string()
            .to_wire()
            .map_err(|e| Error::Protocol(format!("{e:#}")))?;
        let reply_bytes = self.proxy.invoke(LOADER_INTERFACE, "fetch", &args)?;
        let reply = ResourceReply::from_wire(&reply_bytes)
            .map_err(|e| Error::Protocol(format!("{e:#}")))?;
        let fetched = self.materialize(name, reply)?;
        self.resolved
            .lock()
            .unwrap()
            .insert(name.to_string(), fetched.clone());
        Ok(fetched)
    }

    /// Asks the provider for `name` plus whatever it predicts will be needed
    /// next, populating the resolution cache without extra round trips.
    /// Returns the number of entries now cached.
    pub fn prefetch(&self, name: &str) -> std::result::Result<usize, Error> {
        let shared = self.shared()?;
        shared.check_name(name)?;

        let args = name
            .to_string()
            .to_wire()
            .map_err(|e| Error::Protocol(format!("{e:#}")))?;
        let reply_bytes = self.proxy.invoke(LOADER_INTERFACE, "prefetch", &args)?;
        let reply = PrefetchReply::from_wire(&reply_bytes)
            .map_err(|e| Error::Protocol(format!("{e:#}")))?;

        let mut cached = 0;
        for (entry_name, entry_reply) in reply.entries {
            if shared.check_name(&entry_name).is_err() {
                warn!("dropping prefetched entry with rejected name {entry_name:?}");
                continue;
            }
            if matches!(entry_reply, ResourceReply::Refused) {
                continue;
            }
            let fetched = self.materialize(&entry_name, entry_reply)?;
            self.resolved.lock().unwrap().insert(entry_name, fetched);
            cached += 1;
        }
        Ok(cached)
    }

    fn materialize(
        &self,
        name: &str,
        reply: ResourceReply,
    ) -> std::result::Result<FetchedResource, Error> {
        match reply {
            ResourceReply::Direct(bytes) => Ok(FetchedResource {
                bytes: Some(bytes),
                url: None,
                member: None,
            }),
            ResourceReply::InJar { checksum, path } => {
                let url = self.resolve_jar(checksum)?;
                let bytes = match &path {
                    None => Some(std::fs::read(url.path())?),
                    Some(_) => None,
                };
                Ok(FetchedResource {
                    bytes,
                    url: Some(url),
                    member: path,
                })
            },
            ResourceReply::Refused => Err(Error::ResourceNotFound(name.to_string())),
        }
    }

    /// Resolves a jar reference through the cache. The actual download runs
    /// on the channel's capacity-1 download executor, so jar transfers never
    /// saturate the worker pool.
    pub fn resolve_jar(&self, checksum: Checksum) -> std::result::Result<ArtifactUrl, Error> {
        let shared = self.shared()?;
        let cache = shared.jar_cache();
        if cache.known(&checksum) {
            return cache.resolve(&checksum, &|| bail!("jar expected on disk"));
        }

        let proxy = self.proxy.clone();
        let result = shared
            .run_download(move || {
                let fetch = || -> Result<Vec<u8>> {
                    let args = checksum.to_wire().location()?;
                    let reply_bytes = proxy
                        .invoke(LOADER_INTERFACE, "jar", &args)
                        .map_err(anyhow::Error::from)?;
                    let reply = JarReply::from_wire(&reply_bytes).location()?;
                    reply
                        .bytes
                        .ok_or_else(|| anyhow!("peer has no jar {checksum}"))
                };
                cache.resolve(&checksum, &fetch)
            })
            .map_err(|e| Error::Protocol(format!("{e:#}")))??;

        // Found locally now; let the peer switch to references.
        if let Some(shared) = self.shared.upgrade() {
            shared.advertise_jars(vec![checksum]);
        }
        Ok(result)
    }
}

/// Hook invoked when an inbound call names an operation with no local
/// handler: the definition has been fetched, install it (typically by
/// registering the callable) and the dispatch retries once.
pub trait ResourceInstaller: Send + Sync {
    fn install(
        &self,
        name: &str,
        resource: &FetchedResource,
        ctx: &CallContext,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jarred(inline: Option<Vec<u8>>) -> ResourceLocation {
        ResourceLocation::Jarred {
            checksum: Checksum::of(b"jar"),
            path: None,
            inline,
        }
    }

    #[test]
    fn inline_resources_always_travel_direct() {
        let reply = shape_reply(ResourceLocation::Inline(vec![1, 2]), true);
        assert_eq!(reply, ResourceReply::Direct(vec![1, 2]));
    }

    #[test]
    fn jar_caching_prefers_references() {
        let reply = shape_reply(jarred(Some(vec![1])), true);
        assert!(matches!(reply, ResourceReply::InJar { path: None, .. }));
    }

    #[test]
    fn without_jar_caching_inline_bytes_travel() {
        let reply = shape_reply(jarred(Some(vec![5, 6])), false);
        assert_eq!(reply, ResourceReply::Direct(vec![5, 6]));
    }

    #[test]
    fn without_jar_caching_and_no_bytes_refuses() {
        let reply = shape_reply(jarred(None), false);
        assert_eq!(reply, ResourceReply::Refused);
    }

    #[test]
    fn refusal_passes_through() {
        assert_eq!(
            shape_reply(ResourceLocation::Refused, true),
            ResourceReply::Refused
        );
    }

    #[test]
    fn reply_wire_round_trip() {
        let reply = ResourceReply::InJar {
            checksum: Checksum::of(b"x"),
            path: Some("task/Echo.bin".to_string()),
        };
        let bytes = reply.to_wire().unwrap();
        assert_eq!(ResourceReply::from_wire(&bytes).unwrap(), reply);
    }
}

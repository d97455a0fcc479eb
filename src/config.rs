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

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::Capabilities;
use crate::jar_cache::JarCache;
use crate::request::CallDecorator;
use crate::resource::ResourceInstaller;
use crate::resource::ResourceProvider;

/// Per-channel knobs. Built with the `with_*` setters; every field has a
/// working default. Parsing option files is the launcher's job, not ours.
#[derive(Clone)]
pub struct ChannelOptions {
    /// Channel name used in thread names and log lines.
    pub name: String,
    /// Capabilities offered in the preamble; the effective set is the
    /// intersection with the peer's.
    pub capabilities: Capabilities,
    /// Worker threads executing inbound callables.
    pub workers: usize,
    /// Credit window per proxied stream, in bytes.
    pub stream_window: u32,
    /// Largest chunk a stream forwarder emits per command.
    pub stream_chunk: u32,
    /// How long `close` waits for in-flight requests before tearing down.
    pub close_timeout: Duration,
    /// Grace period during which releases for a freed oid are ignored.
    pub release_grace: Duration,
    /// Capture a creation-site backtrace on every outbound command.
    pub record_origin: bool,
    /// Keep a ring buffer of refcount events per export.
    pub export_diagnostics: bool,
    /// Replacement deny-list patterns, one regex per line.
    pub safelist_path: Option<PathBuf>,
    /// Jar cache; `None` runs the disabled stub (inline transfers only).
    pub jar_cache: Option<Arc<dyn JarCache>>,
    /// Resources served to the peer.
    pub provider: Option<Arc<dyn ResourceProvider>>,
    /// Installs definitions fetched for unknown inbound callables.
    pub installer: Option<Arc<dyn ResourceInstaller>>,
    /// Callable decoration chain, applied in order.
    pub decorators: Vec<Arc<dyn CallDecorator>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            name: "channel".to_string(),
            capabilities: Capabilities::current(),
            workers: 4,
            stream_window: 1024 * 1024,
            stream_chunk: 16 * 1024,
            close_timeout: Duration::from_secs(10),
            release_grace: Duration::from_secs(15),
            record_origin: false,
            export_diagnostics: false,
            safelist_path: None,
            jar_cache: None,
            provider: None,
            installer: None,
            decorators: Vec::new(),
        }
    }
}

impl ChannelOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_stream_window(mut self, bytes: u32) -> Self {
        self.stream_window = bytes.max(1);
        self
    }

    pub fn with_stream_chunk(mut self, bytes: u32) -> Self {
        self.stream_chunk = bytes.max(1);
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_release_grace(mut self, grace: Duration) -> Self {
        self.release_grace = grace;
        self
    }

    pub fn with_record_origin(mut self, record: bool) -> Self {
        self.record_origin = record;
        self
    }

    pub fn with_export_diagnostics(mut self, enabled: bool) -> Self {
        self.export_diagnostics = enabled;
        self
    }

    pub fn with_safelist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.safelist_path = Some(path.into());
        self
    }

    pub fn with_jar_cache(mut self, cache: Arc<dyn JarCache>) -> Self {
        self.jar_cache = Some(cache);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_installer(mut self, installer: Arc<dyn ResourceInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn with_decorator(mut self, decorator: Arc<dyn CallDecorator>) -> Self {
        self.decorators.push(decorator);
        self
    }
}

// The trait-object fields have nothing useful to print.
impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("workers", &self.workers)
            .field("stream_window", &self.stream_window)
            .field("stream_chunk", &self.stream_chunk)
            .field("close_timeout", &self.close_timeout)
            .field("release_grace", &self.release_grace)
            .field("record_origin", &self.record_origin)
            .field("export_diagnostics", &self.export_diagnostics)
            .field("safelist_path", &self.safelist_path)
            .field("jar_cache", &self.jar_cache.is_some())
            .field("provider", &self.provider.is_some())
            .field("installer", &self.installer.is_some())
            .field("decorators", &self.decorators.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityBit;

    #[test]
    fn defaults_are_sane() {
        let options = ChannelOptions::default();
        assert!(options.workers >= 1);
        assert!(options.stream_window >= options.stream_chunk);
        assert!(options.capabilities.contains(CapabilityBit::ChunkedFraming));
    }

    #[test]
    fn builder_setters_clamp_zeroes() {
        let options = ChannelOptions::default()
            .with_workers(0)
            .with_stream_window(0)
            .with_stream_chunk(0);
        assert_eq!(options.workers, 1);
        assert_eq!(options.stream_window, 1);
        assert_eq!(options.stream_chunk, 1);
    }
}

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

use rkyv::Archive;
use rkyv::Deserialize;
use rkyv::Serialize;

use crate::jar_cache::Checksum;

/// Errors visible at the channel boundary.
///
/// Dispatch-loop failures that render the channel unusable poison it: every
/// pending request fails with the root cause and all exports are released. A
/// call that races with channel close resolves with either its result or
/// [`Error::ChannelClosed`], never a hang.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A shutdown started before or while the call was in flight.
    #[error("channel closed")]
    ChannelClosed,

    /// The call was accepted and then abandoned by channel teardown.
    #[error("request aborted by channel teardown")]
    RequestAborted,

    /// The remote callable failed; the failure travels as data.
    #[error("remote invocation failed: {0}")]
    RemoteInvocation(RemoteError),

    /// Framing invariants were violated. Fatal to the channel.
    #[error("stream corrupted: {0}")]
    StreamCorruption(String),

    /// A downloaded jar did not hash to the requested checksum. Retryable.
    #[error("jar {checksum} failed verification after download")]
    CorruptedJar { checksum: Checksum },

    /// The safelist rejected a payload, interface, or resource name.
    #[error("name rejected by safelist: {0:?}")]
    NameRejected(String),

    /// A proxy interface set spans conflicting loader namespaces.
    #[error("interface set spans conflicting loaders")]
    IncompatibleLoader,

    /// The remote resource provider refused or could not supply a resource.
    #[error("resource not found: {0:?}")]
    ResourceNotFound(String),

    /// The local deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// The request was cancelled locally.
    #[error("request cancelled")]
    Cancelled,

    /// The peer sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::CorruptedJar { .. } | Error::Timeout)
    }

    /// Stable kind tag, used as the type name when the error is captured
    /// into wire form.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ChannelClosed => "channel-closed",
            Error::RequestAborted => "request-aborted",
            Error::RemoteInvocation(_) => "remote-invocation",
            Error::StreamCorruption(_) => "stream-corruption",
            Error::CorruptedJar { .. } => "corrupted-jar",
            Error::NameRejected(_) => "name-rejected",
            Error::IncompatibleLoader => "incompatible-loader",
            Error::ResourceNotFound(_) => "resource-not-found",
            Error::Timeout => "timeout",
            Error::Cancelled => "cancelled",
            Error::Protocol(_) => "protocol",
            Error::Io(_) => "io",
        }
    }
}

/// One link in a remote failure chain: type name, message, and stack frames.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteErrorEntry {
    pub type_name: String,
    pub message: String,
    pub frames: Vec<String>,
}

/// A failure captured on the remote side and carried as data.
///
/// No host error type is reconstructed; the chain is flattened (cycle-safe by
/// construction) and capped at [`RemoteError::MAX_CHAIN`] links.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub primary: RemoteErrorEntry,
    pub cause_chain: Vec<RemoteErrorEntry>,
    pub suppressed: Vec<RemoteErrorEntry>,
}

impl RemoteError {
    pub const MAX_CHAIN: usize = 16;

    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            primary: RemoteErrorEntry {
                type_name: type_name.into(),
                message: message.into(),
                frames: Vec::new(),
            },
            cause_chain: Vec::new(),
            suppressed: Vec::new(),
        }
    }

    /// Flattens a live error chain into wire form, preserving the kind tags
    /// of this crate's typed errors along the chain.
    pub fn capture(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut out = Self::new(type_name_of(err), err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            if out.cause_chain.len() >= Self::MAX_CHAIN {
                break;
            }
            out.cause_chain.push(RemoteErrorEntry {
                type_name: type_name_of(cause),
                message: cause.to_string(),
                frames: Vec::new(),
            });
            source = cause.source();
        }
        out
    }

    /// Captures a worker panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "worker panicked".to_string()
        };
        Self::new("panic", message)
    }

    pub fn with_frames(mut self, frames: Vec<String>) -> Self {
        self.primary.frames = frames;
        self
    }

    pub fn suppress(&mut self, other: RemoteError) {
        if self.suppressed.len() < Self::MAX_CHAIN {
            self.suppressed.push(other.primary);
        }
    }
}

// Names are recovered for this crate's own error types; Rust has no stable
// way to name a foreign concrete type behind `dyn Error`, so anything else
// falls back to a generic tag. Callers holding a better name construct
// [`RemoteError::new`] directly.
fn type_name_of(err: &(dyn std::error::Error + 'static)) -> String {
    if let Some(err) = err.downcast_ref::<Error>() {
        return err.kind().to_string();
    }
    if let Some(err) = err.downcast_ref::<RemoteError>() {
        return err.primary.type_name.clone();
    }
    if err.downcast_ref::<std::io::Error>().is_some() {
        return "io".to_string();
    }
    "error".to_string()
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.primary.type_name, self.primary.message)?;
        for cause in &self.cause_chain {
            write!(f, "; caused by {}: {}", cause.type_name, cause.message)?;
        }
        if !self.suppressed.is_empty() {
            write!(f, " (+{} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

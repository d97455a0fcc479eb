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

//! The typed envelopes exchanged on a channel.
//!
//! One [`Envelope`] travels per framed block. The payload of a user call is
//! opaque to the channel: a [`PayloadBlob`] tagged with the name of the
//! operation and the loader namespace that can supply its definition.

use std::fmt;

use enum_as_inner::EnumAsInner;
use rkyv::Archive;
use rkyv::Deserialize;
use rkyv::Serialize;

use crate::error::RemoteError;
use crate::jar_cache::Checksum;

#[derive(
    Archive, Deserialize, Serialize, Debug, Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord,
)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Exporter-side object id. Stable until the export's refcount reaches zero.
#[derive(
    Archive, Deserialize, Serialize, Debug, Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord,
)]
pub struct Oid(pub u64);

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid{}", self.0)
    }
}

/// Loader namespace tag: the exporter-side oid of the resource provider that
/// can supply the definition of a payload. The root provider of each peer is
/// always its first export, so `LoaderId::ROOT` is valid on every channel.
#[derive(Archive, Deserialize, Serialize, Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct LoaderId(pub u64);

impl LoaderId {
    pub const ROOT: LoaderId = LoaderId(1);

    pub fn oid(self) -> Oid {
        Oid(self.0)
    }
}

/// An opaque user payload plus the metadata needed to resolve it remotely.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PayloadBlob {
    pub loader: LoaderId,
    pub tag: String,
    pub data: Vec<u8>,
}

/// Failure shape on the wire. `Structured` requires the mimic-exception
/// capability on both sides; otherwise only the rendered message travels.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum ErrorPayload {
    Structured(RemoteError),
    Plain(String),
}

impl ErrorPayload {
    pub fn into_remote(self) -> RemoteError {
        match self {
            Self::Structured(err) => err,
            Self::Plain(message) => RemoteError::new("remote", message),
        }
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct UserRequest {
    pub id: RequestId,
    /// Stream-I/O commands the caller had sent when this request was
    /// queued; execution waits until that many have been applied, so bytes
    /// written through a pipe before the call are visible to the callee.
    pub last_io_id: u64,
    pub payload: PayloadBlob,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Success(Vec<u8>),
    Failure(ErrorPayload),
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct UserResponse {
    pub id: RequestId,
    /// Number of stream-I/O commands the responder had sent when this
    /// response was queued; delivery waits until that many have been
    /// applied.
    pub last_io_id: u64,
    pub outcome: ReplyOutcome,
}

/// Method selector: a name on first use, the negotiated id afterwards.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum MethodRef {
    Name(String),
    Id(u16),
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub id: RequestId,
    pub last_io_id: u64,
    pub oid: Oid,
    pub interface: String,
    pub method: MethodRef,
    pub args: Vec<u8>,
    /// One-way methods get no response; the caller does not wait.
    pub one_way: bool,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum RpcOutcome {
    Success {
        result: Vec<u8>,
        /// Piggybacked method-table entry when the request used a name.
        method_id: Option<u16>,
    },
    Failure(ErrorPayload),
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: RequestId,
    pub last_io_id: u64,
    pub outcome: RpcOutcome,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Cancel {
    pub id: RequestId,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Release {
    pub oid: Oid,
    pub count: u32,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub oid: Oid,
    pub data: Vec<u8>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StreamEof {
    pub oid: Oid,
    pub error: Option<String>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StreamWindow {
    pub oid: Oid,
    pub credit: u32,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StreamRead {
    pub oid: Oid,
    pub reply_oid: Oid,
    pub max: u32,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PipeConnect {
    pub pipe: u64,
    pub sink_oid: Oid,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct JarPresent {
    pub checksums: Vec<Checksum>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SetProperty {
    pub key: String,
    pub value: Option<String>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Close {
    pub reason: Option<String>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, EnumAsInner)]
pub enum Command {
    UserRequest(UserRequest),
    UserResponse(UserResponse),
    RpcRequest(RpcRequest),
    RpcResponse(RpcResponse),
    Cancel(Cancel),
    Release(Release),
    StreamChunk(StreamChunk),
    StreamEof(StreamEof),
    StreamWindow(StreamWindow),
    StreamRead(StreamRead),
    PipeConnect(PipeConnect),
    JarPresent(JarPresent),
    SetProperty(SetProperty),
    Close(Close),
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserRequest(_) => "UserRequest",
            Self::UserResponse(_) => "UserResponse",
            Self::RpcRequest(_) => "RpcRequest",
            Self::RpcResponse(_) => "RpcResponse",
            Self::Cancel(_) => "Cancel",
            Self::Release(_) => "Release",
            Self::StreamChunk(_) => "StreamChunk",
            Self::StreamEof(_) => "StreamEof",
            Self::StreamWindow(_) => "StreamWindow",
            Self::StreamRead(_) => "StreamRead",
            Self::PipeConnect(_) => "PipeConnect",
            Self::JarPresent(_) => "JarPresent",
            Self::SetProperty(_) => "SetProperty",
            Self::Close(_) => "Close",
        }
    }

    /// Stream side effects counted by the pipe-writer ordering protocol.
    pub fn is_stream_io(&self) -> bool {
        matches!(self, Self::StreamChunk(_) | Self::StreamEof(_))
    }
}

/// What actually travels per framed block: a command plus an optional
/// creation-site capture for diagnostics.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub command: Command,
    pub origin: Option<String>,
}

impl Envelope {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            origin: None,
        }
    }

    pub fn with_origin(command: Command) -> Self {
        Self {
            command,
            origin: Some(std::backtrace::Backtrace::force_capture().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Message;

    #[test]
    fn envelope_round_trips() {
        let env = Envelope::new(Command::UserRequest(UserRequest {
            id: RequestId(12),
            last_io_id: 0,
            payload: PayloadBlob {
                loader: LoaderId::ROOT,
                tag: "echo".to_string(),
                data: vec![1, 2, 3],
            },
        }));
        let bytes = env.to_wire().unwrap();
        let back = Envelope::from_wire(&bytes).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.command.kind(), "UserRequest");
    }

    #[test]
    fn stream_commands_count_as_io() {
        assert!(
            Command::StreamChunk(StreamChunk {
                oid: Oid(3),
                data: vec![0],
            })
            .is_stream_io()
        );
        assert!(
            Command::StreamEof(StreamEof {
                oid: Oid(3),
                error: None,
            })
            .is_stream_io()
        );
        assert!(
            !Command::Cancel(Cancel { id: RequestId(1) }).is_stream_io()
        );
    }

    #[test]
    fn variant_accessors() {
        let cmd = Command::Release(Release {
            oid: Oid(9),
            count: 2,
        });
        assert_eq!(cmd.as_release().unwrap().count, 2);
        assert!(cmd.as_close().is_none());
    }

    #[test]
    fn origin_capture_is_optional() {
        let plain = Envelope::new(Command::Close(Close { reason: None }));
        assert!(plain.origin.is_none());
        let traced = Envelope::with_origin(Command::Close(Close { reason: None }));
        assert!(traced.origin.is_some());
    }
}

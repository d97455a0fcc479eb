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

//! Bidirectional RPC transport connecting a controller process to remote
//! agent processes over a single full-duplex byte stream.
//!
//! One [`channel::Channel`] multiplexes typed commands, request/response
//! calls, exported-object RPC, on-demand resource loading backed by a
//! content-addressed jar cache, and proxied byte streams with flow control.

pub mod capability;
pub mod channel;
pub mod command;
pub mod config;
pub mod error;
pub mod error_utils;
pub mod executor;
pub mod export;
pub mod filter;
pub mod framing;
pub mod jar_cache;
pub mod pipe;
pub mod prelude;
pub mod proxy;
pub mod request;
pub mod resource;
pub mod stream;
pub mod utils;
pub mod wire;

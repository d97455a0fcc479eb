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

//! Self-describing value encoding for everything that crosses the channel.
//!
//! Commands and user payloads are rkyv-archived enums/structs; reads are
//! validated before deserialization so a hostile peer cannot produce an
//! out-of-bounds archived value.

use std::fmt::Debug;

use rkyv::Archive;
use rkyv::Deserialize;
use rkyv::Serialize;
use rkyv::api::high::HighDeserializer;
use rkyv::api::high::HighSerializer;
use rkyv::api::high::HighValidator;
use rkyv::bytecheck;
use rkyv::rancor::Error as RancorError;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;

use crate::prelude::*;

// TODO: figure out how to shorten the T::Archived bound. This may require
// https://github.com/rust-lang/rust/issues/52662.

pub trait Serializable:
    Debug
    + Send
    + Archive
    + for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RancorError>>
    + 'static
{
}

impl<T> Serializable for T where
    T: Debug
        + Send
        + Archive
        + for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RancorError>>
        + 'static
{
}

pub fn encode<T: Serializable>(value: &T) -> Result<AlignedVec> {
    rkyv::to_bytes::<RancorError>(value).location()
}

/// Validated decode. The input is copied into an aligned buffer first;
/// payload bytes extracted from a larger archive have arbitrary alignment.
pub fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, HighDeserializer<RancorError>>
        + for<'a> bytecheck::CheckBytes<HighValidator<'a, RancorError>>,
{
    let mut aligned = AlignedVec::<16>::new();
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<T, RancorError>(&aligned).location()
}

/// A value that can travel in both directions: encodable and decodable.
///
/// Blanket-implemented; user argument and result types only need the rkyv
/// derives.
pub trait Message: Serializable {
    fn to_wire(&self) -> Result<Vec<u8>>;
    fn from_wire(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

impl<T> Message for T
where
    T: Serializable,
    T::Archived: Deserialize<T, HighDeserializer<RancorError>>
        + for<'a> bytecheck::CheckBytes<HighValidator<'a, RancorError>>,
{
    fn to_wire(&self) -> Result<Vec<u8>> {
        encode(self).map(|buf| buf.to_vec())
    }

    fn from_wire(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Archive, Deserialize, Serialize, Debug, PartialEq)]
    struct Sample {
        n: u64,
        name: String,
        data: Vec<u8>,
    }

    #[test]
    fn round_trip() {
        let value = Sample {
            n: 7,
            name: "agent".to_string(),
            data: vec![1, 2, 3],
        };
        let bytes = value.to_wire().unwrap();
        let back = Sample::from_wire(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn decode_tolerates_unaligned_input() {
        let value = Sample {
            n: 1,
            name: "x".to_string(),
            data: vec![9; 32],
        };
        let bytes = value.to_wire().unwrap();
        // Shift the buffer by one to force misalignment.
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        let back = Sample::from_wire(&shifted[1..]).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let value = Sample {
            n: 1,
            name: "truncated".to_string(),
            data: vec![1; 16],
        };
        let bytes = value.to_wire().unwrap();
        assert!(Sample::from_wire(&bytes[..bytes.len() / 2]).is_err());
    }
}

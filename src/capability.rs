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

//! Capability preamble.
//!
//! Immediately after connecting, both peers write a fixed greeting followed
//! by a 64-bit big-endian capability mask, then read the peer's. The
//! effective capability set is the intersection; unknown bits survive the
//! intersection untouched and are simply never acted on. The decoder touches
//! nothing but fixed-size binary, so no codec machinery runs before the
//! handshake completes.

use std::fmt;
use std::io::Read;
use std::io::Write;
use std::ops::BitAnd;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

use crate::error::Error;
use crate::framing::Framed;
use crate::prelude::*;

/// Fixed greeting written by both peers before the capability mask.
pub const GREETING: &[u8] = b"<===[JENKINS REMOTING CAPACITY]===>";

/// Documented capability bits, 1-based as on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CapabilityBit {
    MultiLoader = 1,
    PipeThrottling = 2,
    MimicException = 3,
    PrefetchJarCache = 4,
    GreedyRemoteInput = 5,
    ProxyWriterThrottling = 6,
    ChunkedFraming = 7,
}

impl CapabilityBit {
    fn mask(self) -> u64 {
        1 << (u8::from(self) - 1)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Capabilities(u64);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);

    /// Everything this implementation understands.
    pub fn current() -> Self {
        let mut caps = Self::NONE;
        for bit in 1..=7u8 {
            caps = caps.with(CapabilityBit::try_from(bit).unwrap());
        }
        caps
    }

    pub fn from_mask(mask: u64) -> Self {
        Self(mask)
    }

    pub fn mask(self) -> u64 {
        self.0
    }

    pub fn contains(self, bit: CapabilityBit) -> bool {
        self.0 & bit.mask() != 0
    }

    #[must_use]
    pub fn with(self, bit: CapabilityBit) -> Self {
        Self(self.0 | bit.mask())
    }

    #[must_use]
    pub fn without(self, bit: CapabilityBit) -> Self {
        Self(self.0 & !bit.mask())
    }
}

impl BitAnd for Capabilities {
    type Output = Capabilities;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        let mut known = 0u64;
        for bit in 1..=7u8 {
            let bit = CapabilityBit::try_from(bit).unwrap();
            known |= bit.mask();
            if self.contains(bit) {
                set.entry(&bit);
            }
        }
        let unknown = self.0 & !known;
        if unknown != 0 {
            set.entry(&format_args!("unknown({unknown:#x})"));
        }
        set.finish()
    }
}

pub fn write_preamble<W: Write>(stream: &mut W, caps: Capabilities) -> Result<()> {
    stream.write_all(GREETING).location()?;
    caps.mask().framed_write(stream).location()?;
    stream.flush().location()?;
    Ok(())
}

pub fn read_preamble<R: Read>(stream: &mut R) -> Result<Capabilities> {
    let mut greeting = [0u8; GREETING.len()];
    stream.read_exact(&mut greeting).location_ctx("reading greeting")?;
    if greeting != GREETING {
        return Err(Error::Protocol(format!(
            "bad greeting {:?}",
            String::from_utf8_lossy(&greeting)
        ))
        .into());
    }
    let mask = u64::framed_read(stream).location_ctx("reading capability mask")?;
    Ok(Capabilities::from_mask(mask))
}

/// Runs the symmetric exchange: write ours, read theirs, intersect.
///
/// Both sides write before reading, so neither blocks on the other.
pub fn exchange<S: Read + Write>(
    stream: &mut S,
    local: Capabilities,
) -> Result<(Capabilities, Capabilities)> {
    write_preamble(stream, local).location()?;
    let peer = read_preamble(stream).location()?;
    debug!("peer capabilities: {peer:?}, effective: {:?}", local & peer);
    Ok((peer, local & peer))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn current_contains_all_documented_bits() {
        let caps = Capabilities::current();
        for bit in 1..=7u8 {
            assert!(caps.contains(CapabilityBit::try_from(bit).unwrap()));
        }
    }

    #[test]
    fn preamble_round_trips() {
        let caps = Capabilities::NONE
            .with(CapabilityBit::ChunkedFraming)
            .with(CapabilityBit::PrefetchJarCache);
        let mut buf = Vec::new();
        write_preamble(&mut buf, caps).unwrap();
        let got = read_preamble(&mut Cursor::new(buf)).unwrap();
        assert_eq!(got, caps);
    }

    #[test]
    fn unknown_bits_survive_the_mask() {
        let caps = Capabilities::from_mask(1 << 42 | 1);
        let mut buf = Vec::new();
        write_preamble(&mut buf, caps).unwrap();
        let got = read_preamble(&mut Cursor::new(buf)).unwrap();
        assert_eq!(got.mask(), 1 << 42 | 1);
        // And they are ignored: only bit 1 is meaningful.
        assert!(got.contains(CapabilityBit::MultiLoader));
    }

    #[test]
    fn intersection_is_commutative() {
        let a = Capabilities::from_mask(0b101_0101);
        let b = Capabilities::from_mask(0b110_0110);
        assert_eq!(a & b, b & a);
    }

    #[test]
    fn bad_greeting_is_rejected() {
        let mut buf = GREETING.to_vec();
        buf[3] ^= 0xff;
        buf.extend_from_slice(&0u64.to_be_bytes());
        let err = read_preamble(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Protocol(_))
        ));
    }

    #[test]
    fn exchange_intersects_both_directions() {
        // Simulate both peers with in-memory buffers: each writes into the
        // buffer the other reads from.
        let a_caps = Capabilities::current().without(CapabilityBit::ChunkedFraming);
        let b_caps = Capabilities::current().without(CapabilityBit::GreedyRemoteInput);

        let mut a_to_b = Vec::new();
        let mut b_to_a = Vec::new();
        write_preamble(&mut a_to_b, a_caps).unwrap();
        write_preamble(&mut b_to_a, b_caps).unwrap();

        let at_b = read_preamble(&mut Cursor::new(a_to_b)).unwrap() & b_caps;
        let at_a = read_preamble(&mut Cursor::new(b_to_a)).unwrap() & a_caps;
        assert_eq!(at_a, at_b);
        assert!(!at_a.contains(CapabilityBit::ChunkedFraming));
        assert!(!at_a.contains(CapabilityBit::GreedyRemoteInput));
        assert!(at_a.contains(CapabilityBit::PipeThrottling));
    }
}

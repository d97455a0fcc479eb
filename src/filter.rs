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

//! Deserialization name guard.
//!
//! Every payload tag, callable name, interface name, and resource name
//! received from the peer is matched against a deny list of regular
//! expressions before it is resolved against any registry or loader. The
//! archive decoding itself is validated and memory-safe; this list stops
//! resolution side effects for names that should never be looked up.

use std::fs;
use std::path::Path;

use regex::Regex;

use crate::error::Error;
use crate::prelude::*;

// Builtin deny list: traversal, absolute paths, control bytes, empty and
// oversized names.
const DEFAULT_DENY: &[&str] = &[
    r"\.\.",
    r"^/",
    r"^[A-Za-z]:[/\\]",
    r"[\x00-\x1f]",
    r"^$",
    r"^.{256,}",
];

#[derive(Debug)]
pub struct NameFilter {
    deny: Vec<Regex>,
}

impl Default for NameFilter {
    fn default() -> Self {
        Self {
            deny: DEFAULT_DENY
                .iter()
                .map(|p| Regex::new(p).unwrap())
                .collect(),
        }
    }
}

impl NameFilter {
    /// Loads patterns from a file: one regex per line, `#` starts a comment.
    /// The file replaces the builtin set entirely.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .with_location_ctx(|| format!("reading safelist {:?}", path.as_ref()))?;
        let mut deny = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            deny.push(
                Regex::new(line)
                    .with_location_ctx(|| format!("bad pattern on line {}", lineno + 1))?,
            );
        }
        Ok(Self { deny })
    }

    pub fn check(&self, name: &str) -> std::result::Result<(), Error> {
        for pattern in &self.deny {
            if pattern.is_match(name) {
                debug!("rejecting name {name:?} (matched {:?})", pattern.as_str());
                return Err(Error::NameRejected(name.to_string()));
            }
        }
        Ok(())
    }
}

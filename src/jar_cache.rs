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

//! Content-addressed jar cache.
//!
//! Jars are keyed by a 128-bit checksum (the first half of a SHA-256, fixed
//! at channel creation) and stored at `<root>/<TOP>/<REST>.jar`. Concurrent
//! demands for one checksum share a single download; files land via a
//! sibling temp file and an atomic rename, then are re-hashed before use.
//! The cache never evicts; with `touch` enabled, lookups bump the mtime so
//! an outside process can run LRU eviction.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use rkyv::Archive;
use rkyv::Deserialize;
use rkyv::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::error::Error;
use crate::prelude::*;

/// 128-bit content identifier: two big-endian halves of a SHA-256 prefix.
#[derive(Archive, Deserialize, Serialize, Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct Checksum {
    pub hi: u64,
    pub lo: u64,
}

impl Checksum {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self {
            hi: u64::from_be_bytes(digest[..8].try_into().unwrap()),
            lo: u64::from_be_bytes(digest[8..16].try_into().unwrap()),
        }
    }

    /// `<root>/<TOP>/<REST>.jar`: TOP is the two-hex-digit top byte of the
    /// first half; REST is the remaining 14 hex of the first half plus all
    /// 16 hex of the second.
    pub fn path_under(&self, root: &Path) -> PathBuf {
        root.join(format!("{:02x}", self.top())).join(format!("{}.jar", self.rest()))
    }

    fn top(&self) -> u8 {
        (self.hi >> 56) as u8
    }

    fn rest(&self) -> String {
        format!("{:014x}{:016x}", self.hi & 0x00ff_ffff_ffff_ffff, self.lo)
    }

    fn from_layout(top: u8, rest: &str) -> Option<Self> {
        if rest.len() != 30 {
            return None;
        }
        let hi_rest = u64::from_str_radix(&rest[..14], 16).ok()?;
        let lo = u64::from_str_radix(&rest[14..], 16).ok()?;
        Some(Self {
            hi: (u64::from(top) << 56) | hi_rest,
            lo,
        })
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.hi, self.lo)
    }
}

/// Location of a resolved artifact.
///
/// Equality and hashing use the literal external form only; nothing is ever
/// resolved or canonicalized for comparison. Temp artifacts delete their
/// file once the last clone is dropped.
#[derive(Clone)]
pub struct ArtifactUrl(Arc<UrlInner>);

struct UrlInner {
    path: PathBuf,
    external: String,
    temp: bool,
}

impl ArtifactUrl {
    fn new(path: PathBuf, temp: bool) -> Self {
        let external = format!("file:{}", path.display());
        Self(Arc::new(UrlInner {
            path,
            external,
            temp,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    pub fn external_form(&self) -> &str {
        &self.0.external
    }
}

impl PartialEq for ArtifactUrl {
    fn eq(&self, other: &Self) -> bool {
        self.0.external == other.0.external
    }
}

impl Eq for ArtifactUrl {}

impl std::hash::Hash for ArtifactUrl {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.external.hash(state);
    }
}

impl fmt::Debug for ArtifactUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactUrl({})", self.0.external)
    }
}

impl Drop for UrlInner {
    fn drop(&mut self) {
        if self.temp {
            _ = fs::remove_file(&self.path);
        }
    }
}

pub type FetchJar<'a> = &'a (dyn Fn() -> Result<Vec<u8>> + Sync);

pub trait JarCache: Send + Sync {
    /// Whether the jar is already present locally.
    fn known(&self, sum: &Checksum) -> bool;

    /// Produces a local URL for the jar, downloading it via `fetch` at most
    /// once no matter how many callers ask concurrently.
    fn resolve(&self, sum: &Checksum, fetch: FetchJar) -> std::result::Result<ArtifactUrl, Error>;

    /// Checksums worth advertising to the peer on channel open.
    fn advertised(&self) -> Vec<Checksum> {
        Vec::new()
    }
}

enum FlightState {
    Running,
    Done(ArtifactUrl),
    Failed { message: String, corrupted: bool },
}

struct Flight {
    state: Mutex<FlightState>,
    cond: Condvar,
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Disk-backed cache.
pub struct FileJarCache {
    root: PathBuf,
    touch: bool,
    inflight: Mutex<HashMap<Checksum, Arc<Flight>>>,
    known: Mutex<HashSet<Checksum>>,
}

impl FileJarCache {
    pub fn new(root: impl Into<PathBuf>, touch: bool) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).location_ctx("creating jar cache root")?;
        Ok(Self {
            root,
            touch,
            inflight: Mutex::new(HashMap::new()),
            known: Mutex::new(HashSet::new()),
        })
    }

    /// Stores jar bytes directly (no peer involved), e.g. to prime a cache.
    pub fn seed(&self, bytes: &[u8]) -> Result<Checksum> {
        let sum = Checksum::of(bytes);
        self.store_verified(&sum, bytes)
            .map_err(anyhow::Error::from)?;
        Ok(sum)
    }

    fn lookup(&self, sum: &Checksum) -> Option<ArtifactUrl> {
        let path = sum.path_under(&self.root);
        if !path.is_file() {
            return None;
        }
        if self.touch {
            if let Ok(file) = fs::File::options().write(true).open(&path) {
                file.set_modified(SystemTime::now()).warn_and_ignore();
            }
        }
        self.known.lock().unwrap().insert(*sum);
        Some(ArtifactUrl::new(path, false))
    }

    fn store_verified(
        &self,
        sum: &Checksum,
        bytes: &[u8],
    ) -> std::result::Result<ArtifactUrl, Error> {
        let path = sum.path_under(&self.root);
        let parent = path.parent().unwrap();
        fs::create_dir_all(parent)?;

        let temp = parent.join(format!(
            ".{}.tmp.{}.{}",
            sum.rest(),
            std::process::id(),
            TEMP_SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        fs::write(&temp, bytes)?;
        if let Err(e) = fs::rename(&temp, &path) {
            _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        // Trust nothing until the renamed file hashes back to the key.
        let on_disk = fs::read(&path)?;
        if Checksum::of(&on_disk) != *sum {
            _ = fs::remove_file(&path);
            return Err(Error::CorruptedJar { checksum: *sum });
        }
        self.known.lock().unwrap().insert(*sum);
        Ok(ArtifactUrl::new(path, false))
    }

    fn download(&self, sum: &Checksum, fetch: FetchJar) -> std::result::Result<ArtifactUrl, Error> {
        let bytes = fetch().map_err(|e| Error::Protocol(format!("jar download failed: {e:#}")))?;
        if Checksum::of(&bytes) != *sum {
            return Err(Error::CorruptedJar { checksum: *sum });
        }
        self.store_verified(sum, &bytes)
    }
}

impl JarCache for FileJarCache {
    fn known(&self, sum: &Checksum) -> bool {
        if self.known.lock().unwrap().contains(sum) {
            return true;
        }
        sum.path_under(&self.root).is_file()
    }

    fn resolve(&self, sum: &Checksum, fetch: FetchJar) -> std::result::Result<ArtifactUrl, Error> {
        if let Some(url) = self.lookup(sum) {
            return Ok(url);
        }

        let (flight, leader) = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(sum) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight {
                        state: Mutex::new(FlightState::Running),
                        cond: Condvar::new(),
                    });
                    inflight.insert(*sum, Arc::clone(&flight));
                    (flight, true)
                },
            }
        };

        if leader {
            debug!("downloading jar {sum}");
            let result = self.download(sum, fetch);
            let mut state = flight.state.lock().unwrap();
            *state = match &result {
                Ok(url) => FlightState::Done(url.clone()),
                Err(err) => FlightState::Failed {
                    message: err.to_string(),
                    corrupted: matches!(err, Error::CorruptedJar { .. }),
                },
            };
            drop(state);
            flight.cond.notify_all();
            // Success or failure, the entry clears so a later attempt can
            // retry.
            self.inflight.lock().unwrap().remove(sum);
            return result;
        }

        let mut state = flight.state.lock().unwrap();
        loop {
            match &*state {
                FlightState::Running => state = flight.cond.wait(state).unwrap(),
                FlightState::Done(url) => return Ok(url.clone()),
                FlightState::Failed { message, corrupted } => {
                    return Err(if *corrupted {
                        Error::CorruptedJar { checksum: *sum }
                    } else {
                        Error::Protocol(message.clone())
                    });
                },
            }
        }
    }

    fn advertised(&self) -> Vec<Checksum> {
        let mut out = Vec::new();
        let Ok(tops) = fs::read_dir(&self.root) else {
            return out;
        };
        for top in tops.flatten() {
            let Some(top_byte) = top
                .file_name()
                .to_str()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
            else {
                continue;
            };
            let Ok(files) = fs::read_dir(top.path()) else {
                continue;
            };
            for file in files.flatten() {
                let name = file.file_name();
                let Some(rest) = name.to_str().and_then(|s| s.strip_suffix(".jar")) else {
                    continue;
                };
                if let Some(sum) = Checksum::from_layout(top_byte, rest) {
                    out.push(sum);
                }
            }
        }
        out
    }
}

/// Stub used when caching is disabled: nothing is ever reported present, so
/// peers fall back to inline payloads, and resolved jars live in temp files
/// that vanish once the URL is dropped.
pub struct DisabledJarCache;

impl JarCache for DisabledJarCache {
    fn known(&self, _sum: &Checksum) -> bool {
        false
    }

    fn resolve(&self, sum: &Checksum, fetch: FetchJar) -> std::result::Result<ArtifactUrl, Error> {
        let bytes = fetch().map_err(|e| Error::Protocol(format!("jar download failed: {e:#}")))?;
        if Checksum::of(&bytes) != *sum {
            return Err(Error::CorruptedJar { checksum: *sum });
        }
        let path = std::env::temp_dir().join(format!(
            "tether-{sum}-{}-{}.jar",
            std::process::id(),
            TEMP_SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        fs::write(&path, &bytes)?;
        Ok(ArtifactUrl::new(path, true))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn checksum_is_content_addressed() {
        let a = Checksum::of(b"jar one");
        let b = Checksum::of(b"jar two");
        assert_ne!(a, b);
        assert_eq!(a, Checksum::of(b"jar one"));
    }

    #[test]
    fn path_layout_splits_top_byte() {
        let sum = Checksum {
            hi: 0xab01_0203_0405_0607,
            lo: 0x1112_1314_1516_1718,
        };
        let path = sum.path_under(Path::new("/cache"));
        assert_eq!(
            path,
            PathBuf::from("/cache/ab/010203040506071112131415161718.jar")
        );
        let rendered = sum.to_string();
        assert_eq!(rendered.len(), 32);
        assert!(rendered.starts_with("ab"));
    }

    #[test]
    fn layout_round_trips_through_filenames() {
        let sum = Checksum::of(b"anything");
        let path = sum.path_under(Path::new("r"));
        let top = u8::from_str_radix(
            path.parent().unwrap().file_name().unwrap().to_str().unwrap(),
            16,
        )
        .unwrap();
        let rest = path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .strip_suffix(".jar")
            .unwrap();
        assert_eq!(Checksum::from_layout(top, rest).unwrap(), sum);
    }

    #[test]
    fn resolve_downloads_then_hits_locally() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileJarCache::new(dir.path(), false).unwrap();
        let payload = b"class bytes".to_vec();
        let sum = Checksum::of(&payload);
        let downloads = AtomicUsize::new(0);

        let fetch = || {
            downloads.fetch_add(1, Ordering::SeqCst);
            Ok(payload.clone())
        };
        let url = cache.resolve(&sum, &fetch).unwrap();
        assert_eq!(fs::read(url.path()).unwrap(), payload);
        assert!(cache.known(&sum));

        cache.resolve(&sum, &fetch).unwrap();
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resolved_file_hashes_back_to_its_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileJarCache::new(dir.path(), false).unwrap();
        let payload = vec![7u8; 4096];
        let sum = Checksum::of(&payload);

        let url = cache.resolve(&sum, &{ let p = payload.clone(); move || Ok(p.clone()) }).unwrap();
        assert_eq!(Checksum::of(&fs::read(url.path()).unwrap()), sum);
    }

    #[test]
    fn concurrent_resolves_share_one_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileJarCache::new(dir.path(), false).unwrap());
        let payload = b"shared jar".to_vec();
        let sum = Checksum::of(&payload);
        let downloads = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let downloads = Arc::clone(&downloads);
                let payload = payload.clone();
                thread::spawn(move || {
                    cache.resolve(&sum, &move || {
                        downloads.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(30));
                        Ok(payload.clone())
                    })
                })
            })
            .collect();

        let urls: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
        assert!(urls.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn corrupt_download_fails_cleans_up_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileJarCache::new(dir.path(), false).unwrap();
        let payload = b"good jar".to_vec();
        let sum = Checksum::of(&payload);

        let err = cache
            .resolve(&sum, &|| Ok(b"tampered".to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::CorruptedJar { .. }));
        assert!(!sum.path_under(dir.path()).exists());
        // No stray temp files either.
        let parent = sum.path_under(dir.path());
        if let Ok(entries) = fs::read_dir(parent.parent().unwrap()) {
            assert_eq!(entries.count(), 0);
        }

        // The in-flight entry cleared, so the retry runs a fresh download.
        let url = cache
            .resolve(&sum, &{ let p = payload.clone(); move || Ok(p.clone()) })
            .unwrap();
        assert_eq!(fs::read(url.path()).unwrap(), payload);
    }

    #[test]
    fn failed_download_clears_inflight_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileJarCache::new(dir.path(), false).unwrap();
        let payload = b"eventually".to_vec();
        let sum = Checksum::of(&payload);

        let err = cache
            .resolve(&sum, &|| bail!("connection reset"))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let url = cache
            .resolve(&sum, &{ let p = payload.clone(); move || Ok(p.clone()) })
            .unwrap();
        assert_eq!(fs::read(url.path()).unwrap(), payload);
    }

    #[test]
    fn touch_bumps_mtime_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileJarCache::new(dir.path(), true).unwrap();
        let sum = cache.seed(b"old jar").unwrap();
        let path = sum.path_under(dir.path());

        let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        cache.resolve(&sum, &|| bail!("must not download")).unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        assert!(mtime > old + Duration::from_secs(3600));
    }

    #[test]
    fn advertised_lists_seeded_jars() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileJarCache::new(dir.path(), false).unwrap();
        let a = cache.seed(b"jar a").unwrap();
        let b = cache.seed(b"jar b").unwrap();

        let mut advertised = cache.advertised();
        advertised.sort_by_key(|c| (c.hi, c.lo));
        let mut expected = vec![a, b];
        expected.sort_by_key(|c| (c.hi, c.lo));
        assert_eq!(advertised, expected);
    }

    #[test]
    fn disabled_cache_reports_nothing_and_cleans_temp_files() {
        let cache = DisabledJarCache;
        let payload = b"inline".to_vec();
        let sum = Checksum::of(&payload);
        assert!(!cache.known(&sum));

        let url = cache
            .resolve(&sum, &{ let p = payload.clone(); move || Ok(p.clone()) })
            .unwrap();
        let path = url.path().to_path_buf();
        assert!(path.exists());
        drop(url);
        assert!(!path.exists());
    }

    #[test]
    fn artifact_url_equality_uses_literal_form() {
        let a = ArtifactUrl::new(PathBuf::from("/x/y.jar"), false);
        let b = ArtifactUrl::new(PathBuf::from("/x/y.jar"), false);
        let c = ArtifactUrl::new(PathBuf::from("/x/./y.jar"), false);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

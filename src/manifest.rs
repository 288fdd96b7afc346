//! Persistent manifest of encrypted content
//!
//! The manifest maps change-detection fingerprints to blob metadata
//! (path, convergent key, blob HMAC). It is the authoritative record of
//! a backup; the content-addressed store is just a cache that could be
//! rebuilt from plaintext. On disk it is a stream of whitespace-delimited
//! JSON values: a reserved header object first, then one value per
//! entry.

use crate::crypto::{Key, Writer, HMAC_SIZE};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::scan::ScanResult;
use crate::worker;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, error, info};

/// One manifest record.
///
/// The fingerprint is the map key; `key` and `hmac` are the convergent
/// key and blob address of the file content observed when the entry was
/// created. Stale entries are fine: a metadata change produces a new
/// fingerprint and the old entry falls out through [`Manifest::diff`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "LocalHash")]
    pub fingerprint: Fingerprint,
    #[serde(rename = "Path")]
    pub relpath: String,
    #[serde(rename = "Key")]
    pub key: Key,
    #[serde(rename = "HMAC", with = "hmac_serde")]
    pub hmac: [u8; HMAC_SIZE],
}

/// Reserved leading object of the manifest file. Currently carries no
/// fields of its own; unknown keys round-trip untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestHeader {
    #[serde(flatten)]
    reserved: serde_json::Map<String, serde_json::Value>,
}

/// Additions/replacements and removals produced by [`Manifest::diff`].
#[derive(Debug, Default)]
pub struct ManifestDiff {
    /// Entries to insert or overwrite.
    pub change: Vec<ManifestEntry>,
    /// Entries whose fingerprint disappeared from the scanned set.
    pub remove: Vec<ManifestEntry>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.change.is_empty() && self.remove.is_empty()
    }
}

/// Thread-safe fingerprint → entry map with persistence.
pub struct Manifest {
    header: ManifestHeader,
    entries: Mutex<HashMap<Fingerprint, ManifestEntry>>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    /// An empty manifest with a fresh reserved header.
    pub fn new() -> Self {
        Manifest {
            header: ManifestHeader::default(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Read a manifest from a stream of JSON values: header first, then
    /// entries until EOF.
    pub fn load<R: Read>(reader: R) -> Result<Self> {
        let mut de = serde_json::Deserializer::from_reader(reader);

        let header = ManifestHeader::deserialize(&mut de)
            .map_err(|e| Error::ManifestFormat(format!("bad header: {e}")))?;
        // The save format once was a single JSON document with the
        // entries embedded; refuse it rather than load an empty map.
        for legacy_key in ["Entries", "entries", "LocalHash"] {
            if header.reserved.contains_key(legacy_key) {
                return Err(Error::ManifestFormat(
                    "legacy single-document manifest; re-save with a current version".into(),
                ));
            }
        }

        let mut entries = HashMap::new();
        loop {
            match ManifestEntry::deserialize(&mut de) {
                Ok(entry) => {
                    entries.insert(entry.fingerprint, entry);
                }
                Err(e) if e.is_eof() => break,
                Err(e) => return Err(Error::ManifestFormat(format!("bad entry: {e}"))),
            }
        }

        debug!(entries = entries.len(), "manifest loaded");
        Ok(Manifest {
            header,
            entries: Mutex::new(entries),
        })
    }

    /// Load from `path`; a missing file yields an empty manifest.
    pub fn load_path(path: &Path) -> Result<Self> {
        match File::open(path) {
            Ok(file) => Self::load(BufReader::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no manifest on disk, starting empty");
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write the header and every entry, newline-delimited.
    pub fn save<W: Write>(&self, mut writer: W) -> Result<()> {
        serde_json::to_writer(&mut writer, &self.header)?;
        writer.write_all(b"\n")?;

        let entries = self.entries.lock();
        for entry in entries.values() {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Save to `path`, truncating any previous manifest.
    pub fn save_path(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        self.save(BufWriter::new(file))?;
        debug!(path = %path.display(), entries = self.len(), "manifest saved");
        Ok(())
    }

    /// Assign a [`ManifestEntry`] to every scan result, in parallel.
    ///
    /// A result whose fingerprint is already present reuses the stored
    /// entry untouched; otherwise the file is opened, its convergent key
    /// computed, and the blob HMAC derived by encrypting to a discard
    /// sink. Any per-file error aborts the whole batch.
    pub fn resolve(
        &self,
        root: &Path,
        results: &[ScanResult],
        parallelism: usize,
    ) -> Result<Vec<ManifestEntry>> {
        let jobs: Vec<&ScanResult> = results.iter().collect();
        let outputs = worker::map_unordered(parallelism, jobs, |result| {
            self.resolve_one(root, result)
        });

        let mut entries = Vec::with_capacity(outputs.len());
        let mut first_err = None;
        let mut failures = 0usize;
        for output in outputs {
            match output {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    failures += 1;
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_err {
            error!(failures, "resolve aborted");
            return Err(e);
        }
        Ok(entries)
    }

    fn resolve_one(&self, root: &Path, result: &ScanResult) -> Result<ManifestEntry> {
        let fingerprint =
            Fingerprint::compute(&result.secret, &result.relpath, result.mtime, result.size);
        if let Some(entry) = self.entries.lock().get(&fingerprint) {
            return Ok(entry.clone());
        }

        let path = root.join(&result.relpath);
        let mut file = File::open(&path)?;
        // convergent() leaves the handle rewound to 0 for the Writer.
        let key = Key::convergent(result.secret.as_bytes(), &mut file)?;
        let hmac = Writer::new(file, key.clone()).encrypt(&mut io::sink())?;

        debug!(relpath = %result.relpath, "resolved fresh entry");
        Ok(ManifestEntry {
            fingerprint,
            relpath: result.relpath.clone(),
            key,
            hmac,
        })
    }

    /// Compare `entries` against the manifest's records under `prefix`.
    ///
    /// An in-prefix record whose fingerprint is absent from `entries` is
    /// a removal; an input entry whose fingerprint is absent from the
    /// manifest is a change. Records outside the prefix are ignored. A
    /// non-empty prefix is treated as a directory name (trailing `/`
    /// added); the empty prefix scopes the whole manifest.
    pub fn diff(&self, prefix: &str, entries: &[ManifestEntry]) -> ManifestDiff {
        let prefix = normalize_prefix(prefix);
        let incoming: HashSet<Fingerprint> =
            entries.iter().map(|e| e.fingerprint).collect();

        let map = self.entries.lock();
        let remove = map
            .values()
            .filter(|e| e.relpath.starts_with(&prefix) && !incoming.contains(&e.fingerprint))
            .cloned()
            .collect();
        let change = entries
            .iter()
            .filter(|e| !map.contains_key(&e.fingerprint))
            .cloned()
            .collect();

        ManifestDiff { change, remove }
    }

    /// Apply a diff atomically: insert every change, delete every
    /// removal by fingerprint.
    pub fn commit(&self, diff: &ManifestDiff) {
        let mut map = self.entries.lock();
        for entry in &diff.change {
            map.insert(entry.fingerprint, entry.clone());
        }
        for entry in &diff.remove {
            map.remove(&entry.fingerprint);
        }
    }

    /// The subset of `candidates` whose HMAC no retained entry
    /// references, i.e. the blobs that are safe to unlink.
    ///
    /// Distinct fingerprints can share an HMAC (a renamed file with
    /// identical content under the same secret), so the filter works on
    /// HMACs, never fingerprints.
    pub fn garbage_collectable(&self, candidates: &[ManifestEntry]) -> Vec<ManifestEntry> {
        let map = self.entries.lock();
        let retained: HashSet<&[u8; HMAC_SIZE]> = map.values().map(|e| &e.hmac).collect();
        candidates
            .iter()
            .filter(|c| !retained.contains(&c.hmac))
            .cloned()
            .collect()
    }

    /// Linear search by blob HMAC, for restoring a single blob file.
    pub fn find_entry_with_hmac(&self, hmac: &[u8; HMAC_SIZE]) -> Option<ManifestEntry> {
        self.entries
            .lock()
            .values()
            .find(|e| &e.hmac == hmac)
            .cloned()
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> Vec<ManifestEntry> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

/// Serde helper for the 64-byte HMAC, which is wider than the array
/// sizes serde derives handle natively. Encoded as a JSON array of
/// numbers like every other byte field.
mod hmac_serde {
    use crate::crypto::HMAC_SIZE;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; HMAC_SIZE], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(bytes.iter())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; HMAC_SIZE], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        bytes.as_slice().try_into().map_err(|_| {
            D::Error::custom(format!("expected {} bytes, got {}", HMAC_SIZE, bytes.len()))
        })
    }
}

//! Content-addressed artifact store.
//!
//! Artifacts are keyed by `(subject, node, output)` plus the fingerprint of
//! everything that went into producing them. Committed working directories
//! move under `objects/<subject>/<node>/<fingerprint>/`, and the index is
//! persisted next to them as CBOR so later runs can skip work that is
//! already done.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::sync::{PoisonError, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Fingerprint;
use crate::error::StoreError;
use crate::tool::{Outputs, WorkDir};
use crate::utils::copy_rec;

const INDEX_FILE: &str = "index.cbor";
const INDEX_VERSION: u32 = 1;

/// Output name recorded for nodes that declare no outputs, so their
/// completion can still be cached.
pub const DONE_MARKER: &str = "@done";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub subject: String,
    pub node: String,
    pub output: String,
}

impl ArtifactKey {
    pub fn new(
        subject: impl Into<String>,
        node: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            node: node.into(),
            output: output.into(),
        }
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}.{}", self.subject, self.node, self.output)
    }
}

/// One registered output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub key: ArtifactKey,
    pub fingerprint: Fingerprint,
    pub paths: Vec<Utf8PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct Index {
    version: u32,
    artifacts: Vec<Artifact>,
}

type Entries = HashMap<ArtifactKey, HashMap<Fingerprint, Vec<Utf8PathBuf>>>;

/// Shared by all workers; reads are concurrent, registration is serialized.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    root: Option<Utf8PathBuf>,
    entries: RwLock<Entries>,
}

impl ArtifactStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens (or creates) a persistent store rooted at `root`. A missing index
    /// is an empty store; an unreadable one is an error. Registered paths are
    /// absolute.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))?;
        let root = root.canonicalize_utf8()?;

        let path = root.join(INDEX_FILE);
        let mut entries = Entries::new();

        if path.exists() {
            let file = BufReader::new(File::open(&path)?);
            let index: Index = ciborium::from_reader(file)
                .map_err(|err| StoreError::Decode(path.clone(), err.to_string()))?;

            if index.version != INDEX_VERSION {
                tracing::warn!(
                    "ignoring artifact index {} with version {}",
                    path,
                    index.version
                );
            } else {
                for artifact in index.artifacts {
                    entries
                        .entry(artifact.key)
                        .or_default()
                        .insert(artifact.fingerprint, artifact.paths);
                }
            }
        }

        tracing::debug!("opened artifact store at {} ({} keys)", root, entries.len());

        Ok(Self {
            root: Some(root),
            entries: RwLock::new(entries),
        })
    }

    pub fn root(&self) -> Option<&Utf8Path> {
        self.root.as_deref()
    }

    /// Registers an artifact.
    ///
    /// Registering the same key and fingerprint twice is a no-op when the
    /// paths agree, and an error when they don't.
    pub fn put(&self, artifact: Artifact) -> Result<(), StoreError> {
        self.put_all(vec![artifact])
    }

    /// Registers several artifacts at once: either all of them are
    /// registered, or none is and the first conflict is returned.
    pub fn put_all(&self, artifacts: Vec<Artifact>) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        check(&entries, &artifacts)?;

        for artifact in artifacts {
            entries
                .entry(artifact.key)
                .or_default()
                .insert(artifact.fingerprint, artifact.paths);
        }

        Ok(())
    }

    /// The registered paths, without checking the filesystem.
    pub fn get(&self, key: &ArtifactKey, fingerprint: Fingerprint) -> Option<Artifact> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);

        entries
            .get(key)
            .and_then(|versions| versions.get(&fingerprint))
            .map(|paths| Artifact {
                key: key.clone(),
                fingerprint,
                paths: paths.clone(),
            })
    }

    /// Like [`ArtifactStore::get`], but an artifact whose files have
    /// disappeared counts as absent.
    pub fn lookup(&self, key: &ArtifactKey, fingerprint: Fingerprint) -> Option<Artifact> {
        self.get(key, fingerprint)
            .filter(|artifact| artifact.paths.iter().all(|path| path.exists()))
    }

    /// Moves a finished working directory into the object area, registers
    /// every output under `fingerprint` and returns the outputs rewritten to
    /// their new locations. A node without outputs is registered under
    /// [`DONE_MARKER`].
    ///
    /// Conflicts with existing registrations are detected before anything on
    /// disk changes, so a failed commit never touches stored files.
    /// Stores without a root keep the directory where it is.
    pub fn commit_dir(
        &self,
        workdir: WorkDir,
        subject: &str,
        node: &str,
        fingerprint: Fingerprint,
        outputs: &Outputs,
    ) -> Result<Outputs, StoreError> {
        let target = self.root.as_ref().map(|root| {
            root.join("objects")
                .join(subject)
                .join(node)
                .join(fingerprint.to_hex())
        });

        let mut moved = Outputs::new();

        for (name, paths) in outputs {
            let paths = paths
                .iter()
                .map(|path| match (&target, path.strip_prefix(workdir.path())) {
                    (Some(target), Ok(relative)) => target.join(relative),
                    _ => path.clone(),
                })
                .collect();

            moved.insert(name.clone(), paths);
        }

        let artifacts: Vec<Artifact> = if moved.is_empty() {
            vec![Artifact {
                key: ArtifactKey::new(subject, node, DONE_MARKER),
                fingerprint,
                paths: Vec::new(),
            }]
        } else {
            moved
                .iter()
                .map(|(name, paths)| Artifact {
                    key: ArtifactKey::new(subject, node, name),
                    fingerprint,
                    paths: paths.clone(),
                })
                .collect()
        };

        check(
            &self.entries.read().unwrap_or_else(PoisonError::into_inner),
            &artifacts,
        )?;

        match &target {
            None => {
                workdir.keep();
            }
            Some(target) => {
                if target.exists() {
                    fs::remove_dir_all(target)?;
                }

                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }

                if fs::rename(workdir.path(), target).is_err() {
                    copy_rec(workdir.path(), target)?;
                }

                // Dropping the guard removes the source if it was copied
                // rather than renamed.
                drop(workdir);
            }
        }

        self.put_all(artifacts)?;

        Ok(moved)
    }

    /// Writes the index to disk. A no-op for in-memory stores.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(root) = &self.root else {
            return Ok(());
        };

        let mut artifacts: Vec<Artifact> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);

            entries
                .iter()
                .flat_map(|(key, versions)| {
                    versions.iter().map(|(fingerprint, paths)| Artifact {
                        key: key.clone(),
                        fingerprint: *fingerprint,
                        paths: paths.clone(),
                    })
                })
                .collect()
        };

        artifacts.sort_by(|a, b| (&a.key, a.fingerprint).cmp(&(&b.key, b.fingerprint)));

        let index = Index {
            version: INDEX_VERSION,
            artifacts,
        };

        let path = root.join(INDEX_FILE);
        let temp = root.join(format!("{INDEX_FILE}.tmp"));

        let file = BufWriter::new(File::create(&temp)?);
        ciborium::into_writer(&index, file)
            .map_err(|err| StoreError::Encode(path.clone(), err.to_string()))?;
        fs::rename(&temp, &path)?;

        Ok(())
    }

    /// Number of registered `(key, fingerprint)` pairs.
    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fails on the first artifact whose key and fingerprint are registered
/// with different paths.
fn check(entries: &Entries, artifacts: &[Artifact]) -> Result<(), StoreError> {
    for artifact in artifacts {
        let existing = entries
            .get(&artifact.key)
            .and_then(|versions| versions.get(&artifact.fingerprint));

        if let Some(existing) = existing
            && *existing != artifact.paths
        {
            return Err(StoreError::DuplicateArtifact {
                key: artifact.key.clone(),
                fingerprint: artifact.fingerprint,
                existing: existing.clone(),
                attempted: artifact.paths.clone(),
            });
        }
    }

    Ok(())
}

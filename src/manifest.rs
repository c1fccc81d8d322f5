//! Subject discovery over a BIDS-like input tree.
//!
//! A [`SubjectManifest`] is the immutable set of input files for one
//! processing unit (a subject, or a subject/session pair). Manifests are
//! produced by [`discover`], which walks
//! `sub-<label>/[ses-<label>/]<modality>/<file>` and files every image under
//! the role named by its BIDS suffix (`T1w`, `bold`, ...).

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use glob::glob;

use crate::core::split_ext;
use crate::error::ConfigError;

/// The resolved input files of one processing unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectManifest {
    subject: String,
    session: Option<String>,
    inputs: BTreeMap<String, Vec<Utf8PathBuf>>,
}

impl SubjectManifest {
    /// Creates an empty manifest. `subject` and `session` are bare labels,
    /// without the `sub-`/`ses-` prefixes.
    pub fn new(subject: impl Into<String>, session: Option<String>) -> Self {
        Self {
            subject: subject.into(),
            session,
            inputs: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, role: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        self.add_input(role, path);
        self
    }

    fn add_input(&mut self, role: impl Into<String>, path: impl Into<Utf8PathBuf>) {
        let paths = self.inputs.entry(role.into()).or_default();
        paths.push(path.into());
        paths.sort();
        paths.dedup();
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn inputs(&self) -> &BTreeMap<String, Vec<Utf8PathBuf>> {
        &self.inputs
    }

    pub fn get(&self, role: &str) -> Option<&[Utf8PathBuf]> {
        self.inputs
            .get(role)
            .map(Vec::as_slice)
            .filter(|paths| !paths.is_empty())
    }

    /// `sub-01` or `sub-01_ses-pre`, used for log lines and directory names.
    pub fn label(&self) -> String {
        match &self.session {
            Some(session) => format!("sub-{}_ses-{}", self.subject, session),
            None => format!("sub-{}", self.subject),
        }
    }
}

/// A file name decomposed according to the BIDS naming convention.
///
/// `sub-01_ses-retest_task-rest_bold.nii.gz` yields subject `01`, session
/// `retest`, entities `[task-rest]`, suffix `bold`, extension `.nii.gz`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidsName {
    /// Whether the name uses `tpl-` (template) rather than `sub-`.
    pub template: bool,
    pub subject: String,
    pub session: Option<String>,
    /// Remaining `key-value` entities in file order.
    pub entities: Vec<(String, String)>,
    /// Everything before the suffix, e.g. `sub-01_ses-retest_task-rest`.
    pub stem: String,
    pub suffix: String,
    pub extension: String,
}

impl BidsName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let (name, extension) = split_ext(file_name);
        let name = Utf8Path::new(name).file_name()?;
        let (stem, suffix) = name.rsplit_once('_')?;

        let mut parts = stem.split('_');
        let (template, subject) = match parts.next()?.split_once('-')? {
            ("sub", label) => (false, label),
            ("tpl", label) => (true, label),
            _ => return None,
        };

        if !is_label(subject) || suffix.is_empty() {
            return None;
        }

        let mut session = None;
        let mut entities = Vec::new();

        for part in parts {
            let (key, value) = part.split_once('-')?;
            if !is_label(value) {
                return None;
            }
            if key == "ses" && session.is_none() && entities.is_empty() {
                session = Some(value.to_string());
            } else {
                entities.push((key.to_string(), value.to_string()));
            }
        }

        Some(Self {
            template,
            subject: subject.to_string(),
            session,
            entities,
            stem: stem.to_string(),
            suffix: suffix.to_string(),
            extension: extension.to_string(),
        })
    }

    pub fn entity(&self, key: &str) -> Option<&str> {
        self.entities
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn is_label(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Image extensions picked up during discovery.
const IMAGE_EXTENSIONS: &[&str] = &[".nii", ".nii.gz"];

/// Walks `root` and builds one manifest per subject (or subject/session).
///
/// `participants` restricts discovery to the given labels; both `01` and
/// `sub-01` are accepted. Subjects without a usable file are skipped with a
/// warning, as are files whose name does not parse or whose subject/session
/// disagree with their directory.
pub fn discover(
    root: impl AsRef<Utf8Path>,
    participants: &[String],
) -> Result<Vec<SubjectManifest>, ConfigError> {
    let root = root.as_ref();

    if !root.is_dir() {
        return Err(ConfigError::InputRoot(root.to_path_buf()));
    }

    let root = Utf8PathBuf::try_from(fs::canonicalize(root).map_err(|source| {
        ConfigError::Read {
            path: root.to_path_buf(),
            source,
        }
    })?)?;

    let wanted: Vec<&str> = participants
        .iter()
        .map(|p| p.strip_prefix("sub-").unwrap_or(p))
        .collect();

    let mut manifests = Vec::new();

    for subject_dir in sorted_dirs(&root, "sub-*")? {
        let Some(label) = subject_dir
            .file_name()
            .and_then(|name| name.strip_prefix("sub-"))
            .filter(|label| is_label(label))
        else {
            tracing::warn!("skipping malformed subject directory {}", subject_dir);
            continue;
        };

        if !wanted.is_empty() && !wanted.contains(&label) {
            continue;
        }

        let sessions = sorted_dirs(&subject_dir, "ses-*")?;

        if sessions.is_empty() {
            push_manifest(&mut manifests, collect(&subject_dir, label, None)?);
            continue;
        }

        for session_dir in sessions {
            let Some(session) = session_dir
                .file_name()
                .and_then(|name| name.strip_prefix("ses-"))
                .filter(|label| is_label(label))
            else {
                tracing::warn!("skipping malformed session directory {}", session_dir);
                continue;
            };

            let manifest = collect(&session_dir, label, Some(session.to_string()))?;
            push_manifest(&mut manifests, manifest);
        }
    }

    Ok(manifests)
}

fn push_manifest(manifests: &mut Vec<SubjectManifest>, manifest: SubjectManifest) {
    if manifest.inputs.is_empty() {
        tracing::warn!("skipping {}: no usable input files", manifest.label());
    } else {
        tracing::debug!(
            "discovered {} with roles {:?}",
            manifest.label(),
            manifest.inputs.keys().collect::<Vec<_>>()
        );
        manifests.push(manifest);
    }
}

fn sorted_dirs(parent: &Utf8Path, pattern: &str) -> Result<Vec<Utf8PathBuf>, ConfigError> {
    let pattern = parent.join(pattern);
    let mut dirs = Vec::new();

    for entry in glob(pattern.as_str())? {
        match entry {
            Ok(path) => {
                let path = Utf8PathBuf::try_from(path)?;
                if path.is_dir() {
                    dirs.push(path);
                }
            }
            Err(err) => tracing::warn!("skipping unreadable entry: {}", err),
        }
    }

    dirs.sort();
    Ok(dirs)
}

fn collect(
    dir: &Utf8Path,
    subject: &str,
    session: Option<String>,
) -> Result<SubjectManifest, ConfigError> {
    let mut manifest = SubjectManifest::new(subject, session);
    let pattern = dir.join("*").join("*");

    for entry in glob(pattern.as_str())? {
        let path = match entry {
            Ok(path) => Utf8PathBuf::try_from(path)?,
            Err(err) => {
                tracing::warn!("skipping unreadable entry: {}", err);
                continue;
            }
        };

        let Some(file_name) = path.file_name() else {
            continue;
        };

        if !path.is_file() || !IMAGE_EXTENSIONS.iter().any(|ext| file_name.ends_with(ext)) {
            continue;
        }

        let Some(name) = BidsName::parse(file_name) else {
            tracing::warn!("skipping {}: not a BIDS file name", path);
            continue;
        };

        if name.subject != manifest.subject || name.session != manifest.session {
            tracing::warn!("skipping {}: name does not match its directory", path);
            continue;
        }

        manifest.add_input(name.suffix, path);
    }

    Ok(manifest)
}

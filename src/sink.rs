//! Staging of final outputs into a BIDS-derivatives tree.
//!
//! Each sink declaration names an output of its node and a manifest role
//! whose first file is the naming reference. The destination directory and
//! file name are derived from that reference:
//!
//! ```text
//! <base>/<out_path_base>/sub-<s>[/ses-<t>]/<modality>/
//!     <stem>[_space-<x>][_desc-<y>][_<key>-<value>...][_<extra>][_<suffix>][_<dtype>]<ext>
//! ```
//!
//! Outputs with several files and no `extra_values` get a four digit index
//! right after the suffix instead.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::core::{Fingerprint, split_ext};
use crate::error::SinkError;
use crate::graph::PipelineGraph;
use crate::manifest::{BidsName, SubjectManifest};
use crate::record::RunRecord;
use crate::template::SinkSpec;
use crate::utils::as_overhead;

/// What one [`DataSink::materialize`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub written: Vec<Utf8PathBuf>,
    pub unchanged: Vec<Utf8PathBuf>,
    pub sidecars: Vec<Utf8PathBuf>,
}

impl SinkReport {
    fn merge(&mut self, other: SinkReport) {
        self.written.extend(other.written);
        self.unchanged.extend(other.unchanged);
        self.sidecars.extend(other.sidecars);
    }
}

#[derive(Debug, Clone)]
pub struct DataSink {
    root: Utf8PathBuf,
}

impl DataSink {
    pub fn new(base: impl AsRef<Utf8Path>, out_path_base: &str) -> Self {
        Self {
            root: base.as_ref().join(out_path_base),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Destination paths for `files` staged under `spec`.
    pub fn destinations(
        &self,
        manifest: &SubjectManifest,
        spec: &SinkSpec,
        files: &[Utf8PathBuf],
    ) -> Result<Vec<Utf8PathBuf>, SinkError> {
        let source = manifest
            .get(&spec.source)
            .and_then(|paths| paths.first())
            .ok_or_else(|| SinkError::MissingSource {
                subject: manifest.label(),
                role: spec.source.clone(),
            })?;

        let name = source
            .file_name()
            .and_then(BidsName::parse)
            .ok_or_else(|| SinkError::InvalidSource(source.clone()))?;

        let modality = source
            .parent()
            .and_then(Utf8Path::file_name)
            .ok_or_else(|| SinkError::InvalidSource(source.clone()))?;

        let prefix = if name.template { "tpl" } else { "sub" };
        let mut dir = self.root.join(format!("{prefix}-{}", name.subject));

        if let Some(session) = &name.session {
            dir.push(format!("ses-{session}"));
        }

        dir.push(modality);

        let Some(first) = files.first() else {
            return Ok(Vec::new());
        };

        let (_, ext) = split_ext(first.as_str());
        let ext = match spec.compress {
            Some(true) if !ext.ends_with(".gz") => format!("{ext}.gz"),
            Some(false) => ext.strip_suffix(".gz").unwrap_or(ext).to_string(),
            _ => ext.to_string(),
        };

        if let Some(extra) = &spec.extra_values
            && extra.len() < files.len()
        {
            return Err(SinkError::ExtraValues {
                output: spec.output.clone(),
                files: files.len(),
                labels: extra.len(),
            });
        }

        let mut base = name.stem.clone();

        if let Some(space) = &spec.space {
            base.push_str(&format!("_space-{space}"));
        }

        if let Some(desc) = &spec.desc {
            base.push_str(&format!("_desc-{desc}"));
        }

        for entity in &spec.entities {
            base.push_str(&format!("_{}-{}", entity.key, entity.value));
        }

        let suffix = spec
            .suffix
            .as_ref()
            .map(|suffix| format!("_{suffix}"))
            .unwrap_or_default();

        let dtype = if spec.keep_dtype {
            format!("_{}", name.suffix)
        } else {
            String::new()
        };

        let indexed = files.len() > 1 && spec.extra_values.is_none();

        let destinations = (0..files.len())
            .map(|i| {
                let file = match (&spec.extra_values, indexed) {
                    (Some(extra), _) => format!("{base}_{}{suffix}{dtype}{ext}", extra[i]),
                    (None, true) => format!("{base}{suffix}{i:04}{dtype}{ext}"),
                    (None, false) => format!("{base}{suffix}{dtype}{ext}"),
                };
                dir.join(file)
            })
            .collect();

        Ok(destinations)
    }

    /// Copies every declared final output of a successful run into the
    /// derivatives tree. Files already in place with identical content are
    /// left alone.
    pub fn materialize(
        &self,
        graph: &PipelineGraph,
        record: &RunRecord,
    ) -> Result<SinkReport, SinkError> {
        if !record.is_success() {
            return Err(SinkError::IncompleteRun(record.label.clone()));
        }

        let start = Instant::now();
        let mut report = SinkReport::default();

        for (index, node) in graph.nodes() {
            for spec in &node.sinks {
                let files = record.results[index.index()]
                    .outputs
                    .get(&spec.output)
                    .ok_or_else(|| {
                        SinkError::MissingArtifact(format!("{}.{}", node.name, spec.output))
                    })?;

                report.merge(self.stage(graph.manifest(), spec, files)?);
            }
        }

        tracing::info!(
            "{}: staged {} files ({} unchanged) {}",
            record.label,
            report.written.len(),
            report.unchanged.len(),
            as_overhead(start)
        );

        Ok(report)
    }

    fn stage(
        &self,
        manifest: &SubjectManifest,
        spec: &SinkSpec,
        files: &[Utf8PathBuf],
    ) -> Result<SinkReport, SinkError> {
        let mut report = SinkReport::default();
        let destinations = self.destinations(manifest, spec, files)?;

        for (source, target) in files.iter().zip(&destinations) {
            let write_err = |source| SinkError::Write {
                path: target.clone(),
                source,
            };

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }

            match place(source, target).map_err(write_err)? {
                true => report.written.push(target.clone()),
                false => report.unchanged.push(target.clone()),
            }
        }

        if let [single] = destinations.as_slice()
            && !spec.meta.is_empty()
        {
            let (stem, _) = split_ext(single.as_str());
            let sidecar = Utf8PathBuf::from(format!("{stem}.json"));
            let text = serde_json::to_string_pretty(&spec.meta)?;

            let current = fs::read_to_string(&sidecar).ok();
            if current.as_deref() != Some(text.as_str()) {
                fs::write(&sidecar, &text).map_err(|source| SinkError::Write {
                    path: sidecar.clone(),
                    source,
                })?;
            }

            report.sidecars.push(sidecar);
        }

        Ok(report)
    }
}

/// Puts `source` at `target`, compressing or decompressing as the two
/// extensions require. Returns whether `target` changed.
fn place(source: &Utf8Path, target: &Utf8Path) -> io::Result<bool> {
    let compress = match (source.as_str().ends_with(".gz"), target.as_str().ends_with(".gz")) {
        (false, true) => Some(true),
        (true, false) => Some(false),
        _ => None,
    };

    let Some(compress) = compress else {
        if target.exists() && Fingerprint::hash_file(source)? == Fingerprint::hash_file(target)? {
            return Ok(false);
        }

        if target.exists() {
            fs::remove_file(target)?;
        }

        if fs::hard_link(source, target).is_err() {
            fs::copy(source, target)?;
        }

        return Ok(true);
    };

    let temp = Utf8PathBuf::from(format!("{target}.tmp"));
    let reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(File::create(&temp)?);

    if compress {
        let mut reader = reader;
        let mut encoder = GzEncoder::new(writer, Compression::default());
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?.flush()?;
    } else {
        let mut decoder = GzDecoder::new(reader);
        io::copy(&mut decoder, &mut writer)?;
        writer.flush()?;
    }

    if target.exists() && Fingerprint::hash_file(&temp)? == Fingerprint::hash_file(target)? {
        fs::remove_file(&temp)?;
        return Ok(false);
    }

    fs::rename(&temp, target)?;
    Ok(true)
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing and cache validation.
///
/// In `neuroflow` this serves two purposes:
/// 1. It fingerprints the resolved inputs of a node (parameters, input file
///    contents, upstream fingerprints, tool identity) to decide whether a
///    stored artifact can be reused.
/// 2. It names the object directories inside the artifact store, so two
///    executions with the same fingerprint always land in the same place.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl<T> From<T> for Fingerprint
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Fingerprint(value.into())
    }
}

impl Fingerprint {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// First 12 hex characters, enough to tell fingerprints apart in logs.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental fingerprint builder.
///
/// Every field is written with a tag and a length prefix, so `("ab", "c")`
/// and `("a", "bc")` never collide.
pub struct FingerprintBuilder(blake3::Hasher);

impl FingerprintBuilder {
    pub fn new(domain: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain.as_bytes());
        Self(hasher)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
    }

    pub fn field(&mut self, name: &str, value: impl AsRef<[u8]>) -> &mut Self {
        self.write(b"f");
        self.write(name.as_bytes());
        self.write(value.as_ref());
        self
    }

    pub fn fingerprint(&mut self, name: &str, value: Fingerprint) -> &mut Self {
        self.field(name, value.as_bytes())
    }

    pub fn finish(&self) -> Fingerprint {
        self.0.finalize().into()
    }
}

/// Shared flag used to stop a run from the outside (e.g. Ctrl-C).
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Exit codes treated as transient by default: `EX_TEMPFAIL` and the codes
/// shells report for SIGKILL and SIGTERM.
pub const DEFAULT_TRANSIENT_EXIT_CODES: &[i32] = &[75, 137, 143];

/// Execution settings shared by the scheduler and the tool adapters.
///
/// Everything that would otherwise come from process-wide environment state
/// (thread counts, locale, search path) lives in [`Settings::base_env`] and is
/// handed to each subprocess explicitly.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum number of nodes executing at the same time.
    pub max_concurrency: usize,
    /// How many times a transiently failing node is retried.
    pub retries: u32,
    /// Fixed pause before each retry.
    pub retry_delay: Duration,
    /// Timeout for nodes that don't declare their own.
    pub default_timeout: Option<Duration>,
    /// Exit codes classified as transient.
    pub transient_exit_codes: Vec<i32>,
    /// Keep the working directories of failed attempts for inspection.
    pub keep_failed_workdirs: bool,
    /// Root for scratch directories, the artifact store and failure logs.
    pub work_dir: Utf8PathBuf,
    /// Environment every tool process starts from.
    pub base_env: BTreeMap<String, String>,
    /// How often a running subprocess is polled for exit, timeout and
    /// cancellation.
    pub poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let mut base_env = BTreeMap::new();

        if let Ok(path) = std::env::var("PATH") {
            base_env.insert("PATH".to_string(), path);
        }

        base_env.insert("LC_ALL".to_string(), "C.UTF-8".to_string());
        base_env.insert("OMP_NUM_THREADS".to_string(), "1".to_string());
        base_env.insert(
            "ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS".to_string(),
            "1".to_string(),
        );

        Self {
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            retries: 1,
            retry_delay: Duration::from_secs(5),
            default_timeout: None,
            transient_exit_codes: DEFAULT_TRANSIENT_EXIT_CODES.to_vec(),
            keep_failed_workdirs: true,
            work_dir: Utf8PathBuf::from("work"),
            base_env,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl Settings {
    pub fn with_work_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the thread count every tool sees through the usual OpenMP and ITK
    /// variables.
    pub fn with_tool_threads(mut self, threads: usize) -> Self {
        let threads = threads.max(1).to_string();
        self.base_env
            .insert("OMP_NUM_THREADS".to_string(), threads.clone());
        self.base_env
            .insert("ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS".to_string(), threads);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.base_env.insert(key.into(), value.into());
        self
    }

    pub fn store_dir(&self) -> Utf8PathBuf {
        self.work_dir.join("store")
    }

    pub fn scratch_dir(&self) -> Utf8PathBuf {
        self.work_dir.join("scratch")
    }

    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.work_dir.join("logs")
    }
}

/// Splits a file name into stem and extension, treating a trailing `.gz` as
/// part of a double extension (`brain.nii.gz` -> `brain`, `.nii.gz`).
pub fn split_ext(name: &str) -> (&str, &str) {
    let file = Utf8Path::new(name).file_name().unwrap_or(name);
    let offset = name.len() - file.len();

    let cut = match file.strip_suffix(".gz") {
        Some(inner) => inner.rfind('.').unwrap_or(inner.len()),
        None => file.rfind('.').unwrap_or(file.len()),
    };

    // Hidden files like `.bashrc` have no extension.
    let cut = if cut == 0 && !file.ends_with(".gz") {
        file.len()
    } else {
        cut
    };

    name.split_at(offset + cut)
}

//! Configuration for batch signing.
//!
//! Everything here has a default, so a settings file only needs the keys it changes:
//!
//! ```json
//! { "destination": "/srv/signed", "concurrency": 2, "sign": { "reason": "Approved" } }
//! ```

use crate::error::{Error, Result};
use crate::signatures::SignOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for the default worker count.
const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Batch signing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// Directory that receives signed files when a run does not name one
    pub destination: Option<PathBuf>,

    /// Files in flight at once
    pub concurrency: usize,

    /// Ceiling on one signing call, in seconds
    pub signing_timeout_secs: u64,

    /// Pause before the single read retry, in milliseconds
    pub read_retry_backoff_ms: u64,

    /// Width of the visible signature box, in points
    pub box_width: f64,

    /// Height of the visible signature box, in points
    pub box_height: f64,

    /// Appended to the input file stem to name the output
    pub output_suffix: String,

    /// PEM files with trusted root certificates
    pub trusted_roots: Vec<PathBuf>,

    /// Serialize calls into the private key
    pub exclusive_session: bool,

    /// Signature dictionary and appearance options
    pub sign: SignOptions,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SignerConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self {
            destination: None,
            concurrency: num_cpus::get().clamp(1, DEFAULT_MAX_CONCURRENCY),
            signing_timeout_secs: 30,
            read_retry_backoff_ms: 100,
            box_width: 200.0,
            box_height: 50.0,
            output_suffix: "-signed".to_string(),
            trusted_roots: Vec::new(),
            exclusive_session: false,
            sign: SignOptions::default(),
        }
    }

    /// Load a JSON settings file. Missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        log::debug!("loaded settings from {}", path.display());
        Ok(config)
    }

    /// Set the remembered destination directory.
    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// The destination for a run: `explicit` when given, else the remembered one.
    ///
    /// There is no fallback to the working directory.
    pub fn resolve_destination(&self, explicit: Option<PathBuf>) -> Result<PathBuf> {
        explicit.or_else(|| self.destination.clone()).ok_or_else(|| {
            Error::Config("no destination directory given and none set in the settings".to_string())
        })
    }

    /// Set the number of files in flight.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the per-file signing timeout.
    pub fn with_signing_timeout(mut self, timeout: Duration) -> Self {
        self.signing_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the read retry backoff.
    pub fn with_read_retry_backoff(mut self, backoff: Duration) -> Self {
        self.read_retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the visible signature box size.
    pub fn with_box_size(mut self, width: f64, height: f64) -> Self {
        self.box_width = width;
        self.box_height = height;
        self
    }

    /// Set the output file suffix.
    pub fn with_output_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.output_suffix = suffix.into();
        self
    }

    /// Add a trusted root PEM file.
    pub fn with_trusted_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.trusted_roots.push(path.into());
        self
    }

    /// Serialize calls into the private key.
    pub fn with_exclusive_session(mut self, exclusive: bool) -> Self {
        self.exclusive_session = exclusive;
        self
    }

    /// Set the signature options.
    pub fn with_sign_options(mut self, options: SignOptions) -> Self {
        self.sign = options;
        self
    }

    /// Per-file signing timeout.
    pub fn signing_timeout(&self) -> Duration {
        Duration::from_secs(self.signing_timeout_secs)
    }

    /// Read retry backoff.
    pub fn read_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.read_retry_backoff_ms)
    }

    /// Check the values a settings file could get wrong.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.signing_timeout_secs == 0 {
            return Err(Error::Config("signing_timeout_secs must be at least 1".to_string()));
        }
        for (name, value) in [("box_width", self.box_width), ("box_height", self.box_height)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::Config(format!("{} must be positive, got {}", name, value)));
            }
        }
        if self.output_suffix.is_empty() || self.output_suffix.contains(['/', '\\']) {
            return Err(Error::Config(format!(
                "output_suffix '{}' must be non-empty and contain no path separators",
                self.output_suffix
            )));
        }
        if self.destination.as_ref().is_some_and(|d| d.as_os_str().is_empty()) {
            return Err(Error::Config("destination must not be empty".to_string()));
        }
        if self.sign.appearance.font_size <= 0.0 {
            return Err(Error::Config("appearance font_size must be positive".to_string()));
        }
        if self.sign.contents_size.is_some_and(|size| size < 1024) {
            return Err(Error::Config("contents_size below 1024 bytes cannot hold a CMS".to_string()));
        }
        Ok(())
    }
}

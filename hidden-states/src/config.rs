use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::select::Architecture;

/// Configuration errors.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Cannot open configuration: {}", path.to_string_lossy()))]
    Open { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot parse configuration"))]
    Parse { source: serde_json::Error },
}

/// Hidden state capture configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub(crate) architecture: Architecture,
    pub(crate) encode_quantized: bool,
    pub(crate) output: PathBuf,
}

impl CaptureConfig {
    /// Read a configuration from JSON.
    ///
    /// Missing fields take their default values.
    pub fn from_json_reader(reader: impl Read) -> Result<Self, ConfigError> {
        serde_json::from_reader(reader).context(ParseSnafu)
    }

    /// Read a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).context(OpenSnafu { path })?;
        Self::from_json_reader(BufReader::new(file))
    }

    /// Model architecture, selects architecture-specific outputs.
    ///
    /// Default: `Architecture::Generic`
    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        self
    }

    /// Whether quantized tensors are dequantized and written.
    ///
    /// When disabled, quantized tensors still take a tensor id, but no
    /// records are written for them.
    ///
    /// Default: `true`
    pub fn encode_quantized(mut self, encode_quantized: bool) -> Self {
        self.encode_quantized = encode_quantized;
        self
    }

    /// Path of the output table.
    ///
    /// Default: `hidden-states.csv`
    pub fn output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        self
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            architecture: Architecture::Generic,
            encode_quantized: true,
            output: PathBuf::from("hidden-states.csv"),
        }
    }
}

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Name prefix of transformer layer outputs.
pub static LAYER_OUTPUT_PREFIX: &str = "l_out";

/// Additional outputs captured for the WavTokenizer decoder.
pub static WAVTOKENIZER_DEC_OUTPUTS: &[&str] = &["posnet_out", "convnext_out"];

/// Model architecture family.
///
/// Only architectures that change tensor selection are distinguished,
/// every other architecture is `Generic`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq)]
#[serde(from = "String")]
pub enum Architecture {
    #[default]
    Generic,

    /// WavTokenizer decoder (`wavtokenizer-dec`).
    WavTokenizerDec,
}

impl Architecture {
    /// Get the architecture for a llama.cpp architecture name.
    ///
    /// Unknown names map to `Architecture::Generic`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "wavtokenizer-dec" => Architecture::WavTokenizerDec,
            _ => Architecture::Generic,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Generic => write!(f, "generic"),
            Architecture::WavTokenizerDec => write!(f, "wavtokenizer-dec"),
        }
    }
}

impl FromStr for Architecture {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl From<String> for Architecture {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

/// Decides which tensors are captured.
///
/// Selection must only depend on the tensor name, since it is evaluated
/// before the tensor's data exists.
pub trait TensorSelector {
    /// Whether the tensor with the given name should be captured.
    fn accepts(&self, name: &str) -> bool;
}

/// Selects transformer layer outputs.
///
/// Accepts names starting with `l_out`. For the WavTokenizer decoder,
/// names starting with `posnet_out` or `convnext_out` are accepted as
/// well.
#[derive(Clone, Copy, Debug, Default)]
pub struct LayerOutputSelector {
    architecture: Architecture,
}

impl LayerOutputSelector {
    /// Construct a selector for a model architecture.
    pub fn new(architecture: Architecture) -> Self {
        LayerOutputSelector { architecture }
    }

    /// Architecture the selector was constructed for.
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }
}

impl TensorSelector for LayerOutputSelector {
    fn accepts(&self, name: &str) -> bool {
        if name.starts_with(LAYER_OUTPUT_PREFIX) {
            return true;
        }

        match self.architecture {
            Architecture::WavTokenizerDec => WAVTOKENIZER_DEC_OUTPUTS
                .iter()
                .any(|prefix| name.starts_with(prefix)),
            Architecture::Generic => false,
        }
    }
}

//! Error types of the crate.
//!
//! Every module defines its own error enum, they are re-exported here.

use std::error::Error;

pub use crate::config::ConfigError;
pub use crate::dequantize::DequantizeError;
pub use crate::driver::CaptureError;
pub use crate::encode::EncodeError;
pub use crate::sink::SinkError;
pub use crate::stage::{CandleAdapterError, StageError};
pub use crate::tensor::EncodingError;

/// Error of a backing store transfer.
///
/// Backing stores wrap arbitrary device runtimes, their errors are
/// boxed at the trait boundary.
pub type BoxedError = Box<dyn Error + Send + Sync>;

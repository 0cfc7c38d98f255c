use std::fmt;
use std::str::FromStr;

use candle_core::quantized::GgmlDType;
use half::{bf16, f16};
use snafu::Snafu;

/// Tensor encoding errors.
#[derive(Debug, Snafu)]
pub enum EncodingError {
    #[snafu(display("Unsupported tensor encoding, ggml type id: {id}"))]
    UnsupportedTypeId { id: u32 },

    #[snafu(display("Unsupported tensor encoding: {name}"))]
    UnsupportedTypeName { name: String },
}

/// Reads one element from its little-endian bytes and widens it to `f32`.
///
/// The slice must hold at least `Encoding::type_size` bytes.
pub type ScalarReader = fn(&[u8]) -> f32;

/// Numeric encoding of tensor elements.
///
/// This is the closed set of ggml types that can be turned into `f32`
/// values. Canonical encodings store one element per scalar and are read
/// in place, block encodings pack `block_size` elements into `type_size`
/// bytes and have to be decoded first.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Encoding {
    F32,
    F16,
    BF16,
    I8,
    I16,
    I32,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q2K,
    Q3K,
    Q4K,
    Q5K,
    Q6K,
    Q8K,
}

impl Encoding {
    /// All supported encodings.
    pub const ALL: [Encoding; 17] = [
        Encoding::F32,
        Encoding::F16,
        Encoding::BF16,
        Encoding::I8,
        Encoding::I16,
        Encoding::I32,
        Encoding::Q4_0,
        Encoding::Q4_1,
        Encoding::Q5_0,
        Encoding::Q5_1,
        Encoding::Q8_0,
        Encoding::Q2K,
        Encoding::Q3K,
        Encoding::Q4K,
        Encoding::Q5K,
        Encoding::Q6K,
        Encoding::Q8K,
    ];

    /// Get the encoding for a ggml type id.
    ///
    /// Ids of types that cannot be converted to `f32` (64-bit types, the
    /// importance-matrix families, `q8_1` and removed ids) are rejected.
    pub fn from_ggml_id(id: u32) -> Result<Self, EncodingError> {
        Self::ALL
            .into_iter()
            .find(|encoding| encoding.ggml_id() == id)
            .ok_or(EncodingError::UnsupportedTypeId { id })
    }

    /// The ggml type id of this encoding.
    pub fn ggml_id(self) -> u32 {
        match self {
            Encoding::F32 => 0,
            Encoding::F16 => 1,
            Encoding::Q4_0 => 2,
            Encoding::Q4_1 => 3,
            Encoding::Q5_0 => 6,
            Encoding::Q5_1 => 7,
            Encoding::Q8_0 => 8,
            Encoding::Q2K => 10,
            Encoding::Q3K => 11,
            Encoding::Q4K => 12,
            Encoding::Q5K => 13,
            Encoding::Q6K => 14,
            Encoding::Q8K => 15,
            Encoding::I8 => 24,
            Encoding::I16 => 25,
            Encoding::I32 => 26,
            Encoding::BF16 => 30,
        }
    }

    /// The ggml type name, used as the type label in the output table.
    pub fn name(self) -> &'static str {
        match self {
            Encoding::F32 => "f32",
            Encoding::F16 => "f16",
            Encoding::BF16 => "bf16",
            Encoding::I8 => "i8",
            Encoding::I16 => "i16",
            Encoding::I32 => "i32",
            Encoding::Q4_0 => "q4_0",
            Encoding::Q4_1 => "q4_1",
            Encoding::Q5_0 => "q5_0",
            Encoding::Q5_1 => "q5_1",
            Encoding::Q8_0 => "q8_0",
            Encoding::Q2K => "q2_K",
            Encoding::Q3K => "q3_K",
            Encoding::Q4K => "q4_K",
            Encoding::Q5K => "q5_K",
            Encoding::Q6K => "q6_K",
            Encoding::Q8K => "q8_K",
        }
    }

    /// Whether elements are packed into quantized blocks.
    pub fn is_quantized(self) -> bool {
        self.ggml_dtype().is_some()
    }

    /// The candle block type for quantized encodings.
    pub fn ggml_dtype(self) -> Option<GgmlDType> {
        match self {
            Encoding::F32
            | Encoding::F16
            | Encoding::BF16
            | Encoding::I8
            | Encoding::I16
            | Encoding::I32 => None,
            Encoding::Q4_0 => Some(GgmlDType::Q4_0),
            Encoding::Q4_1 => Some(GgmlDType::Q4_1),
            Encoding::Q5_0 => Some(GgmlDType::Q5_0),
            Encoding::Q5_1 => Some(GgmlDType::Q5_1),
            Encoding::Q8_0 => Some(GgmlDType::Q8_0),
            Encoding::Q2K => Some(GgmlDType::Q2K),
            Encoding::Q3K => Some(GgmlDType::Q3K),
            Encoding::Q4K => Some(GgmlDType::Q4K),
            Encoding::Q5K => Some(GgmlDType::Q5K),
            Encoding::Q6K => Some(GgmlDType::Q6K),
            Encoding::Q8K => Some(GgmlDType::Q8K),
        }
    }

    /// Number of elements stored in one block.
    ///
    /// Canonical encodings have a block size of 1.
    pub fn block_size(self) -> usize {
        self.ggml_dtype()
            .map(|dtype| dtype.block_size())
            .unwrap_or(1)
    }

    /// Size of one block in bytes.
    pub fn type_size(self) -> usize {
        match self {
            Encoding::F32 | Encoding::I32 => 4,
            Encoding::F16 | Encoding::BF16 | Encoding::I16 => 2,
            Encoding::I8 => 1,
            quantized => quantized
                .ggml_dtype()
                .map(|dtype| dtype.type_size())
                .unwrap_or_default(),
        }
    }

    /// Reader that widens one element of a canonical encoding to `f32`.
    ///
    /// Returns `None` for quantized encodings, these are decoded a whole
    /// tensor at a time.
    pub fn scalar_reader(self) -> Option<ScalarReader> {
        let reader: ScalarReader = match self {
            Encoding::F32 => |b| f32::from_le_bytes(le_bytes(b)),
            Encoding::F16 => |b| f16::from_le_bytes(le_bytes(b)).to_f32(),
            Encoding::BF16 => |b| bf16::from_le_bytes(le_bytes(b)).to_f32(),
            Encoding::I8 => |b| i8::from_le_bytes(le_bytes(b)) as f32,
            Encoding::I16 => |b| i16::from_le_bytes(le_bytes(b)) as f32,
            Encoding::I32 => |b| i32::from_le_bytes(le_bytes(b)) as f32,
            _ => return None,
        };
        Some(reader)
    }
}

fn le_bytes<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut array = [0; N];
    array.copy_from_slice(&bytes[..N]);
    array
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|encoding| encoding.name() == s)
            .ok_or_else(|| EncodingError::UnsupportedTypeName {
                name: s.to_string(),
            })
    }
}

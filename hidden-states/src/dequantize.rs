use std::borrow::Cow;
use std::{mem, slice};

use candle_core::quantized::ggml_file::qtensor_from_ggml;
use candle_core::quantized::k_quants::{BlockQ8K, GgmlType, QK_K};
use candle_core::quantized::GgmlDType;
use candle_core::Device;
use snafu::{ensure, ResultExt, Snafu};

use crate::tensor::{Encoding, TensorDescriptor};

/// Dequantization errors.
#[derive(Debug, Snafu)]
pub enum DequantizeError {
    #[snafu(display("Cannot decode {encoding} blocks of tensor {name}"))]
    Decode {
        name: String,
        encoding: Encoding,
        source: candle_core::Error,
    },

    #[snafu(display(
        "Tensor {name} has {extent} elements in its first axis, which is not a multiple of the {encoding} block size {block_size}"
    ))]
    PartialBlock {
        name: String,
        encoding: Encoding,
        extent: usize,
        block_size: usize,
    },

    #[snafu(display(
        "Tensor {name} holds {len} bytes, {n_bytes} are needed for {encoding} blocks"
    ))]
    Truncated {
        name: String,
        encoding: Encoding,
        len: usize,
        n_bytes: usize,
    },
}

/// Dense `f32` values decoded from a quantized tensor.
///
/// Values are stored in the canonical element order, so the value of
/// coordinate `(i0, i1, i2, i3)` is found at its dense row-major index.
#[derive(Clone, Debug, PartialEq)]
pub struct DequantizedBuffer(Vec<f32>);

impl DequantizedBuffer {
    /// Decoded values.
    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// Number of decoded values.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Decode a quantized tensor into `f32` values.
///
/// Returns `None` for canonical encodings, their elements are read in
/// place. Quantized data is always treated as densely packed, the
/// tensor's strides are not used.
///
/// * `descriptor` - Description of the tensor.
/// * `bytes` - Host-readable tensor data.
pub fn dequantize(
    descriptor: &TensorDescriptor,
    bytes: &[u8],
) -> Result<Option<DequantizedBuffer>, DequantizeError> {
    let encoding = descriptor.encoding();
    let dtype = match encoding.ggml_dtype() {
        Some(dtype) => dtype,
        None => return Ok(None),
    };

    let n_elements = descriptor.n_elements();
    if n_elements == 0 {
        return Ok(Some(DequantizedBuffer(Vec::new())));
    }

    let shape = descriptor.shape();
    let block_size = encoding.block_size();
    ensure!(
        shape[0] % block_size == 0,
        PartialBlockSnafu {
            name: descriptor.name(),
            encoding,
            extent: shape[0],
            block_size,
        }
    );

    let n_bytes = n_elements / block_size * encoding.type_size();
    ensure!(
        bytes.len() >= n_bytes,
        TruncatedSnafu {
            name: descriptor.name(),
            encoding,
            len: bytes.len(),
            n_bytes,
        }
    );

    // Block decoders read the blocks in place and require their alignment.
    let packed = &bytes[..n_bytes];
    let packed: Cow<[u8]> = if packed.as_ptr().align_offset(mem::align_of::<f32>()) == 0 {
        Cow::Borrowed(packed)
    } else {
        Cow::Owned(packed.to_vec())
    };

    let values = if dtype == GgmlDType::Q8K {
        decode_q8k(&packed)
    } else {
        let dims = shape.iter().rev().copied().collect();
        qtensor_from_ggml(dtype, &packed, dims, &Device::Cpu)
            .and_then(|qtensor| qtensor.dequantize(&Device::Cpu))
            .and_then(|tensor| tensor.flatten_all())
            .and_then(|tensor| tensor.to_vec1::<f32>())
    }
    .context(DecodeSnafu {
        name: descriptor.name(),
        encoding,
    })?;

    Ok(Some(DequantizedBuffer(values)))
}

/// Decode `q8_K` blocks.
///
/// The ggml loader of candle does not accept `q8_K` data, so the blocks
/// are decoded with the block type directly.
fn decode_q8k(packed: &[u8]) -> candle_core::Result<Vec<f32>> {
    let block_size = mem::size_of::<BlockQ8K>();
    let n_blocks = packed.len() / block_size;

    // Words give the alignment that the block fields need.
    let mut words = vec![0u32; n_blocks * block_size / mem::size_of::<u32>()];
    for (word, chunk) in words.iter_mut().zip(packed.chunks_exact(4)) {
        *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    // SAFETY: `BlockQ8K` is `repr(C)` with only integer and float fields,
    // its alignment is 4 and `words` holds exactly `n_blocks` blocks.
    let blocks = unsafe { slice::from_raw_parts(words.as_ptr().cast::<BlockQ8K>(), n_blocks) };

    let mut values = vec![0f32; n_blocks * QK_K];
    BlockQ8K::to_float(blocks, &mut values)?;

    Ok(values)
}

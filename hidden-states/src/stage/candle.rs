use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::stage::BackingStore;
use crate::tensor::{Encoding, TensorDescriptor, MAX_DIMS};

/// Candle tensor adapter errors.
#[derive(Debug, Snafu)]
pub enum CandleAdapterError {
    #[snafu(display("Cannot copy tensor to the CPU"))]
    CopyToCpu { source: candle_core::Error },

    #[snafu(display("Tensor data type {dtype:?} cannot be captured"))]
    UnsupportedDType { dtype: DType },

    #[snafu(display("Tensor has rank {rank}, at most {MAX_DIMS} is supported"))]
    Rank { rank: usize },

    #[snafu(display("Tensor holds {n_bytes} bytes, but {expected} were requested"))]
    SizeMismatch { n_bytes: usize, expected: usize },
}

/// Get the element encoding of a candle data type.
fn encoding_from_dtype(dtype: DType) -> Result<Encoding, CandleAdapterError> {
    match dtype {
        DType::F32 => Ok(Encoding::F32),
        DType::F16 => Ok(Encoding::F16),
        DType::BF16 => Ok(Encoding::BF16),
        dtype => UnsupportedDTypeSnafu { dtype }.fail(),
    }
}

/// Describe a candle tensor.
///
/// Candle dimensions are reversed into ggml order, so that the last
/// candle dimension becomes axis 0. The strides describe the densely
/// packed data that [`CandleStore`] produces, regardless of the tensor's
/// own layout.
///
/// * `name` - Tensor name.
/// * `operation` - Label of the operation that produced the tensor.
/// * `tensor` - The tensor to describe.
pub fn descriptor_from_candle(
    name: impl Into<String>,
    operation: impl Into<String>,
    tensor: &Tensor,
) -> Result<TensorDescriptor, CandleAdapterError> {
    let encoding = encoding_from_dtype(tensor.dtype())?;

    let dims = tensor.dims();
    ensure!(dims.len() <= MAX_DIMS, RankSnafu { rank: dims.len() });

    let mut shape = [1; MAX_DIMS];
    for (extent, &dim) in shape.iter_mut().zip(dims.iter().rev()) {
        *extent = dim;
    }

    Ok(TensorDescriptor::contiguous(name, encoding, operation, shape))
}

/// Backing store for a candle tensor.
///
/// Candle keeps CPU storage behind a lock, so the data cannot be lent
/// out. Tensors are always copied, on non-CPU devices this is a
/// device-to-host transfer.
#[derive(Clone, Debug)]
pub struct CandleStore {
    tensor: Tensor,
}

impl CandleStore {
    /// Wrap a candle tensor.
    pub fn new(tensor: &Tensor) -> Self {
        CandleStore {
            tensor: tensor.clone(),
        }
    }

    /// Whether the tensor lives on a device other than the CPU.
    pub fn is_device(&self) -> bool {
        !self.tensor.device().is_cpu()
    }

    fn copy_to(&self, dst: &mut [u8]) -> Result<(), CandleAdapterError> {
        let encoding = encoding_from_dtype(self.tensor.dtype())?;
        let n_bytes = self.tensor.elem_count() * encoding.type_size();
        ensure!(
            n_bytes == dst.len(),
            SizeMismatchSnafu {
                n_bytes,
                expected: dst.len(),
            }
        );

        let host = self
            .tensor
            .to_device(&Device::Cpu)
            .and_then(|tensor| tensor.flatten_all())
            .context(CopyToCpuSnafu)?;

        match encoding {
            Encoding::F16 => {
                let values = host.to_vec1::<f16>().context(CopyToCpuSnafu)?;
                write_le(dst, values, f16::to_le_bytes);
            }
            Encoding::BF16 => {
                let values = host.to_vec1::<bf16>().context(CopyToCpuSnafu)?;
                write_le(dst, values, bf16::to_le_bytes);
            }
            _ => {
                let values = host.to_vec1::<f32>().context(CopyToCpuSnafu)?;
                write_le(dst, values, f32::to_le_bytes);
            }
        }

        Ok(())
    }
}

fn write_le<T, const N: usize>(dst: &mut [u8], values: Vec<T>, to_le_bytes: fn(T) -> [u8; N]) {
    for (chunk, value) in dst.chunks_exact_mut(N).zip(values) {
        chunk.copy_from_slice(&to_le_bytes(value));
    }
}

impl BackingStore for CandleStore {
    fn host_bytes(&self) -> Option<&[u8]> {
        None
    }

    fn read_to_host(&self, dst: &mut [u8]) -> Result<(), BoxedError> {
        Ok(self.copy_to(dst)?)
    }
}

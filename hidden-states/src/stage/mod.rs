use std::ops::Deref;

use snafu::{ensure, ResultExt, Snafu};
use tracing::debug;

use crate::error::BoxedError;
use crate::tensor::TensorDescriptor;

mod candle;
pub use self::candle::{descriptor_from_candle, CandleAdapterError, CandleStore};

/// Host staging errors.
#[derive(Debug, Snafu)]
pub enum StageError {
    #[snafu(display("Host memory of tensor {name} holds {len} bytes, expected {n_bytes}"))]
    HostTooSmall {
        name: String,
        len: usize,
        n_bytes: usize,
    },

    #[snafu(display("Cannot copy tensor {name} to host memory"))]
    Transfer { name: String, source: BoxedError },
}

/// Memory that backs a tensor.
pub trait BackingStore {
    /// View of the tensor bytes if they live in host memory.
    ///
    /// Returns `None` when the data has to be copied out with
    /// [`BackingStore::read_to_host`].
    fn host_bytes(&self) -> Option<&[u8]>;

    /// Copy the first `dst.len()` bytes of the tensor data into `dst`.
    ///
    /// This call blocks until the copy is complete.
    fn read_to_host(&self, dst: &mut [u8]) -> Result<(), BoxedError>;

    /// Whether the data can be read without a copy.
    fn is_host(&self) -> bool {
        self.host_bytes().is_some()
    }
}

impl BackingStore for [u8] {
    fn host_bytes(&self) -> Option<&[u8]> {
        Some(self)
    }

    fn read_to_host(&self, dst: &mut [u8]) -> Result<(), BoxedError> {
        let src = self.get(..dst.len()).ok_or("host buffer is too small")?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

impl BackingStore for Vec<u8> {
    fn host_bytes(&self) -> Option<&[u8]> {
        Some(self)
    }

    fn read_to_host(&self, dst: &mut [u8]) -> Result<(), BoxedError> {
        self.as_slice().read_to_host(dst)
    }
}

/// A tensor as seen by the scheduler callback.
#[derive(Clone, Copy)]
pub struct TensorRef<'a> {
    descriptor: &'a TensorDescriptor,
    store: &'a dyn BackingStore,
}

impl<'a> TensorRef<'a> {
    /// Construct a tensor reference.
    pub fn new(descriptor: &'a TensorDescriptor, store: &'a dyn BackingStore) -> Self {
        TensorRef { descriptor, store }
    }

    /// Static tensor description.
    pub fn descriptor(&self) -> &'a TensorDescriptor {
        self.descriptor
    }

    /// Memory that holds the tensor data.
    pub fn store(&self) -> &'a dyn BackingStore {
        self.store
    }
}

/// Host-readable tensor bytes.
///
/// Host-resident tensors are borrowed from the graph, other tensors are
/// copied into a buffer that lives until the capture of the tensor is
/// done.
#[derive(Debug)]
pub enum CaptureBuffer<'a> {
    Borrowed(&'a [u8]),
    Owned(Vec<u8>),
}

impl CaptureBuffer<'_> {
    /// Whether the data was copied out of device memory.
    pub fn is_owned(&self) -> bool {
        matches!(self, CaptureBuffer::Owned(_))
    }
}

impl Deref for CaptureBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            CaptureBuffer::Borrowed(bytes) => bytes,
            CaptureBuffer::Owned(bytes) => bytes,
        }
    }
}

/// Make the data of a tensor readable from the host.
///
/// Host-resident data is returned as a borrowed view. Otherwise a buffer
/// of exactly `TensorDescriptor::n_bytes` bytes is allocated and filled
/// with a blocking device-to-host copy.
pub fn stage_to_host<'a>(
    descriptor: &TensorDescriptor,
    store: &'a dyn BackingStore,
) -> Result<CaptureBuffer<'a>, StageError> {
    let n_bytes = descriptor.n_bytes();

    if let Some(bytes) = store.host_bytes() {
        ensure!(
            bytes.len() >= n_bytes,
            HostTooSmallSnafu {
                name: descriptor.name(),
                len: bytes.len(),
                n_bytes,
            }
        );
        return Ok(CaptureBuffer::Borrowed(&bytes[..n_bytes]));
    }

    debug!(tensor = descriptor.name(), n_bytes, "copying tensor to host");
    let mut buffer = vec![0; n_bytes];
    store.read_to_host(&mut buffer).context(TransferSnafu {
        name: descriptor.name(),
    })?;

    Ok(CaptureBuffer::Owned(buffer))
}

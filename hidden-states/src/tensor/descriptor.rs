use crate::tensor::{Dims, Encoding, Layout, MAX_DIMS};

/// Static description of a graph tensor.
///
/// The descriptor carries everything needed to interpret the tensor's
/// raw bytes, but not the bytes themselves. Shapes and strides use ggml
/// order: axis 0 is the innermost axis and axes beyond the logical rank
/// have extent 1.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorDescriptor {
    name: String,
    encoding: Encoding,
    operation: String,
    shape: Dims,
    strides: Dims,
}

impl TensorDescriptor {
    /// Construct a descriptor.
    ///
    /// * `name` - Tensor name, e.g. `l_out-3`.
    /// * `encoding` - Element encoding.
    /// * `operation` - Label of the operation that produced the tensor.
    /// * `shape` - Extent per axis.
    /// * `strides` - Byte stride per axis.
    pub fn new(
        name: impl Into<String>,
        encoding: Encoding,
        operation: impl Into<String>,
        shape: Dims,
        strides: Dims,
    ) -> Self {
        TensorDescriptor {
            name: name.into(),
            encoding,
            operation: operation.into(),
            shape,
            strides,
        }
    }

    /// Construct a descriptor for a densely packed tensor.
    ///
    /// Strides are computed the way ggml does: the first axis advances by
    /// one block and the other axes by the size of the preceding row.
    pub fn contiguous(
        name: impl Into<String>,
        encoding: Encoding,
        operation: impl Into<String>,
        shape: Dims,
    ) -> Self {
        let mut strides = [0; MAX_DIMS];
        strides[0] = encoding.type_size();
        strides[1] = strides[0] * (shape[0] / encoding.block_size());
        for axis in 2..MAX_DIMS {
            strides[axis] = strides[axis - 1] * shape[axis - 1];
        }
        Self::new(name, encoding, operation, shape, strides)
    }

    /// Tensor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element encoding.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Label of the producing operation.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Extent per axis.
    pub fn shape(&self) -> &Dims {
        &self.shape
    }

    /// Byte stride per axis.
    pub fn strides(&self) -> &Dims {
        &self.strides
    }

    /// Byte layout of the raw tensor data.
    pub fn layout(&self) -> Layout {
        Layout::new(self.shape, self.strides)
    }

    /// Number of elements.
    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of bytes spanned by the tensor data.
    pub fn n_bytes(&self) -> usize {
        if self.shape.contains(&0) {
            return 0;
        }

        let block_size = self.encoding.block_size();
        let (first, rest) = if block_size == 1 {
            (self.encoding.type_size(), 0)
        } else {
            (self.shape[0] * self.strides[0] / block_size, 1)
        };

        first
            + self.shape[rest..]
                .iter()
                .zip(&self.strides[rest..])
                .map(|(extent, stride)| (extent - 1) * stride)
                .sum::<usize>()
    }
}

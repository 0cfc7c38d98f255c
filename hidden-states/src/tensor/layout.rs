use std::fmt;

/// Maximum tensor rank.
pub const MAX_DIMS: usize = 4;

/// Per-axis values in ggml order, axis 0 is the innermost axis.
pub type Dims = [usize; MAX_DIMS];

/// Memory layout of a tensor with rank at most 4.
///
/// Strides are in units chosen by the caller: bytes for raw tensor data,
/// elements for dense `f32` buffers. All offset arithmetic in this crate
/// goes through [`Layout::offset`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Layout {
    shape: Dims,
    strides: Dims,
}

impl Layout {
    /// Construct a layout from a shape and strides.
    pub fn new(shape: Dims, strides: Dims) -> Self {
        Layout { shape, strides }
    }

    /// Densely packed layout.
    ///
    /// * `shape` - Tensor shape.
    /// * `unit` - Stride of the innermost axis.
    pub fn contiguous(shape: Dims, unit: usize) -> Self {
        let mut strides = [unit; MAX_DIMS];
        for axis in 1..MAX_DIMS {
            strides[axis] = strides[axis - 1] * shape[axis - 1];
        }
        Layout { shape, strides }
    }

    /// Tensor shape.
    pub fn shape(&self) -> &Dims {
        &self.shape
    }

    /// Strides per axis.
    pub fn strides(&self) -> &Dims {
        &self.strides
    }

    /// Number of elements.
    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Offset of the element at `coord`.
    pub fn offset(&self, coord: &Dims) -> usize {
        coord
            .iter()
            .zip(self.strides.iter())
            .map(|(index, stride)| index * stride)
            .sum()
    }

    /// End of the region spanned by the layout.
    ///
    /// This is the offset of the last element plus `elem_size`, or zero
    /// for an empty tensor.
    pub fn span(&self, elem_size: usize) -> usize {
        if self.n_elements() == 0 {
            return 0;
        }

        let last = self.shape.map(|extent| extent - 1);
        self.offset(&last) + elem_size
    }

    /// Iterate over all coordinates in canonical order.
    pub fn coords(&self) -> Coords {
        Coords::new(self.shape)
    }
}

/// Iterator over the coordinates of a shape.
///
/// Coordinates are enumerated with axis 3 outermost and axis 0
/// innermost, so the i-th coordinate has dense row-major index i.
#[derive(Clone, Debug)]
pub struct Coords {
    shape: Dims,
    next: Option<Dims>,
}

impl Coords {
    fn new(shape: Dims) -> Self {
        let next = if shape.contains(&0) {
            None
        } else {
            Some([0; MAX_DIMS])
        };
        Coords { shape, next }
    }
}

impl Iterator for Coords {
    type Item = Dims;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;

        let mut next = current;
        self.next = None;
        for axis in 0..MAX_DIMS {
            next[axis] += 1;
            if next[axis] < self.shape[axis] {
                self.next = Some(next);
                break;
            }
            next[axis] = 0;
        }

        Some(current)
    }
}

/// Display wrapper that renders dims as `{d0, d1, d2, d3}`.
pub struct Extents<'a>(pub &'a Dims);

impl fmt::Display for Extents<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (axis, extent) in self.0.iter().enumerate() {
            if axis > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{extent}")?;
        }
        write!(f, "}}")
    }
}

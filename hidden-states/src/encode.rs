use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::dequantize::DequantizedBuffer;
use crate::sink::{RecordSink, SinkError};
use crate::tensor::{Dims, Encoding, Layout, ScalarReader, TensorDescriptor};

/// Record encoding errors.
#[derive(Debug, Snafu)]
pub enum EncodeError {
    #[snafu(display("Tensor {name} data spans {span} bytes, but only {len} are available"))]
    BufferTooSmall {
        name: String,
        span: usize,
        len: usize,
    },

    #[snafu(display("Tensor {name} has {n_elements} elements, but {len} values were decoded"))]
    ValueCount {
        name: String,
        n_elements: usize,
        len: usize,
    },

    #[snafu(display("Tensor {name} with encoding {encoding} cannot be read in place"))]
    NotCanonical { name: String, encoding: Encoding },

    #[snafu(display("Cannot write record of tensor {name}"))]
    Write { name: String, source: SinkError },
}

/// One scalar element of a captured tensor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputRecord<'a> {
    /// Sequence number of the tensor, shared by all its elements.
    pub id: usize,
    pub name: &'a str,
    pub encoding: Encoding,
    pub operation: &'a str,
    pub shape: Dims,
    pub coord: Dims,
    pub value: f32,
}

/// Where the element values of a tensor are read from.
pub enum ValueSource<'a> {
    /// Raw canonical elements, addressed through the tensor's byte strides.
    Strided {
        bytes: &'a [u8],
        layout: Layout,
        read: ScalarReader,
        elem_size: usize,
    },

    /// Decoded values, addressed by dense row-major index.
    Dense { values: &'a [f32], layout: Layout },
}

impl<'a> ValueSource<'a> {
    /// Read canonical elements from raw tensor bytes.
    ///
    /// Fails if the encoding is quantized or if the bytes do not cover
    /// every element addressed by the tensor's strides.
    pub fn strided(descriptor: &TensorDescriptor, bytes: &'a [u8]) -> Result<Self, EncodeError> {
        let encoding = descriptor.encoding();
        let read = encoding.scalar_reader().context(NotCanonicalSnafu {
            name: descriptor.name(),
            encoding,
        })?;

        let layout = descriptor.layout();
        let elem_size = encoding.type_size();
        let span = layout.span(elem_size);
        ensure!(
            span <= bytes.len(),
            BufferTooSmallSnafu {
                name: descriptor.name(),
                span,
                len: bytes.len(),
            }
        );

        Ok(ValueSource::Strided {
            bytes,
            layout,
            read,
            elem_size,
        })
    }

    /// Read decoded values of a quantized tensor.
    pub fn dense(
        descriptor: &TensorDescriptor,
        values: &'a DequantizedBuffer,
    ) -> Result<Self, EncodeError> {
        let n_elements = descriptor.n_elements();
        ensure!(
            values.len() == n_elements,
            ValueCountSnafu {
                name: descriptor.name(),
                n_elements,
                len: values.len(),
            }
        );

        Ok(ValueSource::Dense {
            values: values.values(),
            layout: Layout::contiguous(*descriptor.shape(), 1),
        })
    }

    /// Value of the element at `coord`.
    fn value(&self, coord: &Dims) -> f32 {
        match self {
            ValueSource::Strided {
                bytes,
                layout,
                read,
                elem_size,
            } => {
                let offset = layout.offset(coord);
                read(&bytes[offset..offset + elem_size])
            }
            ValueSource::Dense { values, layout } => values[layout.offset(coord)],
        }
    }
}

/// Write one record per element of a tensor to a sink.
///
/// Elements are visited in canonical order (axis 3 outermost, axis 0
/// innermost). Records are written as they are produced, so memory use
/// does not depend on the size of the tensor.
///
/// * `descriptor` - Description of the tensor.
/// * `source` - Element values, constructed for the same descriptor.
/// * `id` - Sequence number of the tensor.
/// * `sink` - Record sink.
///
/// Returns: the number of records written.
pub fn encode_records<S>(
    descriptor: &TensorDescriptor,
    source: &ValueSource,
    id: usize,
    sink: &mut S,
) -> Result<usize, EncodeError>
where
    S: RecordSink + ?Sized,
{
    let shape = *descriptor.shape();
    let mut n_records = 0;

    for coord in descriptor.layout().coords() {
        let record = OutputRecord {
            id,
            name: descriptor.name(),
            encoding: descriptor.encoding(),
            operation: descriptor.operation(),
            shape,
            coord,
            value: source.value(&coord),
        };
        sink.write_record(&record).context(WriteSnafu {
            name: descriptor.name(),
        })?;
        n_records += 1;
    }

    Ok(n_records)
}

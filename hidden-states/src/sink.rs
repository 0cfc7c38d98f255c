use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};

use crate::encode::OutputRecord;
use crate::tensor::Extents;

/// Header row of the hidden state table.
pub static CSV_HEADER: &str = "ID,name,type,operation,full_ne,curr_ne,value";

/// Record sink errors.
#[derive(Debug, Snafu)]
pub enum SinkError {
    #[snafu(display("Cannot create output file: {}", path.to_string_lossy()))]
    Create { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot flush output"))]
    Flush { source: io::Error },

    #[snafu(display("Cannot write output"))]
    Write { source: io::Error },
}

/// Destination of output records.
pub trait RecordSink {
    /// Prepare the sink before the first record.
    fn begin(&mut self) -> Result<(), SinkError>;

    /// Write a single record.
    fn write_record(&mut self, record: &OutputRecord) -> Result<(), SinkError>;

    /// Complete the output, no records are written afterwards.
    fn finish(&mut self) -> Result<(), SinkError>;
}

/// Writes records as comma-separated lines.
///
/// Line format: `ID,name,type,operation,"{full_ne}","{curr_ne}",value`,
/// where both shapes are rendered as `{d0, d1, d2, d3}`.
pub struct CsvSink<W: Write> {
    writer: BufWriter<W>,
}

impl CsvSink<File> {
    /// Create a sink that writes to a new file.
    ///
    /// An existing file at `path` is truncated.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        let file = File::create(path).context(CreateSnafu {
            path: path.to_owned(),
        })?;
        Ok(Self::new(file))
    }
}

impl<W: Write> CsvSink<W> {
    /// Create a sink that writes to `writer`.
    pub fn new(writer: W) -> Self {
        CsvSink {
            writer: BufWriter::new(writer),
        }
    }

    /// Flush buffered output and return the underlying writer.
    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer
            .into_inner()
            .map_err(|err| err.into_error())
            .context(FlushSnafu)
    }
}

impl<W: Write> RecordSink for CsvSink<W> {
    fn begin(&mut self) -> Result<(), SinkError> {
        writeln!(self.writer, "{}", CSV_HEADER).context(WriteSnafu)
    }

    fn write_record(&mut self, record: &OutputRecord) -> Result<(), SinkError> {
        writeln!(
            self.writer,
            "{},{},{},{},\"{}\",\"{}\",{:?}",
            record.id,
            record.name,
            record.encoding,
            record.operation,
            Extents(&record.shape),
            Extents(&record.coord),
            record.value
        )
        .context(WriteSnafu)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.writer.flush().context(FlushSnafu)
    }
}

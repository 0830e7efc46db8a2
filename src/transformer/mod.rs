//! Converts extracted records into CSV buffers ready for native bulk load.
//!
//! Both submodules write through the same `csv` writer configuration; the
//! quoting/escaping rules come from the crate's own defaults rather than
//! anything hand-rolled here.

pub mod audit;
pub mod normalized;

use std::io::{Cursor, Seek, SeekFrom};

use csv::{QuoteStyle, Terminator, WriterBuilder};

use crate::errors::TransformError;

/// An in-memory CSV payload, rewound and ready to be streamed into a
/// `COPY ... FROM STDIN` call.
pub type CsvBuffer = Cursor<Vec<u8>>;

fn csv_writer(buffer: &mut CsvBuffer) -> csv::Writer<&mut CsvBuffer> {
    WriterBuilder::new()
        .has_headers(true)
        .quote_style(QuoteStyle::Necessary)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(buffer)
}

fn rewind(buffer: &mut CsvBuffer) -> Result<(), TransformError> {
    buffer
        .seek(SeekFrom::Start(0))
        .map_err(|e| TransformError::Csv(csv::Error::from(e)))?;
    Ok(())
}

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
    time::SystemTime,
};

use palantiri::{
    Observer, Snapshot,
    observer::{NotifyError, NotifyRetry},
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::csv::CsvHelper;

const HEADER: [&str; 3] = ["alias", "timestamp", "value"];

/// Writes every value of the snapshots as a CSV row `alias;timestamp;value`.
pub struct CsvObserver {
    /// Has the header been written?
    header_written: bool,

    /// parameter: do we flush after each snapshot?
    force_flush: bool,

    /// File writer
    writer: BufWriter<File>,

    /// CSV utility
    csv_helper: CsvHelper,
}

impl CsvObserver {
    /// Creates a new CSV file, or truncates the existing one.
    pub fn new(output_file: impl AsRef<Path>, force_flush: bool, delimiter: char) -> io::Result<Self> {
        let file = File::create(output_file)?;
        Ok(Self::with_file(file, false, force_flush, delimiter))
    }

    /// Appends to a CSV file, without writing the header again if the file is not empty.
    pub fn append(output_file: impl AsRef<Path>, force_flush: bool, delimiter: char) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(output_file)?;
        let has_content = file.metadata()?.len() > 0;
        Ok(Self::with_file(file, has_content, force_flush, delimiter))
    }

    fn with_file(file: File, header_written: bool, force_flush: bool, delimiter: char) -> Self {
        Self {
            header_written,
            force_flush,
            writer: BufWriter::new(file),
            csv_helper: CsvHelper::new(delimiter),
        }
    }
}

impl Observer for CsvObserver {
    fn notify(&mut self, snapshot: &Snapshot) -> Result<(), NotifyError> {
        if !self.header_written {
            self.csv_helper.writeln(&mut self.writer, HEADER).retry_notify()?;
            self.header_written = true;
        }

        for (alias, value) in snapshot.iter() {
            let datetime: OffsetDateTime = SystemTime::from(value.timestamp).into();
            let datetime = datetime.format(&Rfc3339)?;
            let value = value.value.to_string();
            self.csv_helper
                .writeln(&mut self.writer, [alias, datetime.as_str(), value.as_str()])
                .retry_notify()?;
        }

        if self.force_flush {
            log::trace!("flushing BufWriter");
            self.writer.flush().retry_notify()?;
        }
        Ok(())
    }
}

impl Drop for CsvObserver {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            log::error!("could not flush the CSV file: {e}");
        }
    }
}

use std::{borrow::Cow, io::Write};

/// Writes CSV records.
pub struct CsvHelper {
    delimiter: char,
}

impl CsvHelper {
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }

    /// Writes one record, followed by a newline.
    pub fn writeln<S: AsRef<str>>(&self, w: &mut impl Write, record: impl IntoIterator<Item = S>) -> std::io::Result<()> {
        let mut first = true;
        for field in record {
            if !first {
                write!(w, "{}", self.delimiter)?;
            }
            first = false;
            write!(w, "{}", self.escape_string(field.as_ref()))?;
        }
        writeln!(w)
    }

    /// Escape a string for CSV formatting.
    ///
    /// See <https://www.ietf.org/rfc/rfc4180.txt>.
    pub fn escape_string<'a>(&self, s: &'a str) -> Cow<'a, str> {
        if s.contains([self.delimiter, '"', '\n', '\r']) {
            let escaped = s.replace('"', "\"\"");
            let quoted = format!("\"{escaped}\"");
            Cow::Owned(quoted)
        } else {
            Cow::Borrowed(s)
        }
    }
}

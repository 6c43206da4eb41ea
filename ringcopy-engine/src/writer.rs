//! Export destination handling: a single CSV stream, optionally split
//! across numbered files by row count.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use ringcopy::options::{CopyOptions, Dialect};

/// Where exported CSV goes.
#[derive(Debug, Clone)]
pub enum ExportDest {
    Stdout,
    File(PathBuf),
}

/// Writes CSV chunks to the destination, opening `<fname>.<n>` files as
/// the row cap is reached. Rows never straddle two files.
pub(crate) struct ExportWriter {
    dest: ExportDest,
    header: Option<Vec<String>>,
    dialect: Dialect,
    max_output_size: i64,
    split: bool,
    out: Option<Box<dyn Write + Send>>,
    num_written: i64,
    /// Files opened so far; 0 when writing to stdout.
    pub(crate) num_files: usize,
}

impl ExportWriter {
    pub(crate) fn new(dest: ExportDest, columns: &[String], options: &CopyOptions) -> Self {
        let max_output_size = options.copy.max_output_size;
        let split = match (&dest, max_output_size > 0) {
            (ExportDest::File(_), true) => true,
            (ExportDest::Stdout, true) => {
                tracing::warn!(max_output_size, "maxoutputsize ignored when writing to stdout");
                false
            }
            _ => false,
        };
        let header = options.copy.header.then(|| columns.to_vec());
        Self {
            dest,
            header,
            dialect: options.dialect,
            max_output_size,
            split,
            out: None,
            num_written: 0,
            num_files: 0,
        }
    }

    /// Open the first destination and emit the header row if requested.
    pub(crate) fn open(&mut self) -> Result<()> {
        let mut out: Box<dyn Write + Send> = match &self.dest {
            ExportDest::Stdout => Box::new(io::stdout()),
            ExportDest::File(path) => {
                let file = File::create(path)
                    .with_context(|| format!("can't open {} for writing", path.display()))?;
                self.num_files += 1;
                Box::new(BufWriter::new(file))
            }
        };
        self.write_header(&mut out)?;
        self.out = Some(out);
        Ok(())
    }

    /// Append one CSV chunk of `rows` rows.
    pub(crate) fn write(&mut self, data: &str, rows: u64) -> Result<()> {
        if self.split {
            self.write_with_split(data, rows as i64)
        } else {
            self.current()?.write_all(data.as_bytes())?;
            Ok(())
        }
    }

    /// Flush and drop the current destination.
    pub(crate) fn close(&mut self) -> Result<()> {
        if let Some(out) = &mut self.out {
            out.flush()?;
        }
        self.out = None;
        Ok(())
    }

    fn current(&mut self) -> Result<&mut Box<dyn Write + Send>> {
        self.out.as_mut().context("writer is not open")
    }

    fn write_header(&mut self, out: &mut Box<dyn Write + Send>) -> Result<()> {
        let Some(columns) = &self.header else {
            return Ok(());
        };
        let mut builder = csv::WriterBuilder::new();
        builder
            .delimiter(self.dialect.delimiter)
            .quote(self.dialect.quote)
            .double_quote(self.dialect.double_quote);
        if let Some(escape) = self.dialect.escape {
            builder.escape(escape);
        }
        let mut w = builder.from_writer(Vec::new());
        w.write_record(columns)?;
        let rendered = w.into_inner().map_err(|e| anyhow::anyhow!("header render: {e}"))?;
        out.write_all(&rendered)?;
        Ok(())
    }

    /// Roll to `<fname>.<n>`.
    fn next_dest(&mut self) -> Result<()> {
        self.close()?;
        let ExportDest::File(path) = &self.dest else {
            anyhow::bail!("split output requires a file destination");
        };
        let mut next = path.as_os_str().to_owned();
        next.push(format!(".{}", self.num_files));
        let next = PathBuf::from(next);
        let file = File::create(&next)
            .with_context(|| format!("can't open {} for writing", next.display()))?;
        self.num_files += 1;
        let mut out: Box<dyn Write + Send> = Box::new(BufWriter::new(file));
        self.write_header(&mut out)?;
        self.out = Some(out);
        Ok(())
    }

    /// Split the chunk's rows on line separators so the current file never
    /// exceeds the cap; each overflow opens the next numbered file.
    fn write_with_split(&mut self, data: &str, num: i64) -> Result<()> {
        if self.num_written + num <= self.max_output_size {
            self.num_written += num;
            self.current()?.write_all(data.as_bytes())?;
            return Ok(());
        }

        let mut num_remaining = self.max_output_size - self.num_written;
        let mut last_switch = 0i64;
        for (i, row) in data.split('\n').filter(|l| !l.is_empty()).enumerate() {
            let i = i as i64;
            if i == num_remaining {
                self.next_dest()?;
                last_switch = i;
                num_remaining += self.max_output_size;
            }
            let out = self.current()?;
            out.write_all(row.as_bytes())?;
            out.write_all(b"\n")?;
        }
        self.num_written = num - last_switch;
        Ok(())
    }
}

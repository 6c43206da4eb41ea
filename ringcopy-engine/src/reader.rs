//! Import input: CSV files matched by glob patterns, or rows forwarded
//! from the host's standard input.
//!
//! Readers hand out *raw lines*; CSV tokenization happens in the workers
//! so it runs in parallel.

use std::fs::File;
use std::io::{BufRead as _, BufReader, Lines};
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use ringcopy::channel::PipeReceiver;
use ringcopy::options::CopySettings;

use crate::messages::PipeMsg;

/// Reads comma-separated glob patterns source by source.
pub(crate) struct FilesReader {
    chunk_size: usize,
    header: bool,
    max_rows: i64,
    skip_rows: u64,
    pattern: String,
    paths: Vec<PathBuf>,
    next_path: usize,
    current: Option<Lines<BufReader<File>>>,
    pub(crate) num_sources: u64,
    num_read: u64,
    exhausted: bool,
}

impl FilesReader {
    pub(crate) fn new(pattern: &str, settings: &CopySettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            header: settings.header,
            max_rows: settings.max_rows,
            skip_rows: settings.skip_rows,
            pattern: pattern.to_owned(),
            paths: Vec::new(),
            next_path: 0,
            current: None,
            num_sources: 0,
            num_read: 0,
            exhausted: false,
        }
    }

    /// Expand the patterns and open the first source.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed glob pattern; unreadable files are
    /// logged and skipped instead.
    pub(crate) fn start(&mut self) -> Result<()> {
        for part in self.pattern.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let as_path = PathBuf::from(part);
            if as_path.is_file() {
                self.paths.push(as_path);
            } else {
                for entry in glob::glob(part)
                    .with_context(|| format!("invalid file pattern {part:?}"))?
                {
                    match entry {
                        Ok(p) => self.paths.push(p),
                        Err(e) => tracing::warn!(error = %e, "skipping unreadable path"),
                    }
                }
            }
        }
        self.next_source();
        Ok(())
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.exhausted
    }

    pub(crate) fn skip_rows(&self) -> u64 {
        self.skip_rows
    }

    /// Close the current source and open the next one, skipping its header
    /// row if configured. Unopenable files are logged and skipped.
    fn next_source(&mut self) {
        self.current = None;
        while self.next_path < self.paths.len() {
            let path = &self.paths[self.next_path];
            self.next_path += 1;
            match File::open(path) {
                Ok(file) => {
                    let mut lines = BufReader::new(file).lines();
                    if self.header {
                        let _ = lines.next();
                    }
                    self.num_sources += 1;
                    self.current = Some(lines);
                    return;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "can't open for reading");
                }
            }
        }
        self.exhausted = true;
    }

    /// Read up to `min(max_rows, chunksize)` raw lines, honoring the
    /// global `skiprows` and `maxrows` budgets. Empty lines are dropped.
    pub(crate) fn read_rows(&mut self, max_rows: usize) -> Vec<String> {
        let mut rows = Vec::new();
        if self.current.is_none() {
            return rows;
        }
        for _ in 0..max_rows.min(self.chunk_size) {
            let line = self.current.as_mut().and_then(Iterator::next);
            match line {
                None => {
                    self.next_source();
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "read error, moving to the next source");
                    self.next_source();
                    break;
                }
                Some(Ok(line)) => {
                    self.num_read += 1;
                    if 0 <= self.max_rows && (self.max_rows as u64) < self.num_read {
                        self.current = None;
                        self.exhausted = true;
                        break;
                    }
                    if self.num_read > self.skip_rows && !line.is_empty() {
                        rows.push(line);
                    }
                }
            }
        }
        rows
    }
}

/// Reads rows the coordinator forwards from standard input.
pub(crate) struct PipeReader {
    chunk_size: usize,
    header_pending: bool,
    max_rows: i64,
    skip_rows: u64,
    num_read: u64,
    exhausted: bool,
}

impl PipeReader {
    pub(crate) fn new(settings: &CopySettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            header_pending: settings.header,
            max_rows: settings.max_rows,
            skip_rows: settings.skip_rows,
            num_read: 0,
            exhausted: false,
        }
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.exhausted
    }

    pub(crate) fn skip_rows(&self) -> u64 {
        self.skip_rows
    }

    pub(crate) async fn read_rows(
        &mut self,
        inbound: &mut PipeReceiver<PipeMsg>,
        max_rows: usize,
    ) -> Vec<String> {
        let mut rows = Vec::new();
        for _ in 0..max_rows.min(self.chunk_size) {
            match inbound.recv().await {
                None | Some(PipeMsg::Eof | PipeMsg::Shutdown) => {
                    self.exhausted = true;
                    break;
                }
                Some(PipeMsg::Row(line)) => {
                    if self.header_pending {
                        self.header_pending = false;
                        continue;
                    }
                    self.num_read += 1;
                    if 0 <= self.max_rows && (self.max_rows as u64) < self.num_read {
                        self.exhausted = true;
                        break;
                    }
                    if self.num_read > self.skip_rows && !line.is_empty() {
                        rows.push(line);
                    }
                }
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write as _;

    fn settings(pairs: &[(&str, &str)]) -> CopySettings {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ringcopy::options::CopyOptions::parse(&map, "ks", "t").unwrap().copy
    }

    fn write_file(dir: &std::path::Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn reads_globbed_sources_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a1.csv", "1,a\n2,b\n");
        write_file(dir.path(), "a2.csv", "3,c\n");
        let pattern = format!("{}/a*.csv", dir.path().display());
        let mut reader = FilesReader::new(&pattern, &settings(&[]));
        reader.start().unwrap();

        let mut all = Vec::new();
        while !reader.exhausted() {
            all.extend(reader.read_rows(100));
        }
        assert_eq!(all, vec!["1,a", "2,b", "3,c"]);
        assert_eq!(reader.num_sources, 2);
    }

    #[test]
    fn header_skipped_per_source() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "h1.csv", "id,name\n1,a\n");
        write_file(dir.path(), "h2.csv", "id,name\n2,b\n");
        let pattern = format!("{}/h*.csv", dir.path().display());
        let mut reader = FilesReader::new(&pattern, &settings(&[("header", "true")]));
        reader.start().unwrap();
        let mut all = Vec::new();
        while !reader.exhausted() {
            all.extend(reader.read_rows(100));
        }
        assert_eq!(all, vec!["1,a", "2,b"]);
    }

    #[test]
    fn skiprows_and_maxrows_budgets() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "r.csv", "1\n2\n3\n4\n5\n");
        let pattern = format!("{}/r.csv", dir.path().display());
        let mut reader =
            FilesReader::new(&pattern, &settings(&[("skiprows", "1"), ("maxrows", "3")]));
        reader.start().unwrap();
        let mut all = Vec::new();
        while !reader.exhausted() {
            all.extend(reader.read_rows(100));
        }
        // row 1 skipped, rows 2..=3 kept, cap reached at row 4
        assert_eq!(all, vec!["2", "3"]);
    }

    #[test]
    fn missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "ok.csv", "1\n");
        let pattern = format!("{0}/absent.csv,{0}/ok.csv", dir.path().display());
        let mut reader = FilesReader::new(&pattern, &settings(&[]));
        reader.start().unwrap();
        let mut all = Vec::new();
        while !reader.exhausted() {
            all.extend(reader.read_rows(100));
        }
        assert_eq!(all, vec!["1"]);
        assert_eq!(reader.num_sources, 1);
    }

    #[tokio::test]
    async fn pipe_reader_stops_at_eof() {
        let (tx, mut rx) = ringcopy::channel::pipe();
        let mut reader = PipeReader::new(&settings(&[]));
        tx.send(PipeMsg::Row("1,a".into())).unwrap();
        tx.send(PipeMsg::Row("2,b".into())).unwrap();
        tx.send(PipeMsg::Eof).unwrap();
        let rows = reader.read_rows(&mut rx, 100).await;
        assert_eq!(rows, vec!["1,a", "2,b"]);
        assert!(reader.exhausted());
    }
}

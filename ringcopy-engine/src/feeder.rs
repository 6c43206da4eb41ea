//! The feeder: reads import sources and deals chunks to the workers,
//! throttled by the ingest-rate budget.

use ringcopy::channel::{GroupSender, PipeReceiver, PipeSender};
use ringcopy::options::CopySettings;
use ringcopy::rate::RateMeter;

use crate::messages::{Chunk, ChunkBound, FeedingSummary, ImportMsg, PipeMsg, TaskError};
use crate::reader::{FilesReader, PipeReader};

/// Where the feeder pulls rows from.
pub(crate) enum FeederInput {
    /// Comma-separated glob patterns.
    Files(String),
    /// Rows forwarded by the coordinator from standard input.
    Pipe,
}

enum Reader {
    Files(FilesReader),
    Pipe(PipeReader),
}

pub(crate) struct Feeder {
    input: FeederInput,
    settings: CopySettings,
    inbound: PipeReceiver<PipeMsg>,
    out: GroupSender<ImportMsg>,
    workers: Vec<PipeSender<ChunkBound>>,
    chunk_id: u64,
}

impl Feeder {
    pub(crate) fn new(
        input: FeederInput,
        settings: CopySettings,
        inbound: PipeReceiver<PipeMsg>,
        out: GroupSender<ImportMsg>,
        workers: Vec<PipeSender<ChunkBound>>,
    ) -> Self {
        Self { input, settings, inbound, out, workers, chunk_id: 0 }
    }

    /// Feed every source, report the final account, then wait for the
    /// poison pill.
    pub(crate) async fn run(mut self) {
        let started = match &self.input {
            FeederInput::Files(pattern) => {
                let mut r = FilesReader::new(pattern, &self.settings);
                r.start().map(|()| Reader::Files(r))
            }
            FeederInput::Pipe => Ok(Reader::Pipe(PipeReader::new(&self.settings))),
        };
        let mut reader = match started {
            Ok(reader) => reader,
            Err(e) => {
                let _ = self
                    .out
                    .send(ImportMsg::Error(TaskError::new("ReadError", e.to_string())));
                let _ = self.out.send(ImportMsg::FeederDone(FeedingSummary {
                    sent: 0,
                    num_sources: 0,
                    skip_rows: self.settings.skip_rows,
                }));
                self.wait_for_shutdown().await;
                return;
            }
        };

        // One meter window per second paces the ingest-rate budget.
        let mut send_meter =
            RateMeter::new(std::time::Duration::from_secs(1), false, None)
                .unwrap_or_else(|_| unreachable!("meter without a log file"));
        let ingest_rate = self.settings.ingest_rate;
        let mut sent = 0u64;

        'feeding: while !exhausted(&reader) {
            for i in 0..self.workers.len() {
                let budget = ingest_rate.saturating_sub(send_meter.current_record());
                if budget == 0 {
                    send_meter.maybe_update_sleeping().await;
                    continue;
                }
                let rows = match &mut reader {
                    Reader::Files(r) => r.read_rows(budget as usize),
                    Reader::Pipe(r) => r.read_rows(&mut self.inbound, budget as usize).await,
                };
                if !rows.is_empty() {
                    let n = rows.len() as u64;
                    self.chunk_id += 1;
                    send_meter.increment(n);
                    let chunk =
                        Chunk { id: self.chunk_id, rows, attempts: 1 };
                    if self.workers[i].send(ChunkBound::Chunk(chunk)).is_err() {
                        let _ = self.out.send(ImportMsg::Error(TaskError::new(
                            "WorkerError",
                            format!("import worker {i} is gone"),
                        )));
                        break 'feeding;
                    }
                    sent += n;
                }
                if exhausted(&reader) {
                    break;
                }
            }
        }

        let num_sources = match &reader {
            Reader::Files(r) => r.num_sources,
            Reader::Pipe(_) => 1,
        };
        let skip_rows = match &reader {
            Reader::Files(r) => r.skip_rows(),
            Reader::Pipe(r) => r.skip_rows(),
        };
        let _ = self.out.send(ImportMsg::FeederDone(FeedingSummary {
            sent,
            num_sources,
            skip_rows,
        }));

        self.wait_for_shutdown().await;
    }

    async fn wait_for_shutdown(&mut self) {
        loop {
            match self.inbound.recv().await {
                None | Some(PipeMsg::Shutdown) => break,
                Some(PipeMsg::Row(_) | PipeMsg::Eof) => {}
            }
        }
    }
}

fn exhausted(reader: &Reader) -> bool {
    match reader {
        Reader::Files(r) => r.exhausted(),
        Reader::Pipe(r) => r.exhausted(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringcopy::channel::{fan_in, pipe};
    use std::collections::BTreeMap;
    use std::io::Write as _;

    fn settings(pairs: &[(&str, &str)]) -> CopySettings {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ringcopy::options::CopyOptions::parse(&map, "ks", "t").unwrap().copy
    }

    #[tokio::test]
    async fn chunks_round_robin_across_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        for i in 0..10 {
            writeln!(f, "{i},x").unwrap();
        }
        drop(f);

        let (w1_tx, mut w1_rx) = pipe();
        let (w2_tx, mut w2_rx) = pipe();
        let (ctl_tx, ctl_rx) = pipe();
        let mut results = fan_in();

        let feeder = Feeder::new(
            FeederInput::Files(path.display().to_string()),
            settings(&[("chunksize", "3")]),
            ctl_rx,
            results.sender(),
            vec![w1_tx, w2_tx],
        );
        let handle = tokio::spawn(feeder.run());

        let done = results.recv_timeout(std::time::Duration::from_secs(5)).await;
        let sent = done
            .iter()
            .find_map(|m| match m {
                ImportMsg::FeederDone(s) => Some(s.sent),
                _ => None,
            })
            .expect("feeding summary");
        assert_eq!(sent, 10);
        ctl_tx.send(PipeMsg::Shutdown).unwrap();
        handle.await.unwrap();

        let drain = |rx: &mut ringcopy::channel::PipeReceiver<ChunkBound>| {
            let mut chunks = Vec::new();
            while let Some(ChunkBound::Chunk(c)) = rx.try_recv() {
                chunks.push(c);
            }
            chunks
        };
        let w1 = drain(&mut w1_rx);
        let w2 = drain(&mut w2_rx);

        // 10 rows in chunks of up to 3, dealt round-robin: ids alternate
        assert_eq!(w1.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(w2.iter().map(|c| c.id).collect::<Vec<_>>(), vec![2, 4]);
        let total: usize = w1.iter().chain(w2.iter()).map(|c| c.rows.len()).sum();
        assert_eq!(total, 10);
        assert!(w1.iter().chain(w2.iter()).all(|c| c.attempts == 1));
    }
}

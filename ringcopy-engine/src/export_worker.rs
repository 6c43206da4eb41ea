//! Export worker: scans assigned token ranges against their replicas and
//! streams CSV chunks back to the coordinator.
//!
//! Sessions are opened lazily, one per replica host, each pinned to that
//! host alone; the replica with the fewest requests in flight wins the
//! next range. Above `maxrequests` in-flight the worker naps a
//! millisecond before pulling more work.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ringcopy::channel::{GroupSender, PipeReceiver};
use ringcopy::convert::ValueFormatter;
use ringcopy::cql::{HostAddr, Value};
use ringcopy::driver::{ClusterDriver, DriverSession, SelectQuery};
use ringcopy::options::{CopySettings, Dialect};
use ringcopy::retry::{ExpBackoffRetry, select_page_with_retry};

use crate::messages::{ExportMsg, ExportWork, RangeAssignment};

#[derive(Clone)]
struct WorkerSession {
    session: Arc<dyn DriverSession>,
    requests: Arc<AtomicUsize>,
}

pub(crate) struct ExportWorker {
    cluster: Arc<dyn ClusterDriver>,
    keyspace: String,
    table: String,
    columns: Vec<String>,
    partition_key: Vec<String>,
    settings: CopySettings,
    dialect: Dialect,
    formatter: Arc<ValueFormatter>,
    work: PipeReceiver<ExportWork>,
    results: GroupSender<ExportMsg>,
    sessions: HashMap<HostAddr, WorkerSession>,
}

impl ExportWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cluster: Arc<dyn ClusterDriver>,
        keyspace: String,
        table: String,
        columns: Vec<String>,
        partition_key: Vec<String>,
        settings: CopySettings,
        dialect: Dialect,
        work: PipeReceiver<ExportWork>,
        results: GroupSender<ExportMsg>,
    ) -> Self {
        let formatter = Arc::new(ValueFormatter::new(&settings));
        Self {
            cluster,
            keyspace,
            table,
            columns,
            partition_key,
            settings,
            dialect,
            formatter,
            work,
            results,
            sessions: HashMap::new(),
        }
    }

    /// Pull ranges until the channel closes or the pill arrives.
    pub(crate) async fn run(mut self) {
        loop {
            if self.num_requests() > self.settings.max_requests {
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }
            match self.work.recv().await {
                None | Some(ExportWork::Shutdown) => break,
                Some(ExportWork::Range(assignment)) => self.start_range(assignment).await,
            }
        }
        for (_, ws) in self.sessions.drain() {
            ws.session.shutdown().await;
        }
    }

    fn num_requests(&self) -> usize {
        self.sessions.values().map(|ws| ws.requests.load(Ordering::Relaxed)).sum()
    }

    /// Kick off the async scan of one range.
    async fn start_range(&mut self, assignment: RangeAssignment) {
        // Prefer hosts with no session yet, then the least busy one.
        let mut hosts = assignment.hosts.clone();
        hosts.sort_by_key(|h| {
            self.sessions.get(h).map_or(0, |ws| ws.requests.load(Ordering::Relaxed))
        });

        let mut errors = Vec::new();
        let mut connected = None;
        for host in &hosts {
            match self.session_for(host).await {
                Ok(ws) => {
                    connected = Some(ws);
                    break;
                }
                Err(e) => errors.push(format!("{host}: {e}")),
            }
        }
        let Some(ws) = connected else {
            let _ = self.results.send(ExportMsg::RangeFailed {
                range: assignment.range,
                error: format!(
                    "failed to connect to all replicas {hosts:?}: {}",
                    errors.join("; ")
                ),
            });
            return;
        };

        let query = SelectQuery {
            keyspace: self.keyspace.clone(),
            table: self.table.clone(),
            columns: self.columns.clone(),
            partition_key: self.partition_key.clone(),
            token_range: assignment.range,
            consistency: self.settings.consistency_level,
            page_size: self.settings.page_size,
            timeout: self.settings.page_timeout,
        };
        tracing::debug!(
            range = %assignment.range,
            attempts = assignment.attempts,
            cql = %query.cql(),
            "starting range"
        );

        ws.requests.fetch_add(1, Ordering::Relaxed);
        let results = self.results.clone();
        let formatter = Arc::clone(&self.formatter);
        let dialect = self.dialect;
        let retry = ExpBackoffRetry::new(self.settings.max_attempts);
        tokio::spawn(async move {
            stream_range(ws, query, formatter, dialect, retry, results).await;
        });
    }

    /// The cached session for `host`, opening a whitelisted one on first
    /// use.
    async fn session_for(&mut self, host: &HostAddr) -> Result<WorkerSession, String> {
        if let Some(ws) = self.sessions.get(host) {
            return Ok(ws.clone());
        }
        let session = self
            .cluster
            .connect(std::slice::from_ref(host), true)
            .await
            .map_err(|e| e.to_string())?;
        tracing::debug!(
            host = %host,
            page_size = self.settings.page_size,
            page_timeout_s = self.settings.page_timeout.as_secs(),
            "connected"
        );
        let ws = WorkerSession { session, requests: Arc::new(AtomicUsize::new(0)) };
        self.sessions.insert(host.clone(), ws.clone());
        Ok(ws)
    }
}

/// Page through one range, sending a CSV chunk per page.
async fn stream_range(
    ws: WorkerSession,
    query: SelectQuery,
    formatter: Arc<ValueFormatter>,
    dialect: Dialect,
    retry: ExpBackoffRetry,
    results: GroupSender<ExportMsg>,
) {
    let range = query.token_range;
    let mut paging_state = None;
    loop {
        match select_page_with_retry(ws.session.as_ref(), &query, paging_state, retry).await {
            Ok(page) => {
                if !page.rows.is_empty() {
                    match format_chunk(&page.rows, &formatter, dialect) {
                        Ok(data) => {
                            let rows = page.rows.len() as u64;
                            let _ = results.send(ExportMsg::Page { range, data, rows });
                        }
                        Err(e) => {
                            // a row we cannot render is a worker defect,
                            // not a cluster-side range failure
                            let _ = results.send(ExportMsg::WorkerFailed {
                                error: format!("cannot render rows as CSV: {e}"),
                            });
                            let _ = results.send(ExportMsg::RangeFailed { range, error: e });
                            break;
                        }
                    }
                }
                match page.paging_state {
                    Some(next) => paging_state = Some(next),
                    None => {
                        let _ = results.send(ExportMsg::RangeFinished);
                        break;
                    }
                }
            }
            Err(e) => {
                let _ = results.send(ExportMsg::RangeFailed { range, error: e.to_string() });
                break;
            }
        }
    }
    ws.requests.fetch_sub(1, Ordering::Relaxed);
}

/// Render one page of rows as CSV text in the run's dialect.
fn format_chunk(
    rows: &[Vec<Value>],
    formatter: &ValueFormatter,
    dialect: Dialect,
) -> Result<String, String> {
    let mut builder = csv::WriterBuilder::new();
    builder
        .delimiter(dialect.delimiter)
        .quote(dialect.quote)
        .double_quote(dialect.double_quote);
    if let Some(escape) = dialect.escape {
        builder.escape(escape);
    }
    let mut w = builder.from_writer(Vec::new());
    for row in rows {
        let fields: Vec<String> = row.iter().map(|v| formatter.format(v)).collect();
        w.write_record(&fields).map_err(|e| e.to_string())?;
    }
    let bytes = w.into_inner().map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn formatter() -> ValueFormatter {
        let map = BTreeMap::new();
        let opts = ringcopy::options::CopyOptions::parse(&map, "ks", "t").unwrap();
        ValueFormatter::new(&opts.copy)
    }

    #[test]
    fn chunk_formatting_quotes_only_when_needed() {
        let rows = vec![
            vec![Value::Int(1), Value::Text("plain".into())],
            vec![Value::Int(2), Value::Text("a,b".into())],
        ];
        let data = format_chunk(&rows, &formatter(), Dialect::default()).unwrap();
        assert_eq!(data, "1,plain\n2,\"a,b\"\n");
    }

    #[test]
    fn chunk_formatting_honors_delimiter() {
        let rows = vec![vec![Value::Int(1), Value::Text("x".into())]];
        let dialect = Dialect { delimiter: b'|', ..Dialect::default() };
        let data = format_chunk(&rows, &formatter(), dialect).unwrap();
        assert_eq!(data, "1|x\n");
    }
}

//! Import worker: parses chunk rows, groups them by ring position into
//! replica-tagged batches and executes them with retries.
//!
//! Timeout-class failures back off inside the session wrapper; anything
//! that still fails is reported and resubmitted with the same replicas
//! until the attempt budget runs out, at which point the rows are
//! credited anyway so chunk completion can be declared.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ringcopy::channel::{GroupSender, PipeReceiver};
use ringcopy::convert::{ImportedRow, RowConverter, RowPayload, ValueFormatter};
use ringcopy::cql::{HostAddr, TableMeta, protect_name};
use ringcopy::driver::{
    BatchEntry, BatchKind, BatchRequest, ClusterDriver, DriverSession, PreparedId,
};
use ringcopy::options::{CopySettings, Dialect};
use ringcopy::retry::{ExpBackoffRetry, execute_batch_with_retry};
use ringcopy::ring::TokenMap;

use crate::messages::{Chunk, ChunkBound, ImportMsg, TaskError};

/// How rows become statements.
enum StatementShape {
    /// Counter tables take `UPDATE ... SET c=c+? WHERE pk=?` batches.
    Counter { table_name: String, columns: Vec<String>, pk_indexes: Vec<usize> },
    /// Bound values against a server-side prepared insert.
    Prepared { id: PreparedId },
    /// Textual inserts with protected literals.
    Literal { prefix: String },
}

/// Everything a spawned batch task needs.
struct BatchContext {
    session: Arc<dyn DriverSession>,
    shape: StatementShape,
    keyspace: String,
    settings: CopySettings,
    retry: ExpBackoffRetry,
    formatter: ValueFormatter,
    out: GroupSender<ImportMsg>,
}

/// Completion accounting for one chunk; every row is credited exactly
/// once, whether it was imported, failed parsing or failed for good.
struct ChunkProgress {
    total: u64,
    credited: AtomicU64,
    out: GroupSender<ImportMsg>,
}

impl ChunkProgress {
    fn credit(&self, n: u64) {
        let after = self.credited.fetch_add(n, Ordering::AcqRel) + n;
        if after == self.total {
            let _ = self.out.send(ImportMsg::Progress(self.total));
        }
    }
}

/// One replica-group slice of a chunk.
struct Batch {
    rows: Vec<ImportedRow>,
    replicas: Vec<HostAddr>,
    attempts: u32,
}

pub(crate) struct ImportWorker {
    cluster: Arc<dyn ClusterDriver>,
    keyspace: String,
    table: String,
    valid_columns: Vec<String>,
    skip_indexes: Vec<usize>,
    settings: CopySettings,
    dialect: Dialect,
    work: PipeReceiver<ChunkBound>,
    out: GroupSender<ImportMsg>,
}

struct WorkerRuntime {
    ctx: Arc<BatchContext>,
    converter: RowConverter,
    token_map: TokenMap,
}

impl ImportWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cluster: Arc<dyn ClusterDriver>,
        keyspace: String,
        table: String,
        valid_columns: Vec<String>,
        skip_indexes: Vec<usize>,
        settings: CopySettings,
        dialect: Dialect,
        work: PipeReceiver<ChunkBound>,
        out: GroupSender<ImportMsg>,
    ) -> Self {
        Self {
            cluster,
            keyspace,
            table,
            valid_columns,
            skip_indexes,
            settings,
            dialect,
            work,
            out,
        }
    }

    /// Consume chunks until the pill arrives.
    pub(crate) async fn run(mut self) {
        let runtime = match self.setup().await {
            Ok(rt) => rt,
            Err(e) => {
                let _ = self.out.send(ImportMsg::Error(TaskError::new("WorkerError", e)));
                return;
            }
        };
        while let Some(msg) = self.work.recv().await {
            match msg {
                ChunkBound::Shutdown => break,
                ChunkBound::Chunk(chunk) => self.process_chunk(&runtime, chunk),
            }
        }
        runtime.ctx.session.shutdown().await;
    }

    /// Connect, pick the statement shape and build the conversion and
    /// routing state.
    async fn setup(&self) -> Result<WorkerRuntime, String> {
        let meta = self.cluster.metadata();
        let table_meta = self
            .cluster
            .table_meta(&self.keyspace, &self.table)
            .map_err(|e| e.to_string())?;
        let session = self
            .cluster
            .connect(std::slice::from_ref(&meta.contact_point), false)
            .await
            .map_err(|e| e.to_string())?;

        let is_counter = self.valid_columns.iter().any(|name| {
            table_meta.column(name).is_some_and(|c| c.cql_type.is_counter())
        });
        let prepared = self.settings.prepared_statements && !is_counter;

        let converter =
            RowConverter::new(&table_meta, &self.valid_columns, &self.settings, prepared)
                .map_err(|e| e.to_string())?;

        let shape = if is_counter {
            StatementShape::Counter {
                table_name: table_meta.qualified_name(),
                columns: self.valid_columns.iter().map(|c| protect_name(c)).collect(),
                pk_indexes: converter.pk_indexes().to_vec(),
            }
        } else {
            let cql = insert_statement(&table_meta, &self.valid_columns, prepared);
            if prepared {
                let id = session.prepare(&cql).await.map_err(|e| e.to_string())?;
                StatementShape::Prepared { id }
            } else {
                StatementShape::Literal { prefix: cql }
            }
        };

        let ctx = Arc::new(BatchContext {
            session,
            shape,
            keyspace: self.keyspace.clone(),
            settings: self.settings.clone(),
            retry: ExpBackoffRetry::new(self.settings.max_attempts),
            formatter: ValueFormatter::new(&self.settings),
            out: self.out.clone(),
        });
        Ok(WorkerRuntime { ctx, converter, token_map: TokenMap::new(&meta) })
    }

    /// Parse, convert, batch and launch one chunk.
    fn process_chunk(&self, rt: &WorkerRuntime, chunk: Chunk) {
        tracing::debug!(
            chunk = chunk.id,
            rows = chunk.rows.len(),
            attempt = chunk.attempts,
            "processing chunk"
        );
        let progress = Arc::new(ChunkProgress {
            total: chunk.rows.len() as u64,
            credited: AtomicU64::new(0),
            out: self.out.clone(),
        });

        // Parse errors are grouped per message, reported once each, and
        // their rows credited to the chunk right away.
        let mut errors: HashMap<String, Vec<Vec<String>>> = HashMap::new();
        let mut converted: Vec<ImportedRow> = Vec::with_capacity(chunk.rows.len());
        for line in &chunk.rows {
            match self.parse_line(line) {
                Err(msg) => errors.entry(msg).or_default().push(vec![line.clone()]),
                Ok(fields) => match rt.converter.convert_row(&fields) {
                    Ok(row) => converted.push(row),
                    Err(e) => errors.entry(e.to_string()).or_default().push(fields),
                },
            }
        }
        for (msg, rows) in errors {
            let n = rows.len() as u64;
            let _ = self
                .out
                .send(ImportMsg::Error(TaskError::with_rows("ParseError", msg, rows)));
            progress.credit(n);
        }

        for batch in split_into_batches(converted, &rt.token_map, &self.settings) {
            let ctx = Arc::clone(&rt.ctx);
            let progress = Arc::clone(&progress);
            tokio::spawn(run_batch(ctx, progress, batch));
        }
    }

    /// Tokenize one raw line with the run's dialect, dropping skipped
    /// columns.
    fn parse_line(&self, line: &str) -> Result<Vec<String>, String> {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .has_headers(false)
            .delimiter(self.dialect.delimiter)
            .quote(self.dialect.quote)
            .double_quote(self.dialect.double_quote)
            .escape(self.dialect.escape);
        let mut reader = builder.from_reader(line.as_bytes());
        let mut record = csv::StringRecord::new();
        match reader.read_record(&mut record) {
            Ok(true) => Ok(record
                .iter()
                .enumerate()
                .filter(|(i, _)| !self.skip_indexes.contains(i))
                .map(|(_, f)| f.to_owned())
                .collect()),
            Ok(false) => Err("empty record".to_owned()),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// `INSERT INTO ks.t (a, b) VALUES (?, ?)` or its literal-placeholder
/// prefix form `INSERT INTO ks.t (a, b) VALUES `.
fn insert_statement(table: &TableMeta, columns: &[String], prepared: bool) -> String {
    let cols: Vec<String> = columns.iter().map(|c| protect_name(c)).collect();
    let base = format!("INSERT INTO {} ({}) VALUES ", table.qualified_name(), cols.join(", "));
    if prepared {
        let marks: Vec<&str> = columns.iter().map(|_| "?").collect();
        format!("{base}({})", marks.join(", "))
    } else {
        base
    }
}

/// Group converted rows by ring position. A position with more than
/// `minbatchsize` rows is sliced into `maxbatchsize` batches tagged with
/// all of its replicas; smaller groups pool under their first valid
/// replica to keep replica overlap across partition keys.
fn split_into_batches(
    converted: Vec<ImportedRow>,
    token_map: &TokenMap,
    settings: &CopySettings,
) -> Vec<Batch> {
    let mut by_pos: HashMap<usize, Vec<ImportedRow>> = HashMap::new();
    for row in converted {
        let pos = token_map.ring_pos(token_map.token_of(&row.routing_key));
        by_pos.entry(pos).or_default().push(row);
    }

    let mut batches = Vec::new();
    let mut by_replica: HashMap<Vec<HostAddr>, Vec<ImportedRow>> = HashMap::new();
    for (pos, rows) in by_pos {
        if rows.len() > settings.min_batch_size {
            let replicas = token_map.filter_replicas(&token_map.replicas[pos]);
            for slice in rows.chunks(settings.max_batch_size) {
                batches.push(Batch {
                    rows: slice.to_vec(),
                    replicas: replicas.clone(),
                    attempts: 1,
                });
            }
        } else {
            let first: Vec<HostAddr> = token_map
                .filter_replicas(&token_map.replicas[pos])
                .into_iter()
                .take(1)
                .collect();
            by_replica.entry(first).or_default().extend(rows);
        }
    }
    for (replicas, rows) in by_replica {
        for slice in rows.chunks(settings.max_batch_size) {
            batches.push(Batch { rows: slice.to_vec(), replicas: replicas.clone(), attempts: 1 });
        }
    }
    batches
}

/// Execute one batch, retrying with the same replicas until it lands or
/// the budget is spent.
async fn run_batch(ctx: Arc<BatchContext>, progress: Arc<ChunkProgress>, mut batch: Batch) {
    let rows = batch.rows.len() as u64;
    loop {
        let request = match build_request(&ctx, &batch) {
            Ok(r) => r,
            Err(msg) => {
                let _ = ctx.out.send(ImportMsg::Error(TaskError::with_rows(
                    "ParseError",
                    msg,
                    display_rows(&ctx.formatter, &batch),
                )));
                progress.credit(rows);
                return;
            }
        };
        match execute_batch_with_retry(ctx.session.as_ref(), &request, ctx.retry).await {
            Ok(()) => {
                progress.credit(rows);
                return;
            }
            Err(e) => {
                let is_final = batch.attempts >= ctx.settings.max_attempts;
                let _ = ctx.out.send(ImportMsg::Error(TaskError {
                    name: e.tag().to_owned(),
                    msg: e.to_string(),
                    rows: display_rows(&ctx.formatter, &batch),
                    attempts: batch.attempts,
                    is_final,
                }));
                if is_final {
                    progress.credit(rows);
                    return;
                }
                batch.attempts += 1;
            }
        }
    }
}

/// Build the driver request for a batch in its current attempt.
fn build_request(ctx: &BatchContext, batch: &Batch) -> Result<BatchRequest, String> {
    let mut entries = Vec::with_capacity(batch.rows.len());
    for row in &batch.rows {
        let entry = match (&ctx.shape, &row.payload) {
            (StatementShape::Prepared { id }, RowPayload::Bound(values)) => {
                BatchEntry::Prepared { id: *id, values: values.clone() }
            }
            (StatementShape::Literal { prefix }, RowPayload::Literal(literals)) => {
                BatchEntry::Simple { cql: format!("{prefix}({})", literals.join(", ")) }
            }
            (
                StatementShape::Counter { table_name, columns, pk_indexes },
                RowPayload::Literal(literals),
            ) => {
                let mut set_clause = Vec::new();
                let mut where_clause = Vec::new();
                for (i, value) in literals.iter().enumerate() {
                    let col = &columns[i];
                    if pk_indexes.contains(&i) {
                        where_clause.push(format!("{col}={value}"));
                    } else {
                        set_clause.push(format!("{col}={col}+{value}"));
                    }
                }
                BatchEntry::Simple {
                    cql: format!(
                        "UPDATE {table_name} SET {} WHERE {}",
                        set_clause.join(","),
                        where_clause.join(" AND ")
                    ),
                }
            }
            _ => return Err("statement shape does not match row payload".to_owned()),
        };
        entries.push(entry);
    }
    let kind = match ctx.shape {
        StatementShape::Counter { .. } => BatchKind::Counter,
        _ => BatchKind::Unlogged,
    };
    Ok(BatchRequest {
        kind,
        consistency: ctx.settings.consistency_level,
        keyspace: ctx.keyspace.clone(),
        replicas: batch.replicas.clone(),
        entries,
    })
}

/// Render batch rows for the error file.
fn display_rows(formatter: &ValueFormatter, batch: &Batch) -> Vec<Vec<String>> {
    batch
        .rows
        .iter()
        .map(|row| match &row.payload {
            RowPayload::Bound(values) => values.iter().map(|v| formatter.format(v)).collect(),
            RowPayload::Literal(literals) => literals.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringcopy::cql::{ColumnMeta, CqlType, Value};
    use ringcopy::driver::{ClusterMetadata, HostInfo};
    use ringcopy::ring::Partitioner;
    use std::collections::BTreeMap;

    fn settings(pairs: &[(&str, &str)]) -> CopySettings {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ringcopy::options::CopyOptions::parse(&map, "ks", "t").unwrap().copy
    }

    fn table() -> TableMeta {
        TableMeta {
            keyspace: "ks".into(),
            table: "t".into(),
            columns: vec![
                ColumnMeta { name: "id".into(), cql_type: CqlType::Int },
                ColumnMeta { name: "hits".into(), cql_type: CqlType::Counter },
            ],
            partition_key: vec!["id".into()],
            primary_key: vec!["id".into()],
        }
    }

    #[test]
    fn insert_statement_shapes() {
        let cols = vec!["id".to_owned(), "Name".to_owned()];
        let t = TableMeta {
            keyspace: "ks".into(),
            table: "t".into(),
            columns: vec![
                ColumnMeta { name: "id".into(), cql_type: CqlType::Int },
                ColumnMeta { name: "Name".into(), cql_type: CqlType::Text },
            ],
            partition_key: vec!["id".into()],
            primary_key: vec!["id".into()],
        };
        assert_eq!(
            insert_statement(&t, &cols, true),
            "INSERT INTO ks.t (id, \"Name\") VALUES (?, ?)"
        );
        assert_eq!(insert_statement(&t, &cols, false), "INSERT INTO ks.t (id, \"Name\") VALUES ");
    }

    fn batch_ctx(shape: StatementShape) -> BatchContext {
        let s = settings(&[]);
        let group = ringcopy::channel::fan_in::<ImportMsg>();
        BatchContext {
            session: dummy_session(),
            shape,
            keyspace: "ks".into(),
            settings: s.clone(),
            retry: ExpBackoffRetry::new(s.max_attempts),
            formatter: ValueFormatter::new(&s),
            out: group.sender(),
        }
    }

    fn dummy_session() -> Arc<dyn DriverSession> {
        struct Nop;
        #[async_trait::async_trait]
        impl DriverSession for Nop {
            async fn prepare(
                &self,
                _cql: &str,
            ) -> Result<PreparedId, ringcopy::driver::DriverError> {
                Ok(PreparedId(0))
            }
            async fn select_page(
                &self,
                _query: &ringcopy::driver::SelectQuery,
                _paging_state: Option<u64>,
            ) -> Result<ringcopy::driver::Page, ringcopy::driver::DriverError> {
                Ok(ringcopy::driver::Page { rows: vec![], paging_state: None })
            }
            async fn execute_batch(
                &self,
                _batch: &BatchRequest,
            ) -> Result<(), ringcopy::driver::DriverError> {
                Ok(())
            }
            async fn shutdown(&self) {}
        }
        Arc::new(Nop)
    }

    fn literal_row(literals: &[&str], key: i32) -> ImportedRow {
        ImportedRow {
            payload: RowPayload::Literal(literals.iter().map(|s| (*s).to_owned()).collect()),
            routing_key: key.to_be_bytes().to_vec(),
        }
    }

    #[test]
    fn counter_batches_compose_updates() {
        let ctx = batch_ctx(StatementShape::Counter {
            table_name: "ks.t".into(),
            columns: vec!["id".into(), "hits".into()],
            pk_indexes: vec![0],
        });
        let batch = Batch {
            rows: vec![literal_row(&["7", "3"], 7)],
            replicas: vec!["h1".into()],
            attempts: 1,
        };
        let request = build_request(&ctx, &batch).unwrap();
        assert_eq!(request.kind, BatchKind::Counter);
        match &request.entries[0] {
            BatchEntry::Simple { cql } => {
                assert_eq!(cql, "UPDATE ks.t SET hits=hits+3 WHERE id=7");
            }
            BatchEntry::Prepared { .. } => panic!("expected statement text"),
        }
    }

    #[test]
    fn literal_batches_inline_values() {
        let ctx = batch_ctx(StatementShape::Literal {
            prefix: "INSERT INTO ks.t (id, name) VALUES ".into(),
        });
        let batch = Batch {
            rows: vec![literal_row(&["1", "'a'"], 1)],
            replicas: vec![],
            attempts: 1,
        };
        let request = build_request(&ctx, &batch).unwrap();
        match &request.entries[0] {
            BatchEntry::Simple { cql } => {
                assert_eq!(cql, "INSERT INTO ks.t (id, name) VALUES (1, 'a')");
            }
            BatchEntry::Prepared { .. } => panic!("expected statement text"),
        }
        assert_eq!(request.kind, BatchKind::Unlogged);
    }

    fn token_map_two_slots() -> TokenMap {
        let mut hosts = std::collections::HashMap::new();
        for h in ["h1", "h2"] {
            hosts.insert(
                h.to_owned(),
                HostInfo { address: h.to_owned(), datacenter: "dc1".into(), is_up: true },
            );
        }
        TokenMap::new(&ClusterMetadata {
            contact_point: "h1".into(),
            local_dc: "dc1".into(),
            partitioner: Partitioner::Murmur3,
            ring: vec![(0, vec!["h1".into()]), (i64::MAX, vec!["h2".into()])],
            hosts,
        })
    }

    #[test]
    fn large_groups_split_with_all_replicas() {
        let tm = token_map_two_slots();
        let s = settings(&[("minbatchsize", "2"), ("maxbatchsize", "3")]);
        // 7 rows with the same routing key land in one ring position
        let rows: Vec<ImportedRow> = (0..7).map(|_| literal_row(&["1"], 42)).collect();
        let batches = split_into_batches(rows, &tm, &s);
        assert_eq!(batches.len(), 3);
        let mut sizes: Vec<usize> = batches.iter().map(|b| b.rows.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 3, 3]);
        // all batches carry the full replica set of their position
        let expected = tm.filter_replicas(&tm.replicas[tm.ring_pos(tm.token_of(&42i32.to_be_bytes()))]);
        for b in &batches {
            assert_eq!(b.rows.len().min(1), 1);
            assert_eq!(b.replicas.len(), expected.len());
        }
    }

    #[test]
    fn small_groups_pool_under_first_replica() {
        let tm = token_map_two_slots();
        let s = settings(&[("minbatchsize", "10"), ("maxbatchsize", "20")]);
        let mut rows = Vec::new();
        for key in 0..5 {
            rows.push(literal_row(&["1"], key));
        }
        let batches = split_into_batches(rows, &tm, &s);
        let total: usize = batches.iter().map(|b| b.rows.len()).sum();
        assert_eq!(total, 5);
        for b in &batches {
            assert!(b.replicas.len() <= 1, "pooled batches pin at most one replica");
        }
    }

    #[test]
    fn counter_detection_uses_schema() {
        let t = table();
        assert!(t.column("hits").unwrap().cql_type.is_counter());
    }
}

//! In-memory cluster for exercising the copy engine without a server.
//!
//! Rows live in a table map keyed by qualified name, routed with the same
//! murmur3 hash the import path uses, and faults can be injected to force
//! the retry paths: a token range that fails its first reads, or a
//! countdown of write timeouts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::cql::{HostAddr, TableMeta, Value, serialize_partition_key};
use crate::driver::{
    BatchEntry, BatchRequest, ClusterDriver, ClusterMetadata, DriverError, DriverSession,
    HostInfo, Page, PreparedId, SelectQuery,
};
use crate::ring::{Partitioner, TokenRange, murmur3_token};

/// A token range that errors until its attempt budget is spent.
#[derive(Debug, Clone, Copy)]
struct FailingRange {
    begin: i64,
    end: i64,
    failures: u32,
}

#[derive(Debug, Clone)]
struct PreparedInsert {
    table_key: String,
    columns: Vec<String>,
}

#[derive(Default)]
struct Faults {
    failing_range: Option<FailingRange>,
    range_attempts: HashMap<(i64, i64), u32>,
    write_timeouts: u32,
}

struct MemState {
    contact_point: HostAddr,
    local_dc: String,
    partitioner: Partitioner,
    ring: Vec<(i64, Vec<HostAddr>)>,
    hosts: HashMap<HostAddr, HostInfo>,
    tables: HashMap<String, TableMeta>,
    rows: Mutex<HashMap<String, Vec<(i64, Vec<Value>)>>>,
    prepared: Mutex<HashMap<u64, PreparedInsert>>,
    next_prepared: AtomicU64,
    simple_statements: Mutex<Vec<String>>,
    connections: Mutex<Vec<Vec<HostAddr>>>,
    faults: Mutex<Faults>,
}

/// Builder-configured in-memory cluster.
#[derive(Clone)]
pub struct MemCluster {
    state: Arc<MemState>,
}

/// Builder for [`MemCluster`].
pub struct MemClusterBuilder {
    contact_point: HostAddr,
    local_dc: String,
    partitioner: Partitioner,
    ring: Vec<(i64, Vec<HostAddr>)>,
    hosts: HashMap<HostAddr, HostInfo>,
    tables: HashMap<String, TableMeta>,
    seed_rows: Vec<(String, Vec<Vec<Value>>)>,
}

impl MemCluster {
    /// Start building a cluster with contact point `127.0.0.1` in `dc1`.
    #[must_use]
    pub fn builder() -> MemClusterBuilder {
        MemClusterBuilder {
            contact_point: "127.0.0.1".to_owned(),
            local_dc: "dc1".to_owned(),
            partitioner: Partitioner::Murmur3,
            ring: Vec::new(),
            hosts: HashMap::new(),
            tables: HashMap::new(),
            seed_rows: Vec::new(),
        }
    }

    /// Snapshot of a table's rows in schema column order.
    #[must_use]
    pub fn rows(&self, keyspace: &str, table: &str) -> Vec<Vec<Value>> {
        let key = format!("{keyspace}.{table}");
        self.state
            .rows
            .lock()
            .expect("rows lock")
            .get(&key)
            .map(|rows| rows.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Every non-prepared statement executed so far, in arrival order.
    #[must_use]
    pub fn simple_statements(&self) -> Vec<String> {
        self.state.simple_statements.lock().expect("statements lock").clone()
    }

    /// Host lists passed to `connect`, in call order.
    #[must_use]
    pub fn connections(&self) -> Vec<Vec<HostAddr>> {
        self.state.connections.lock().expect("connections lock").clone()
    }

    /// Fail reads of the `(begin, end]` range `failures` times.
    pub fn fail_range(&self, begin: i64, end: i64, failures: u32) {
        let mut faults = self.state.faults.lock().expect("faults lock");
        faults.failing_range = Some(FailingRange { begin, end, failures });
        faults.range_attempts.clear();
    }

    /// Fail the next `n` batch executions with a write timeout.
    pub fn fail_writes(&self, n: u32) {
        self.state.faults.lock().expect("faults lock").write_timeouts = n;
    }

    fn token_of_row(table: &TableMeta, row: &[Value]) -> Result<i64, DriverError> {
        let values: Vec<&Value> = table
            .partition_key
            .iter()
            .map(|name| {
                table
                    .columns
                    .iter()
                    .position(|c| &c.name == name)
                    .map(|i| &row[i])
                    .ok_or_else(|| DriverError::Other(format!("bad partition key {name}")))
            })
            .collect::<Result<_, _>>()?;
        let key = serialize_partition_key(&values)
            .map_err(|e| DriverError::Other(e.to_string()))?;
        Ok(murmur3_token(&key))
    }
}

impl MemClusterBuilder {
    #[must_use]
    pub fn contact_point(mut self, host: &str) -> Self {
        self.contact_point = host.to_owned();
        self
    }

    #[must_use]
    pub fn local_dc(mut self, dc: &str) -> Self {
        self.local_dc = dc.to_owned();
        self
    }

    #[must_use]
    pub fn partitioner(mut self, p: Partitioner) -> Self {
        self.partitioner = p;
        self
    }

    /// Add a host; the first host added becomes the contact point.
    #[must_use]
    pub fn host(mut self, address: &str, datacenter: &str, is_up: bool) -> Self {
        if self.hosts.is_empty() {
            self.contact_point = address.to_owned();
        }
        self.hosts.insert(
            address.to_owned(),
            HostInfo {
                address: address.to_owned(),
                datacenter: datacenter.to_owned(),
                is_up,
            },
        );
        self
    }

    /// Add a ring slot owning everything up to `token`.
    #[must_use]
    pub fn ring_slot(mut self, token: i64, replicas: &[&str]) -> Self {
        self.ring
            .push((token, replicas.iter().map(|r| (*r).to_owned()).collect()));
        self
    }

    #[must_use]
    pub fn table(mut self, meta: TableMeta) -> Self {
        self.tables.insert(meta.qualified_unprotected(), meta);
        self
    }

    /// Seed rows, given in schema column order.
    #[must_use]
    pub fn rows(mut self, keyspace: &str, table: &str, rows: Vec<Vec<Value>>) -> Self {
        self.seed_rows.push((format!("{keyspace}.{table}"), rows));
        self
    }

    /// Finish the cluster.
    ///
    /// # Panics
    ///
    /// Panics if seed rows reference an unknown table or an unserializable
    /// partition key; that is a broken test fixture.
    #[must_use]
    pub fn build(mut self) -> MemCluster {
        self.ring.sort_by_key(|(t, _)| *t);
        let seed_rows = std::mem::take(&mut self.seed_rows);
        let mut rows: HashMap<String, Vec<(i64, Vec<Value>)>> = HashMap::new();
        for (key, seeded) in seed_rows {
            let table = self.tables.get(&key).expect("seed rows for unknown table");
            let entry = rows.entry(key).or_default();
            for row in seeded {
                let token = MemCluster::token_of_row(table, &row).expect("seed row token");
                entry.push((token, row));
            }
        }
        MemCluster {
            state: Arc::new(MemState {
                contact_point: self.contact_point,
                local_dc: self.local_dc,
                partitioner: self.partitioner,
                ring: self.ring,
                hosts: self.hosts,
                tables: self.tables,
                rows: Mutex::new(rows),
                prepared: Mutex::new(HashMap::new()),
                next_prepared: AtomicU64::new(1),
                simple_statements: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
            }),
        }
    }
}

impl TableMeta {
    /// `ks.table` without identifier protection, the internal map key.
    #[must_use]
    fn qualified_unprotected(&self) -> String {
        format!("{}.{}", self.keyspace, self.table)
    }
}

#[async_trait]
impl ClusterDriver for MemCluster {
    fn metadata(&self) -> ClusterMetadata {
        ClusterMetadata {
            contact_point: self.state.contact_point.clone(),
            local_dc: self.state.local_dc.clone(),
            partitioner: self.state.partitioner.clone(),
            ring: self.state.ring.clone(),
            hosts: self.state.hosts.clone(),
        }
    }

    fn table_meta(&self, keyspace: &str, table: &str) -> Result<TableMeta, DriverError> {
        self.state
            .tables
            .get(&format!("{keyspace}.{table}"))
            .cloned()
            .ok_or_else(|| DriverError::Other(format!("unknown table {keyspace}.{table}")))
    }

    async fn connect(
        &self,
        hosts: &[HostAddr],
        _whitelist: bool,
    ) -> Result<Arc<dyn DriverSession>, DriverError> {
        if hosts.is_empty() {
            return Err(DriverError::Connect("no contact points".to_owned()));
        }
        self.state
            .connections
            .lock()
            .expect("connections lock")
            .push(hosts.to_vec());
        Ok(Arc::new(MemSession { state: Arc::clone(&self.state) }))
    }
}

struct MemSession {
    state: Arc<MemState>,
}

impl MemSession {
    fn check_failing_range(&self, range: TokenRange) -> Result<(), DriverError> {
        let mut faults = self.state.faults.lock().expect("faults lock");
        let Some(fault) = faults.failing_range else {
            return Ok(());
        };
        let (Some(begin), Some(end)) = (range.begin, range.end) else {
            return Ok(());
        };
        if begin >= fault.begin && end <= fault.end {
            let attempts = faults.range_attempts.entry((begin, end)).or_insert(0);
            if *attempts < fault.failures {
                *attempts += 1;
                // a non-timeout error, so it surfaces to the coordinator
                // instead of being absorbed by the back-off policy
                return Err(DriverError::Other(format!(
                    "injected failure for ({begin}, {end}]"
                )));
            }
        }
        Ok(())
    }

    fn apply_insert(
        &self,
        insert: &PreparedInsert,
        values: &[Value],
    ) -> Result<(), DriverError> {
        let table = self
            .state
            .tables
            .get(&insert.table_key)
            .ok_or_else(|| DriverError::Other(format!("unknown table {}", insert.table_key)))?;
        if values.len() != insert.columns.len() {
            return Err(DriverError::Other(format!(
                "bound {} values for {} columns",
                values.len(),
                insert.columns.len()
            )));
        }
        // Rebuild the row in schema column order.
        let mut row = vec![Value::Null; table.columns.len()];
        for (name, value) in insert.columns.iter().zip(values.iter()) {
            let idx = table
                .columns
                .iter()
                .position(|c| &c.name == name)
                .ok_or_else(|| DriverError::Other(format!("unknown column {name}")))?;
            row[idx] = value.clone();
        }
        let token = MemCluster::token_of_row(table, &row)?;

        let pk_indexes: Vec<usize> = table
            .primary_key
            .iter()
            .filter_map(|name| table.columns.iter().position(|c| &c.name == name))
            .collect();
        let mut rows = self.state.rows.lock().expect("rows lock");
        let entry = rows.entry(insert.table_key.clone()).or_default();
        // Upsert on the full primary key.
        entry.retain(|(_, existing)| {
            !pk_indexes.iter().all(|&i| existing[i] == row[i])
        });
        entry.push((token, row));
        Ok(())
    }
}

#[async_trait]
impl DriverSession for MemSession {
    async fn prepare(&self, cql: &str) -> Result<PreparedId, DriverError> {
        let insert = parse_insert(cql)
            .ok_or_else(|| DriverError::Other(format!("cannot prepare {cql:?}")))?;
        let id = self.state.next_prepared.fetch_add(1, Ordering::Relaxed);
        self.state
            .prepared
            .lock()
            .expect("prepared lock")
            .insert(id, insert);
        Ok(PreparedId(id))
    }

    async fn select_page(
        &self,
        query: &SelectQuery,
        paging_state: Option<u64>,
    ) -> Result<Page, DriverError> {
        self.check_failing_range(query.token_range)?;

        let key = format!("{}.{}", query.keyspace, query.table);
        let table = self
            .state
            .tables
            .get(&key)
            .ok_or_else(|| DriverError::Other(format!("unknown table {key}")))?;
        let projection: Vec<usize> = query
            .columns
            .iter()
            .map(|name| {
                table
                    .columns
                    .iter()
                    .position(|c| &c.name == name)
                    .ok_or_else(|| DriverError::Other(format!("unknown column {name}")))
            })
            .collect::<Result<_, _>>()?;

        let rows = self.state.rows.lock().expect("rows lock");
        let mut matching: Vec<(i64, Vec<Value>)> = rows
            .get(&key)
            .map(|all| {
                all.iter()
                    .filter(|(token, _)| query.token_range.contains(*token))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by_key(|(token, _)| *token);

        let offset = paging_state.unwrap_or(0) as usize;
        let page: Vec<Vec<Value>> = matching
            .iter()
            .skip(offset)
            .take(query.page_size)
            .map(|(_, row)| projection.iter().map(|&i| row[i].clone()).collect())
            .collect();
        let consumed = offset + page.len();
        let next = if consumed < matching.len() { Some(consumed as u64) } else { None };
        Ok(Page { rows: page, paging_state: next })
    }

    async fn execute_batch(&self, batch: &BatchRequest) -> Result<(), DriverError> {
        {
            let mut faults = self.state.faults.lock().expect("faults lock");
            if faults.write_timeouts > 0 {
                faults.write_timeouts -= 1;
                return Err(DriverError::WriteTimeout("injected write timeout".to_owned()));
            }
        }
        for entry in &batch.entries {
            match entry {
                BatchEntry::Prepared { id, values } => {
                    let insert = self
                        .state
                        .prepared
                        .lock()
                        .expect("prepared lock")
                        .get(&id.0)
                        .cloned()
                        .ok_or_else(|| {
                            DriverError::Other(format!("unknown prepared id {}", id.0))
                        })?;
                    self.apply_insert(&insert, values)?;
                }
                BatchEntry::Simple { cql } => {
                    self.state
                        .simple_statements
                        .lock()
                        .expect("statements lock")
                        .push(cql.clone());
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Minimal `INSERT INTO ks.t (a, b) VALUES (...)` reader, enough to
/// register prepared inserts.
fn parse_insert(cql: &str) -> Option<PreparedInsert> {
    let rest = cql.trim().strip_prefix("INSERT INTO ")?;
    let open = rest.find('(')?;
    let qualified = rest[..open].trim();
    let close = rest[open + 1..].find(')')? + open + 1;
    let columns = rest[open + 1..close]
        .split(',')
        .map(|c| unquote_name(c.trim()))
        .collect();
    let table_key = qualified
        .split('.')
        .map(unquote_name)
        .collect::<Vec<_>>()
        .join(".");
    Some(PreparedInsert { table_key, columns })
}

fn unquote_name(name: &str) -> String {
    if name.len() >= 2 && name.starts_with('"') && name.ends_with('"') {
        name[1..name.len() - 1].replace("\"\"", "\"")
    } else {
        name.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::{ColumnMeta, CqlType};
    use crate::driver::ConsistencyLevel;
    use std::time::Duration;

    fn test_table() -> TableMeta {
        TableMeta {
            keyspace: "ks".into(),
            table: "t".into(),
            columns: vec![
                ColumnMeta { name: "id".into(), cql_type: CqlType::Int },
                ColumnMeta { name: "name".into(), cql_type: CqlType::Text },
            ],
            partition_key: vec!["id".into()],
            primary_key: vec!["id".into()],
        }
    }

    fn select_all() -> SelectQuery {
        SelectQuery {
            keyspace: "ks".into(),
            table: "t".into(),
            columns: vec!["id".into(), "name".into()],
            partition_key: vec!["id".into()],
            token_range: TokenRange::unbounded(),
            consistency: ConsistencyLevel::One,
            page_size: 2,
            timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn pages_through_seeded_rows() {
        let cluster = MemCluster::builder()
            .host("h1", "dc1", true)
            .table(test_table())
            .rows(
                "ks",
                "t",
                vec![
                    vec![Value::Int(1), Value::Text("a".into())],
                    vec![Value::Int(2), Value::Text("b".into())],
                    vec![Value::Int(3), Value::Text("c".into())],
                ],
            )
            .build();
        let session = cluster.connect(&["h1".into()], true).await.unwrap();

        let q = select_all();
        let first = session.select_page(&q, None).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        let second = session.select_page(&q, first.paging_state).await.unwrap();
        assert_eq!(second.rows.len(), 1);
        assert_eq!(second.paging_state, None);
    }

    #[tokio::test]
    async fn prepared_inserts_store_rows() {
        let cluster = MemCluster::builder()
            .host("h1", "dc1", true)
            .table(test_table())
            .build();
        let session = cluster.connect(&["h1".into()], false).await.unwrap();
        let id = session
            .prepare("INSERT INTO ks.t (id, name) VALUES (?, ?)")
            .await
            .unwrap();
        let batch = BatchRequest {
            kind: crate::driver::BatchKind::Unlogged,
            consistency: ConsistencyLevel::One,
            keyspace: "ks".into(),
            replicas: vec!["h1".into()],
            entries: vec![BatchEntry::Prepared {
                id,
                values: vec![Value::Int(9), Value::Text("x".into())],
            }],
        };
        session.execute_batch(&batch).await.unwrap();
        // same key upserts
        session.execute_batch(&batch).await.unwrap();
        assert_eq!(cluster.rows("ks", "t"), vec![vec![Value::Int(9), Value::Text("x".into())]]);
    }

    #[tokio::test]
    async fn write_timeout_countdown() {
        let cluster = MemCluster::builder()
            .host("h1", "dc1", true)
            .table(test_table())
            .build();
        cluster.fail_writes(1);
        let session = cluster.connect(&["h1".into()], false).await.unwrap();
        let batch = BatchRequest {
            kind: crate::driver::BatchKind::Unlogged,
            consistency: ConsistencyLevel::One,
            keyspace: "ks".into(),
            replicas: vec![],
            entries: vec![],
        };
        let err = session.execute_batch(&batch).await.unwrap_err();
        assert!(err.is_timeout());
        session.execute_batch(&batch).await.unwrap();
    }
}

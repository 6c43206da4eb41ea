//! End-to-end copy scenarios against the in-memory cluster.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ringcopy::cql::{ColumnMeta, CqlType, TableMeta, Value};
use ringcopy::driver::ClusterDriver;
use ringcopy::mem::MemCluster;
use ringcopy::options::CopyOptions;
use ringcopy_engine::{ExportDest, ExportTask, ImportSource, ImportTask};

/// Honor `RUST_LOG` when debugging a scenario; quiet by default.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
        )
        .with_test_writer()
        .try_init();
}

fn options(dir: &Path, pairs: &[(&str, &str)]) -> CopyOptions {
    init_tracing();
    let mut map: BTreeMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    map.entry("errfile".to_owned()).or_insert_with(|| {
        dir.join("rows.err").display().to_string()
    });
    CopyOptions::parse(&map, "ks", "t").unwrap()
}

fn small_table() -> TableMeta {
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

fn small_rows(n: i32) -> Vec<Vec<Value>> {
    (1..=n)
        .map(|i| {
            vec![
                Value::Int(i),
                Value::Text(char::from(b'a' + (i as u8 - 1) % 26).to_string()),
            ]
        })
        .collect()
}

fn single_host_cluster(rows: Vec<Vec<Value>>) -> MemCluster {
    MemCluster::builder()
        .host("h1", "dc1", true)
        .ring_slot(0, &["h1"])
        .table(small_table())
        .rows("ks", "t", rows)
        .build()
}

fn sorted_lines(path: &Path) -> Vec<String> {
    let mut lines: Vec<String> = std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(ToOwned::to_owned)
        .collect();
    lines.sort();
    lines
}

fn write_input(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn simple_export_writes_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.csv");
    let cluster = single_host_cluster(small_rows(3));

    let summary = ExportTask::new(
        Arc::new(cluster),
        "ks",
        "t",
        vec![],
        options(dir.path(), &[("numprocesses", "2")]),
        ExportDest::File(out.clone()),
    )
    .run()
    .await
    .unwrap();

    assert!(summary.ok(), "summary: {summary:?}");
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.exported_rows, 3);
    assert_eq!(summary.num_files, 1);
    assert_eq!(sorted_lines(&out), vec!["1,a", "2,b", "3,c"]);
}

#[tokio::test]
async fn export_splits_output_by_row_count() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.csv");
    let cluster = single_host_cluster(small_rows(5));

    let summary = ExportTask::new(
        Arc::new(cluster),
        "ks",
        "t",
        vec![],
        options(
            dir.path(),
            &[("numprocesses", "1"), ("maxoutputsize", "2")],
        ),
        ExportDest::File(out.clone()),
    )
    .run()
    .await
    .unwrap();

    assert!(summary.ok());
    assert_eq!(summary.exported_rows, 5);
    assert_eq!(summary.num_files, 3);
    let count = |p: PathBuf| std::fs::read_to_string(p).unwrap().lines().count();
    assert_eq!(count(out.clone()), 2);
    assert_eq!(count(PathBuf::from(format!("{}.1", out.display()))), 2);
    assert_eq!(count(PathBuf::from(format!("{}.2", out.display()))), 1);
}

#[tokio::test]
async fn export_header_row_is_written_once_per_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.csv");
    let cluster = single_host_cluster(small_rows(2));

    let summary = ExportTask::new(
        Arc::new(cluster),
        "ks",
        "t",
        vec![],
        options(dir.path(), &[("numprocesses", "1"), ("header", "true")]),
        ExportDest::File(out.clone()),
    )
    .run()
    .await
    .unwrap();

    assert!(summary.ok());
    let contents = std::fs::read_to_string(&out).unwrap();
    assert!(contents.starts_with("id,name\n"));
    assert_eq!(contents.matches("id,name").count(), 1);
}

#[tokio::test]
async fn export_token_window_restricts_rows() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.csv");
    let cluster = single_host_cluster(small_rows(20));
    let all_rows = cluster.rows("ks", "t");
    assert_eq!(all_rows.len(), 20);

    // split the ring in half and export only the upper half
    let summary = ExportTask::new(
        Arc::new(cluster),
        "ks",
        "t",
        vec![],
        options(
            dir.path(),
            &[("numprocesses", "1"), ("begintoken", "0")],
        ),
        ExportDest::File(out.clone()),
    )
    .run()
    .await
    .unwrap();

    assert!(summary.ok());
    let exported = sorted_lines(&out).len() as u64;
    assert_eq!(exported, summary.exported_rows);
    assert!(exported > 0, "murmur3 spreads 20 keys across both halves");
    assert!(exported < 20, "a half-ring window must not export everything");
}

#[tokio::test]
async fn failed_range_is_retried_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.csv");
    let cluster = MemCluster::builder()
        .host("h1", "dc1", true)
        .host("h2", "dc1", true)
        .ring_slot(-100, &["h1"])
        .ring_slot(0, &["h2"])
        .ring_slot(100, &["h1"])
        .table(small_table())
        .rows("ks", "t", small_rows(20))
        .build();
    // the (-100, 0] range fails its first attempt
    cluster.fail_range(-100, 0, 1);

    let summary = ExportTask::new(
        Arc::new(cluster),
        "ks",
        "t",
        vec![],
        options(dir.path(), &[("numprocesses", "2")]),
        ExportDest::File(out.clone()),
    )
    .run()
    .await
    .unwrap();

    assert!(summary.ok(), "retried range must eventually succeed: {summary:?}");
    let lines = sorted_lines(&out);
    assert_eq!(lines.len(), 20, "every row exported");
    let mut unique = lines.clone();
    unique.dedup();
    assert_eq!(unique.len(), 20, "no duplicate rows after the retry");
}

#[tokio::test]
async fn range_that_keeps_failing_is_counted() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.csv");
    let cluster = MemCluster::builder()
        .host("h1", "dc1", true)
        .ring_slot(-100, &["h1"])
        .ring_slot(0, &["h1"])
        .ring_slot(100, &["h1"])
        .table(small_table())
        .rows("ks", "t", small_rows(5))
        .build();
    cluster.fail_range(-100, 0, 100);

    let summary = ExportTask::new(
        Arc::new(cluster),
        "ks",
        "t",
        vec![],
        options(dir.path(), &[("numprocesses", "1"), ("maxattempts", "2")]),
        ExportDest::File(out),
    )
    .run()
    .await
    .unwrap();

    assert!(!summary.ok());
    assert_eq!(summary.ranges_failed, 1);
    assert_ne!(summary.exit_code(), 0);
}

#[tokio::test]
async fn import_with_skipped_columns() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "in.csv", "id,name,ignore\n1,a,x\n2,b,y\n");
    let cluster = Arc::new(single_host_cluster(Vec::new()));

    let summary = ImportTask::new(
        Arc::clone(&cluster) as Arc<dyn ClusterDriver>,
        "ks",
        "t",
        vec!["id".into(), "name".into(), "ignore".into()],
        options(
            dir.path(),
            &[("numprocesses", "2"), ("header", "true"), ("skipcols", "ignore")],
        ),
        ImportSource::Files(input.display().to_string()),
    )
    .run()
    .await
    .unwrap();

    assert!(summary.ok(), "summary: {summary:?}");
    assert_eq!(summary.received_rows, 2);
    assert_eq!(summary.sent_rows, 2);
    assert_eq!(summary.num_sources, 1);
    assert!(!dir.path().join("rows.err").exists());

    let mut rows = cluster.rows("ks", "t");
    rows.sort_by_key(|r| match r[0] {
        Value::Int(i) => i,
        _ => i32::MAX,
    });
    assert_eq!(
        rows,
        vec![
            vec![Value::Int(1), Value::Text("a".into())],
            vec![Value::Int(2), Value::Text("b".into())],
        ]
    );
}

#[tokio::test]
async fn null_primary_key_rows_go_to_the_error_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "in.csv", ",foo\n");
    let cluster = Arc::new(single_host_cluster(Vec::new()));

    let summary = ImportTask::new(
        Arc::clone(&cluster) as Arc<dyn ClusterDriver>,
        "ks",
        "t",
        vec![],
        options(dir.path(), &[("numprocesses", "1")]),
        ImportSource::Files(input.display().to_string()),
    )
    .run()
    .await
    .unwrap();

    assert!(!summary.ok());
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.failed_rows, 1);
    assert!(cluster.rows("ks", "t").is_empty(), "nothing may be inserted");
    let err_contents = std::fs::read_to_string(dir.path().join("rows.err")).unwrap();
    assert_eq!(err_contents, ",foo\n");
}

#[tokio::test(start_paused = true)]
async fn write_timeouts_back_off_and_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "in.csv", "1,a\n2,b\n");
    let cluster = Arc::new(single_host_cluster(Vec::new()));
    cluster.fail_writes(2);

    let summary = ImportTask::new(
        Arc::clone(&cluster) as Arc<dyn ClusterDriver>,
        "ks",
        "t",
        vec![],
        options(dir.path(), &[("numprocesses", "1"), ("maxattempts", "5")]),
        ImportSource::Files(input.display().to_string()),
    )
    .run()
    .await
    .unwrap();

    assert!(summary.ok(), "timeouts within the budget succeed: {summary:?}");
    assert_eq!(summary.received_rows, 2);
    assert!(!dir.path().join("rows.err").exists(), "no rows may fail");
    assert_eq!(cluster.rows("ks", "t").len(), 2, "rows land exactly once");
}

#[tokio::test(start_paused = true)]
async fn exhausted_write_retries_are_final() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "in.csv", "1,a\n");
    let cluster = Arc::new(single_host_cluster(Vec::new()));
    cluster.fail_writes(1000);

    let summary = ImportTask::new(
        Arc::clone(&cluster) as Arc<dyn ClusterDriver>,
        "ks",
        "t",
        vec![],
        options(dir.path(), &[("numprocesses", "1"), ("maxattempts", "2")]),
        ImportSource::Files(input.display().to_string()),
    )
    .run()
    .await
    .unwrap();

    assert!(!summary.ok());
    assert_eq!(summary.received_rows, 1, "failed rows still complete the chunk");
    assert_eq!(summary.failed_rows, 1);
    assert!(summary.insert_errors >= 1);
    let err_contents = std::fs::read_to_string(dir.path().join("rows.err")).unwrap();
    assert_eq!(err_contents, "1,a\n");
}

#[tokio::test]
async fn import_from_stdin_ends_at_the_terminator() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(single_host_cluster(Vec::new()));
    let stdin = Cursor::new("1,a\n2,b\n\\.\n3,c\n".to_owned());

    let summary = ImportTask::new(
        Arc::clone(&cluster) as Arc<dyn ClusterDriver>,
        "ks",
        "t",
        vec![],
        options(dir.path(), &[("numprocesses", "1")]),
        ImportSource::Stdin(Box::new(stdin)),
    )
    .run()
    .await
    .unwrap();

    assert!(summary.ok(), "summary: {summary:?}");
    assert_eq!(summary.received_rows, 2);
    assert_eq!(cluster.rows("ks", "t").len(), 2);
}

#[tokio::test]
async fn parse_error_limit_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "in.csv", "x,a\ny,b\nz,c\n");
    let cluster = Arc::new(single_host_cluster(Vec::new()));

    let summary = ImportTask::new(
        Arc::clone(&cluster) as Arc<dyn ClusterDriver>,
        "ks",
        "t",
        vec![],
        options(dir.path(), &[("numprocesses", "1"), ("maxparseerrors", "1")]),
        ImportSource::Files(input.display().to_string()),
    )
    .run()
    .await
    .unwrap();

    assert!(!summary.ok());
    assert!(summary.limit_exceeded);
    assert!(summary.parse_errors > 1);
}

#[tokio::test]
async fn non_prepared_import_inlines_literals() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), "in.csv", "1,o'clock\n");
    let cluster = Arc::new(single_host_cluster(Vec::new()));

    let summary = ImportTask::new(
        Arc::clone(&cluster) as Arc<dyn ClusterDriver>,
        "ks",
        "t",
        vec![],
        options(
            dir.path(),
            &[("numprocesses", "1"), ("preparedstatements", "false")],
        ),
        ImportSource::Files(input.display().to_string()),
    )
    .run()
    .await
    .unwrap();

    assert!(summary.ok(), "summary: {summary:?}");
    let statements = cluster.simple_statements();
    assert_eq!(statements.len(), 1);
    assert_eq!(
        statements[0],
        "INSERT INTO ks.t (id, name) VALUES (1, 'o''clock')"
    );
}

fn typed_table() -> TableMeta {
    TableMeta {
        keyspace: "ks".into(),
        table: "typed".into(),
        columns: vec![
            ColumnMeta { name: "id".into(), cql_type: CqlType::Int },
            ColumnMeta { name: "label".into(), cql_type: CqlType::Text },
            ColumnMeta { name: "score".into(), cql_type: CqlType::Double },
            ColumnMeta { name: "active".into(), cql_type: CqlType::Boolean },
            ColumnMeta {
                name: "tags".into(),
                cql_type: CqlType::List(Box::new(CqlType::Int)),
            },
            ColumnMeta {
                name: "attrs".into(),
                cql_type: CqlType::Map(Box::new(CqlType::Text), Box::new(CqlType::Int)),
            },
            ColumnMeta { name: "seen".into(), cql_type: CqlType::Timestamp },
        ],
        partition_key: vec!["id".into()],
        primary_key: vec!["id".into()],
    }
}

fn typed_rows() -> Vec<Vec<Value>> {
    vec![
        vec![
            Value::Int(1),
            Value::Text("first".into()),
            Value::Double(1.5),
            Value::Boolean(true),
            Value::List(vec![Value::Int(1), Value::Int(2)]),
            Value::Map(vec![(Value::Text("k".into()), Value::Int(7))]),
            Value::Timestamp(1_714_567_800_000),
        ],
        vec![
            Value::Int(2),
            Value::Text("with, comma".into()),
            Value::Double(-0.25),
            Value::Boolean(false),
            Value::List(vec![]),
            Value::Map(vec![
                (Value::Text("a".into()), Value::Int(1)),
                (Value::Text("b".into()), Value::Int(2)),
            ]),
            Value::Timestamp(0),
        ],
    ]
}

#[tokio::test]
async fn round_trip_preserves_rows() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("dump.csv");

    let source = MemCluster::builder()
        .host("h1", "dc1", true)
        .ring_slot(0, &["h1"])
        .table(typed_table())
        .rows("ks", "typed", typed_rows())
        .build();

    let opts = || {
        let mut map = BTreeMap::new();
        map.insert(
            "errfile".to_owned(),
            dir.path().join("rt.err").display().to_string(),
        );
        map.insert("numprocesses".to_owned(), "1".to_owned());
        CopyOptions::parse(&map, "ks", "typed").unwrap()
    };

    let export = ExportTask::new(
        Arc::new(source),
        "ks",
        "typed",
        vec![],
        opts(),
        ExportDest::File(out.clone()),
    )
    .run()
    .await
    .unwrap();
    assert!(export.ok());
    assert_eq!(export.exported_rows, 2);

    let dest = Arc::new(
        MemCluster::builder()
            .host("h1", "dc1", true)
            .ring_slot(0, &["h1"])
            .table(typed_table())
            .build(),
    );
    let import = ImportTask::new(
        Arc::clone(&dest) as Arc<dyn ClusterDriver>,
        "ks",
        "typed",
        vec![],
        opts(),
        ImportSource::Files(out.display().to_string()),
    )
    .run()
    .await
    .unwrap();
    assert!(import.ok(), "summary: {import:?}");
    assert_eq!(import.received_rows, 2);

    let mut got = dest.rows("ks", "typed");
    got.sort_by_key(|r| match r[0] {
        Value::Int(i) => i,
        _ => i32::MAX,
    });
    assert_eq!(got, typed_rows());
}

#[tokio::test]
async fn export_workers_connect_only_to_assigned_replicas() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.csv");
    let cluster = Arc::new(
        MemCluster::builder()
            .host("h1", "dc1", true)
            .host("h2", "dc2", true)
            .ring_slot(0, &["h1", "h2"])
            .table(small_table())
            .rows("ks", "t", small_rows(2))
            .build(),
    );

    let summary = ExportTask::new(
        Arc::clone(&cluster) as Arc<dyn ClusterDriver>,
        "ks",
        "t",
        vec![],
        options(dir.path(), &[("numprocesses", "1")]),
        ExportDest::File(out),
    )
    .run()
    .await
    .unwrap();
    assert!(summary.ok());

    // h2 is in another datacenter; only h1 may be contacted
    for hosts in cluster.connections() {
        assert_eq!(hosts, vec!["h1".to_owned()]);
    }
}

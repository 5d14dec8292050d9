//! Transactional replay of logical-replication changes into a target
//! PostgreSQL database.
//!
//! The sink reproduces each upstream transaction verbatim: `begin`, the row
//! changes rebound with their original column OIDs in binary format, the
//! `pgcapture.sources` bookkeeping upsert, `commit`. DDL captured in-band is
//! executed as SQL text and schedules a primary-key cache refresh once the
//! surrounding transaction commits.
//!
//! A sink holds a database-wide advisory lock for its whole lifetime, so at
//! most one sink replays into a given database. The lock is released when the
//! connection closes.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::types::{to_sql_checked, IsNull, Kind, ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use super::base::{BaseSink, SinkHandler};
use crate::change::{
    commit_timestamp, parse_lsn, Change, Checkpoint, Commit, Field, Message, Op, RowChange,
};
use crate::config::SinkConfig;
use crate::schema::SchemaLoader;
use crate::{Error, Result};

const ADVISORY_LOCK_SQL: &str =
    "select pg_try_advisory_lock(('x' || md5(current_database()))::bit(64)::bigint)";

const FIND_CHECKPOINT_SQL: &str =
    "SELECT commit, commit_ts FROM pgcapture.sources WHERE id = $1 AND status IS NULL";

const UPDATE_SOURCE_SQL: &str = "insert into pgcapture.sources(id,commit,commit_ts) values ($1,$2,$3) \
     on conflict (id) do update set commit=EXCLUDED.commit,commit_ts=EXCLUDED.commit_ts,apply_ts=now()";

const INSTALL_EXTENSION_SQL: &str = r#"
create schema if not exists pgcapture;

create table if not exists pgcapture.sources (
    id text primary key,
    commit bigint,
    commit_ts timestamptz,
    status text,
    apply_ts timestamptz
);

create table if not exists pgcapture.ddl_logs (
    query text,
    tags text[]
);

create or replace function pgcapture.log_ddl() returns event_trigger as $$
begin
    insert into pgcapture.ddl_logs(query, tags)
    values (current_query(), (select array_agg(command_tag) from pg_event_trigger_ddl_commands()));
end;
$$ language plpgsql;

drop event trigger if exists pgcapture_ddl_command_end;
create event trigger pgcapture_ddl_command_end on ddl_command_end
    execute procedure pgcapture.log_ddl();
"#;

fn log_lsn_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:consistent recovery state reached at|redo done at) ([0-9A-F]{2,8}/[0-9A-F]{2,8})",
        )
        .unwrap()
    })
}

fn log_tx_time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"last completed transaction was at log time (.*)\.?$").unwrap())
}

fn ddl_skip_regex() -> &'static BytesRegex {
    static RE: OnceLock<BytesRegex> = OnceLock::new();
    RE.get_or_init(|| BytesRegex::new(r"(CREATE TABLE AS|SELECT)").unwrap())
}

/// The replay sink. See the module docs for the overall contract.
pub struct PgSink {
    conn_str: String,
    config: SinkConfig,
    base: BaseSink,
    client: Option<Arc<Client>>,
    conn_task: Option<JoinHandle<()>>,
    schema: Option<SchemaLoader>,
    lsn: u64,
}

impl PgSink {
    pub fn new(conn_str: impl Into<String>, config: SinkConfig) -> Self {
        Self {
            conn_str: conn_str.into(),
            config,
            base: BaseSink::new(),
            client: None,
            conn_task: None,
            schema: None,
            lsn: 0,
        }
    }

    /// Connects, takes the per-database advisory lock, installs the capture
    /// extension's SQL objects, loads the key cache, and returns the last
    /// durably-applied checkpoint.
    ///
    /// Fails with [`Error::SinkOccupied`] when another sink already holds the
    /// lock on this database.
    pub async fn setup(&mut self) -> Result<Checkpoint> {
        let (client, connection) = tokio_postgres::connect(&self.conn_str, NoTls).await?;
        let conn_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("connection error: {e}");
            }
        });
        let client = Arc::new(client);

        let row = client.query_one(ADVISORY_LOCK_SQL, &[]).await?;
        if !row.get::<_, bool>(0) {
            conn_task.abort();
            return Err(Error::SinkOccupied);
        }

        client.batch_execute(INSTALL_EXTENSION_SQL).await?;

        let mut schema = SchemaLoader::new(client.clone());
        schema.refresh_keys().await?;

        self.client = Some(client);
        self.conn_task = Some(conn_task);
        self.schema = Some(schema);

        self.find_checkpoint().await
    }

    async fn find_checkpoint(&mut self) -> Result<Checkpoint> {
        let client = self.client.as_ref().ok_or(Error::NotSetup)?;

        let mut cp = Checkpoint::default();
        let row = client
            .query_opt(FIND_CHECKPOINT_SQL, &[&self.config.source_id])
            .await?;
        match row {
            Some(row) => {
                if let Some(commit) = row.get::<_, Option<i64>>(0) {
                    cp.lsn = commit as u64;
                }
                cp.ts = row.get(1);
            }
            None => {
                if let Some(path) = &self.config.log_path {
                    info!(
                        path = %path.display(),
                        "no stored checkpoint, scanning the server log"
                    );
                    let (lsn, ts) = scan_checkpoint_from_log(path).await?;
                    cp.lsn = parse_lsn(&lsn)?;
                    cp.ts = Some(parse_log_time(&ts)?);
                }
            }
        }

        info!(
            source_id = %self.config.source_id,
            lsn = cp.lsn,
            ts = ?cp.ts,
            "last checkpoint found"
        );

        if cp.lsn != 0 {
            // The source re-emits the last committed transaction's Begin at
            // this exact LSN; minus one lets the drop-filter pass it once.
            self.lsn = cp.lsn - 1;
        }
        Ok(cp)
    }

    /// Consumes the inbound change stream and yields one committed checkpoint
    /// per completed transaction. Runs until the inbound channel closes or a
    /// fatal error stops the worker.
    pub fn apply(&mut self, changes: mpsc::Receiver<Change>) -> Result<mpsc::Receiver<Checkpoint>> {
        let client = self.client.clone().ok_or(Error::NotSetup)?;
        let schema = self.schema.take().ok_or(Error::NotSetup)?;

        let applier = Applier {
            client,
            schema,
            source_id: self.config.source_id.clone(),
            lsn: self.lsn,
            in_tx: false,
            skip: false,
            refresh: false,
            first: false,
        };

        let conn_task = self.conn_task.take();
        Ok(self.base.spawn(changes, applier, move || {
            if let Some(task) = conn_task {
                task.abort();
            }
        }))
    }

    /// Stops the worker and closes the connection, releasing the advisory
    /// lock.
    pub async fn stop(&mut self) {
        self.base.stop().await;
        if let Some(task) = self.conn_task.take() {
            task.abort();
        }
        self.client = None;
        self.schema = None;
    }

    /// Last asynchronous apply error, if any.
    pub fn error(&self) -> Option<Arc<Error>> {
        self.base.error()
    }
}

struct Applier {
    client: Arc<Client>,
    schema: SchemaLoader,
    source_id: String,
    lsn: u64,
    in_tx: bool,
    skip: bool,
    refresh: bool,
    first: bool,
}

#[async_trait::async_trait]
impl SinkHandler for Applier {
    async fn apply(&mut self, change: Change, committed: &mpsc::Sender<Checkpoint>) -> Result<()> {
        if !self.first {
            info!(
                message_lsn = change.checkpoint.lsn,
                sink_lsn = self.lsn,
                "applying the first message from the source"
            );
            self.first = true;
        }
        if change.checkpoint.lsn <= self.lsn {
            warn!(
                message_lsn = change.checkpoint.lsn,
                sink_lsn = self.lsn,
                "message dropped, lsn not beyond the sink's last position"
            );
            return Ok(());
        }

        let result = self.dispatch(&change, committed).await;
        if let Err(err) = &result {
            error!(
                message_lsn = change.checkpoint.lsn,
                error = %err,
                "failed to apply message"
            );
        }
        result
    }
}

impl Applier {
    async fn dispatch(
        &mut self,
        change: &Change,
        committed: &mpsc::Sender<Checkpoint>,
    ) -> Result<()> {
        match &change.message {
            Message::Begin => {
                if self.in_tx {
                    return Err(Error::IncompleteTx);
                }
                self.client.batch_execute("begin").await?;
                self.in_tx = true;
            }
            Message::Row(row) => {
                if !self.in_tx {
                    return Err(Error::IncompleteTx);
                }
                if self.skip {
                    return Ok(());
                }
                if row.is_ddl() {
                    self.refresh = true;
                    self.handle_ddl(row).await?;
                } else {
                    self.handle_change(row).await?;
                }
            }
            Message::Commit(commit) => {
                if !self.in_tx {
                    return Err(Error::IncompleteTx);
                }
                self.handle_commit(change.checkpoint, commit).await?;
                committed.send(change.checkpoint).await.ok();
                self.in_tx = false;
                self.skip = false;
                if self.refresh {
                    self.schema.refresh_keys().await?;
                    self.refresh = false;
                }
            }
        }
        Ok(())
    }

    async fn handle_ddl(&mut self, m: &RowChange) -> Result<()> {
        for field in &m.new_tuple {
            match field.name.as_str() {
                "query" => {
                    if let Some(datum) = &field.datum {
                        let query = String::from_utf8_lossy(datum);
                        debug!(query = %query, "replaying ddl");
                        self.client.batch_execute(query.as_ref()).await?;
                    }
                }
                "tags" => {
                    // Bulk-materialising DDL (CREATE TABLE AS / SELECT INTO)
                    // snapshots its data server-side; the row changes that
                    // follow in the same transaction would double-apply.
                    self.skip = field
                        .datum
                        .as_deref()
                        .is_some_and(|d| ddl_skip_regex().is_match(d));
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_change(&self, m: &RowChange) -> Result<()> {
        match m.op {
            Op::Insert => self.handle_insert(m).await,
            Op::Update => self.handle_update(m).await,
            Op::Delete => self.handle_delete(m).await,
        }
    }

    async fn handle_insert(&self, m: &RowChange) -> Result<()> {
        let fields: Vec<&Field> = m.new_tuple.iter().collect();
        let sql = insert_query(&m.namespace, &m.table, &fields);
        self.exec_tuple(&sql, &fields).await
    }

    async fn handle_delete(&self, m: &RowChange) -> Result<()> {
        let fields: Vec<&Field> = m.old_tuple.iter().collect();
        let sql = delete_query(&m.namespace, &m.table, &fields);
        self.exec_tuple(&sql, &fields).await
    }

    async fn handle_update(&self, m: &RowChange) -> Result<()> {
        let (keys, sets) = if !m.old_tuple.is_empty() {
            (m.old_tuple.iter().collect(), m.new_tuple.iter().collect())
        } else {
            let key_cols = self.schema.table_key(&m.namespace, &m.table)?;
            split_tuple(&m.new_tuple, key_cols)
        };
        if keys.is_empty() || sets.is_empty() {
            return Ok(());
        }

        let sql = update_query(&m.namespace, &m.table, &sets, &keys);
        let fields: Vec<&Field> = sets.iter().chain(keys.iter()).copied().collect();
        self.exec_tuple(&sql, &fields).await
    }

    async fn handle_commit(&mut self, checkpoint: Checkpoint, commit: &Commit) -> Result<()> {
        let commit_ts = commit_timestamp(commit.commit_time)?;
        self.client
            .execute(
                UPDATE_SOURCE_SQL,
                &[&self.source_id, &(checkpoint.lsn as i64), &commit_ts],
            )
            .await?;
        self.client.batch_execute("commit").await?;
        Ok(())
    }

    /// Executes `sql` binding every field's datum in binary format with its
    /// original OID, so values round-trip without reinterpretation.
    async fn exec_tuple(&self, sql: &str, fields: &[&Field]) -> Result<()> {
        let types: Vec<Type> = fields.iter().map(|f| param_type(f.oid)).collect();
        let stmt = self.client.prepare_typed(sql, &types).await?;
        let params: Vec<RawDatum> = fields.iter().map(|f| RawDatum(f.datum.as_deref())).collect();
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        self.client.execute(&stmt, &refs).await?;
        Ok(())
    }
}

/// Passes an already-encoded binary datum straight through to the wire.
#[derive(Debug)]
struct RawDatum<'a>(Option<&'a [u8]>);

impl ToSql for RawDatum<'_> {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self.0 {
            Some(datum) => {
                out.extend_from_slice(datum);
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn param_type(oid: u32) -> Type {
    Type::from_oid(oid)
        .unwrap_or_else(|| Type::new("unknown".to_string(), oid, Kind::Simple, String::new()))
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn insert_query(namespace: &str, table: &str, fields: &[&Field]) -> String {
    let cols: Vec<String> = fields.iter().map(|f| quote_ident(&f.name)).collect();
    let vals: Vec<String> = (1..=fields.len()).map(|i| format!("${i}")).collect();
    format!(
        "insert into {}.{} ({}) values ({})",
        quote_ident(namespace),
        quote_ident(table),
        cols.join(","),
        vals.join(",")
    )
}

fn delete_query(namespace: &str, table: &str, fields: &[&Field]) -> String {
    let conds: Vec<String> = fields
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{} = ${}", quote_ident(&f.name), i + 1))
        .collect();
    format!(
        "delete from {}.{} where {}",
        quote_ident(namespace),
        quote_ident(table),
        conds.join(" and ")
    )
}

fn update_query(namespace: &str, table: &str, sets: &[&Field], keys: &[&Field]) -> String {
    let assigns: Vec<String> = sets
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{} = ${}", quote_ident(&f.name), i + 1))
        .collect();
    let conds: Vec<String> = keys
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{} = ${}", quote_ident(&f.name), sets.len() + i + 1))
        .collect();
    format!(
        "update {}.{} set {} where {}",
        quote_ident(namespace),
        quote_ident(table),
        assigns.join(","),
        conds.join(" and ")
    )
}

/// Splits a new tuple into `(keys, sets)` by the table's primary-key columns.
fn split_tuple<'a>(tuple: &'a [Field], key_cols: &[String]) -> (Vec<&'a Field>, Vec<&'a Field>) {
    let mut keys = Vec::new();
    let mut sets = Vec::new();
    for field in tuple {
        if key_cols.iter().any(|k| k == &field.name) {
            keys.push(field);
        } else {
            sets.push(field);
        }
    }
    (keys, sets)
}

/// Scans a PostgreSQL server log for the recovery position and the last
/// completed transaction time; the last match of each wins. Both must be
/// present or the scan fails.
pub async fn scan_checkpoint_from_log(path: &Path) -> Result<(String, String)> {
    let file = fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();

    let mut lsn = None;
    let mut ts = None;
    while let Some(line) = lines.next_line().await? {
        if let Some(caps) = log_lsn_regex().captures(&line) {
            lsn = Some(caps[1].to_string());
        } else if let Some(caps) = log_tx_time_regex().captures(&line) {
            ts = Some(caps[1].to_string());
        }
    }

    match (lsn, ts) {
        (Some(lsn), Some(ts)) => Ok((lsn, ts)),
        _ => Err(Error::LogScan(path.display().to_string())),
    }
}

fn parse_log_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| Error::InvalidTimestamp(s.to_string()))
}

/// Builds a sink from the crate [`Config`](crate::Config).
impl From<&crate::Config> for PgSink {
    fn from(config: &crate::Config) -> Self {
        PgSink::new(config.postgres_url(), config.sink.clone())
    }
}

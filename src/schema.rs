//! Primary-key cache over the target database's catalog.
//!
//! The sink needs each table's key columns to split an UPDATE without an old
//! tuple into its key predicate and SET list. The cache is rebuilt as a whole
//! by [`SchemaLoader::refresh_keys`], which the sink calls at setup and after
//! any transaction that replayed DDL; lookups in between never touch the
//! database.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_postgres::Client;
use tracing::debug;

use crate::{Error, Result};

const KEY_QUERY: &str = "\
SELECT n.nspname, c.relname, a.attname
FROM pg_index i
JOIN pg_class c ON c.oid = i.indrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord) ON true
JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = k.attnum
WHERE i.indisprimary
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
ORDER BY n.nspname, c.relname, k.ord";

pub struct SchemaLoader {
    client: Arc<Client>,
    keys: HashMap<(String, String), Vec<String>>,
}

impl SchemaLoader {
    pub fn new(client: Arc<Client>) -> Self {
        Self {
            client,
            keys: HashMap::new(),
        }
    }

    /// Rebuilds the `(namespace, table) -> key columns` mapping atomically
    /// from the catalog.
    pub async fn refresh_keys(&mut self) -> Result<()> {
        let rows = self.client.query(KEY_QUERY, &[]).await?;

        let mut keys: HashMap<(String, String), Vec<String>> = HashMap::new();
        for row in &rows {
            let namespace: String = row.get(0);
            let table: String = row.get(1);
            let column: String = row.get(2);
            keys.entry((namespace, table)).or_default().push(column);
        }

        debug!(tables = keys.len(), "refreshed primary key cache");
        self.keys = keys;
        Ok(())
    }

    /// Returns the ordered primary-key column names of a table.
    pub fn table_key(&self, namespace: &str, table: &str) -> Result<&[String]> {
        self.keys
            .get(&(namespace.to_string(), table.to_string()))
            .map(Vec::as_slice)
            .ok_or_else(|| Error::UnknownTable {
                namespace: namespace.to_string(),
                table: table.to_string(),
            })
    }
}

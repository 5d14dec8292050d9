//! Typed-row decoding for consumers that want structs instead of raw tuples.
//!
//! A [`ModelDescriptor`] is an explicit schema descriptor built once per
//! model: for every column name it holds a decode function that turns the
//! PostgreSQL binary datum for that column's OID into a field of the model.
//! A [`ModelRegistry`] maps `(namespace, table)` to a descriptor plus a
//! handler and dispatches row changes to them; tables nobody registered are
//! ignored.

use std::collections::HashMap;

use tokio_postgres::types::{FromSql, Kind, Type};

use crate::change::{Field, Op, RowChange};
use crate::{Error, Result};

type DecodeFn<T> = Box<dyn Fn(&mut T, &Field) -> Result<()> + Send + Sync>;

/// Column-by-column decoding plan for one model type.
pub struct ModelDescriptor<T> {
    columns: HashMap<String, DecodeFn<T>>,
}

impl<T> ModelDescriptor<T> {
    pub fn new() -> Self {
        Self {
            columns: HashMap::new(),
        }
    }

    /// Adds a column slot: the named column's datum is decoded as `V` for its
    /// OID and stored into the model with `set`. Use an `Option` value type
    /// for nullable columns.
    pub fn column<V, F>(mut self, name: &str, set: F) -> Self
    where
        V: for<'a> FromSql<'a>,
        F: Fn(&mut T, V) + Send + Sync + 'static,
    {
        let column = name.to_string();
        self.columns.insert(
            name.to_string(),
            Box::new(move |model, field| {
                let ty = column_type(field.oid);
                if !V::accepts(&ty) {
                    return Err(Error::Decode {
                        column: column.clone(),
                        message: format!("type {ty} is not accepted"),
                    });
                }
                let value = V::from_sql_nullable(&ty, field.datum.as_deref()).map_err(|e| {
                    Error::Decode {
                        column: column.clone(),
                        message: e.to_string(),
                    }
                })?;
                set(model, value);
                Ok(())
            }),
        );
        self
    }
}

impl<T> Default for ModelDescriptor<T> {
    fn default() -> Self {
        Self::new()
    }
}

trait RowDispatch: Send {
    fn dispatch(&mut self, change: &RowChange) -> Result<()>;
}

struct Registration<T, H> {
    descriptor: ModelDescriptor<T>,
    handler: H,
}

impl<T, H> RowDispatch for Registration<T, H>
where
    T: Default + Send,
    H: FnMut(T, bool) + Send,
{
    fn dispatch(&mut self, change: &RowChange) -> Result<()> {
        let deleted = change.op == Op::Delete;
        let tuple = if deleted {
            &change.old_tuple
        } else {
            &change.new_tuple
        };

        let mut model = T::default();
        for field in tuple {
            if let Some(decode) = self.descriptor.columns.get(&field.name) {
                decode(&mut model, field)?;
            }
        }
        (self.handler)(model, deleted);
        Ok(())
    }
}

/// Routes row changes to the handlers registered for their table.
pub struct ModelRegistry {
    handlers: HashMap<(String, String), Box<dyn RowDispatch>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a model for `namespace.table`. The handler receives the
    /// decoded model and whether the row was deleted (decoded from the old
    /// tuple in that case).
    pub fn register<T, H>(
        &mut self,
        namespace: &str,
        table: &str,
        descriptor: ModelDescriptor<T>,
        handler: H,
    ) where
        T: Default + Send + 'static,
        H: FnMut(T, bool) + Send + 'static,
    {
        self.handlers.insert(
            (namespace.to_string(), table.to_string()),
            Box::new(Registration {
                descriptor,
                handler,
            }),
        );
    }

    /// Decodes and dispatches one row change; unregistered tables are a
    /// no-op.
    pub fn dispatch(&mut self, change: &RowChange) -> Result<()> {
        let key = (change.namespace.clone(), change.table.clone());
        match self.handlers.get_mut(&key) {
            Some(handler) => handler.dispatch(change),
            None => Ok(()),
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn column_type(oid: u32) -> Type {
    Type::from_oid(oid)
        .unwrap_or_else(|| Type::new("unknown".to_string(), oid, Kind::Simple, String::new()))
}

//! Declarative record-to-row mapping.
//!
//! A record type names its columns once. A [`BoundQuery`] checks those
//! names against the statement's result columns when it is bound, so a
//! drifted query fails at setup instead of on the first row it reads.

use holonet_types::error::RegistryError;
use rusqlite::{Connection, Params, Row};
use std::marker::PhantomData;

/// A type that can be built from one result row.
pub trait RowRecord: Sized {
    /// Record name used in diagnostics.
    const NAME: &'static str;
    /// Result columns, in order, that `from_row` reads.
    const COLUMNS: &'static [&'static str];

    /// Build the record. Column `i` corresponds to `COLUMNS[i]`.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// A SQL statement whose result columns were validated against `R`.
#[derive(Debug, Clone)]
pub struct BoundQuery<R> {
    sql: String,
    _record: PhantomData<fn() -> R>,
}

impl<R: RowRecord> BoundQuery<R> {
    /// Prepare `sql` once and verify its column list matches `R::COLUMNS`.
    pub fn bind(conn: &Connection, sql: &str) -> Result<Self, RegistryError> {
        let stmt = conn
            .prepare_cached(sql)
            .map_err(|e| RegistryError::Database(e.to_string()))?;
        let found: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let matches = found.len() == R::COLUMNS.len()
            && found.iter().zip(R::COLUMNS).all(|(f, e)| f == e);
        if !matches {
            return Err(RegistryError::Mapping {
                record: R::NAME,
                expected: R::COLUMNS.iter().map(|c| c.to_string()).collect(),
                found,
            });
        }

        Ok(Self {
            sql: sql.to_string(),
            _record: PhantomData,
        })
    }

    /// Run the query and map every row.
    pub fn query<P: Params>(&self, conn: &Connection, params: P) -> Result<Vec<R>, RegistryError> {
        let mut stmt = conn
            .prepare_cached(&self.sql)
            .map_err(|e| RegistryError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params, |row| R::from_row(row))
            .map_err(|e| RegistryError::Database(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| RegistryError::Database(e.to_string()))
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

//! Table metadata as reported by the target store's catalog.

use crate::error::JobError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;
use std::time::Duration;

/// Scalar column types the loader knows how to coerce into.
///
/// Anything the catalog reports outside this set is loaded as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    SmallInt,
    Integer,
    BigInt,
    Numeric,
    Double,
    Boolean,
    /// `timestamp without time zone`: stores local wall-clock time.
    Timestamp,
    /// `timestamp with time zone`: stores an absolute instant.
    TimestampTz,
    Varchar,
}

impl SqlType {
    /// Map a catalog `data_type` name onto a loader type (case-insensitive).
    pub fn from_catalog(data_type: &str) -> Self {
        match data_type.trim().to_ascii_lowercase().as_str() {
            "smallint" | "int2" => SqlType::SmallInt,
            "integer" | "int" | "int4" => SqlType::Integer,
            "bigint" | "int8" => SqlType::BigInt,
            "numeric" | "decimal" => SqlType::Numeric,
            "double precision" | "float8" | "real" | "float4" => SqlType::Double,
            "boolean" | "bool" => SqlType::Boolean,
            "timestamp without time zone" | "timestamp" => SqlType::Timestamp,
            "timestamp with time zone" | "timestamptz" => SqlType::TimestampTz,
            _ => SqlType::Varchar,
        }
    }

    /// Postgres array type a whole column of this type is bound as.
    pub fn array_type(self) -> &'static str {
        match self {
            SqlType::SmallInt => "int2[]",
            SqlType::Integer => "int4[]",
            SqlType::BigInt => "int8[]",
            SqlType::Numeric => "numeric[]",
            SqlType::Double => "float8[]",
            SqlType::Boolean => "bool[]",
            SqlType::Timestamp => "timestamp[]",
            SqlType::TimestampTz => "timestamptz[]",
            SqlType::Varchar => "text[]",
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlType::SmallInt => "SMALLINT",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Numeric => "NUMERIC",
            SqlType::Double => "DOUBLE",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::TimestampTz => "TIMESTAMPTZ",
            SqlType::Varchar => "VARCHAR",
        };
        f.write_str(name)
    }
}

/// Raw catalog row for one column, before type mapping.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub udt_name: String,
    pub nullable: bool,
    pub has_default: bool,
}

/// Loader view of a column. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Lowercased column name.
    pub name: String,
    pub sql_type: SqlType,
    /// Catalog type name (`udt_name`), e.g. `uuid`, `int4`, `varchar`.
    pub catalog_type: String,
    pub nullable: bool,
    pub has_default: bool,
}

impl ColumnMeta {
    pub fn from_descriptor(descriptor: ColumnDescriptor) -> Self {
        Self {
            name: descriptor.name.trim().to_lowercase(),
            sql_type: SqlType::from_catalog(&descriptor.data_type),
            catalog_type: descriptor.udt_name.to_lowercase(),
            nullable: descriptor.nullable,
            has_default: descriptor.has_default,
        }
    }

    /// NOT NULL without a default: an insert must always supply a value.
    pub fn is_required(&self) -> bool {
        !self.nullable && !self.has_default
    }

    /// Whether text bound for this column must be cast to its catalog type.
    ///
    /// Postgres has no assignment cast from `text` to types like `uuid`,
    /// `date` or `jsonb`, so those columns get an explicit cast.
    pub fn needs_text_cast(&self) -> bool {
        self.sql_type == SqlType::Varchar
            && !matches!(
                self.catalog_type.as_str(),
                "text" | "varchar" | "bpchar" | "name" | ""
            )
    }
}

/// Ordered column metadata for one table, in the catalog's ordinal order.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnMeta>,
    pub loaded_at: DateTime<Utc>,
}

impl TableSchema {
    pub fn from_catalog(
        table: impl Into<String>,
        columns: Vec<ColumnDescriptor>,
        loaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            table: table.into(),
            columns: columns.into_iter().map(ColumnMeta::from_descriptor).collect(),
            loaded_at,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Stale once strictly more than `ttl` has passed since loading.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match (now - self.loaded_at).to_std() {
            Ok(age) => age > ttl,
            // loaded_at in the future (clock went backwards)
            Err(_) => false,
        }
    }
}

/// Target table, optionally schema-qualified. Names are lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn parse(raw: &str) -> Result<Self, JobError> {
        let normalized = raw.trim().to_lowercase();
        let invalid = || JobError::InvalidTableName(raw.to_string());

        let mut parts = normalized.split('.');
        let (schema, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => (None, name),
            (Some(schema), Some(name), None) => (Some(schema), name),
            _ => return Err(invalid()),
        };

        if name.is_empty() || schema.is_some_and(str::is_empty) {
            return Err(invalid());
        }

        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    /// Quoted form for interpolation into SQL text.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Source of column metadata for a table.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Columns in ordinal order. An unknown table yields an empty list.
    async fn lookup_columns(&self, table: &TableName) -> Result<Vec<ColumnDescriptor>, sqlx::Error>;
}

/// Reads column metadata from Postgres `information_schema`.
pub struct PgSchemaSource {
    pool: PgPool,
}

impl PgSchemaSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaSource for PgSchemaSource {
    async fn lookup_columns(&self, table: &TableName) -> Result<Vec<ColumnDescriptor>, sqlx::Error> {
        // Identity and generated columns fill themselves, so they count as defaulted.
        let columns: Vec<ColumnDescriptor> = sqlx::query_as(
            r#"SELECT column_name::text AS name,
                      data_type::text AS data_type,
                      udt_name::text AS udt_name,
                      is_nullable = 'YES' AS nullable,
                      (column_default IS NOT NULL
                        OR is_identity = 'YES'
                        OR is_generated = 'ALWAYS') AS has_default
               FROM information_schema.columns
               WHERE table_schema = COALESCE($1, current_schema())
                 AND table_name = $2
               ORDER BY ordinal_position"#,
        )
        .bind(table.schema.as_deref())
        .bind(&table.name)
        .fetch_all(&self.pool)
        .await?;

        log::debug!("schema lookup for {}: {} columns", table, columns.len());
        Ok(columns)
    }
}

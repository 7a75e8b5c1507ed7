//! Physical schema management.
//!
//! Keeps the PostgreSQL schema in line with registered component metadata:
//! base tables on first boot, one LIST partition per component class, and
//! JSONB path indexes per declared index spec.

pub mod ident;

use crate::component::{ComponentDescriptor, IndexKind, IndexSpec, TypeId};
use crate::error::{Result, StratumError};
use self::ident::{normalize_component_name, validate_identifier};
use sqlx::PgPool;
use std::collections::HashMap;

/// Guard regex for the partial numeric index: only rows whose text projection
/// parses as a number participate, so the cast can never fail.
const NUMERIC_GUARD_REGEX: &str = r"^[+-]?[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?$";

const BASE_SCHEMA_SQL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        id uuid PRIMARY KEY,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now(),
        deleted_at timestamptz
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS components (
        component_id uuid NOT NULL,
        entity_id uuid NOT NULL,
        type_id varchar(64) NOT NULL,
        name varchar(128) NOT NULL,
        data jsonb NOT NULL DEFAULT '{}'::jsonb,
        created_at timestamptz NOT NULL DEFAULT now(),
        updated_at timestamptz NOT NULL DEFAULT now(),
        deleted_at timestamptz,
        PRIMARY KEY (component_id, type_id, entity_id)
    ) PARTITION BY LIST (type_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entity_components (
        entity_id uuid NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        type_id varchar(64) NOT NULL,
        deleted_at timestamptz,
        UNIQUE (entity_id, type_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS components_entity_id_idx ON components (entity_id)",
    "CREATE INDEX IF NOT EXISTS components_type_id_idx ON components (type_id)",
    "CREATE INDEX IF NOT EXISTS components_data_gin_idx ON components USING gin (data)",
    "CREATE INDEX IF NOT EXISTS entity_components_entity_id_idx ON entity_components (entity_id)",
    "CREATE INDEX IF NOT EXISTS entity_components_type_id_idx ON entity_components (type_id)",
    "CREATE INDEX IF NOT EXISTS entity_components_type_entity_idx ON entity_components (type_id, entity_id)",
];

/// Partitioning strategy of the `components` parent, discovered at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    List,
    Hash,
}

/// Ensures the physical schema matches registered metadata.
pub struct SchemaManager {
    pool: PgPool,
    /// type id -> partition table name, for classes provisioned by this
    /// process.
    partitions: parking_lot::RwLock<HashMap<TypeId, String>>,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            partitions: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Creates the base tables and their default indexes. Idempotent.
    pub async fn ensure_base_schema(&self) -> Result<()> {
        for stmt in BASE_SCHEMA_SQL {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        log::info!("schema: base tables ensured");
        Ok(())
    }

    /// Discovers whether `components` is LIST- or HASH-partitioned.
    pub async fn partition_strategy(&self) -> Result<PartitionStrategy> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT pt.partstrat::text
            FROM pg_partitioned_table pt
            JOIN pg_class c ON c.oid = pt.partrelid
            WHERE c.relname = 'components'
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        match row.as_ref().map(|(s,)| s.as_str()) {
            Some("h") => Ok(PartitionStrategy::Hash),
            Some(_) => Ok(PartitionStrategy::List),
            None => Err(StratumError::Storage(sqlx::Error::RowNotFound)),
        }
    }

    /// Provisions storage for one registered component class: the partition
    /// table and every declared index. Re-runs ANALYZE on touched tables.
    pub async fn provision_component(&self, descriptor: &ComponentDescriptor) -> Result<()> {
        let type_id = descriptor.type_id();
        let table = self.ensure_partition(descriptor).await?;
        let strategy = self.partition_strategy().await?;
        // For HASH partitioning rows spread across fixed buckets, so indexes
        // go on the parent instead of a per-type child.
        let index_target = match strategy {
            PartitionStrategy::List => table.clone(),
            PartitionStrategy::Hash => "components".to_string(),
        };
        let blocking = strategy == PartitionStrategy::Hash;
        for spec in &descriptor.indexes {
            self.ensure_index(&index_target, descriptor, spec, blocking)
                .await?;
        }
        for field in descriptor.fields.iter().filter(|f| f.indexed) {
            // Indexed fields without an explicit spec get the default B-Tree.
            if !descriptor
                .indexes
                .iter()
                .any(|s| s.fields.len() == 1 && s.fields[0] == field.key)
            {
                self.ensure_index(
                    &index_target,
                    descriptor,
                    &IndexSpec::single(field.key.clone(), IndexKind::BTree),
                    blocking,
                )
                .await?;
            }
        }
        self.analyze(&index_target).await?;
        self.partitions.write().insert(type_id, table);
        Ok(())
    }

    /// Returns the partition table name for a type id, if provisioned by this
    /// process.
    pub fn partition_table(&self, type_id: &TypeId) -> Option<String> {
        self.partitions.read().get(type_id).cloned()
    }

    async fn ensure_partition(&self, descriptor: &ComponentDescriptor) -> Result<String> {
        let normalized = normalize_component_name(&descriptor.name)?;
        let table = partition_table_name(&normalized);
        validate_identifier(&table)?;
        let type_id = descriptor.type_id();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF components FOR VALUES IN ('{}')",
            table,
            type_id.as_str()
        );
        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(_) => {
                log::debug!(
                    "schema: partition {} ready for component '{}'",
                    table,
                    descriptor.name
                );
                Ok(table)
            }
            Err(err) => {
                // Another instance may have won the race.
                if self.table_exists(&table).await? {
                    Ok(table)
                } else {
                    Err(err.into())
                }
            }
        }
    }

    async fn ensure_index(
        &self,
        table: &str,
        descriptor: &ComponentDescriptor,
        spec: &IndexSpec,
        blocking: bool,
    ) -> Result<()> {
        for field in &spec.fields {
            validate_identifier(field)?;
        }
        validate_identifier(table)?;
        let index_name = index_name(table, spec);
        validate_identifier(&index_name)?;
        let sql = index_ddl(table, &index_name, spec, blocking)?;
        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(err) => {
                // Duplicate-name and deadlock races resolve themselves if the
                // index exists after the dust settles.
                let code = err
                    .as_database_error()
                    .and_then(|e| e.code().map(|c| c.to_string()));
                let racy = matches!(code.as_deref(), Some("42P07") | Some("42710") | Some("40P01"));
                if racy && self.index_exists(&index_name).await? {
                    log::debug!(
                        "schema: index {} on {} already created by a peer",
                        index_name,
                        table
                    );
                    Ok(())
                } else {
                    log::error!(
                        "schema: failed to create index {} for component '{}': {}",
                        index_name,
                        descriptor.name,
                        err
                    );
                    Err(err.into())
                }
            }
        }
    }

    async fn analyze(&self, table: &str) -> Result<()> {
        validate_identifier(table)?;
        sqlx::query(&format!("ANALYZE {}", table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM pg_tables WHERE schemaname = 'public' AND tablename = $1")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM pg_indexes WHERE schemaname = 'public' AND indexname = $1")
                .bind(index)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }
}

pub(crate) fn partition_table_name(normalized: &str) -> String {
    let mut table = format!("components_{}", normalized);
    table.truncate(ident::MAX_IDENT_LEN);
    table
}

fn index_name(table: &str, spec: &IndexSpec) -> String {
    let kind = match spec.kind {
        IndexKind::Gin => "gin",
        IndexKind::BTree => "btree",
        IndexKind::Hash => "hash",
        IndexKind::Numeric => "num",
        IndexKind::Composite => "comp",
    };
    let mut name = format!("{}_{}_{}_idx", table, spec.fields.join("_"), kind);
    name.truncate(ident::MAX_IDENT_LEN);
    name
}

/// Renders the CREATE INDEX statement for one spec. Identifiers must already
/// be validated; field names are interpolated as single-quoted JSON keys.
fn index_ddl(table: &str, index_name: &str, spec: &IndexSpec, blocking: bool) -> Result<String> {
    let concurrently = if blocking { "" } else { "CONCURRENTLY " };
    let ddl = match spec.kind {
        IndexKind::Gin => {
            let field = single_field(spec)?;
            format!(
                "CREATE INDEX {}IF NOT EXISTS {} ON {} USING gin ((data->'{}') jsonb_path_ops)",
                concurrently, index_name, table, field
            )
        }
        IndexKind::BTree => {
            let field = single_field(spec)?;
            format!(
                "CREATE INDEX {}IF NOT EXISTS {} ON {} ((data->>'{}'))",
                concurrently, index_name, table, field
            )
        }
        IndexKind::Hash => {
            let field = single_field(spec)?;
            format!(
                "CREATE INDEX {}IF NOT EXISTS {} ON {} USING hash ((data->>'{}'))",
                concurrently, index_name, table, field
            )
        }
        IndexKind::Numeric => {
            let field = single_field(spec)?;
            format!(
                "CREATE INDEX {}IF NOT EXISTS {} ON {} (((data->>'{}')::numeric)) WHERE data->>'{}' ~ '{}'",
                concurrently, index_name, table, field, field, NUMERIC_GUARD_REGEX
            )
        }
        IndexKind::Composite => {
            if spec.fields.len() < 2 {
                return Err(StratumError::Validation(
                    "composite index needs at least two fields".into(),
                ));
            }
            let cols: Vec<String> = spec
                .fields
                .iter()
                .map(|f| format!("(data->>'{}')", f))
                .collect();
            format!(
                "CREATE INDEX {}IF NOT EXISTS {} ON {} ({})",
                concurrently,
                index_name,
                table,
                cols.join(", ")
            )
        }
    };
    Ok(ddl)
}

fn single_field(spec: &IndexSpec) -> Result<&str> {
    match spec.fields.as_slice() {
        [field] => Ok(field),
        _ => Err(StratumError::Validation(format!(
            "index kind {:?} takes exactly one field",
            spec.kind
        ))),
    }
}

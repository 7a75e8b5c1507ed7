//! Declarative entity queries.
//!
//! A query selects entities by component presence and absence plus
//! predicates over component fields, with stable ordering and either offset
//! or keyset pagination. Results are lightweight handles unless
//! [`Query::populate`] is set.

pub mod filter;
pub mod sql;

use crate::component::{Component, TypeId};
use crate::entity::store::EntityStore;
use crate::entity::Entity;
use crate::error::{Result, StratumError};
use self::filter::{Filter, FilterSqlBuilder, SqlValue};
use self::sql::{BuilderMap, QuerySpec, SortDirection, SortSpec, WithClause};
use std::sync::Arc;
use uuid::Uuid;

pub use self::sql::SortDirection as Direction;

/// Fluent query builder bound to an [`EntityStore`].
pub struct Query {
    store: EntityStore,
    spec: QuerySpec,
    populate: bool,
    builders: BuilderMap,
}

impl Query {
    pub fn new(store: EntityStore) -> Self {
        Self {
            store,
            spec: QuerySpec::default(),
            populate: false,
            builders: BuilderMap::new(),
        }
    }

    /// Requires the component to be present.
    pub fn with<C: Component>(self) -> Self {
        self.with_component(C::NAME, Vec::new())
    }

    /// Requires the component with per-field predicates.
    pub fn with_filters<C: Component>(self, filters: Vec<Filter>) -> Self {
        self.with_component(C::NAME, filters)
    }

    /// Requires a component by class name.
    pub fn with_component(mut self, name: &str, filters: Vec<Filter>) -> Self {
        self.spec.with.push(WithClause {
            name: name.to_string(),
            type_id: TypeId::of(name),
            filters,
        });
        self
    }

    /// Forbids the component.
    pub fn without<C: Component>(self) -> Self {
        self.without_component(C::NAME)
    }

    pub fn without_component(mut self, name: &str) -> Self {
        self.spec.without.push(TypeId::of(name));
        self
    }

    /// Constrains the result to a single entity.
    pub fn find_by_id(mut self, id: Uuid) -> Self {
        self.spec.entity_id = Some(id);
        self
    }

    /// Primary ordering key. The component must also be required.
    pub fn sort_by<C: Component>(self, field: &str, direction: SortDirection) -> Self {
        self.sort_by_component(C::NAME, field, direction)
    }

    pub fn sort_by_component(
        mut self,
        name: &str,
        field: &str,
        direction: SortDirection,
    ) -> Self {
        self.spec.sort = Some(SortSpec {
            type_id: TypeId::of(name),
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn take(mut self, n: i64) -> Self {
        self.spec.limit = Some(n);
        self
    }

    /// Offset pagination. Cost grows with the offset; prefer
    /// [`Query::cursor`].
    pub fn offset(mut self, n: i64) -> Self {
        self.spec.offset = Some(n);
        self
    }

    /// Keyset pagination anchored at the previous page's last entity.
    pub fn cursor(mut self, entity_id: Uuid) -> Self {
        self.spec.cursor = Some(entity_id);
        self
    }

    /// Hydrates component data for the returned entities in one bulk load.
    pub fn populate(mut self) -> Self {
        self.populate = true;
        self
    }

    /// Registers a custom filter builder under a name referenced by
    /// [`filter::FilterOp::Custom`].
    pub fn register_filter_builder(
        mut self,
        name: impl Into<String>,
        builder: Arc<dyn FilterSqlBuilder>,
    ) -> Self {
        self.builders.insert(name.into(), builder);
        self
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    fn check_registered(&self) -> Result<()> {
        let registry = self.store.registry();
        for clause in &self.spec.with {
            if !registry.is_registered(&clause.type_id) {
                return Err(StratumError::UnknownComponent(clause.name.clone()));
            }
        }
        Ok(())
    }

    /// Fetches the sort value of the cursor row so the keyset predicate can
    /// anchor on `(sort value, entity id)`.
    async fn cursor_anchor(&self) -> Result<Option<sql::CursorSortValue>> {
        let (Some(cursor_id), Some(sort)) = (self.spec.cursor, self.spec.sort.as_ref()) else {
            return Ok(None);
        };
        crate::schema::ident::validate_identifier(&sort.field)?;
        let sql = format!(
            "SELECT data->>'{}' FROM components \
             WHERE entity_id = $1 AND type_id = $2 AND deleted_at IS NULL",
            sort.field
        );
        let value: Option<Option<String>> = sqlx::query_scalar(&sql)
            .bind(cursor_id)
            .bind(sort.type_id.as_str())
            .fetch_optional(self.store.pool())
            .await?;
        Ok(Some(value.flatten()))
    }

    /// Executes the query and returns matching entities in stable order.
    pub async fn exec(&self) -> Result<Vec<Entity>> {
        self.check_registered()?;
        let anchor = self.cursor_anchor().await?;
        let built = sql::build_select(&self.spec, &self.builders, anchor)?;
        log::debug!("query: {}", built.sql);
        let mut query = sqlx::query_scalar(&built.sql);
        for param in &built.params {
            query = bind_value(query, param);
        }
        let ids: Vec<Uuid> = query.fetch_all(self.store.pool()).await?;
        if self.populate {
            self.store.load_multiple(&ids).await
        } else {
            Ok(ids.into_iter().map(Entity::handle).collect())
        }
    }

    /// Returns the cardinality without materializing rows.
    pub async fn count(&self) -> Result<i64> {
        self.check_registered()?;
        let built = sql::build_count(&self.spec, &self.builders)?;
        log::debug!("query count: {}", built.sql);
        let mut query = sqlx::query_scalar(&built.sql);
        for param in &built.params {
            query = bind_value(query, param);
        }
        let count: i64 = query.fetch_one(self.store.pool()).await?;
        Ok(count)
    }
}

/// Applies one generated parameter to a scalar query builder.
fn bind_value<'q, O>(
    query: sqlx::query::QueryScalar<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments>,
    param: &'q SqlValue,
) -> sqlx::query::QueryScalar<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments> {
    match param {
        SqlValue::Text(v) => query.bind(v),
        SqlValue::Int(v) => query.bind(v),
        SqlValue::Float(v) => query.bind(v),
        SqlValue::Bool(v) => query.bind(v),
        SqlValue::Uuid(v) => query.bind(v),
        SqlValue::TextArray(v) => query.bind(v),
        SqlValue::FloatArray(v) => query.bind(v),
        SqlValue::Json(v) => query.bind(v),
    }
}

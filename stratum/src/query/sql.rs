//! SQL generation for the query engine.
//!
//! Presence is served from the `entity_components` mirror; component data is
//! joined only where predicates or sort keys need it. All literals are bind
//! parameters, all identifiers pass the allow-list validator.

use crate::component::TypeId;
use crate::error::{Result, StratumError};
use crate::query::filter::{compile_filter, Filter, FilterOp, FilterSqlBuilder, ParamContext, SqlValue};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// One required component plus its predicates.
#[derive(Debug, Clone)]
pub struct WithClause {
    pub name: String,
    pub type_id: TypeId,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone)]
pub struct SortSpec {
    pub type_id: TypeId,
    pub field: String,
    pub direction: SortDirection,
}

/// Declarative shape of one query, independent of any connection.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub with: Vec<WithClause>,
    pub without: Vec<TypeId>,
    pub entity_id: Option<Uuid>,
    pub sort: Option<SortSpec>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub cursor: Option<Uuid>,
}

/// Rendered SQL plus its bind parameters, in order.
#[derive(Debug)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

pub type BuilderMap = HashMap<String, Arc<dyn FilterSqlBuilder>>;

/// Sort value of the cursor row, prefetched by the executor. `None` when the
/// cursor row has no value for the sort field.
pub type CursorSortValue = Option<String>;

struct Rendered {
    select_body: String,
    grouped: bool,
    ctx: ParamContext,
    sort_expr: Option<(String, SortDirection)>,
}

fn render_body(
    spec: &QuerySpec,
    builders: &BuilderMap,
    cursor_anchor: Option<CursorSortValue>,
) -> Result<Rendered> {
    let mut ctx = ParamContext::new();
    let mut joins = String::new();
    let mut conditions = vec!["e.deleted_at IS NULL".to_string()];

    // Presence join against the mirror.
    let grouped = spec.with.len() > 1;
    if spec.with.len() == 1 {
        let param = ctx.push(SqlValue::Text(spec.with[0].type_id.to_string()));
        joins.push_str(&format!(
            " JOIN entity_components ec ON ec.entity_id = e.id AND ec.type_id = {} AND ec.deleted_at IS NULL",
            param
        ));
    } else if grouped {
        let ids: Vec<String> = spec.with.iter().map(|w| w.type_id.to_string()).collect();
        let param = ctx.push(SqlValue::TextArray(ids));
        joins.push_str(&format!(
            " JOIN entity_components ec ON ec.entity_id = e.id AND ec.type_id = ANY({}) AND ec.deleted_at IS NULL",
            param
        ));
    }

    // Data joins, one per required component whose data is actually needed.
    let mut sort_expr: Option<(String, SortDirection)> = None;
    for (i, clause) in spec.with.iter().enumerate() {
        let alias = format!("c{}", i);
        let sorted_here = spec
            .sort
            .as_ref()
            .map(|s| s.type_id == clause.type_id)
            .unwrap_or(false);
        if clause.filters.is_empty() && !sorted_here {
            continue;
        }
        let param = ctx.push(SqlValue::Text(clause.type_id.to_string()));
        joins.push_str(&format!(
            " JOIN components {a} ON {a}.entity_id = e.id AND {a}.type_id = {p} AND {a}.deleted_at IS NULL",
            a = alias,
            p = param
        ));
        for filter in &clause.filters {
            let fragment = match &filter.op {
                FilterOp::Custom(name) => {
                    let builder = builders.get(name).ok_or_else(|| {
                        StratumError::Validation(format!(
                            "no filter builder registered under '{}'",
                            name
                        ))
                    })?;
                    builder.validate(filter)?;
                    builder.build(filter, &alias, &mut ctx)?
                }
                _ => compile_filter(filter, &alias, &mut ctx)?,
            };
            conditions.push(fragment);
        }
        if sorted_here {
            let sort = spec.sort.as_ref().unwrap();
            crate::schema::ident::validate_identifier(&sort.field)?;
            sort_expr = Some((
                format!("{}.data->>'{}'", alias, sort.field),
                sort.direction,
            ));
        }
    }
    if spec.sort.is_some() && sort_expr.is_none() {
        return Err(StratumError::Validation(
            "sort component must be required with with()".into(),
        ));
    }

    if let Some(id) = spec.entity_id {
        let param = ctx.push(SqlValue::Uuid(id));
        conditions.push(format!("e.id = {}", param));
    }

    for excluded in &spec.without {
        let param = ctx.push(SqlValue::Text(excluded.to_string()));
        conditions.push(format!(
            "NOT EXISTS (SELECT 1 FROM entity_components x WHERE x.entity_id = e.id AND x.type_id = {} AND x.deleted_at IS NULL)",
            param
        ));
    }

    if let Some(cursor_id) = spec.cursor {
        conditions.push(cursor_predicate(
            cursor_id,
            sort_expr.as_ref(),
            cursor_anchor,
            &mut ctx,
        )?);
    }

    let mut body = format!("FROM entities e{} WHERE {}", joins, conditions.join(" AND "));
    if grouped {
        match &sort_expr {
            Some((expr, _)) => {
                body.push_str(&format!(
                    " GROUP BY e.id, {} HAVING COUNT(DISTINCT ec.type_id) = {}",
                    expr,
                    spec.with.len()
                ));
            }
            None => {
                body.push_str(&format!(
                    " GROUP BY e.id HAVING COUNT(DISTINCT ec.type_id) = {}",
                    spec.with.len()
                ));
            }
        }
    }

    Ok(Rendered {
        select_body: body,
        grouped,
        ctx,
        sort_expr,
    })
}

/// Keyset predicate anchored at the cursor row. The tie-break on `e.id` is
/// always ascending, matching the final ORDER BY.
fn cursor_predicate(
    cursor_id: Uuid,
    sort_expr: Option<&(String, SortDirection)>,
    cursor_anchor: Option<CursorSortValue>,
    ctx: &mut ParamContext,
) -> Result<String> {
    let id_param = ctx.push(SqlValue::Uuid(cursor_id));
    let Some((expr, direction)) = sort_expr else {
        return Ok(format!("e.id > {}", id_param));
    };
    let anchor = cursor_anchor.ok_or_else(|| {
        StratumError::Validation("cursor pagination with sort needs the anchor sort value".into())
    })?;
    match anchor {
        Some(value) => {
            let value_param = ctx.push(SqlValue::Text(value));
            let fragment = match direction {
                SortDirection::Asc => format!(
                    "({expr} > {v} OR ({expr} = {v} AND e.id > {id}) OR {expr} IS NULL)",
                    expr = expr,
                    v = value_param,
                    id = id_param
                ),
                SortDirection::Desc => format!(
                    "({expr} < {v} OR ({expr} = {v} AND e.id > {id}))",
                    expr = expr,
                    v = value_param,
                    id = id_param
                ),
            };
            Ok(fragment)
        }
        // The cursor row sits in the NULL region of the ordering.
        None => match direction {
            // ASC puts NULLs last: only NULL rows remain.
            SortDirection::Asc => Ok(format!(
                "({expr} IS NULL AND e.id > {id})",
                expr = expr,
                id = id_param
            )),
            // DESC puts NULLs first: NULL rows after the cursor id, then
            // every non-NULL row.
            SortDirection::Desc => Ok(format!(
                "(({expr} IS NULL AND e.id > {id}) OR {expr} IS NOT NULL)",
                expr = expr,
                id = id_param
            )),
        },
    }
}

/// Renders the id-selecting query with ordering and pagination.
pub fn build_select(
    spec: &QuerySpec,
    builders: &BuilderMap,
    cursor_anchor: Option<CursorSortValue>,
) -> Result<BuiltQuery> {
    let mut rendered = render_body(spec, builders, cursor_anchor)?;

    let mut sql = format!("SELECT e.id {}", rendered.select_body);
    match &rendered.sort_expr {
        Some((expr, direction)) => {
            sql.push_str(&format!(
                " ORDER BY {} {}, e.id ASC",
                expr,
                direction.as_sql()
            ));
        }
        None => sql.push_str(" ORDER BY e.id ASC"),
    }
    if let Some(limit) = spec.limit {
        let param = rendered.ctx.push(SqlValue::Int(limit));
        sql.push_str(&format!(" LIMIT {}", param));
    }
    if let Some(offset) = spec.offset {
        let param = rendered.ctx.push(SqlValue::Int(offset));
        sql.push_str(&format!(" OFFSET {}", param));
    }

    Ok(BuiltQuery {
        sql,
        params: rendered.ctx.into_params(),
    })
}

/// Renders the cardinality query: same join shape, no ordering or paging.
pub fn build_count(spec: &QuerySpec, builders: &BuilderMap) -> Result<BuiltQuery> {
    let mut spec = spec.clone();
    spec.sort = None;
    spec.limit = None;
    spec.offset = None;
    spec.cursor = None;
    let rendered = render_body(&spec, builders, None)?;
    let sql = if rendered.grouped {
        format!(
            "SELECT COUNT(*) FROM (SELECT e.id {}) AS matched",
            rendered.select_body
        )
    } else {
        format!("SELECT COUNT(DISTINCT e.id) {}", rendered.select_body)
    };
    Ok(BuiltQuery {
        sql,
        params: rendered.ctx.into_params(),
    })
}

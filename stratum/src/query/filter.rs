//! Filter predicates and their SQL compilation.
//!
//! Every literal becomes a bind parameter; field names are validated against
//! the identifier allow-list before being interpolated as JSON keys.

use crate::component::IndexKind;
use crate::error::{Result, StratumError};
use crate::schema::ident::validate_identifier;
use serde_json::Value;
use uuid::Uuid;

/// Comparison operators over component fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Between,
    /// Dispatched to a registered [`FilterSqlBuilder`] under this name.
    Custom(String),
}

/// One predicate over one component field.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn neq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOp::Neq, value)
    }

    pub fn gt(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOp::Gt, value)
    }

    pub fn gte(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOp::Gte, value)
    }

    pub fn lt(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOp::Lt, value)
    }

    pub fn lte(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOp::Lte, value)
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(field, FilterOp::Like, Value::String(pattern.into()))
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOp::In, Value::Array(values))
    }

    pub fn not_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOp::NotIn, Value::Array(values))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOp::IsNull, Value::Null)
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOp::IsNotNull, Value::Null)
    }

    pub fn between(field: impl Into<String>, low: Value, high: Value) -> Self {
        Self::new(field, FilterOp::Between, Value::Array(vec![low, high]))
    }
}

/// A literal destined for one bind slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Uuid(Uuid),
    TextArray(Vec<String>),
    FloatArray(Vec<f64>),
    Json(Value),
}

/// Accumulates bind parameters while fragments are rendered.
#[derive(Debug, Default)]
pub struct ParamContext {
    params: Vec<SqlValue>,
}

impl ParamContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parameter and returns its `$n` placeholder.
    pub fn push(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn into_params(self) -> Vec<SqlValue> {
        self.params
    }
}

/// Contributes an SQL fragment for a custom filter operator.
///
/// Implementations are registered on the query under a name and receive the
/// filter, the alias of the component data join, and the parameter context.
pub trait FilterSqlBuilder: Send + Sync {
    fn build(&self, filter: &Filter, table_alias: &str, ctx: &mut ParamContext) -> Result<String>;

    /// Whether the fragment must be joined through LATERAL.
    fn supports_lateral(&self) -> bool {
        false
    }

    /// Index kind this fragment needs to perform acceptably, if any.
    fn requires_index(&self) -> Option<IndexKind> {
        None
    }

    /// Relative planning cost, used for diagnostics.
    fn complexity_score(&self) -> u32 {
        1
    }

    /// Rejects malformed filter input before SQL is rendered.
    fn validate(&self, _filter: &Filter) -> Result<()> {
        Ok(())
    }
}

/// PostgreSQL full-text search over one field.
pub struct TextSearchBuilder {
    /// Text search configuration, e.g. "simple" or "english".
    pub config: String,
}

impl TextSearchBuilder {
    pub fn new(config: impl Into<String>) -> Self {
        Self {
            config: config.into(),
        }
    }
}

impl FilterSqlBuilder for TextSearchBuilder {
    fn build(&self, filter: &Filter, table_alias: &str, ctx: &mut ParamContext) -> Result<String> {
        validate_identifier(&filter.field)?;
        validate_identifier(&self.config)?;
        let query = match &filter.value {
            Value::String(s) => s.clone(),
            other => {
                return Err(StratumError::Validation(format!(
                    "full-text search takes a string query, got {}",
                    other
                )))
            }
        };
        let param = ctx.push(SqlValue::Text(query));
        Ok(format!(
            "to_tsvector('{}', {}.data->>'{}') @@ plainto_tsquery('{}', {})",
            self.config, table_alias, filter.field, self.config, param
        ))
    }

    fn requires_index(&self) -> Option<IndexKind> {
        Some(IndexKind::Gin)
    }

    fn complexity_score(&self) -> u32 {
        4
    }

    fn validate(&self, filter: &Filter) -> Result<()> {
        if !filter.value.is_string() {
            return Err(StratumError::Validation(
                "full-text search takes a string query".into(),
            ));
        }
        Ok(())
    }
}

fn is_numeric(value: &Value) -> bool {
    value.is_number()
}

fn push_scalar(value: &Value, ctx: &mut ParamContext) -> Result<String> {
    let sql_value = match value {
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Int(i)
            } else {
                SqlValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::Bool(b) => SqlValue::Text(b.to_string()),
        other => {
            return Err(StratumError::Validation(format!(
                "unsupported filter literal: {}",
                other
            )))
        }
    };
    Ok(ctx.push(sql_value))
}

/// Renders one built-in predicate against `alias.data`.
///
/// Numeric literals compare through a `::numeric` cast so they can ride the
/// partial numeric index; strings (including ISO-8601 timestamps, which order
/// lexicographically) compare as text.
pub fn compile_filter(filter: &Filter, alias: &str, ctx: &mut ParamContext) -> Result<String> {
    validate_identifier(&filter.field)?;
    let text_col = format!("{}.data->>'{}'", alias, filter.field);
    let numeric_col = format!("({}.data->>'{}')::numeric", alias, filter.field);

    let fragment = match &filter.op {
        FilterOp::Eq | FilterOp::Neq => {
            let sql_op = if filter.op == FilterOp::Eq { "=" } else { "<>" };
            if filter.value.is_null() {
                let null_op = if filter.op == FilterOp::Eq {
                    "IS NULL"
                } else {
                    "IS NOT NULL"
                };
                format!("{} {}", text_col, null_op)
            } else if is_numeric(&filter.value) {
                let param = push_scalar(&filter.value, ctx)?;
                format!("{} {} {}", numeric_col, sql_op, param)
            } else {
                let param = push_scalar(&filter.value, ctx)?;
                format!("{} {} {}", text_col, sql_op, param)
            }
        }
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
            let sql_op = match filter.op {
                FilterOp::Gt => ">",
                FilterOp::Gte => ">=",
                FilterOp::Lt => "<",
                _ => "<=",
            };
            let param = push_scalar(&filter.value, ctx)?;
            if is_numeric(&filter.value) {
                format!("{} {} {}", numeric_col, sql_op, param)
            } else {
                format!("{} {} {}", text_col, sql_op, param)
            }
        }
        FilterOp::Like => {
            let param = push_scalar(&filter.value, ctx)?;
            format!("{} LIKE {}", text_col, param)
        }
        FilterOp::In | FilterOp::NotIn => {
            let items = filter.value.as_array().ok_or_else(|| {
                StratumError::Validation(format!("{}: IN/NOT IN take an array", filter.field))
            })?;
            if items.is_empty() {
                // An empty list is a contradiction for IN and a tautology
                // for NOT IN, not a SQL error.
                return Ok(if filter.op == FilterOp::In {
                    "FALSE".to_string()
                } else {
                    "TRUE".to_string()
                });
            }
            if items.iter().all(is_numeric) {
                let nums: Vec<f64> = items.iter().filter_map(|v| v.as_f64()).collect();
                let param = ctx.push(SqlValue::FloatArray(nums));
                if filter.op == FilterOp::In {
                    format!("{} = ANY({})", numeric_col, param)
                } else {
                    format!("{} <> ALL({})", numeric_col, param)
                }
            } else {
                let texts: Result<Vec<String>> = items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => Ok(s.clone()),
                        Value::Number(n) => Ok(n.to_string()),
                        Value::Bool(b) => Ok(b.to_string()),
                        other => Err(StratumError::Validation(format!(
                            "unsupported IN element: {}",
                            other
                        ))),
                    })
                    .collect();
                let param = ctx.push(SqlValue::TextArray(texts?));
                if filter.op == FilterOp::In {
                    format!("{} = ANY({})", text_col, param)
                } else {
                    format!("{} <> ALL({})", text_col, param)
                }
            }
        }
        FilterOp::IsNull => format!("{} IS NULL", text_col),
        FilterOp::IsNotNull => format!("{} IS NOT NULL", text_col),
        FilterOp::Between => {
            let bounds = filter.value.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                StratumError::Validation(format!(
                    "{}: BETWEEN takes a two-element array",
                    filter.field
                ))
            })?;
            let numeric = bounds.iter().all(is_numeric);
            let low = push_scalar(&bounds[0], ctx)?;
            let high = push_scalar(&bounds[1], ctx)?;
            let col = if numeric { &numeric_col } else { &text_col };
            format!("{} BETWEEN {} AND {}", col, low, high)
        }
        FilterOp::Custom(name) => {
            return Err(StratumError::Validation(format!(
                "no filter builder registered under '{}'",
                name
            )))
        }
    };
    Ok(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn compile(filter: Filter) -> (String, Vec<SqlValue>) {
        let mut ctx = ParamContext::new();
        let sql = compile_filter(&filter, "c0", &mut ctx).unwrap();
        (sql, ctx.into_params())
    }

    #[test]
    fn string_equality_compares_text() {
        let (sql, params) = compile(Filter::eq("name", json!("ada")));
        assert_eq!(sql, "c0.data->>'name' = $1");
        assert_eq!(params, vec![SqlValue::Text("ada".into())]);
    }

    #[test]
    fn numeric_comparison_casts() {
        let (sql, params) = compile(Filter::gt("score", json!(10)));
        assert_eq!(sql, "(c0.data->>'score')::numeric > $1");
        assert_eq!(params, vec![SqlValue::Int(10)]);

        let (sql, _) = compile(Filter::lte("score", json!(1.5)));
        assert_eq!(sql, "(c0.data->>'score')::numeric <= $1");
    }

    #[test]
    fn eq_null_becomes_is_null() {
        let (sql, params) = compile(Filter::eq("age", Value::Null));
        assert_eq!(sql, "c0.data->>'age' IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn like_preserves_caller_wildcards() {
        let (sql, params) = compile(Filter::like("name", "%ada%"));
        assert_eq!(sql, "c0.data->>'name' LIKE $1");
        assert_eq!(params, vec![SqlValue::Text("%ada%".into())]);
    }

    #[test]
    fn empty_in_is_a_contradiction() {
        let (sql, params) = compile(Filter::is_in("status", vec![]));
        assert_eq!(sql, "FALSE");
        assert!(params.is_empty());

        let (sql, _) = compile(Filter::not_in("status", vec![]));
        assert_eq!(sql, "TRUE");
    }

    #[test]
    fn numeric_in_uses_any_over_floats() {
        let (sql, params) = compile(Filter::is_in("score", vec![json!(1), json!(2)]));
        assert_eq!(sql, "(c0.data->>'score')::numeric = ANY($1)");
        assert_eq!(params, vec![SqlValue::FloatArray(vec![1.0, 2.0])]);
    }

    #[test]
    fn text_not_in_uses_all() {
        let (sql, _) = compile(Filter::not_in("status", vec![json!("a"), json!("b")]));
        assert_eq!(sql, "c0.data->>'status' <> ALL($1)");
    }

    #[test]
    fn between_numeric() {
        let (sql, params) = compile(Filter::between("score", json!(5000), json!(5100)));
        assert_eq!(sql, "(c0.data->>'score')::numeric BETWEEN $1 AND $2");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn between_text_for_iso_dates() {
        let (sql, _) = compile(Filter::between(
            "created",
            json!("2026-01-01T00:00:00Z"),
            json!("2026-02-01T00:00:00Z"),
        ));
        assert_eq!(sql, "c0.data->>'created' BETWEEN $1 AND $2");
    }

    #[test]
    fn field_names_are_validated() {
        let mut ctx = ParamContext::new();
        let filter = Filter::eq("bad'; drop--", json!("x"));
        assert!(compile_filter(&filter, "c0", &mut ctx).is_err());
    }

    #[test]
    fn text_search_builder_contributes_fragment() {
        let builder = TextSearchBuilder::new("simple");
        let filter = Filter::new("bio", FilterOp::Custom("text_search".into()), json!("rust"));
        builder.validate(&filter).unwrap();
        let mut ctx = ParamContext::new();
        let sql = builder.build(&filter, "c1", &mut ctx).unwrap();
        assert_eq!(
            sql,
            "to_tsvector('simple', c1.data->>'bio') @@ plainto_tsquery('simple', $1)"
        );
        assert_eq!(builder.requires_index(), Some(IndexKind::Gin));
        assert!(!builder.supports_lateral());
        assert!(builder.complexity_score() > 1);
    }
}

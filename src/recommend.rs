//! Recommendation-row filter criteria: a whitelisted JSON expression tree
//! translated into a repository query. The whitelist is part of the
//! contract, not an optimization.

use crate::error::{LumiereError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ALLOWED_FILTER_FIELDS: [&str; 11] = [
    "scanned_at",
    "created_at",
    "updated_at",
    "duration",
    "file_name",
    "file_size",
    "file_extension",
    "width",
    "height",
    "codec",
    "bitrate",
];

const ALLOWED_ORDER_FIELDS: [&str; 9] = [
    "scanned_at",
    "created_at",
    "updated_at",
    "duration",
    "file_name",
    "file_size",
    "width",
    "height",
    "bitrate",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterClause {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterCriteria {
    #[serde(rename = "where", default, skip_serializing_if = "Vec::is_empty")]
    pub where_clauses: Vec<FilterClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    Integer(i64),
    Real(f64),
}

fn bind_from_value(value: &Value) -> Result<BindValue> {
    match value {
        Value::String(s) => Ok(BindValue::Text(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(BindValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(BindValue::Real(f))
            } else {
                Err(LumiereError::InvalidArgument("Unsupported number".into()))
            }
        }
        Value::Bool(b) => Ok(BindValue::Integer(*b as i64)),
        other => Err(LumiereError::InvalidArgument(format!(
            "Unsupported filter value: {}",
            other
        ))),
    }
}

fn validate_filter_field(field: &str) -> Result<()> {
    if !ALLOWED_FILTER_FIELDS.contains(&field) {
        return Err(LumiereError::InvalidArgument(format!(
            "Invalid filter field: {}",
            field
        )));
    }
    Ok(())
}

fn validate_order_field(field: &str) -> Result<()> {
    if !ALLOWED_ORDER_FIELDS.contains(&field) {
        return Err(LumiereError::InvalidArgument(format!(
            "Invalid order_by field: {}",
            field
        )));
    }
    Ok(())
}

/// Validate without building. Used by the dashboard CRUD endpoints so a bad
/// row is rejected at write time.
pub fn validate_filter_criteria(criteria: &FilterCriteria) -> Result<()> {
    build_filter_query(criteria, "/").map(|_| ())
}

/// Translate criteria into a WHERE/ORDER/LIMIT SQL fragment plus bind
/// values, always scoped to the library root and live rows.
pub fn build_filter_query(
    criteria: &FilterCriteria,
    library_path: &str,
) -> Result<(String, Vec<BindValue>)> {
    let mut sql = String::from("file_path LIKE ? AND deleted_at IS NULL");
    let mut binds = vec![BindValue::Text(format!("{}%", library_path))];

    for clause in &criteria.where_clauses {
        validate_filter_field(&clause.field)?;
        match clause.operator.as_str() {
            "eq" => {
                sql.push_str(&format!(" AND {} = ?", clause.field));
                binds.push(bind_from_value(&clause.value)?);
            }
            "ne" => {
                sql.push_str(&format!(" AND {} != ?", clause.field));
                binds.push(bind_from_value(&clause.value)?);
            }
            "gt" => {
                sql.push_str(&format!(" AND {} > ?", clause.field));
                binds.push(bind_from_value(&clause.value)?);
            }
            "gte" => {
                sql.push_str(&format!(" AND {} >= ?", clause.field));
                binds.push(bind_from_value(&clause.value)?);
            }
            "lt" => {
                sql.push_str(&format!(" AND {} < ?", clause.field));
                binds.push(bind_from_value(&clause.value)?);
            }
            "lte" => {
                sql.push_str(&format!(" AND {} <= ?", clause.field));
                binds.push(bind_from_value(&clause.value)?);
            }
            "like" => {
                let Value::String(s) = &clause.value else {
                    return Err(LumiereError::InvalidArgument(
                        "like operator requires a string value".into(),
                    ));
                };
                sql.push_str(&format!(" AND {} LIKE ?", clause.field));
                binds.push(BindValue::Text(s.clone()));
            }
            "ilike" => {
                let Value::String(s) = &clause.value else {
                    return Err(LumiereError::InvalidArgument(
                        "ilike operator requires a string value".into(),
                    ));
                };
                sql.push_str(&format!(" AND LOWER({}) LIKE LOWER(?)", clause.field));
                binds.push(BindValue::Text(s.clone()));
            }
            "in" | "not_in" => {
                let Value::Array(values) = &clause.value else {
                    return Err(LumiereError::InvalidArgument(format!(
                        "{} operator requires a list value",
                        clause.operator
                    )));
                };
                if values.is_empty() {
                    return Err(LumiereError::InvalidArgument(format!(
                        "{} operator requires a non-empty list",
                        clause.operator
                    )));
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                let keyword = if clause.operator == "in" { "IN" } else { "NOT IN" };
                sql.push_str(&format!(" AND {} {} ({})", clause.field, keyword, placeholders));
                for value in values {
                    binds.push(bind_from_value(value)?);
                }
            }
            "is_null" => sql.push_str(&format!(" AND {} IS NULL", clause.field)),
            "is_not_null" => sql.push_str(&format!(" AND {} IS NOT NULL", clause.field)),
            other => {
                return Err(LumiereError::InvalidArgument(format!(
                    "Unsupported operator: {}",
                    other
                )));
            }
        }
    }

    if let Some(order_by) = &criteria.order_by {
        validate_order_field(order_by)?;
        let direction = match criteria.order.as_deref().map(|o| o.to_uppercase()) {
            None => "ASC".to_string(),
            Some(direction) if direction == "ASC" || direction == "DESC" => direction,
            Some(other) => {
                return Err(LumiereError::InvalidArgument(format!(
                    "order must be ASC or DESC, got {}",
                    other
                )));
            }
        };
        sql.push_str(&format!(" ORDER BY {} {}", order_by, direction));
    }

    match (criteria.limit, criteria.offset) {
        (Some(limit), _) if limit < 1 => {
            return Err(LumiereError::InvalidArgument(
                "limit must be a positive integer".into(),
            ));
        }
        (_, Some(offset)) if offset < 0 => {
            return Err(LumiereError::InvalidArgument(
                "offset must be a non-negative integer".into(),
            ));
        }
        (Some(limit), Some(offset)) => {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
        }
        (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
        (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
        (None, None) => {}
    }

    Ok((sql, binds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn criteria(value: Value) -> FilterCriteria {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_scoped_to_library_and_live_rows() {
        let (sql, binds) = build_filter_query(&FilterCriteria::default(), "/media/movies").unwrap();
        assert_eq!(sql, "file_path LIKE ? AND deleted_at IS NULL");
        assert_eq!(binds, vec![BindValue::Text("/media/movies%".into())]);
    }

    #[test]
    fn test_comparison_and_ordering() {
        let criteria = criteria(json!({
            "where": [{"field": "duration", "operator": "gt", "value": 3600}],
            "order_by": "created_at",
            "order": "desc",
            "limit": 20,
            "offset": 10
        }));
        let (sql, binds) = build_filter_query(&criteria, "/m").unwrap();
        assert!(sql.contains("duration > ?"));
        assert!(sql.contains("ORDER BY created_at DESC"));
        assert!(sql.ends_with("LIMIT 20 OFFSET 10"));
        assert_eq!(binds[1], BindValue::Integer(3600));
    }

    #[test]
    fn test_in_operator_expands_placeholders() {
        let criteria = criteria(json!({
            "where": [{"field": "codec", "operator": "in", "value": ["h264", "hevc"]}]
        }));
        let (sql, binds) = build_filter_query(&criteria, "/m").unwrap();
        assert!(sql.contains("codec IN (?, ?)"));
        assert_eq!(binds.len(), 3);
    }

    #[test]
    fn test_null_checks_take_no_binds() {
        let criteria = criteria(json!({
            "where": [{"field": "codec", "operator": "is_null"}]
        }));
        let (sql, binds) = build_filter_query(&criteria, "/m").unwrap();
        assert!(sql.contains("codec IS NULL"));
        assert_eq!(binds.len(), 1);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let criteria = criteria(json!({
            "where": [{"field": "password", "operator": "eq", "value": "x"}]
        }));
        let err = build_filter_query(&criteria, "/m").unwrap_err();
        assert!(matches!(err, LumiereError::InvalidArgument(_)));
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let criteria = criteria(json!({
            "where": [{"field": "codec", "operator": "regex", "value": ".*"}]
        }));
        assert!(matches!(
            build_filter_query(&criteria, "/m"),
            Err(LumiereError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_order_field_whitelist_is_narrower() {
        // codec is filterable but not orderable.
        let criteria = criteria(json!({"order_by": "codec"}));
        assert!(build_filter_query(&criteria, "/m").is_err());
    }

    #[test]
    fn test_like_requires_string() {
        let criteria = criteria(json!({
            "where": [{"field": "file_name", "operator": "like", "value": 42}]
        }));
        assert!(build_filter_query(&criteria, "/m").is_err());
    }

    #[test]
    fn test_limit_and_offset_bounds() {
        assert!(build_filter_query(&criteria(json!({"limit": 0})), "/m").is_err());
        assert!(build_filter_query(&criteria(json!({"offset": -1})), "/m").is_err());
        let (sql, _) = build_filter_query(&criteria(json!({"offset": 5})), "/m").unwrap();
        assert!(sql.ends_with("LIMIT -1 OFFSET 5"));
    }

    #[test]
    fn test_validate_matches_build() {
        let good = criteria(json!({
            "where": [{"field": "width", "operator": "gte", "value": 1920}],
            "order_by": "width",
            "order": "ASC"
        }));
        assert!(validate_filter_criteria(&good).is_ok());

        let bad = criteria(json!({"order": "SIDEWAYS", "order_by": "width"}));
        assert!(validate_filter_criteria(&bad).is_err());
    }
}

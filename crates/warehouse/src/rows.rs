//! Decoding of REST query results into typed rows.
//!
//! The REST API returns every scalar as a string inside a `{"f": [{"v": ...}]}`
//! envelope. The schema is used to turn those strings back into JSON numbers
//! and booleans, and to unfold nested records and repeated fields.

use propensity_types::{Row, RowSet};
use serde::Deserialize;
use serde_json::{Map, Number, Value};

/// One column of a result schema.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: String,
    #[serde(default)]
    pub mode: Option<String>,
    /// Sub-fields for RECORD/STRUCT columns.
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

/// Encoded result row.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TableRow {
    #[serde(default)]
    pub f: Vec<TableCell>,
}

/// Encoded result cell.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TableCell {
    #[serde(default)]
    pub v: Value,
}

/// Decode encoded rows against their schema. Missing cells decode to `null`.
pub fn decode_rows(fields: &[FieldSchema], rows: &[TableRow]) -> RowSet {
    let columns = fields.iter().map(|field| field.name.clone()).collect();
    let rows = rows
        .iter()
        .map(|row| {
            let mut decoded = Row::with_capacity(fields.len());
            for (index, field) in fields.iter().enumerate() {
                let raw = row.f.get(index).map(|cell| &cell.v).unwrap_or(&Value::Null);
                decoded.insert(field.name.clone(), decode_field(field, raw));
            }
            decoded
        })
        .collect();
    RowSet { columns, rows }
}

fn decode_field(field: &FieldSchema, raw: &Value) -> Value {
    if raw.is_null() {
        return Value::Null;
    }
    if field.mode.as_deref().is_some_and(|mode| mode.eq_ignore_ascii_case("REPEATED")) {
        let Value::Array(items) = raw else {
            return raw.clone();
        };
        return Value::Array(
            items
                .iter()
                .map(|item| decode_scalar_or_record(field, item.get("v").unwrap_or(item)))
                .collect(),
        );
    }
    decode_scalar_or_record(field, raw)
}

fn decode_scalar_or_record(field: &FieldSchema, raw: &Value) -> Value {
    if raw.is_null() {
        return Value::Null;
    }
    match field.field_type.to_ascii_uppercase().as_str() {
        "RECORD" | "STRUCT" => decode_record(&field.fields, raw),
        "INTEGER" | "INT64" => parse_string(raw, |text| text.parse::<i64>().ok().map(Value::from)),
        "FLOAT" | "FLOAT64" => parse_string(raw, |text| text.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number)),
        "BOOLEAN" | "BOOL" => parse_string(raw, |text| match text.to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        }),
        // NUMERIC and BIGNUMERIC stay strings to keep their precision.
        _ => raw.clone(),
    }
}

fn decode_record(fields: &[FieldSchema], raw: &Value) -> Value {
    let Some(cells) = raw.get("f").and_then(Value::as_array) else {
        return raw.clone();
    };
    let mut object = Map::new();
    for (index, field) in fields.iter().enumerate() {
        let cell = cells.get(index).and_then(|cell| cell.get("v")).unwrap_or(&Value::Null);
        object.insert(field.name.clone(), decode_field(field, cell));
    }
    Value::Object(object)
}

fn parse_string(raw: &Value, parse: impl Fn(&str) -> Option<Value>) -> Value {
    match raw {
        Value::String(text) => parse(text).unwrap_or_else(|| raw.clone()),
        _ => raw.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, field_type: &str) -> FieldSchema {
        FieldSchema {
            name: name.into(),
            field_type: field_type.into(),
            mode: None,
            fields: Vec::new(),
        }
    }

    #[test]
    fn decodes_evaluation_metrics_row() {
        let fields = vec![field("precision", "FLOAT"), field("recall", "FLOAT"), field("f1_score", "FLOAT"), field("roc_auc", "FLOAT")];
        let rows: Vec<TableRow> = serde_json::from_value(json!([
            {"f": [{"v": "0.468"}, {"v": "0.111"}, {"v": "0.179"}, {"v": "0.9815"}]}
        ]))
        .expect("rows");

        let decoded = decode_rows(&fields, &rows);
        assert_eq!(decoded.columns, vec!["precision", "recall", "f1_score", "roc_auc"]);
        assert_eq!(decoded.rows[0]["roc_auc"], json!(0.9815));
    }

    #[test]
    fn decodes_integers_booleans_nulls_and_strings() {
        let fields = vec![
            field("country", "STRING"),
            field("total_predicted_purchases", "INTEGER"),
            field("is_mobile", "BOOLEAN"),
            field("pageviews", "INT64"),
        ];
        let rows: Vec<TableRow> = serde_json::from_value(json!([
            {"f": [{"v": "Canada"}, {"v": "7"}, {"v": "false"}, {"v": null}]}
        ]))
        .expect("rows");

        let decoded = decode_rows(&fields, &rows);
        let row = &decoded.rows[0];
        assert_eq!(row["country"], json!("Canada"));
        assert_eq!(row["total_predicted_purchases"], json!(7));
        assert_eq!(row["is_mobile"], json!(false));
        assert_eq!(row["pageviews"], Value::Null);
    }

    #[test]
    fn decodes_repeated_records() {
        let probability = FieldSchema {
            name: "predicted_label_probs".into(),
            field_type: "RECORD".into(),
            mode: Some("REPEATED".into()),
            fields: vec![field("label", "INTEGER"), field("prob", "FLOAT")],
        };
        let rows: Vec<TableRow> = serde_json::from_value(json!([
            {"f": [{"v": [
                {"v": {"f": [{"v": "1"}, {"v": "0.25"}]}},
                {"v": {"f": [{"v": "0"}, {"v": "0.75"}]}}
            ]}]}
        ]))
        .expect("rows");

        let decoded = decode_rows(&[probability], &rows);
        assert_eq!(
            decoded.rows[0]["predicted_label_probs"],
            json!([{"label": 1, "prob": 0.25}, {"label": 0, "prob": 0.75}])
        );
    }

    #[test]
    fn short_rows_fill_missing_cells_with_null() {
        let fields = vec![field("a", "STRING"), field("b", "STRING")];
        let rows = vec![TableRow {
            f: vec![TableCell { v: json!("x") }],
        }];
        let decoded = decode_rows(&fields, &rows);
        assert_eq!(decoded.rows[0]["b"], Value::Null);
    }
}

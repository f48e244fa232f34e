//! Declarative schemas turning untyped [`SourceRecord`]s into typed
//! [`ValidatedRecord`]s.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use zlv_core::{
    BuildingRecord, DpeClass, HousingOwnerRecord, HousingRecord, Occupancy, OwnerKind,
    OwnerRecord, PropertyRight, RecordKind, SourceRecord, ValidatedRecord,
};
use zlv_sources::RecordStream;

use crate::report::Reporter;
use crate::ImportError;

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Text,
    FixedLength(usize),
    /// Case-insensitive membership; the value is canonicalized to the listed spelling.
    OneOf(&'static [&'static str]),
    Integer { min: Option<i64>, max: Option<i64> },
    Decimal,
    Date,
    /// JSON array of strings, or a single string split on `|` and newlines.
    TextList,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
    pub rule: Rule,
}

impl FieldSpec {
    const fn required(name: &'static str, rule: Rule) -> Self {
        Self {
            name,
            required: true,
            rule,
        }
    }

    const fn optional(name: &'static str, rule: Rule) -> Self {
        Self {
            name,
            required: false,
            rule,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Coerced {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
    List(Vec<String>),
}

/// A record that failed its schema, with every failing field.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {}: {}", .record.line, .messages.join("; "))]
pub struct ValidationError {
    pub messages: Vec<String>,
    pub record: SourceRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub kind: RecordKind,
    pub fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn for_kind(kind: RecordKind) -> Self {
        use Rule::*;
        let fields = match kind {
            RecordKind::Owner => vec![
                FieldSpec::optional("idpersonne", FixedLength(8)),
                FieldSpec::required("full_name", Text),
                FieldSpec::optional("raw_address", TextList),
                FieldSpec::optional("birth_date", Date),
                FieldSpec::optional("kind", OneOf(&OwnerKind::VALUES)),
                FieldSpec::optional("siren", FixedLength(9)),
                FieldSpec::optional("data_source", Text),
            ],
            RecordKind::Housing => vec![
                FieldSpec::required("geo_code", FixedLength(5)),
                FieldSpec::required("local_id", FixedLength(12)),
                FieldSpec::optional("invariant", Text),
                FieldSpec::optional("building_id", Text),
                FieldSpec::optional("raw_address", TextList),
                FieldSpec::optional("living_area", Decimal),
                FieldSpec::optional("rooms_count", Integer { min: Some(0), max: None }),
                FieldSpec::optional(
                    "vacancy_start_year",
                    Integer {
                        min: Some(1800),
                        max: Some(2100),
                    },
                ),
                FieldSpec::required("occupancy", OneOf(&Occupancy::VALUES)),
                FieldSpec::optional("data_source", Text),
            ],
            RecordKind::HousingOwner => vec![
                FieldSpec::required("idpersonne", FixedLength(8)),
                FieldSpec::required("idprocpte", FixedLength(11)),
                FieldSpec::required("idprodroit", FixedLength(13)),
                FieldSpec::required("local_id", FixedLength(12)),
                FieldSpec::required("geo_code", FixedLength(5)),
                FieldSpec::required(
                    "rank",
                    Integer {
                        min: Some(1),
                        max: Some(10),
                    },
                ),
                FieldSpec::required("property_right", OneOf(&PropertyRight::VALUES)),
            ],
            RecordKind::Building => vec![
                FieldSpec::required("building_id", Text),
                FieldSpec::required("geo_code", FixedLength(5)),
                FieldSpec::optional("housing_count", Integer { min: Some(0), max: None }),
                FieldSpec::optional(
                    "vacant_housing_count",
                    Integer { min: Some(0), max: None },
                ),
                FieldSpec::optional("dpe_class", OneOf(&DpeClass::VALUES)),
                FieldSpec::optional("dpe_date", Date),
            ],
        };
        Self { kind, fields }
    }

    pub fn validate(&self, record: &SourceRecord) -> Result<ValidatedRecord, ValidationError> {
        let mut values = HashMap::new();
        let mut messages = Vec::new();
        for field in &self.fields {
            match record.get(field.name) {
                None if field.required => messages.push(format!("{} is required", field.name)),
                None => {}
                Some(raw) => match coerce(&field.rule, raw) {
                    Ok(value) => {
                        values.insert(field.name, value);
                    }
                    Err(reason) => messages.push(format!("{} {reason}", field.name)),
                },
            }
        }
        if !messages.is_empty() {
            return Err(ValidationError {
                messages,
                record: record.clone(),
            });
        }

        let fields = Fields(values);
        let built = match self.kind {
            RecordKind::Owner => ValidatedRecord::Owner(OwnerRecord {
                idpersonne: fields.text("idpersonne"),
                full_name: fields.text("full_name").unwrap_or_default(),
                raw_address: fields.list("raw_address"),
                birth_date: fields.date("birth_date"),
                kind: fields.parsed("kind"),
                siren: fields.text("siren"),
                data_source: fields.text("data_source"),
            }),
            RecordKind::Housing => ValidatedRecord::Housing(HousingRecord {
                geo_code: fields.text("geo_code").unwrap_or_default(),
                local_id: fields.text("local_id").unwrap_or_default(),
                invariant: fields.text("invariant"),
                building_id: fields.text("building_id"),
                raw_address: fields.list("raw_address"),
                living_area: fields.decimal("living_area"),
                rooms_count: fields.integer("rooms_count"),
                vacancy_start_year: fields.integer("vacancy_start_year"),
                occupancy: fields.parsed("occupancy").unwrap_or(Occupancy::Unknown),
                data_source: fields.text("data_source"),
            }),
            RecordKind::HousingOwner => {
                let property_right = fields.parsed("property_right");
                ValidatedRecord::HousingOwner(HousingOwnerRecord {
                    idpersonne: fields.text("idpersonne").unwrap_or_default(),
                    idprocpte: fields.text("idprocpte").unwrap_or_default(),
                    idprodroit: fields.text("idprodroit").unwrap_or_default(),
                    local_id: fields.text("local_id").unwrap_or_default(),
                    geo_code: fields.text("geo_code").unwrap_or_default(),
                    rank: fields.integer("rank").unwrap_or(1),
                    property_right: property_right.unwrap_or(PropertyRight::Autre),
                })
            }
            RecordKind::Building => ValidatedRecord::Building(BuildingRecord {
                building_id: fields.text("building_id").unwrap_or_default(),
                geo_code: fields.text("geo_code").unwrap_or_default(),
                housing_count: fields.integer("housing_count"),
                vacant_housing_count: fields.integer("vacant_housing_count"),
                dpe_class: fields.parsed("dpe_class"),
                dpe_date: fields.date("dpe_date"),
            }),
        };
        Ok(built)
    }

    /// Validate every row of `stream`, forwarding typed records to `out`.
    /// Failures go to the reporter; with `abort_early` the first one ends the
    /// stream with [`ImportError::AbortEarly`]. Returns the number of rows read.
    pub async fn run_stream(
        &self,
        mut stream: RecordStream,
        out: mpsc::Sender<(SourceRecord, ValidatedRecord)>,
        reporter: Reporter,
        abort_early: bool,
    ) -> Result<u64, ImportError> {
        let mut read = 0u64;
        while let Some(item) = stream.next().await {
            let record = item?;
            read += 1;
            match self.validate(&record) {
                Ok(validated) => {
                    if out.send((record, validated)).await.is_err() {
                        debug!(kind = %self.kind, "downstream closed, validator stopping");
                        break;
                    }
                }
                Err(err) => {
                    reporter.failed(&err.record, &err);
                    if abort_early {
                        return Err(ImportError::AbortEarly {
                            line: err.record.line,
                            message: err.messages.join("; "),
                        });
                    }
                }
            }
        }
        Ok(read)
    }
}

struct Fields(HashMap<&'static str, Coerced>);

impl Fields {
    fn text(&self, name: &str) -> Option<String> {
        match self.0.get(name)? {
            Coerced::Text(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.text(name).and_then(|s| s.parse().ok())
    }

    fn integer(&self, name: &str) -> Option<i64> {
        match self.0.get(name)? {
            Coerced::Integer(v) => Some(*v),
            _ => None,
        }
    }

    fn decimal(&self, name: &str) -> Option<f64> {
        match self.0.get(name)? {
            Coerced::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    fn date(&self, name: &str) -> Option<NaiveDate> {
        match self.0.get(name)? {
            Coerced::Date(d) => Some(*d),
            _ => None,
        }
    }

    fn list(&self, name: &str) -> Vec<String> {
        match self.0.get(name) {
            Some(Coerced::List(v)) => v.clone(),
            _ => Vec::new(),
        }
    }
}

fn as_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce(rule: &Rule, value: &JsonValue) -> Result<Coerced, String> {
    match rule {
        Rule::Text => as_text(value)
            .map(Coerced::Text)
            .ok_or_else(|| "must be a scalar value".to_string()),
        Rule::FixedLength(len) => {
            let text = as_text(value).ok_or_else(|| "must be a scalar value".to_string())?;
            let actual = text.chars().count();
            if actual == *len {
                Ok(Coerced::Text(text))
            } else {
                Err(format!("must be {len} characters long, got {actual}"))
            }
        }
        Rule::OneOf(allowed) => {
            let text = as_text(value).ok_or_else(|| "must be a scalar value".to_string())?;
            allowed
                .iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(&text))
                .map(|candidate| Coerced::Text(candidate.to_string()))
                .ok_or_else(|| format!("must be one of {}, got {text:?}", allowed.join(", ")))
        }
        Rule::Integer { min, max } => {
            let parsed = match value {
                JsonValue::Number(n) => n.as_i64(),
                JsonValue::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            }
            .ok_or_else(|| format!("must be an integer, got {value}"))?;
            if min.is_some_and(|m| parsed < m) || max.is_some_and(|m| parsed > m) {
                return Err(format!(
                    "must be within [{}, {}], got {parsed}",
                    min.map(|m| m.to_string()).unwrap_or_else(|| "..".into()),
                    max.map(|m| m.to_string()).unwrap_or_else(|| "..".into()),
                ));
            }
            Ok(Coerced::Integer(parsed))
        }
        Rule::Decimal => match value {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite())
        .map(Coerced::Decimal)
        .ok_or_else(|| format!("must be a decimal number, got {value}")),
        Rule::Date => coerce_date(value)
            .map(Coerced::Date)
            .ok_or_else(|| format!("must be a date (epoch seconds or YYYY-MM-DD), got {value}")),
        Rule::TextList => {
            let lines = match value {
                JsonValue::Array(items) => items
                    .iter()
                    .map(|item| as_text(item).ok_or_else(|| "must contain only strings".to_string()))
                    .collect::<Result<Vec<_>, _>>()?,
                JsonValue::String(s) => s.split(['|', '\n']).map(ToString::to_string).collect(),
                other => vec![as_text(other).ok_or_else(|| "must be a list of strings".to_string())?],
            };
            Ok(Coerced::List(
                lines
                    .into_iter()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect(),
            ))
        }
    }
}

/// Epoch seconds win over string forms: a JSON number or an all-digit string
/// is always read as a timestamp.
pub fn coerce_date(value: &JsonValue) -> Option<NaiveDate> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .and_then(from_epoch),
        JsonValue::String(s) => {
            let s = s.trim();
            let digits = s.strip_prefix('-').unwrap_or(s);
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return s.parse::<i64>().ok().and_then(from_epoch);
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|d| d.date_naive()))
                .or_else(|| NaiveDate::parse_from_str(s, "%d/%m/%Y").ok())
        }
        _ => None,
    }
}

fn from_epoch(secs: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(secs, 0).map(|d| d.date_naive())
}

//! Dialect rule table + schema normalizer.
//!
//! The rule table is data: a YAML document mapping each canonical field to the
//! raw columns it may come from. [`normalize`] applies it to a [`RawBatch`] and
//! never fails; malformed rows come back as [`RowError`]s.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tripload_core::{CanonicalField, CanonicalRecord, RawBatch, RawValue, ValueKind};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tripload-rules";

/// Rule table shipped with the crate; covers every known historical dialect.
pub const BUILTIN_RULES_YAML: &str = include_str!("../../../rules/dialects.yaml");

const SUPPORTED_VERSION: u32 = 1;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
];

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("reading rule table {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rule table: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported rule table version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown canonical field `{0}`")]
    UnknownField(String),
    #[error("no rule for canonical field `{0}`")]
    MissingRule(CanonicalField),
    #[error("rule for `{0}` lists no candidate columns")]
    NoCandidates(CanonicalField),
    #[error("required field `{0}` must not declare a default")]
    RequiredWithDefault(CanonicalField),
    #[error("field `{0}` must declare an explicit default (null is allowed)")]
    MissingDefault(CanonicalField),
    #[error("field `{0}` cannot default to null")]
    NullDefault(CanonicalField),
    #[error("field `{field}`: {context} `{value}` is not a valid {kind:?}")]
    InvalidLiteral {
        field: CanonicalField,
        context: &'static str,
        value: String,
        kind: ValueKind,
    },
    #[error("field `{0}`: scale applies to float fields only")]
    ScaleOnNonFloat(CanonicalField),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    version: u32,
    fields: BTreeMap<String, RuleSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSpec {
    candidates: Vec<CandidateSpec>,
    #[serde(default, deserialize_with = "present")]
    default: Option<serde_yaml::Value>,
    #[serde(default)]
    rewrite: Option<BTreeMap<String, serde_yaml::Value>>,
    #[serde(default)]
    scale: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CandidateSpec {
    column: String,
    #[serde(default)]
    rewrite: Option<BTreeMap<String, serde_yaml::Value>>,
}

/// Keeps an explicit `default: null` distinguishable from an absent key.
fn present<'de, D>(deserializer: D) -> Result<Option<serde_yaml::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_yaml::Value::deserialize(deserializer).map(Some)
}

/// A coerced canonical value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            FieldValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    fn into_text(self) -> Option<String> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

pub type RewriteTable = HashMap<String, FieldValue>;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub column: String,
    /// Effective rewrite table: the candidate's own, else the rule-level one.
    pub rewrite: Option<Arc<RewriteTable>>,
}

/// How one canonical field is derived from raw columns.
#[derive(Debug, Clone)]
pub struct DialectRule {
    pub field: CanonicalField,
    pub candidates: Vec<Candidate>,
    /// `None` only for required fields.
    pub default: Option<FieldValue>,
    pub scale: Option<f64>,
}

/// Immutable, validated mapping from canonical field to [`DialectRule`].
#[derive(Debug, Clone)]
pub struct RuleTable {
    // Indexed by `CanonicalField as usize`; validation guarantees one rule per field.
    rules: Vec<DialectRule>,
}

impl RuleTable {
    pub fn builtin() -> Result<Self, RuleError> {
        Self::from_yaml_str(BUILTIN_RULES_YAML)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RuleError> {
        let file: RuleFile = serde_yaml::from_str(text)?;
        if file.version != SUPPORTED_VERSION {
            return Err(RuleError::UnsupportedVersion(file.version));
        }

        let mut compiled: BTreeMap<CanonicalField, DialectRule> = BTreeMap::new();
        for (name, spec) in file.fields {
            let field = CanonicalField::from_name(&name).ok_or(RuleError::UnknownField(name))?;
            compiled.insert(field, compile_rule(field, spec)?);
        }

        let mut rules = Vec::with_capacity(CanonicalField::ALL.len());
        for field in CanonicalField::ALL {
            let rule = compiled.remove(&field).ok_or(RuleError::MissingRule(field))?;
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    pub fn rule(&self, field: CanonicalField) -> &DialectRule {
        &self.rules[field as usize]
    }

    pub fn resolve(&self, canonical_field: &str) -> Result<&DialectRule, RuleError> {
        CanonicalField::from_name(canonical_field)
            .map(|field| self.rule(field))
            .ok_or_else(|| RuleError::UnknownField(canonical_field.to_string()))
    }

    pub fn known_canonical_fields(&self) -> BTreeSet<&'static str> {
        self.rules.iter().map(|rule| rule.field.name()).collect()
    }

    pub fn rules(&self) -> impl Iterator<Item = &DialectRule> {
        self.rules.iter()
    }
}

fn compile_rule(field: CanonicalField, spec: RuleSpec) -> Result<DialectRule, RuleError> {
    if spec.candidates.is_empty() {
        return Err(RuleError::NoCandidates(field));
    }
    let kind = field.kind();
    if spec.scale.is_some() && kind != ValueKind::Float {
        return Err(RuleError::ScaleOnNonFloat(field));
    }

    let default = match (field.is_required(), spec.default) {
        (true, Some(_)) => return Err(RuleError::RequiredWithDefault(field)),
        (true, None) => None,
        (false, None) => return Err(RuleError::MissingDefault(field)),
        (false, Some(literal)) => {
            let value = compile_literal(field, "default", &literal)?;
            if value == FieldValue::Null && field.is_non_nullable() {
                return Err(RuleError::NullDefault(field));
            }
            Some(value)
        }
    };

    let shared_rewrite = spec
        .rewrite
        .map(|table| compile_rewrite(field, table).map(Arc::new))
        .transpose()?;

    let mut candidates = Vec::with_capacity(spec.candidates.len());
    for candidate in spec.candidates {
        let rewrite = match candidate.rewrite {
            Some(table) => Some(Arc::new(compile_rewrite(field, table)?)),
            None => shared_rewrite.clone(),
        };
        candidates.push(Candidate {
            column: candidate.column,
            rewrite,
        });
    }

    Ok(DialectRule {
        field,
        candidates,
        default,
        scale: spec.scale,
    })
}

fn compile_rewrite(
    field: CanonicalField,
    table: BTreeMap<String, serde_yaml::Value>,
) -> Result<RewriteTable, RuleError> {
    table
        .into_iter()
        .map(|(from, to)| Ok((from, compile_literal(field, "rewrite target", &to)?)))
        .collect()
}

fn compile_literal(
    field: CanonicalField,
    context: &'static str,
    literal: &serde_yaml::Value,
) -> Result<FieldValue, RuleError> {
    let raw = match literal {
        serde_yaml::Value::Null => return Ok(FieldValue::Null),
        serde_yaml::Value::Bool(v) => RawValue::Bool(*v),
        serde_yaml::Value::Number(n) => match n.as_i64() {
            Some(v) => RawValue::Int(v),
            None => RawValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_yaml::Value::String(s) if field.kind() == ValueKind::Text => {
            return Ok(FieldValue::Text(s.clone()));
        }
        serde_yaml::Value::String(s) => RawValue::Text(s.clone()),
        other => {
            return Err(RuleError::InvalidLiteral {
                field,
                context,
                value: format!("{other:?}"),
                kind: field.kind(),
            })
        }
    };
    coerce(&raw, field.kind(), None).map_err(|_| RuleError::InvalidLiteral {
        field,
        context,
        value: raw.to_string(),
        kind: field.kind(),
    })
}

/// Converts a non-empty raw value into the field's canonical kind.
fn coerce(raw: &RawValue, kind: ValueKind, scale: Option<f64>) -> Result<FieldValue, String> {
    match kind {
        ValueKind::Int => coerce_int(raw).map(FieldValue::Int),
        ValueKind::Float => coerce_float(raw).map(|v| FieldValue::Float(v * scale.unwrap_or(1.0))),
        ValueKind::Timestamp => coerce_timestamp(raw).map(FieldValue::Timestamp),
        ValueKind::Text => raw
            .render()
            .map(FieldValue::Text)
            .ok_or_else(|| "no text value".to_string()),
    }
}

fn integral(v: f64) -> Result<i64, String> {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Ok(v as i64)
    } else {
        Err(format!("{v} is not an integer"))
    }
}

fn coerce_int(raw: &RawValue) -> Result<i64, String> {
    match raw {
        RawValue::Int(v) => Ok(*v),
        RawValue::Float(v) => integral(*v),
        RawValue::Text(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .or_else(|_| s.parse::<f64>().map_err(|e| e.to_string()).and_then(integral))
                .map_err(|_| format!("`{s}` is not an integer"))
        }
        other => Err(format!("{other:?} is not an integer")),
    }
}

fn coerce_float(raw: &RawValue) -> Result<f64, String> {
    match raw {
        RawValue::Int(v) => Ok(*v as f64),
        RawValue::Float(v) if v.is_finite() => Ok(*v),
        RawValue::Text(s) => {
            let s = s.trim();
            match s.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(v),
                _ => Err(format!("`{s}` is not a number")),
            }
        }
        other => Err(format!("{other:?} is not a finite number")),
    }
}

fn coerce_timestamp(raw: &RawValue) -> Result<NaiveDateTime, String> {
    match raw {
        RawValue::Timestamp(ts) => Ok(*ts),
        RawValue::Text(s) => parse_timestamp(s.trim()),
        other => Err(format!("{other:?} is not a timestamp")),
    }
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, String> {
    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(ts);
        }
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.naive_utc())
        .map_err(|_| format!("`{s}` is not a recognised timestamp"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    MissingRequired,
    InvalidRequired { raw: String, message: String },
}

/// A row dropped from the output batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub row: usize,
    pub field: CanonicalField,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum WarningIssue {
    /// The value had no entry in the rewrite table and was dropped.
    UnmappedValue,
    Coercion { message: String },
}

/// A single field fell back to its default; the row itself was kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldWarning {
    pub row: usize,
    pub field: CanonicalField,
    pub column: String,
    pub raw: String,
    pub issue: WarningIssue,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<CanonicalRecord>,
    pub errors: Vec<RowError>,
    pub warnings: Vec<FieldWarning>,
}

struct PlannedCandidate<'a> {
    index: usize,
    candidate: &'a Candidate,
}

enum Resolution {
    Value(FieldValue),
    Rejected(RejectReason),
}

/// Normalizes one raw batch. Output keeps input row order.
pub fn normalize(batch: &RawBatch, rules: &RuleTable) -> NormalizedBatch {
    let plan: Vec<(&DialectRule, Vec<PlannedCandidate<'_>>)> = rules
        .rules()
        .map(|rule| {
            let present = rule
                .candidates
                .iter()
                .filter_map(|candidate| {
                    batch
                        .column_index(&candidate.column)
                        .map(|index| PlannedCandidate { index, candidate })
                })
                .collect();
            (rule, present)
        })
        .collect();

    let mut out = NormalizedBatch {
        records: Vec::with_capacity(batch.len()),
        ..Default::default()
    };

    'rows: for (row_idx, row) in batch.rows().iter().enumerate() {
        let mut values = Vec::with_capacity(plan.len());
        for (rule, present) in &plan {
            match resolve_field(row_idx, row, rule, present, &mut out.warnings) {
                Resolution::Value(value) => values.push(value),
                Resolution::Rejected(reason) => {
                    out.errors.push(RowError {
                        row: row_idx,
                        field: rule.field,
                        reason,
                    });
                    continue 'rows;
                }
            }
        }
        match assemble(values) {
            Ok(record) => out.records.push(record),
            Err(field) => out.errors.push(RowError {
                row: row_idx,
                field,
                reason: RejectReason::MissingRequired,
            }),
        }
    }

    out
}

fn resolve_field(
    row_idx: usize,
    row: &[RawValue],
    rule: &DialectRule,
    present: &[PlannedCandidate<'_>],
    warnings: &mut Vec<FieldWarning>,
) -> Resolution {
    let hit = present
        .iter()
        .map(|p| (p.candidate, &row[p.index]))
        .find(|(_, value)| !value.is_empty());

    let Some((candidate, raw)) = hit else {
        return match &rule.default {
            Some(default) => Resolution::Value(default.clone()),
            None => Resolution::Rejected(RejectReason::MissingRequired),
        };
    };

    let resolved = match &candidate.rewrite {
        Some(table) => raw
            .render()
            .and_then(|key| table.get(&key).cloned())
            .ok_or(WarningIssue::UnmappedValue),
        None => coerce(raw, rule.field.kind(), rule.scale)
            .map_err(|message| WarningIssue::Coercion { message }),
    };
    let issue = match resolved {
        Ok(value) => return Resolution::Value(value),
        Err(issue) => issue,
    };

    match &rule.default {
        Some(default) => {
            warnings.push(FieldWarning {
                row: row_idx,
                field: rule.field,
                column: candidate.column.clone(),
                raw: raw.to_string(),
                issue,
            });
            Resolution::Value(default.clone())
        }
        None => Resolution::Rejected(RejectReason::InvalidRequired {
            raw: raw.to_string(),
            message: match issue {
                WarningIssue::Coercion { message } => message,
                WarningIssue::UnmappedValue => "value has no rewrite mapping".to_string(),
            },
        }),
    }
}

/// Builds the record from values laid out in `CanonicalField::ALL` order.
fn assemble(values: Vec<FieldValue>) -> Result<CanonicalRecord, CanonicalField> {
    let get = |field: CanonicalField| &values[field as usize];
    let int = |field: CanonicalField| get(field).as_int();
    let float = |field: CanonicalField| get(field).as_float();
    let timestamp = |field: CanonicalField| get(field).as_timestamp().ok_or(field);
    let sentinel = |field: CanonicalField| int(field).or(field.sentinel()).ok_or(field);

    let tpep_pickup_datetime = timestamp(CanonicalField::PickupDatetime)?;
    let tpep_dropoff_datetime = timestamp(CanonicalField::DropoffDatetime)?;
    let passenger_count = sentinel(CanonicalField::PassengerCount)?;
    let rate_code = sentinel(CanonicalField::RateCode)?;
    let source_file = get(CanonicalField::SourceFile)
        .clone()
        .into_text()
        .filter(|s| !s.is_empty())
        .ok_or(CanonicalField::SourceFile)?;
    let store_and_forward = get(CanonicalField::StoreAndForward)
        .clone()
        .into_text()
        .unwrap_or_default();

    Ok(CanonicalRecord {
        vendor_id: int(CanonicalField::VendorId),
        tpep_pickup_datetime,
        tpep_dropoff_datetime,
        passenger_count,
        trip_distance: float(CanonicalField::TripDistance),
        rate_code,
        store_and_forward,
        pickup_location_id: int(CanonicalField::PickupLocationId),
        dropoff_location_id: int(CanonicalField::DropoffLocationId),
        pickup_longitude: float(CanonicalField::PickupLongitude),
        pickup_latitude: float(CanonicalField::PickupLatitude),
        dropoff_longitude: float(CanonicalField::DropoffLongitude),
        dropoff_latitude: float(CanonicalField::DropoffLatitude),
        payment_type: int(CanonicalField::PaymentType),
        fare_amount: float(CanonicalField::FareAmount),
        surcharge: float(CanonicalField::Surcharge),
        tip_amount: float(CanonicalField::TipAmount),
        tolls_amount: float(CanonicalField::TollsAmount),
        total_amount: float(CanonicalField::TotalAmount),
        source_file,
        record_id: Uuid::new_v4(),
    })
}

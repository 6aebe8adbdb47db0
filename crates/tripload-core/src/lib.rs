//! Canonical trip record model, raw batch representation, and ledger/outcome types.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tripload-core";

/// Sentinel stored in `passenger_count` when the source has no usable value.
pub const PASSENGER_COUNT_UNKNOWN: i64 = 100;

/// Sentinel stored in `rate_code` when the source has no usable value.
pub const RATE_CODE_UNKNOWN: i64 = 1000;

/// Value kind a canonical field is coerced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Int,
    Float,
    Timestamp,
    Text,
}

/// Every rule-driven column of the canonical schema.
///
/// `record_id` is not listed: it is generated during normalization and never
/// derived from raw columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    VendorId,
    #[serde(rename = "tpep_pickup_datetime")]
    PickupDatetime,
    #[serde(rename = "tpep_dropoff_datetime")]
    DropoffDatetime,
    PassengerCount,
    TripDistance,
    RateCode,
    StoreAndForward,
    PickupLocationId,
    DropoffLocationId,
    PickupLongitude,
    PickupLatitude,
    DropoffLongitude,
    DropoffLatitude,
    PaymentType,
    FareAmount,
    Surcharge,
    TipAmount,
    TollsAmount,
    TotalAmount,
    SourceFile,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 20] = [
        CanonicalField::VendorId,
        CanonicalField::PickupDatetime,
        CanonicalField::DropoffDatetime,
        CanonicalField::PassengerCount,
        CanonicalField::TripDistance,
        CanonicalField::RateCode,
        CanonicalField::StoreAndForward,
        CanonicalField::PickupLocationId,
        CanonicalField::DropoffLocationId,
        CanonicalField::PickupLongitude,
        CanonicalField::PickupLatitude,
        CanonicalField::DropoffLongitude,
        CanonicalField::DropoffLatitude,
        CanonicalField::PaymentType,
        CanonicalField::FareAmount,
        CanonicalField::Surcharge,
        CanonicalField::TipAmount,
        CanonicalField::TollsAmount,
        CanonicalField::TotalAmount,
        CanonicalField::SourceFile,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CanonicalField::VendorId => "vendor_id",
            CanonicalField::PickupDatetime => "tpep_pickup_datetime",
            CanonicalField::DropoffDatetime => "tpep_dropoff_datetime",
            CanonicalField::PassengerCount => "passenger_count",
            CanonicalField::TripDistance => "trip_distance",
            CanonicalField::RateCode => "rate_code",
            CanonicalField::StoreAndForward => "store_and_forward",
            CanonicalField::PickupLocationId => "pickup_location_id",
            CanonicalField::DropoffLocationId => "dropoff_location_id",
            CanonicalField::PickupLongitude => "pickup_longitude",
            CanonicalField::PickupLatitude => "pickup_latitude",
            CanonicalField::DropoffLongitude => "dropoff_longitude",
            CanonicalField::DropoffLatitude => "dropoff_latitude",
            CanonicalField::PaymentType => "payment_type",
            CanonicalField::FareAmount => "fare_amount",
            CanonicalField::Surcharge => "surcharge",
            CanonicalField::TipAmount => "tip_amount",
            CanonicalField::TollsAmount => "tolls_amount",
            CanonicalField::TotalAmount => "total_amount",
            CanonicalField::SourceFile => "source_file",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.name() == name)
    }

    pub fn kind(self) -> ValueKind {
        match self {
            CanonicalField::VendorId
            | CanonicalField::PassengerCount
            | CanonicalField::RateCode
            | CanonicalField::PickupLocationId
            | CanonicalField::DropoffLocationId
            | CanonicalField::PaymentType => ValueKind::Int,
            CanonicalField::PickupDatetime | CanonicalField::DropoffDatetime => ValueKind::Timestamp,
            CanonicalField::StoreAndForward | CanonicalField::SourceFile => ValueKind::Text,
            CanonicalField::TripDistance
            | CanonicalField::PickupLongitude
            | CanonicalField::PickupLatitude
            | CanonicalField::DropoffLongitude
            | CanonicalField::DropoffLatitude
            | CanonicalField::FareAmount
            | CanonicalField::Surcharge
            | CanonicalField::TipAmount
            | CanonicalField::TollsAmount
            | CanonicalField::TotalAmount => ValueKind::Float,
        }
    }

    /// Required fields reject the whole row when missing or unparseable.
    pub fn is_required(self) -> bool {
        matches!(
            self,
            CanonicalField::PickupDatetime | CanonicalField::DropoffDatetime | CanonicalField::SourceFile
        )
    }

    /// Fields that must never be null; unknown is the documented sentinel.
    pub fn sentinel(self) -> Option<i64> {
        match self {
            CanonicalField::PassengerCount => Some(PASSENGER_COUNT_UNKNOWN),
            CanonicalField::RateCode => Some(RATE_CODE_UNKNOWN),
            _ => None,
        }
    }

    /// Fields whose canonical type is not optional.
    pub fn is_non_nullable(self) -> bool {
        self.is_required() || self.sentinel().is_some() || self == CanonicalField::StoreAndForward
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One raw cell as read from a source file, before any normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl RawValue {
    /// Null, NaN and whitespace-only text all count as "no value".
    pub fn is_empty(&self) -> bool {
        match self {
            RawValue::Null => true,
            RawValue::Float(v) => v.is_nan(),
            RawValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Textual form used for rewrite-table lookups and text coercion.
    pub fn render(&self) -> Option<String> {
        match self {
            RawValue::Null => None,
            RawValue::Bool(v) => Some(v.to_string()),
            RawValue::Int(v) => Some(v.to_string()),
            RawValue::Float(v) if v.is_nan() => None,
            RawValue::Float(v) => Some(v.to_string()),
            RawValue::Text(s) => Some(s.trim().to_string()),
            RawValue::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Some(text) => f.write_str(&text),
            None => f.write_str("<null>"),
        }
    }
}

/// A row-major slice of one raw file. Column names are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<RawValue>>,
}

impl RawBatch {
    pub fn new(columns: Vec<String>) -> Self {
        let index = columns
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        Self {
            columns,
            index,
            rows: Vec::new(),
        }
    }

    /// Appends a row, padding with nulls or truncating to the column count.
    pub fn push_row(&mut self, mut row: Vec<RawValue>) {
        row.resize(self.columns.len(), RawValue::Null);
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn rows(&self) -> &[Vec<RawValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sets `name` to `value` on every row, adding the column if needed.
    pub fn set_constant_column(&mut self, name: &str, value: RawValue) {
        match self.column_index(name) {
            Some(idx) => {
                for row in &mut self.rows {
                    row[idx] = value.clone();
                }
            }
            None => {
                self.index.insert(name.to_string(), self.columns.len());
                self.columns.push(name.to_string());
                for row in &mut self.rows {
                    row.push(value.clone());
                }
            }
        }
    }
}

/// One normalized trip row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub vendor_id: Option<i64>,
    pub tpep_pickup_datetime: NaiveDateTime,
    pub tpep_dropoff_datetime: NaiveDateTime,
    pub passenger_count: i64,
    pub trip_distance: Option<f64>,
    pub rate_code: i64,
    pub store_and_forward: String,
    pub pickup_location_id: Option<i64>,
    pub dropoff_location_id: Option<i64>,
    pub pickup_longitude: Option<f64>,
    pub pickup_latitude: Option<f64>,
    pub dropoff_longitude: Option<f64>,
    pub dropoff_latitude: Option<f64>,
    pub payment_type: Option<i64>,
    pub fare_amount: Option<f64>,
    pub surcharge: Option<f64>,
    pub tip_amount: Option<f64>,
    pub tolls_amount: Option<f64>,
    pub total_amount: Option<f64>,
    pub source_file: String,
    pub record_id: Uuid,
}

impl CanonicalRecord {
    /// Store column order used by every sink.
    pub const COLUMNS: [&'static str; 21] = [
        "vendor_id",
        "tpep_pickup_datetime",
        "tpep_dropoff_datetime",
        "passenger_count",
        "trip_distance",
        "rate_code",
        "store_and_forward",
        "pickup_location_id",
        "dropoff_location_id",
        "pickup_longitude",
        "pickup_latitude",
        "dropoff_longitude",
        "dropoff_latitude",
        "payment_type",
        "fare_amount",
        "surcharge",
        "tip_amount",
        "tolls_amount",
        "total_amount",
        "source_file",
        "record_id",
    ];

    /// Same record with `record_id` zeroed; handy for comparing normalizations.
    pub fn without_record_id(&self) -> Self {
        Self {
            record_id: Uuid::nil(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    InProgress,
    Done,
}

impl LedgerState {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerState::InProgress => "in_progress",
            LedgerState::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(LedgerState::InProgress),
            "done" => Some(LedgerState::Done),
            _ => None,
        }
    }
}

/// Durable per-file completion record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub file_id: String,
    pub state: LedgerState,
    pub claimed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl LedgerEntry {
    pub fn claimed(file_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            file_id: file_id.into(),
            state: LedgerState::InProgress,
            claimed_at: now,
            updated_at: now,
            attempts: 1,
            last_error: None,
        }
    }
}

/// Result of an atomic claim attempt on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    Acquired,
    /// A stale in-progress claim was taken over under the reclaim policy.
    Reclaimed,
    AlreadyDone,
    /// Another runner holds an in-progress claim.
    ClaimedElsewhere,
}

impl ClaimOutcome {
    pub fn is_acquired(self) -> bool {
        matches!(self, ClaimOutcome::Acquired | ClaimOutcome::Reclaimed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyDone,
    ClaimedElsewhere,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientIo,
    Ledger,
    Read,
    Cancelled,
    /// The load task panicked; its ledger entry is left as it was.
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Skipped {
        reason: SkipReason,
    },
    Succeeded,
    Failed {
        kind: FailureKind,
        message: String,
        /// Some batches were inserted before the failure; re-running may duplicate them.
        partial: bool,
    },
}

impl LoadOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            LoadOutcome::Skipped { .. } => "skipped",
            LoadOutcome::Succeeded => "succeeded",
            LoadOutcome::Failed { partial: true, .. } => "failed-partial",
            LoadOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStats {
    pub bytes_fetched: u64,
    pub batches_inserted: usize,
    pub rows_read: usize,
    pub rows_inserted: usize,
    pub rows_rejected: usize,
    pub field_warnings: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub file_id: String,
    pub outcome: LoadOutcome,
    pub stats: LoadStats,
}

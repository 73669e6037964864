//! Shared data model for the CDEX extraction pipeline.
//!
//! These types cross crate boundaries, from the gateway through the
//! orchestrator to the file sink, and carry no behaviour beyond
//! construction and serialisation.

use chrono::NaiveDateTime;

/// Internal numeric patient key (`person.pid`).
pub type PatientKey = i64;

/// Key of one document series; the gateway reports the most recent series
/// per patient.
pub type DocumentSeriesKey = i64;

/// Numeric key of the provider authorising an extraction run.
pub type ProviderKey = i64;

/// Backend-generated identifier of a tracking order.
pub type OrderKey = i64;

/// One patient row as resolved from the platform database.
///
/// Produced by the gateway, consumed read-only by the orchestrator and the
/// file sink. Lives for one query result.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PatientRecord {
    /// Internal patient key.
    pub pid: PatientKey,
    /// External (chart-facing) patient identifier.
    pub patient_id: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDateTime,
    /// Most recent document-series key on file for this patient.
    pub document_series: DocumentSeriesKey,
}

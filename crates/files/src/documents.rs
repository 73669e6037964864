//! Output-directory storage for retrieved documents.

use crate::StoreError;
use cdex_types::PatientRecord;
use std::fs;
use std::path::{Path, PathBuf};

/// Fixed-width timestamp rendering of the date of birth inside file names.
const DOB_FORMAT: &str = "%Y%m%d%H%M%S";

/// Sink writing one `.xml` file per successfully retrieved document.
///
/// # Design
///
/// - Directory-scoped: each instance is bound to one output directory,
///   validated eagerly at construction
/// - Whole-buffer writes: a document is written only once its bytes are
///   complete
/// - Deterministic names: the same patient record always produces the same
///   file name
#[derive(Debug)]
pub struct DocumentStore {
    output_dir: PathBuf,
}

impl DocumentStore {
    /// Creates a store rooted at `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidOutputDirectory` if the directory does
    /// not exist, is not a directory, or cannot be canonicalised.
    pub fn new(output_dir: &Path) -> Result<Self, StoreError> {
        if !output_dir.exists() {
            return Err(StoreError::InvalidOutputDirectory(format!(
                "directory does not exist: {}",
                output_dir.display()
            )));
        }

        if !output_dir.is_dir() {
            return Err(StoreError::InvalidOutputDirectory(format!(
                "path is not a directory: {}",
                output_dir.display()
            )));
        }

        let output_dir = output_dir.canonicalize().map_err(|e| {
            StoreError::InvalidOutputDirectory(format!(
                "cannot canonicalise path {}: {}",
                output_dir.display(),
                e
            ))
        })?;

        Ok(Self { output_dir })
    }

    /// Writes `content` as this patient's document file and returns the
    /// path of the written file.
    pub fn store(&self, patient: &PatientRecord, content: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.output_dir.join(document_file_name(patient));
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Returns the canonicalised output directory.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// File name for a patient's retrieved document.
///
/// The name joins the external patient identifier (prefixed `CCDA`), last
/// name, first name and the date of birth as a fixed-width numeric
/// timestamp, delimited by underscores, with an `.xml` suffix.
pub fn document_file_name(patient: &PatientRecord) -> String {
    format!(
        "CCDA{}_{}_{}_{}.xml",
        sanitise(&patient.patient_id),
        sanitise(&patient.last_name),
        sanitise(&patient.first_name),
        patient.date_of_birth.format(DOB_FORMAT)
    )
}

/// Strips path separators and other filesystem-hostile characters from one
/// name component.
fn sanitise(component: &str) -> String {
    component
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0' | ':'))
        .collect()
}

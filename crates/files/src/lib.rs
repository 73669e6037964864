//! CDEX file sink.
//!
//! Retrieved clinical documents are persisted as one file per patient under
//! a caller-supplied output directory. The sink is deliberately small:
//!
//! - the output directory is validated once, at construction
//! - documents are written as complete byte buffers, so no partially
//!   retrieved document ever lands in the directory
//! - file names are derived from the patient record alone and are
//!   reproducible across runs
//!
//! ## Example Usage
//!
//! ```no_run
//! use cdex_files::DocumentStore;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sink = DocumentStore::new(Path::new("out"))?;
//! # Ok(())
//! # }
//! ```

mod documents;

pub use documents::{document_file_name, DocumentStore};

/// Errors that can occur while persisting retrieved documents
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Output directory does not exist or is not a directory
    #[error("invalid output directory: {0}")]
    InvalidOutputDirectory(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

//! # CDEX Core
//!
//! Core pipeline for extracting CCDA documents from a clinical records
//! platform:
//!
//! - [`Gateway`]: dual-dialect access to the platform database (provider
//!   lookup, patient batch resolution, tracking-order create/delete)
//! - [`DocumentClient`]: SOAP client for the platform's
//!   document-generation service
//! - [`Extractor`]: per-patient orchestration with a compensating order
//!   delete when retrieval fails
//!
//! **No process concerns**: argument parsing, credential prompting and
//! logging initialisation belong to the CLI crate.

pub mod client;
pub mod config;
pub mod error;
pub mod extract;
pub mod gateway;

pub use client::DocumentClient;
pub use config::{DatabaseSettings, Dialect, ServiceSettings};
pub use error::{ExtractError, ExtractResult};
pub use extract::{DocumentSource, Extractor, PatientOutcome, RecordStore};
pub use gateway::Gateway;

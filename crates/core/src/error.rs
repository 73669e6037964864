//! Run-level error type for the extraction pipeline.

use cdex_types::OrderKey;

/// Errors surfaced by the gateway, the document client and the orchestrator.
///
/// Per-patient failures are caught at the patient boundary by the
/// orchestrator and reported with the failing patient's key.
/// `CompensationFailed` is the one data-integrity variant: it means a
/// tracking order survived a failed retrieval and still needs manual
/// reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Transport-level database failure, either backend.
    #[error("database error: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("no provider found for login name {0}")]
    ProviderNotFound(String),

    #[error("order id could not be generated")]
    IdGeneration,

    /// Transport-level failure talking to the document service.
    #[error("document service request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The document service replied, but not in the expected shape.
    #[error("malformed document service response: {0}")]
    Protocol(String),

    /// The embedded document payload was not valid base64.
    #[error("invalid document payload encoding: {0}")]
    PayloadDecode(#[from] base64::DecodeError),

    /// A retrieval failed and the compensating order delete failed too.
    #[error(
        "order {order_id} could not be deleted after a failed retrieval: \
         retrieval={fetch_error}; delete={delete_error}"
    )]
    CompensationFailed {
        order_id: OrderKey,
        #[source]
        fetch_error: Box<ExtractError>,
        delete_error: Box<ExtractError>,
    },

    /// Failure persisting a successfully retrieved document.
    #[error("failed to store document: {0}")]
    Store(#[from] cdex_files::StoreError),
}

pub type ExtractResult<T> = std::result::Result<T, ExtractError>;

//! The extraction orchestrator.
//!
//! Drives the per-patient workflow: resolve the provider and the patient
//! set once, then for each patient open a tracking order, request the
//! document, and either deliver the bytes to the file sink or compensate by
//! deleting the order. One patient's failure never aborts the batch.

use crate::error::{ExtractError, ExtractResult};
use async_trait::async_trait;
use cdex_files::DocumentStore;
use cdex_types::{DocumentSeriesKey, OrderKey, PatientKey, PatientRecord, ProviderKey};
use std::path::PathBuf;

/// Data-access seam the orchestrator drives.
///
/// Implemented by [`Gateway`](crate::Gateway); a trait so that the
/// compensation logic is testable without a live database.
#[async_trait]
pub trait RecordStore {
    async fn resolve_provider(&self, login_name: &str) -> ExtractResult<ProviderKey>;

    async fn resolve_patients(
        &self,
        patient_keys: &[PatientKey],
    ) -> ExtractResult<Vec<PatientRecord>>;

    async fn create_order(
        &self,
        pid: PatientKey,
        sdid: DocumentSeriesKey,
        pvid: ProviderKey,
    ) -> ExtractResult<OrderKey>;

    async fn delete_order(&self, order_id: OrderKey) -> ExtractResult<()>;
}

/// Document-retrieval seam, implemented by
/// [`DocumentClient`](crate::DocumentClient).
#[async_trait]
pub trait DocumentSource {
    async fn fetch_document(
        &self,
        order_id: OrderKey,
        pid: PatientKey,
        sdid: DocumentSeriesKey,
        pvid: ProviderKey,
    ) -> ExtractResult<Vec<u8>>;
}

/// Outcome of one patient's extraction attempt.
#[derive(Debug)]
pub struct PatientOutcome {
    pub pid: PatientKey,
    /// Path of the written document, or the error that ended the attempt.
    pub result: Result<PathBuf, ExtractError>,
}

impl PatientOutcome {
    /// True when the failure left a tracking order behind: a
    /// data-integrity problem rather than a missed document.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self.result,
            Err(ExtractError::CompensationFailed { .. })
        )
    }
}

/// Per-run extraction driver.
pub struct Extractor<S, D> {
    store: S,
    documents: D,
    sink: DocumentStore,
}

impl<S: RecordStore, D: DocumentSource> Extractor<S, D> {
    pub fn new(store: S, documents: D, sink: DocumentStore) -> Self {
        Self {
            store,
            documents,
            sink,
        }
    }

    /// The underlying record store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one extraction batch.
    ///
    /// Provider and patient resolution failures are fatal; without them
    /// there is no basis to proceed. Everything after that is caught at the
    /// patient boundary and reported in the returned outcomes; patients are
    /// processed strictly one after another.
    pub async fn run(
        &self,
        login_name: &str,
        patient_keys: &[PatientKey],
    ) -> ExtractResult<Vec<PatientOutcome>> {
        let provider = self.store.resolve_provider(login_name).await?;
        let patients = self.store.resolve_patients(patient_keys).await?;
        tracing::info!("resolved {} patient(s) for provider {}", patients.len(), provider);

        let mut outcomes = Vec::with_capacity(patients.len());
        for patient in &patients {
            let result = self.extract_patient(provider, patient).await;

            // A failed compensation is the one failure that damages the
            // store; it is surfaced at error severity, distinct from an
            // ordinary missed document.
            if let Err(error @ ExtractError::CompensationFailed { .. }) = &result {
                tracing::error!("patient {}: {}", patient.pid, error);
            }

            outcomes.push(PatientOutcome {
                pid: patient.pid,
                result,
            });
        }

        Ok(outcomes)
    }

    /// One patient: order, fetch, deliver or compensate.
    ///
    /// The store must end in exactly one of two states: order present with
    /// the document retrieved, or no order at all. A failed fetch therefore
    /// deletes the fresh order; if that delete fails too, both errors are
    /// surfaced together as `CompensationFailed`.
    async fn extract_patient(
        &self,
        provider: ProviderKey,
        patient: &PatientRecord,
    ) -> Result<PathBuf, ExtractError> {
        let order_id = self
            .store
            .create_order(patient.pid, patient.document_series, provider)
            .await?;

        let content = match self
            .documents
            .fetch_document(order_id, patient.pid, patient.document_series, provider)
            .await
        {
            Ok(content) => content,
            Err(fetch_error) => {
                return Err(match self.store.delete_order(order_id).await {
                    Ok(()) => fetch_error,
                    Err(delete_error) => ExtractError::CompensationFailed {
                        order_id,
                        fetch_error: Box::new(fetch_error),
                        delete_error: Box::new(delete_error),
                    },
                });
            }
        };

        Ok(self.sink.store(patient, &content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn patient(pid: PatientKey, sdid: DocumentSeriesKey) -> PatientRecord {
        PatientRecord {
            pid,
            patient_id: format!("MR{pid}"),
            first_name: "Alice".to_string(),
            last_name: "Smith".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1980, 1, 2)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            document_series: sdid,
        }
    }

    /// In-memory record store tracking live orders.
    struct MemoryStore {
        provider: (String, ProviderKey),
        patients: Vec<PatientRecord>,
        orders: Mutex<HashMap<OrderKey, (PatientKey, DocumentSeriesKey, ProviderKey)>>,
        next_order: Mutex<OrderKey>,
        fail_delete: bool,
    }

    impl MemoryStore {
        fn new(patients: Vec<PatientRecord>) -> Self {
            Self {
                provider: ("alice".to_string(), 7),
                patients,
                orders: Mutex::new(HashMap::new()),
                next_order: Mutex::new(900),
                fail_delete: false,
            }
        }

        fn live_orders(&self) -> Vec<OrderKey> {
            self.orders.lock().unwrap().keys().copied().collect()
        }
    }

    #[async_trait]
    impl RecordStore for MemoryStore {
        async fn resolve_provider(&self, login_name: &str) -> ExtractResult<ProviderKey> {
            if login_name == self.provider.0 {
                Ok(self.provider.1)
            } else {
                Err(ExtractError::ProviderNotFound(login_name.to_string()))
            }
        }

        async fn resolve_patients(
            &self,
            patient_keys: &[PatientKey],
        ) -> ExtractResult<Vec<PatientRecord>> {
            if patient_keys.is_empty() {
                return Ok(self.patients.clone());
            }
            Ok(self
                .patients
                .iter()
                .filter(|p| patient_keys.contains(&p.pid))
                .cloned()
                .collect())
        }

        async fn create_order(
            &self,
            pid: PatientKey,
            sdid: DocumentSeriesKey,
            pvid: ProviderKey,
        ) -> ExtractResult<OrderKey> {
            let mut next = self.next_order.lock().unwrap();
            let order_id = *next;
            *next += 1;
            self.orders
                .lock()
                .unwrap()
                .insert(order_id, (pid, sdid, pvid));
            Ok(order_id)
        }

        async fn delete_order(&self, order_id: OrderKey) -> ExtractResult<()> {
            if self.fail_delete {
                return Err(ExtractError::IdGeneration);
            }
            // Absent rows are fine; delete is idempotent.
            self.orders.lock().unwrap().remove(&order_id);
            Ok(())
        }
    }

    /// Document source failing for a chosen set of patients.
    struct ScriptedSource {
        failing_pids: Vec<PatientKey>,
    }

    #[async_trait]
    impl DocumentSource for ScriptedSource {
        async fn fetch_document(
            &self,
            _order_id: OrderKey,
            pid: PatientKey,
            _sdid: DocumentSeriesKey,
            _pvid: ProviderKey,
        ) -> ExtractResult<Vec<u8>> {
            if self.failing_pids.contains(&pid) {
                Err(ExtractError::Protocol("scripted failure".to_string()))
            } else {
                Ok(b"</a>".to_vec())
            }
        }
    }

    fn extractor(
        store: MemoryStore,
        failing_pids: Vec<PatientKey>,
        dir: &TempDir,
    ) -> Extractor<MemoryStore, ScriptedSource> {
        Extractor::new(
            store,
            ScriptedSource { failing_pids },
            DocumentStore::new(dir.path()).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_order_survives_successful_fetch() {
        let dir = TempDir::new().unwrap();
        let extractor = extractor(MemoryStore::new(vec![patient(100, 5)]), vec![], &dir);

        let outcomes = extractor.run("alice", &[]).await.unwrap();

        assert_eq!(outcomes.len(), 1);
        let path = outcomes[0].result.as_ref().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"</a>");

        let orders = extractor.store.orders.lock().unwrap();
        assert_eq!(orders.get(&900), Some(&(100, 5, 7)));
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_order() {
        let dir = TempDir::new().unwrap();
        let extractor = extractor(MemoryStore::new(vec![patient(100, 5)]), vec![100], &dir);

        let outcomes = extractor.run("alice", &[]).await.unwrap();

        assert!(matches!(
            outcomes[0].result,
            Err(ExtractError::Protocol(_))
        ));
        assert!(!outcomes[0].is_integrity_failure());
        assert!(extractor.store.live_orders().is_empty());
        // No partial document lands in the output directory.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_compensation_surfaces_both_errors() {
        let dir = TempDir::new().unwrap();
        let mut store = MemoryStore::new(vec![patient(100, 5)]);
        store.fail_delete = true;
        let extractor = extractor(store, vec![100], &dir);

        let outcomes = extractor.run("alice", &[]).await.unwrap();

        assert!(outcomes[0].is_integrity_failure());
        match &outcomes[0].result {
            Err(ExtractError::CompensationFailed {
                order_id,
                fetch_error,
                delete_error,
            }) => {
                assert_eq!(*order_id, 900);
                assert!(matches!(**fetch_error, ExtractError::Protocol(_)));
                assert!(matches!(**delete_error, ExtractError::IdGeneration));
            }
            other => panic!("expected CompensationFailed, got {other:?}"),
        }
        // The dangling order is still there; that is exactly the problem
        // being reported.
        assert_eq!(extractor.store.live_orders(), vec![900]);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_the_batch() {
        let dir = TempDir::new().unwrap();
        let extractor = extractor(
            MemoryStore::new(vec![patient(100, 5), patient(101, 6)]),
            vec![100],
            &dir,
        );

        let outcomes = extractor.run("alice", &[]).await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].result.is_err());
        assert!(outcomes[1].result.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_provider_aborts_before_any_patient() {
        let dir = TempDir::new().unwrap();
        let extractor = extractor(MemoryStore::new(vec![patient(100, 5)]), vec![], &dir);

        let result = extractor.run("ghost", &[]).await;

        assert!(matches!(result, Err(ExtractError::ProviderNotFound(_))));
        assert!(extractor.store.live_orders().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_keys_filter_the_batch() {
        let dir = TempDir::new().unwrap();
        let extractor = extractor(
            MemoryStore::new(vec![patient(100, 5), patient(101, 6)]),
            vec![],
            &dir,
        );

        let outcomes = extractor.run("alice", &[101]).await.unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].pid, 101);
    }
}

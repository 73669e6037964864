//! Dual-dialect data access for the platform database.
//!
//! All four operations present one dialect-independent contract; the
//! dialect is chosen once at connect time and only shows up in the SQL text
//! each operation builds. Dialect variance is confined to the transient
//! pid-list DDL, the order-id generation statement, bind-parameter markers,
//! date rendering and connection URL construction.

use crate::config::{DatabaseSettings, Dialect};
use crate::error::{ExtractError, ExtractResult};
use cdex_types::{DocumentSeriesKey, OrderKey, PatientKey, PatientRecord, ProviderKey};
use chrono::NaiveDateTime;
use sqlx::any::AnyPoolOptions;
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool, Row};

/// Transient pid-list table. One name for create, insert, query and drop.
const PID_LIST_TABLE: &str = "cdex_pid_list";

/// Text rendering used for date columns in transit; the `Any` driver only
/// carries scalar types, so dates travel as ISO text.
const SQL_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

impl Dialect {
    /// Bind-parameter marker for the n-th parameter.
    fn marker(self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// DDL for the session-scoped transient pid list.
    fn pid_list_ddl(self) -> String {
        match self {
            Dialect::Postgres => {
                format!("create temporary table {PID_LIST_TABLE} (pid bigint)")
            }
            Dialect::Mysql => {
                format!("create temporary table {PID_LIST_TABLE} (pid bigint) engine=memory")
            }
        }
    }

    /// Drop statement for the transient pid list.
    fn pid_list_drop(self) -> String {
        match self {
            Dialect::Postgres => format!("drop table if exists {PID_LIST_TABLE}"),
            Dialect::Mysql => format!("drop temporary table if exists {PID_LIST_TABLE}"),
        }
    }

    /// Statement producing the next tracking-order id.
    fn order_id_sql(self) -> &'static str {
        match self {
            // Sequence owned by the platform schema.
            Dialect::Postgres => "select nextval('emr_order_id') as orderid",
            // Stored function shipped with the platform schema.
            Dialect::Mysql => "select emr_next_order_id() as orderid",
        }
    }

    /// Renders a datetime column to ISO text.
    fn datetime_text_expr(self, column: &str) -> String {
        match self {
            Dialect::Postgres => {
                format!("to_char({column}, 'YYYY-MM-DD\"T\"HH24:MI:SS')")
            }
            Dialect::Mysql => format!("date_format({column}, '%Y-%m-%dT%H:%i:%S')"),
        }
    }
}

/// Gateway to the platform database.
///
/// Holds one pool capped at a single connection: the run works in one
/// database session, which is also what scopes the transient pid list.
pub struct Gateway {
    pool: AnyPool,
    dialect: Dialect,
}

impl Gateway {
    /// Connects to the platform database.
    ///
    /// Driver registration is explicit here rather than an import side
    /// effect, per the sqlx `Any` driver contract.
    pub async fn connect(settings: &DatabaseSettings) -> ExtractResult<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect(&settings.connection_url())
            .await?;

        Ok(Self {
            pool,
            dialect: settings.dialect,
        })
    }

    /// Resolves the provider key for a login name.
    ///
    /// # Errors
    ///
    /// `ProviderNotFound` if no user row matches the login name;
    /// `Connection` on transport failure.
    pub async fn resolve_provider(&self, login_name: &str) -> ExtractResult<ProviderKey> {
        let sql = format!(
            "select pvid from usr where loginname = {}",
            self.dialect.marker(1)
        );

        match sqlx::query(&sql)
            .bind(login_name)
            .fetch_optional(&self.pool)
            .await?
        {
            Some(row) => Ok(row.try_get("pvid")?),
            None => Err(ExtractError::ProviderNotFound(login_name.to_string())),
        }
    }

    /// Resolves the patient set for the run.
    ///
    /// With explicit keys the lookup goes through the transient pid list:
    /// create, insert one row per key, join, then drop. The drop is
    /// attempted whether or not the join succeeded, and a drop failure is
    /// logged, never allowed to mask the join's own result. With no keys
    /// the full patient/document relation is selected and no list is
    /// created.
    pub async fn resolve_patients(
        &self,
        patient_keys: &[PatientKey],
    ) -> ExtractResult<Vec<PatientRecord>> {
        // All list lifecycle steps must share one session.
        let mut conn = self.pool.acquire().await?;

        let rows = if patient_keys.is_empty() {
            let sql = self.patient_query("document");
            sqlx::query(&sql).fetch_all(&mut *conn).await?
        } else {
            self.create_pid_list(&mut conn, patient_keys).await?;

            let sql = self.patient_query(PID_LIST_TABLE);
            let result = sqlx::query(&sql).fetch_all(&mut *conn).await;

            if let Err(drop_error) = sqlx::query(&self.dialect.pid_list_drop())
                .execute(&mut *conn)
                .await
            {
                tracing::warn!("failed to drop {}: {}", PID_LIST_TABLE, drop_error);
            }

            result?
        };

        let mut patients = Vec::with_capacity(rows.len());
        for row in rows {
            let pid: PatientKey = row.try_get("pid")?;

            let document_series: Option<DocumentSeriesKey> = row.try_get("sdid")?;
            let Some(document_series) = document_series else {
                tracing::warn!("patient {} has no documents on file, skipping", pid);
                continue;
            };

            let date_of_birth: String = row.try_get("dateofbirth")?;

            patients.push(PatientRecord {
                pid,
                patient_id: row.try_get("patientid")?,
                first_name: row.try_get("firstname")?,
                last_name: row.try_get("lastname")?,
                date_of_birth: parse_sql_datetime(&date_of_birth)?,
                document_series,
            });
        }

        Ok(patients)
    }

    /// Creates one tracking order and returns its backend-generated id.
    ///
    /// Id generation runs first and is dialect-specific; the insert then
    /// stamps every audit column with the provider key uniformly.
    ///
    /// # Errors
    ///
    /// `IdGeneration` if the backend produced no id row; `Connection`
    /// otherwise.
    pub async fn create_order(
        &self,
        pid: PatientKey,
        sdid: DocumentSeriesKey,
        pvid: ProviderKey,
    ) -> ExtractResult<OrderKey> {
        let order_id = self.next_order_id().await?;

        let sql = format!(
            "insert into orders \
             (orderid, pid, sdid, authbyusrid, locofservice, istoc, usrid, pubuser) \
             values ({}, {}, {}, {}, {}, 'Y', {}, {})",
            self.dialect.marker(1),
            self.dialect.marker(2),
            self.dialect.marker(3),
            self.dialect.marker(4),
            self.dialect.marker(5),
            self.dialect.marker(6),
            self.dialect.marker(7),
        );

        sqlx::query(&sql)
            .bind(order_id)
            .bind(pid)
            .bind(sdid)
            .bind(pvid)
            .bind(pvid)
            .bind(pvid)
            .bind(pvid)
            .execute(&self.pool)
            .await?;

        Ok(order_id)
    }

    /// Deletes one tracking order by id.
    ///
    /// Deleting an order that is already gone is success: the contract is
    /// "no order exists afterwards", which a delete affecting zero rows
    /// satisfies.
    pub async fn delete_order(&self, order_id: OrderKey) -> ExtractResult<()> {
        let sql = format!(
            "delete from orders where orderid = {}",
            self.dialect.marker(1)
        );

        sqlx::query(&sql).bind(order_id).execute(&self.pool).await?;

        Ok(())
    }

    async fn next_order_id(&self) -> ExtractResult<OrderKey> {
        match sqlx::query(self.dialect.order_id_sql())
            .fetch_optional(&self.pool)
            .await?
        {
            Some(row) => Ok(row.try_get("orderid")?),
            None => Err(ExtractError::IdGeneration),
        }
    }

    async fn create_pid_list(
        &self,
        conn: &mut PoolConnection<Any>,
        patient_keys: &[PatientKey],
    ) -> ExtractResult<()> {
        sqlx::query(&self.dialect.pid_list_ddl())
            .execute(&mut **conn)
            .await?;

        let insert = format!(
            "insert into {PID_LIST_TABLE} (pid) values ({})",
            self.dialect.marker(1)
        );
        for pid in patient_keys {
            sqlx::query(&insert).bind(*pid).execute(&mut **conn).await?;
        }

        Ok(())
    }

    fn patient_query(&self, pid_source: &str) -> String {
        format!(
            "select p.pid as pid, p.patientid as patientid, \
             p.firstname as firstname, p.lastname as lastname, \
             {dob} as dateofbirth, \
             (select max(d.sdid) from document d where d.pid = p.pid) as sdid \
             from person p \
             where p.pid in (select pid from {pid_source}) \
             order by p.pid",
            dob = self.dialect.datetime_text_expr("p.dateofbirth"),
        )
    }
}

#[async_trait::async_trait]
impl crate::extract::RecordStore for Gateway {
    async fn resolve_provider(&self, login_name: &str) -> ExtractResult<ProviderKey> {
        Gateway::resolve_provider(self, login_name).await
    }

    async fn resolve_patients(
        &self,
        patient_keys: &[PatientKey],
    ) -> ExtractResult<Vec<PatientRecord>> {
        Gateway::resolve_patients(self, patient_keys).await
    }

    async fn create_order(
        &self,
        pid: PatientKey,
        sdid: DocumentSeriesKey,
        pvid: ProviderKey,
    ) -> ExtractResult<OrderKey> {
        Gateway::create_order(self, pid, sdid, pvid).await
    }

    async fn delete_order(&self, order_id: OrderKey) -> ExtractResult<()> {
        Gateway::delete_order(self, order_id).await
    }
}

fn parse_sql_datetime(value: &str) -> ExtractResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, SQL_DATETIME_FORMAT)
        .map_err(|e| ExtractError::Connection(sqlx::Error::Decode(Box::new(e))))
}

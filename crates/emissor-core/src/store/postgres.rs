//! Postgres adapter for the persistence ports.
//!
//! Status transitions are a single conditional `UPDATE ... WHERE status =
//! $from`; the affected-row count decides who won a race. The sequence
//! service is an `UPDATE ... RETURNING` over a counter row, linearizable
//! per `(company, series)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::{CompanyStore, RequestStore, RequestUpdate, SequenceService, StoreError};
use crate::model::{
    Address, CertificateRef, Company, ContingencyKind, ContributorSecret, Event, Request,
    RequestStatus, Uf,
};

/// Embedded schema, applied idempotently.
const SCHEMA: &str = include_str!("schema.sql");

/// Postgres-backed store implementing all three persistence ports.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects to the database.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] when the pool cannot be established.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(unavailable)?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the embedded schema.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] when a statement fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
        }
        Ok(())
    }

    /// The underlying pool, for health checks.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn corrupt(detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt(detail.into())
}

fn row_to_request(row: &PgRow) -> Result<Request, StoreError> {
    let status_raw: String = row.try_get("status").map_err(unavailable)?;
    let status = RequestStatus::parse(&status_raw)
        .ok_or_else(|| corrupt(format!("unknown status `{status_raw}`")))?;

    let payload_value: serde_json::Value = row.try_get("payload").map_err(unavailable)?;
    let payload =
        serde_json::from_value(payload_value).map_err(|err| corrupt(err.to_string()))?;

    let contingency_raw: Option<String> =
        row.try_get("contingency_kind").map_err(unavailable)?;
    let contingency_kind = match contingency_raw.as_deref() {
        None => None,
        Some(raw) => Some(
            ContingencyKind::parse(raw)
                .ok_or_else(|| corrupt(format!("unknown contingency kind `{raw}`")))?,
        ),
    };

    let retry_count: i32 = row.try_get("retry_count").map_err(unavailable)?;
    let series: Option<i32> = row.try_get("series").map_err(unavailable)?;

    Ok(Request {
        id: row.try_get("id").map_err(unavailable)?,
        company_id: row.try_get("company_id").map_err(unavailable)?,
        idempotency_key: row.try_get("idempotency_key").map_err(unavailable)?,
        payload_hash: row.try_get("payload_hash").map_err(unavailable)?,
        status,
        payload,
        access_key: row.try_get("access_key").map_err(unavailable)?,
        protocol: row.try_get("protocol").map_err(unavailable)?,
        document_number: row.try_get("document_number").map_err(unavailable)?,
        series: series.map(|value| value as u16),
        rejection_code: row.try_get("rejection_code").map_err(unavailable)?,
        rejection_reason: row.try_get("rejection_reason").map_err(unavailable)?,
        retry_count: retry_count.max(0) as u32,
        next_retry_at: row.try_get("next_retry_at").map_err(unavailable)?,
        processed_at: row.try_get("processed_at").map_err(unavailable)?,
        authorized_at: row.try_get("authorized_at").map_err(unavailable)?,
        in_contingency: row.try_get("in_contingency").map_err(unavailable)?,
        contingency_kind,
        xml_url: row.try_get("xml_url").map_err(unavailable)?,
        pdf_url: row.try_get("pdf_url").map_err(unavailable)?,
        qr_url: row.try_get("qr_url").map_err(unavailable)?,
        created_at: row.try_get("created_at").map_err(unavailable)?,
        updated_at: row.try_get("updated_at").map_err(unavailable)?,
    })
}

const REQUEST_COLUMNS: &str = "id, company_id, idempotency_key, payload_hash, status, payload, \
     access_key, protocol, document_number, series, rejection_code, rejection_reason, \
     retry_count, next_retry_at, processed_at, authorized_at, in_contingency, \
     contingency_kind, xml_url, pdf_url, qr_url, created_at, updated_at";

#[async_trait]
impl RequestStore for PgStore {
    async fn insert(&self, request: &Request) -> Result<(), StoreError> {
        let payload = serde_json::to_value(&request.payload)
            .map_err(|err| corrupt(err.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO requests \
             (id, company_id, idempotency_key, payload_hash, status, payload, retry_count, \
              in_contingency, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(request.id)
        .bind(request.company_id)
        .bind(&request.idempotency_key)
        .bind(&request.payload_hash)
        .bind(request.status.as_str())
        .bind(payload)
        .bind(request.retry_count as i32)
        .bind(request.in_contingency)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateIdempotencyKey)
            },
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Request>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        row.as_ref().map(row_to_request).transpose()
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Request>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        row.as_ref().map(row_to_request).transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        from: RequestStatus,
        to: RequestStatus,
        update: RequestUpdate,
    ) -> Result<bool, StoreError> {
        let clear_next_retry = matches!(update.next_retry_at, Some(None));
        let next_retry_at = update.next_retry_at.flatten();

        let result = sqlx::query(
            "UPDATE requests SET \
                status = $3, \
                updated_at = NOW(), \
                access_key = COALESCE($4, access_key), \
                protocol = COALESCE($5, protocol), \
                document_number = COALESCE($6, document_number), \
                series = COALESCE($7, series), \
                rejection_code = COALESCE($8, rejection_code), \
                rejection_reason = COALESCE($9, rejection_reason), \
                retry_count = COALESCE($10, retry_count), \
                next_retry_at = CASE WHEN $11 THEN NULL \
                                     ELSE COALESCE($12, next_retry_at) END, \
                processed_at = COALESCE($13, processed_at), \
                authorized_at = COALESCE($14, authorized_at), \
                in_contingency = COALESCE($15, in_contingency), \
                contingency_kind = COALESCE($16, contingency_kind), \
                xml_url = COALESCE($17, xml_url), \
                pdf_url = COALESCE($18, pdf_url), \
                qr_url = COALESCE($19, qr_url) \
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(update.access_key)
        .bind(update.protocol)
        .bind(update.document_number)
        .bind(update.series.map(i32::from))
        .bind(update.rejection_code)
        .bind(update.rejection_reason)
        .bind(update.retry_count.map(|value| value as i32))
        .bind(clear_next_retry)
        .bind(next_retry_at)
        .bind(update.processed_at)
        .bind(update.authorized_at)
        .bind(update.in_contingency)
        .bind(update.contingency_kind.map(ContingencyKind::as_str))
        .bind(update.xml_url)
        .bind(update.pdf_url)
        .bind(update.qr_url)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO events \
             (id, request_id, status_from, status_to, cstat, message, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(event.id)
        .bind(event.request_id)
        .bind(event.status_from.as_str())
        .bind(event.status_to.as_str())
        .bind(&event.cstat)
        .bind(&event.message)
        .bind(&event.metadata)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn events(&self, request_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, request_id, status_from, status_to, cstat, message, metadata, \
             created_at FROM events WHERE request_id = $1 ORDER BY created_at ASC",
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter()
            .map(|row| {
                let from_raw: String = row.try_get("status_from").map_err(unavailable)?;
                let to_raw: String = row.try_get("status_to").map_err(unavailable)?;
                Ok(Event {
                    id: row.try_get("id").map_err(unavailable)?,
                    request_id: row.try_get("request_id").map_err(unavailable)?,
                    status_from: RequestStatus::parse(&from_raw)
                        .ok_or_else(|| corrupt(format!("unknown status `{from_raw}`")))?,
                    status_to: RequestStatus::parse(&to_raw)
                        .ok_or_else(|| corrupt(format!("unknown status `{to_raw}`")))?,
                    cstat: row.try_get("cstat").map_err(unavailable)?,
                    message: row.try_get("message").map_err(unavailable)?,
                    metadata: row.try_get("metadata").map_err(unavailable)?,
                    created_at: row.try_get("created_at").map_err(unavailable)?,
                })
            })
            .collect()
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Request>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests \
             WHERE status = 'retrying' AND next_retry_at IS NOT NULL AND next_retry_at <= $1 \
             ORDER BY next_retry_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(row_to_request).collect()
    }

    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Request>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests \
             WHERE status = 'pending' AND created_at <= $1 \
             ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(row_to_request).collect()
    }
}

#[async_trait]
impl CompanyStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<Company>, StoreError> {
        let row = sqlx::query(
            "SELECT id, cnpj, legal_name, trade_name, ie, crt, street, street_number, \
             district, municipality_code, municipality, uf, postal_code, phone, \
             cert_pfx, cert_password, csc_id, csc_token \
             FROM companies WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        let Some(row) = row else { return Ok(None) };

        let uf_raw: String = row.try_get("uf").map_err(unavailable)?;
        let uf: Uf = uf_raw
            .parse()
            .map_err(|_| corrupt(format!("unknown UF `{uf_raw}`")))?;

        let cert_password: String = row.try_get("cert_password").map_err(unavailable)?;
        let csc_token: String = row.try_get("csc_token").map_err(unavailable)?;

        Ok(Some(Company {
            id: row.try_get("id").map_err(unavailable)?,
            cnpj: row.try_get("cnpj").map_err(unavailable)?,
            legal_name: row.try_get("legal_name").map_err(unavailable)?,
            trade_name: row.try_get("trade_name").map_err(unavailable)?,
            ie: row.try_get("ie").map_err(unavailable)?,
            crt: row.try_get("crt").map_err(unavailable)?,
            address: Address {
                street: row.try_get("street").map_err(unavailable)?,
                number: row.try_get("street_number").map_err(unavailable)?,
                district: row.try_get("district").map_err(unavailable)?,
                municipality_code: row.try_get("municipality_code").map_err(unavailable)?,
                municipality: row.try_get("municipality").map_err(unavailable)?,
                uf,
                postal_code: row.try_get("postal_code").map_err(unavailable)?,
                phone: row.try_get("phone").map_err(unavailable)?,
            },
            certificate: CertificateRef {
                pfx_base64: row.try_get("cert_pfx").map_err(unavailable)?,
                password: SecretString::new(cert_password),
            },
            csc: ContributorSecret {
                id: row.try_get("csc_id").map_err(unavailable)?,
                token: SecretString::new(csc_token),
            },
        }))
    }
}

#[async_trait]
impl SequenceService for PgStore {
    async fn next_number(&self, company_id: Uuid, series: u16) -> Result<i64, StoreError> {
        sqlx::query(
            "INSERT INTO sequences (company_id, series, last_number) VALUES ($1, $2, 0) \
             ON CONFLICT (company_id, series) DO NOTHING",
        )
        .bind(company_id)
        .bind(i32::from(series))
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        let row = sqlx::query(
            "UPDATE sequences SET last_number = last_number + 1 \
             WHERE company_id = $1 AND series = $2 RETURNING last_number",
        )
        .bind(company_id)
        .bind(i32::from(series))
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        row.try_get("last_number").map_err(unavailable)
    }
}

//! Data-store backends and reviewer notification plumbing for cleanbook.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cleanbook_core::{
    Attachment, Client, ClientProfileUpdate, Collaborator, CollaboratorProfileUpdate,
    PaymentStage, PlatformSettings, RateTable, Service, ServiceFilter, ServicePatch,
    ServiceStatus,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cleanbook-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("client {0} not found")]
    ClientNotFound(Uuid),
    #[error("collaborator {0} not found")]
    CollaboratorNotFound(Uuid),
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed store document {}: {source}", path.display())]
    Document {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed {what} in database: {detail}")]
    Corrupt { what: &'static str, detail: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ServiceNotFound(_)
                | StoreError::ClientNotFound(_)
                | StoreError::CollaboratorNotFound(_)
        )
    }
}

/// Read/update surface the settlement layer consumes. Writes are last-write-wins.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn read_services(&self, filter: &ServiceFilter) -> Result<Vec<Service>, StoreError>;

    /// Apply `patch`, and set `status` when given, in one write. Passing `None`
    /// keeps whatever status the stored row holds at write time.
    async fn update_service_status(
        &self,
        service_id: Uuid,
        status: Option<ServiceStatus>,
        patch: &ServicePatch,
    ) -> Result<(), StoreError>;

    /// `None` when the platform has no payout table configured.
    async fn read_collaborator_settings(&self) -> Result<Option<PlatformSettings>, StoreError>;

    async fn read_collaborator(&self, id: Uuid) -> Result<Option<Collaborator>, StoreError>;

    async fn update_client_profile(
        &self,
        client_id: Uuid,
        fields: &ClientProfileUpdate,
    ) -> Result<(), StoreError>;

    async fn update_collaborator_profile(
        &self,
        collaborator_id: Uuid,
        fields: &CollaboratorProfileUpdate,
    ) -> Result<(), StoreError>;
}

/// Whole-store snapshot shared by the in-memory and JSON file backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default)]
    pub collaborators: Vec<Collaborator>,
    #[serde(default)]
    pub settings: Option<PlatformSettings>,
}

impl StoreDocument {
    fn select_services(&self, filter: &ServiceFilter) -> Vec<Service> {
        self.services
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect()
    }

    fn update_service(
        &mut self,
        service_id: Uuid,
        status: Option<ServiceStatus>,
        patch: &ServicePatch,
    ) -> Result<(), StoreError> {
        let service = self
            .services
            .iter_mut()
            .find(|s| s.id == service_id)
            .ok_or(StoreError::ServiceNotFound(service_id))?;
        if let Some(status) = status {
            service.status = status;
        }
        service.apply_patch(patch);
        Ok(())
    }

    fn update_client(&mut self, id: Uuid, fields: &ClientProfileUpdate) -> Result<(), StoreError> {
        self.clients
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::ClientNotFound(id))?
            .apply_update(fields);
        Ok(())
    }

    fn update_collaborator(
        &mut self,
        id: Uuid,
        fields: &CollaboratorProfileUpdate,
    ) -> Result<(), StoreError> {
        self.collaborators
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::CollaboratorNotFound(id))?
            .apply_update(fields);
        Ok(())
    }
}

/// In-process store for tests and fixture-driven runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: RwLock<StoreDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(doc: StoreDocument) -> Self {
        Self {
            doc: RwLock::new(doc),
        }
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.doc.get_mut().services.push(service);
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.doc.get_mut().clients.push(client);
        self
    }

    pub fn with_collaborator(mut self, collaborator: Collaborator) -> Self {
        self.doc.get_mut().collaborators.push(collaborator);
        self
    }

    pub fn with_rates(mut self, payouts: RateTable) -> Self {
        self.doc.get_mut().settings = Some(PlatformSettings { payouts });
        self
    }

    pub async fn snapshot(&self) -> StoreDocument {
        self.doc.read().await.clone()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn read_services(&self, filter: &ServiceFilter) -> Result<Vec<Service>, StoreError> {
        Ok(self.doc.read().await.select_services(filter))
    }

    async fn update_service_status(
        &self,
        service_id: Uuid,
        status: Option<ServiceStatus>,
        patch: &ServicePatch,
    ) -> Result<(), StoreError> {
        self.doc
            .write()
            .await
            .update_service(service_id, status, patch)
    }

    async fn read_collaborator_settings(&self) -> Result<Option<PlatformSettings>, StoreError> {
        Ok(self.doc.read().await.settings.clone())
    }

    async fn read_collaborator(&self, id: Uuid) -> Result<Option<Collaborator>, StoreError> {
        Ok(self
            .doc
            .read()
            .await
            .collaborators
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn update_client_profile(
        &self,
        client_id: Uuid,
        fields: &ClientProfileUpdate,
    ) -> Result<(), StoreError> {
        self.doc.write().await.update_client(client_id, fields)
    }

    async fn update_collaborator_profile(
        &self,
        collaborator_id: Uuid,
        fields: &CollaboratorProfileUpdate,
    ) -> Result<(), StoreError> {
        self.doc
            .write()
            .await
            .update_collaborator(collaborator_id, fields)
    }
}

/// Single JSON document on disk, rewritten atomically on every update.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file reads as an empty store.
    pub async fn load(&self) -> Result<StoreDocument, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreDocument::default())
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Document {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the document through a temp file and rename it into place.
    pub async fn save(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(|source| StoreError::Document {
            path: self.path.clone(),
            source,
        })?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await.map_err(io_error(parent))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_error(&temp_path))?;
        file.write_all(&bytes).await.map_err(io_error(&temp_path))?;
        file.flush().await.map_err(io_error(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }

    async fn modify<F>(&self, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreDocument) -> Result<(), StoreError> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        apply(&mut doc)?;
        self.save(&doc).await
    }
}

#[async_trait]
impl DataStore for JsonFileStore {
    async fn read_services(&self, filter: &ServiceFilter) -> Result<Vec<Service>, StoreError> {
        Ok(self.load().await?.select_services(filter))
    }

    async fn update_service_status(
        &self,
        service_id: Uuid,
        status: Option<ServiceStatus>,
        patch: &ServicePatch,
    ) -> Result<(), StoreError> {
        self.modify(|doc| doc.update_service(service_id, status, patch))
            .await
    }

    async fn read_collaborator_settings(&self) -> Result<Option<PlatformSettings>, StoreError> {
        Ok(self.load().await?.settings)
    }

    async fn read_collaborator(&self, id: Uuid) -> Result<Option<Collaborator>, StoreError> {
        Ok(self
            .load()
            .await?
            .collaborators
            .into_iter()
            .find(|c| c.id == id))
    }

    async fn update_client_profile(
        &self,
        client_id: Uuid,
        fields: &ClientProfileUpdate,
    ) -> Result<(), StoreError> {
        self.modify(|doc| doc.update_client(client_id, fields)).await
    }

    async fn update_collaborator_profile(
        &self,
        collaborator_id: Uuid,
        fields: &CollaboratorProfileUpdate,
    ) -> Result<(), StoreError> {
        self.modify(|doc| doc.update_collaborator(collaborator_id, fields))
            .await
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

const SERVICE_COLUMNS: &str = "id, client_id, collaborator_id, status, price, payment_status, \
     proof_signal, proof_signal_type, proof_final, proof_final_type, \
     payment_link_signal, payment_link_final, duration, date, address, service_type";

const PAYOUTS_SETTINGS_KEY: &str = "payouts";

/// PostgreSQL backend. Schema lives in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

fn corrupt(what: &'static str) -> impl FnOnce(cleanbook_core::SettlementError) -> StoreError {
    move |err| StoreError::Corrupt {
        what,
        detail: err.to_string(),
    }
}

fn attachment_from_columns(data: Option<Vec<u8>>, media_type: Option<String>) -> Option<Attachment> {
    data.map(|data| Attachment { media_type, data })
}

fn service_from_row(row: &PgRow) -> Result<Service, StoreError> {
    let status: String = row.try_get("status")?;
    let payment_status: String = row.try_get("payment_status")?;
    Ok(Service {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        collaborator_id: row.try_get("collaborator_id")?,
        status: status.parse().map_err(corrupt("service status"))?,
        price: row.try_get("price")?,
        payment_status: payment_status.parse().map_err(corrupt("payment status"))?,
        proof_signal: attachment_from_columns(
            row.try_get("proof_signal")?,
            row.try_get("proof_signal_type")?,
        ),
        proof_final: attachment_from_columns(
            row.try_get("proof_final")?,
            row.try_get("proof_final_type")?,
        ),
        payment_link_signal: row.try_get("payment_link_signal")?,
        payment_link_final: row.try_get("payment_link_final")?,
        duration: row.try_get("duration")?,
        date: row.try_get::<Option<DateTime<Utc>>, _>("date")?,
        address: row.try_get("address")?,
        service_type: row.try_get("service_type")?,
    })
}

#[async_trait]
impl DataStore for PgStore {
    async fn read_services(&self, filter: &ServiceFilter) -> Result<Vec<Service>, StoreError> {
        let statuses = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect::<Vec<_>>();
        let sql = format!(
            r#"
            SELECT {SERVICE_COLUMNS}
              FROM services
             WHERE ($1::uuid IS NULL OR id = $1)
               AND ($2::uuid IS NULL OR client_id = $2)
               AND ($3::uuid IS NULL OR collaborator_id = $3)
               AND (cardinality($4::text[]) = 0 OR status = ANY($4))
             ORDER BY date NULLS LAST, id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.service_id)
            .bind(filter.client_id)
            .bind(filter.collaborator_id)
            .bind(&statuses)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(service_from_row).collect()
    }

    async fn update_service_status(
        &self,
        service_id: Uuid,
        status: Option<ServiceStatus>,
        patch: &ServicePatch,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {SERVICE_COLUMNS} FROM services WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(service_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::ServiceNotFound(service_id))?;

        let mut service = service_from_row(&row)?;
        if let Some(status) = status {
            service.status = status;
        }
        service.apply_patch(patch);

        sqlx::query(
            r#"
            UPDATE services
               SET status = $2,
                   price = $3,
                   payment_status = $4,
                   proof_signal = $5,
                   proof_signal_type = $6,
                   proof_final = $7,
                   proof_final_type = $8
             WHERE id = $1
            "#,
        )
        .bind(service.id)
        .bind(service.status.as_str())
        .bind(service.price)
        .bind(service.payment_status.as_str())
        .bind(service.proof_signal.as_ref().map(|a| a.data.clone()))
        .bind(service.proof_signal.as_ref().and_then(|a| a.media_type.clone()))
        .bind(service.proof_final.as_ref().map(|a| a.data.clone()))
        .bind(service.proof_final.as_ref().and_then(|a| a.media_type.clone()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_collaborator_settings(&self) -> Result<Option<PlatformSettings>, StoreError> {
        let row = sqlx::query("SELECT value FROM platform_settings WHERE key = $1")
            .bind(PAYOUTS_SETTINGS_KEY)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let value: serde_json::Value = row.try_get("value")?;
        let payouts: RateTable =
            serde_json::from_value(value).map_err(|err| StoreError::Corrupt {
                what: "payout table",
                detail: err.to_string(),
            })?;
        Ok(Some(PlatformSettings { payouts }))
    }

    async fn read_collaborator(&self, id: Uuid) -> Result<Option<Collaborator>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, email, phone, password_hash, photo, level
              FROM collaborators
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok::<_, StoreError>(Collaborator {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                email: row.try_get("email")?,
                phone: row.try_get("phone")?,
                password_hash: row.try_get("password_hash")?,
                photo: row.try_get("photo")?,
                level: row.try_get("level")?,
            })
        })
        .transpose()
    }

    async fn update_client_profile(
        &self,
        client_id: Uuid,
        fields: &ClientProfileUpdate,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE clients
               SET name = COALESCE($2, name),
                   email = COALESCE($3, email),
                   phone = COALESCE($4, phone)
             WHERE id = $1
            "#,
        )
        .bind(client_id)
        .bind(&fields.name)
        .bind(&fields.email)
        .bind(&fields.phone)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ClientNotFound(client_id));
        }
        Ok(())
    }

    async fn update_collaborator_profile(
        &self,
        collaborator_id: Uuid,
        fields: &CollaboratorProfileUpdate,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE collaborators
               SET name = COALESCE($2, name),
                   email = COALESCE($3, email),
                   phone = COALESCE($4, phone),
                   photo = COALESCE($5, photo),
                   password_hash = COALESCE($6, password_hash)
             WHERE id = $1
            "#,
        )
        .bind(collaborator_id)
        .bind(&fields.name)
        .bind(&fields.email)
        .bind(&fields.phone)
        .bind(&fields.photo)
        .bind(&fields.password_hash)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::CollaboratorNotFound(collaborator_id));
        }
        Ok(())
    }
}

/// Hex sha256 used to fingerprint proof attachments in logs and notices.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Sent to reviewers when a client uploads a proof of payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofNotice {
    pub service_id: Uuid,
    pub client_id: Uuid,
    pub stage: PaymentStage,
    pub content_hash: String,
    pub media_type: Option<String>,
    pub byte_size: usize,
    pub submitted_at: DateTime<Utc>,
}

impl ProofNotice {
    pub fn new(service: &Service, stage: PaymentStage, attachment: &Attachment) -> Self {
        Self {
            service_id: service.id,
            client_id: service.client_id,
            stage,
            content_hash: sha256_hex(&attachment.data),
            media_type: attachment.media_type.clone(),
            byte_size: attachment.data.len(),
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
}

#[async_trait]
pub trait ReviewNotifier: Send + Sync {
    async fn proof_submitted(&self, notice: &ProofNotice) -> Result<(), NotifyError>;
}

/// Notifier that only records the notice in the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl ReviewNotifier for LogNotifier {
    async fn proof_submitted(&self, notice: &ProofNotice) -> Result<(), NotifyError> {
        info!(
            service_id = %notice.service_id,
            stage = %notice.stage,
            content_hash = %notice.content_hash,
            bytes = notice.byte_size,
            "proof awaiting review"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

/// Posts [`ProofNotice`]s as JSON to a reviewer webhook.
#[derive(Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    backoff: BackoffPolicy,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building webhook client")?;
        Ok(Self {
            client,
            url: config.url,
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl ReviewNotifier for WebhookNotifier {
    async fn proof_submitted(&self, notice: &ProofNotice) -> Result<(), NotifyError> {
        let span = info_span!("review_webhook", service_id = %notice.service_id, url = %self.url);
        async {
            let mut attempt = 0;
            loop {
                match self.client.post(&self.url).json(notice).send().await {
                    Ok(resp) if resp.status().is_success() => return Ok(()),
                    Ok(resp) => {
                        let status = resp.status();
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(%status, attempt, "review webhook returned retryable status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(NotifyError::HttpStatus {
                            status: status.as_u16(),
                            url: self.url.clone(),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err, attempt, "review webhook request failed; retrying");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(NotifyError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

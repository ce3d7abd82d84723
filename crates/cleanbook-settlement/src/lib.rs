//! Settlement orchestration: client payment views, proof intake, payment
//! confirmation and collaborator payouts over a [`DataStore`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use cleanbook_core::{
    Attachment, ClientProfileUpdate, CollaboratorLevel, CollaboratorProfileUpdate, PaymentAction,
    PaymentStage, PaymentStatus, RateTable, Service, ServiceFilter, ServicePatch, ServiceStatus,
    SettlementError, StageProgress,
};
use cleanbook_storage::{
    BackoffPolicy, DataStore, JsonFileStore, LogNotifier, PgStore, ProofNotice, ReviewNotifier,
    StoreError, WebhookConfig, WebhookNotifier,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cleanbook-settlement";

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub database_url: Option<String>,
    pub data_file: PathBuf,
    pub rates_file: PathBuf,
    pub review_webhook_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
    pub log_level: String,
}

impl SettlementConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            data_file: std::env::var("CLEANBOOK_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/store.json")),
            rates_file: std::env::var("CLEANBOOK_RATES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./rates.yaml")),
            review_webhook_url: std::env::var("CLEANBOOK_REVIEW_WEBHOOK_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            user_agent: std::env::var("CLEANBOOK_USER_AGENT")
                .unwrap_or_else(|_| "cleanbook/0.1".to_string()),
            http_timeout_secs: std::env::var("CLEANBOOK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            web_port: std::env::var("CLEANBOOK_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            log_level: std::env::var("CLEANBOOK_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

pub const RATES_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
struct RatesFile {
    version: u32,
    payouts: RateTable,
}

pub fn load_rate_table(path: &Path) -> Result<RateTable> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: RatesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    anyhow::ensure!(
        file.version == RATES_FILE_VERSION,
        "unsupported rates file version {} in {} (expected {RATES_FILE_VERSION})",
        file.version,
        path.display()
    );
    Ok(file.payouts)
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("stored credential is not a valid password hash: {0}")]
    MalformedHash(String),
    #[error("hashing credential failed: {0}")]
    Hashing(String),
}

/// Hash-and-compare capability. Raw secrets are never compared directly.
pub trait CredentialVerifier: Send + Sync {
    fn hash(&self, secret: &str) -> Result<String, CredentialError>;
    fn verify(&self, secret: &str, stored_hash: &str) -> Result<bool, CredentialError>;
}

#[derive(Debug, Default)]
pub struct Argon2Credentials;

impl CredentialVerifier for Argon2Credentials {
    fn hash(&self, secret: &str) -> Result<String, CredentialError> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| CredentialError::Hashing(e.to_string()))
    }

    fn verify(&self, secret: &str, stored_hash: &str) -> Result<bool, CredentialError> {
        let parsed =
            PasswordHash::new(stored_hash).map_err(|e| CredentialError::MalformedHash(e.to_string()))?;
        Ok(Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok())
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("collaborator {0} not found")]
    CollaboratorNotFound(Uuid),
    #[error("current password does not match")]
    CredentialMismatch,
    #[error("new password must have at least {MIN_PASSWORD_LEN} characters")]
    WeakPassword,
    #[error("no payout table configured")]
    MissingRateTable,
}

impl OrchestratorError {
    pub fn is_not_found(&self) -> bool {
        match self {
            OrchestratorError::ServiceNotFound(_) | OrchestratorError::CollaboratorNotFound(_) => true,
            OrchestratorError::Store(err) => err.is_not_found(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagePaymentView {
    pub stage: PaymentStage,
    pub amount: Decimal,
    pub display_amount: String,
    pub action: PaymentAction,
    pub progress: StageProgress,
}

impl StagePaymentView {
    fn for_stage(service: &Service, stage: PaymentStage) -> Self {
        let amount = cleanbook_core::stage_amount(service, stage);
        Self {
            stage,
            amount,
            display_amount: cleanbook_core::format_amount(amount),
            action: cleanbook_core::resolve_payment_action(service, stage),
            progress: cleanbook_core::stage_progress(service, stage),
        }
    }
}

/// What a client sees for one service on the payment screen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePaymentView {
    pub service_id: Uuid,
    pub status: ServiceStatus,
    pub payment_status: PaymentStatus,
    pub price: Option<Decimal>,
    pub display_price: String,
    pub eligible: bool,
    pub signal: StagePaymentView,
    #[serde(rename = "final")]
    pub final_stage: StagePaymentView,
}

impl ServicePaymentView {
    pub fn from_service(service: &Service) -> Self {
        Self {
            service_id: service.id,
            status: service.status,
            payment_status: service.payment_status,
            price: service.price,
            display_price: cleanbook_core::format_amount(service.price.unwrap_or(Decimal::ZERO)),
            eligible: cleanbook_core::is_eligible_for_payment_display(service),
            signal: StagePaymentView::for_stage(service, PaymentStage::Signal),
            final_stage: StagePaymentView::for_stage(service, PaymentStage::Final),
        }
    }

    pub fn stage(&self, stage: PaymentStage) -> &StagePaymentView {
        match stage {
            PaymentStage::Signal => &self.signal,
            PaymentStage::Final => &self.final_stage,
        }
    }
}

/// Returned to the submitter once a proof is stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofReceipt {
    pub service_id: Uuid,
    pub stage: PaymentStage,
    pub content_hash: String,
    pub progress: StageProgress,
    pub reviewer_notified: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutLine {
    pub service_id: Uuid,
    pub date: Option<DateTime<Utc>>,
    pub duration_hours: f64,
    pub amount: Decimal,
    pub display_amount: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutHistory {
    pub collaborator_id: Uuid,
    pub collaborator_name: String,
    pub level: CollaboratorLevel,
    pub lines: Vec<PayoutLine>,
    pub total: Decimal,
    pub display_total: String,
}

pub struct SettlementOrchestrator {
    store: Arc<dyn DataStore>,
    notifier: Arc<dyn ReviewNotifier>,
    credentials: Arc<dyn CredentialVerifier>,
    fallback_rates: Option<RateTable>,
}

impl SettlementOrchestrator {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            notifier: Arc::new(LogNotifier),
            credentials: Arc::new(Argon2Credentials),
            fallback_rates: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ReviewNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialVerifier>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Rates used when the store holds no platform settings.
    pub fn with_fallback_rates(mut self, rates: RateTable) -> Self {
        self.fallback_rates = Some(rates);
        self
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    async fn load_service(&self, service_id: Uuid) -> Result<Service, OrchestratorError> {
        self.store
            .read_services(&ServiceFilter::by_id(service_id))
            .await?
            .into_iter()
            .next()
            .ok_or(OrchestratorError::ServiceNotFound(service_id))
    }

    pub async fn rate_table(&self) -> Result<RateTable, OrchestratorError> {
        match self.store.read_collaborator_settings().await? {
            Some(settings) => Ok(settings.payouts),
            None => self.fallback_rates.ok_or(OrchestratorError::MissingRateTable),
        }
    }

    pub async fn payment_view(&self, service_id: Uuid) -> Result<ServicePaymentView, OrchestratorError> {
        let service = self.load_service(service_id).await?;
        Ok(ServicePaymentView::from_service(&service))
    }

    /// Payment screen for a client: every service past approval and not canceled.
    pub async fn client_payment_view(
        &self,
        client_id: Uuid,
    ) -> Result<Vec<ServicePaymentView>, OrchestratorError> {
        let services = self
            .store
            .read_services(&ServiceFilter::for_client(client_id))
            .await?;
        Ok(services
            .iter()
            .filter(|s| cleanbook_core::is_eligible_for_payment_display(s))
            .map(ServicePaymentView::from_service)
            .collect())
    }

    /// Store a client's proof for `stage`. The reviewer notification is best-effort.
    #[instrument(skip_all, fields(%service_id, %stage))]
    pub async fn submit_proof(
        &self,
        service_id: Uuid,
        stage: PaymentStage,
        attachment: Option<Attachment>,
    ) -> Result<ProofReceipt, OrchestratorError> {
        let Some(proof) = attachment.filter(|a| !a.is_empty()) else {
            return Err(SettlementError::MissingAttachment { stage }.into());
        };
        let service = self.load_service(service_id).await?;
        let updated = cleanbook_core::submit_proof(&service, stage, Some(proof.clone()))?;

        self.store
            .update_service_status(service.id, None, &ServicePatch::proof(stage, proof.clone()))
            .await?;

        let notice = ProofNotice::new(&updated, stage, &proof);
        let reviewer_notified = match self.notifier.proof_submitted(&notice).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "reviewer notification failed; proof kept");
                false
            }
        };
        info!(content_hash = %notice.content_hash, "proof recorded pending verification");

        Ok(ProofReceipt {
            service_id,
            stage,
            content_hash: notice.content_hash,
            progress: cleanbook_core::stage_progress(&updated, stage),
            reviewer_notified,
            message: format!(
                "{} payment proof received and awaiting verification",
                match stage {
                    PaymentStage::Signal => "Signal",
                    PaymentStage::Final => "Final",
                }
            ),
        })
    }

    /// Administrative verification of a stage.
    #[instrument(skip_all, fields(%service_id, %stage))]
    pub async fn confirm_payment(
        &self,
        service_id: Uuid,
        stage: PaymentStage,
    ) -> Result<PaymentStatus, OrchestratorError> {
        let service = self.load_service(service_id).await?;
        let next = cleanbook_core::confirm_payment(&service, stage)?;
        cleanbook_core::ensure_forward(service.payment_status, next)?;
        if next != service.payment_status {
            self.store
                .update_service_status(service.id, None, &ServicePatch::payment_status(next))
                .await?;
            info!(from = %service.payment_status, to = %next, "payment confirmed");
        }
        Ok(next)
    }

    /// Apply an externally triggered status change.
    #[instrument(skip_all, fields(%service_id, %status))]
    pub async fn record_status(
        &self,
        service_id: Uuid,
        status: ServiceStatus,
    ) -> Result<Service, OrchestratorError> {
        let mut service = self.load_service(service_id).await?;
        let previous = service.status;
        cleanbook_core::transition(&mut service, status)?;
        if previous != status {
            self.store
                .update_service_status(service.id, Some(status), &ServicePatch::default())
                .await?;
            info!(from = %previous, "service status updated");
        }
        Ok(service)
    }

    #[instrument(skip_all, fields(%service_id, %price))]
    pub async fn approve_quote(
        &self,
        service_id: Uuid,
        price: Decimal,
    ) -> Result<Service, OrchestratorError> {
        let mut service = self.load_service(service_id).await?;
        let previous = service.status;
        cleanbook_core::approve_quote(&mut service, price)?;
        let status = (service.status != previous).then_some(service.status);
        self.store
            .update_service_status(service.id, status, &ServicePatch::price(price))
            .await?;
        Ok(service)
    }

    /// Payout for every completed service assigned to the collaborator.
    pub async fn collaborator_history(
        &self,
        collaborator_id: Uuid,
    ) -> Result<PayoutHistory, OrchestratorError> {
        let collaborator = self
            .store
            .read_collaborator(collaborator_id)
            .await?
            .ok_or(OrchestratorError::CollaboratorNotFound(collaborator_id))?;
        let rates = self.rate_table().await?;
        let services = self
            .store
            .read_services(
                &ServiceFilter::for_collaborator(collaborator_id).with_status(ServiceStatus::Completed),
            )
            .await?;

        if collaborator.level.is_none() {
            debug!(%collaborator_id, "collaborator has no level; paying as JUNIOR");
        }

        let lines = services
            .iter()
            .map(|service| {
                let amount = cleanbook_core::payout_for(&collaborator, service, &rates);
                PayoutLine {
                    service_id: service.id,
                    date: service.date,
                    duration_hours: cleanbook_core::parse_duration_hours(service.duration.as_deref()),
                    amount,
                    display_amount: cleanbook_core::format_amount(amount),
                }
            })
            .collect::<Vec<_>>();
        let total = lines.iter().map(|l| l.amount).sum::<Decimal>();

        Ok(PayoutHistory {
            collaborator_id,
            collaborator_name: collaborator.name.clone(),
            level: collaborator.level(),
            lines,
            total,
            display_total: cleanbook_core::format_amount(total),
        })
    }

    pub async fn payout_statement_markdown(
        &self,
        collaborator_id: Uuid,
    ) -> Result<String, OrchestratorError> {
        let history = self.collaborator_history(collaborator_id).await?;
        let mut lines = vec![
            "# Payout Statement".to_string(),
            String::new(),
            format!(
                "- Collaborator: {} (`{}`)",
                history.collaborator_name, history.collaborator_id
            ),
            format!("- Level: {}", history.level),
            format!("- Completed services: {}", history.lines.len()),
            format!("- Total: {}", history.display_total),
            String::new(),
            "## Services".to_string(),
        ];
        if history.lines.is_empty() {
            lines.push("- none".to_string());
        }
        for line in &history.lines {
            let date = line
                .date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "undated".to_string());
            lines.push(format!(
                "- {date} `{}`: {}h -> {}",
                line.service_id, line.duration_hours, line.display_amount
            ));
        }
        lines.push(String::new());
        Ok(lines.join("\n"))
    }

    /// Verify the current secret before storing a hash of the new one.
    #[instrument(skip_all, fields(%collaborator_id))]
    pub async fn change_collaborator_password(
        &self,
        collaborator_id: Uuid,
        current: &str,
        new_password: &str,
    ) -> Result<(), OrchestratorError> {
        let collaborator = self
            .store
            .read_collaborator(collaborator_id)
            .await?
            .ok_or(OrchestratorError::CollaboratorNotFound(collaborator_id))?;
        if collaborator.password_hash.is_empty()
            || !self.credentials.verify(current, &collaborator.password_hash)?
        {
            return Err(OrchestratorError::CredentialMismatch);
        }
        if new_password.chars().count() < MIN_PASSWORD_LEN {
            return Err(OrchestratorError::WeakPassword);
        }
        let password_hash = self.credentials.hash(new_password)?;
        self.store
            .update_collaborator_profile(
                collaborator_id,
                &CollaboratorProfileUpdate {
                    password_hash: Some(password_hash),
                    ..CollaboratorProfileUpdate::default()
                },
            )
            .await?;
        info!("collaborator password changed");
        Ok(())
    }

    pub async fn update_client_profile(
        &self,
        client_id: Uuid,
        fields: &ClientProfileUpdate,
    ) -> Result<(), OrchestratorError> {
        Ok(self.store.update_client_profile(client_id, fields).await?)
    }

    /// Profile edits never carry a password; see [`Self::change_collaborator_password`].
    pub async fn update_collaborator_profile(
        &self,
        collaborator_id: Uuid,
        fields: &CollaboratorProfileUpdate,
    ) -> Result<(), OrchestratorError> {
        let fields = CollaboratorProfileUpdate {
            password_hash: None,
            ..fields.clone()
        };
        Ok(self
            .store
            .update_collaborator_profile(collaborator_id, &fields)
            .await?)
    }
}

/// Wire the orchestrator from configuration: Postgres when a database URL is
/// set, otherwise the JSON document store.
pub async fn orchestrator_from_config(config: &SettlementConfig) -> Result<SettlementOrchestrator> {
    let store: Arc<dyn DataStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?,
        ),
        None => Arc::new(JsonFileStore::new(config.data_file.clone())),
    };

    let notifier: Arc<dyn ReviewNotifier> = match &config.review_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(WebhookConfig {
            url: url.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        })?),
        None => Arc::new(LogNotifier),
    };

    let mut orchestrator = SettlementOrchestrator::new(store).with_notifier(notifier);
    if config.rates_file.exists() {
        orchestrator = orchestrator.with_fallback_rates(load_rate_table(&config.rates_file)?);
    } else {
        debug!(path = %config.rates_file.display(), "no rates file; relying on stored settings");
    }
    Ok(orchestrator)
}

pub async fn orchestrator_from_env() -> Result<SettlementOrchestrator> {
    orchestrator_from_config(&SettlementConfig::from_env()).await
}

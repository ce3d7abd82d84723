//! Core domain model for cleanbook: service lifecycle, two-stage payment
//! sub-state and collaborator payout rules.
//!
//! Everything in this crate is pure. Persistence and notification live in
//! `cleanbook-storage`; composition lives in `cleanbook-settlement`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cleanbook-core";

/// Hours assumed when a service carries no parseable duration.
pub const DEFAULT_DURATION_HOURS: f64 = 4.0;

/// URL schemes accepted for externally hosted payment links.
pub const PAYMENT_LINK_SCHEMES: [&str; 2] = ["https://", "http://"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementError {
    #[error("no attachment supplied for the {stage} payment proof")]
    MissingAttachment { stage: PaymentStage },
    #[error("{stage} payment is not available for this service yet")]
    ActionBlocked { stage: PaymentStage },
    #[error("{stage} payment cannot be confirmed without a proof")]
    ProofRequired { stage: PaymentStage },
    #[error("payment status cannot move from {from} to {to}")]
    PaymentRegression { from: PaymentStatus, to: PaymentStatus },
    #[error("service status cannot move from {from} to {to}")]
    InvalidTransition { from: ServiceStatus, to: ServiceStatus },
    #[error("price must not be negative")]
    NegativePrice,
    #[error("price is already set to {current}")]
    PriceLocked { current: Decimal },
    #[error("unrecognized {kind}: {value}")]
    Unrecognized { kind: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Pending,
    Scheduled,
    InProgress,
    Completed,
    Canceled,
}

impl ServiceStatus {
    pub const ALL: [ServiceStatus; 5] = [
        ServiceStatus::Pending,
        ServiceStatus::Scheduled,
        ServiceStatus::InProgress,
        ServiceStatus::Completed,
        ServiceStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Pending => "PENDING",
            ServiceStatus::Scheduled => "SCHEDULED",
            ServiceStatus::InProgress => "IN_PROGRESS",
            ServiceStatus::Completed => "COMPLETED",
            ServiceStatus::Canceled => "CANCELED",
        }
    }

    /// Forward edges of the lifecycle graph. `COMPLETED` and `CANCELED` arrive
    /// from external triggers and are accepted from any status.
    pub fn can_transition_to(&self, next: ServiceStatus) -> bool {
        if *self == next {
            return true;
        }
        match next {
            ServiceStatus::Completed | ServiceStatus::Canceled => true,
            ServiceStatus::Scheduled => *self == ServiceStatus::Pending,
            ServiceStatus::InProgress => *self == ServiceStatus::Scheduled,
            ServiceStatus::Pending => false,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_").to_ascii_uppercase();
        ServiceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| SettlementError::Unrecognized {
                kind: "service status",
                value: s.to_string(),
            })
    }
}

/// Payment progress. The derived ordering is the only legal direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    SignalPaid,
    FullPaid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "UNPAID",
            PaymentStatus::SignalPaid => "SIGNAL_PAID",
            PaymentStatus::FullPaid => "FULL_PAID",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNPAID" => Ok(PaymentStatus::Unpaid),
            "SIGNAL_PAID" => Ok(PaymentStatus::SignalPaid),
            "FULL_PAID" => Ok(PaymentStatus::FullPaid),
            _ => Err(SettlementError::Unrecognized {
                kind: "payment status",
                value: s.to_string(),
            }),
        }
    }
}

/// One half of a service's payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStage {
    Signal,
    Final,
}

impl PaymentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStage::Signal => "SIGNAL",
            PaymentStage::Final => "FINAL",
        }
    }

    /// Status reached once this stage is confirmed.
    pub fn settled_status(&self) -> PaymentStatus {
        match self {
            PaymentStage::Signal => PaymentStatus::SignalPaid,
            PaymentStage::Final => PaymentStatus::FullPaid,
        }
    }
}

impl fmt::Display for PaymentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStage {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SIGNAL" => Ok(PaymentStage::Signal),
            "FINAL" => Ok(PaymentStage::Final),
            _ => Err(SettlementError::Unrecognized {
                kind: "payment stage",
                value: s.to_string(),
            }),
        }
    }
}

/// Client-submitted evidence of payment. The bytes are opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(with = "hex")]
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(media_type: Option<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            media_type,
            data: data.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One requested or booked job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: Uuid,
    pub client_id: Uuid,
    #[serde(default)]
    pub collaborator_id: Option<Uuid>,
    pub status: ServiceStatus,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub proof_signal: Option<Attachment>,
    #[serde(default)]
    pub proof_final: Option<Attachment>,
    #[serde(default)]
    pub payment_link_signal: Option<String>,
    #[serde(default)]
    pub payment_link_final: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, rename = "type")]
    pub service_type: Option<String>,
}

impl Service {
    /// A freshly booked service, as the booking flow creates it.
    pub fn new(client_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id,
            collaborator_id: None,
            status: ServiceStatus::Pending,
            price: None,
            payment_status: PaymentStatus::Unpaid,
            proof_signal: None,
            proof_final: None,
            payment_link_signal: None,
            payment_link_final: None,
            duration: None,
            date: None,
            address: None,
            service_type: None,
        }
    }

    pub fn proof(&self, stage: PaymentStage) -> Option<&Attachment> {
        match stage {
            PaymentStage::Signal => self.proof_signal.as_ref(),
            PaymentStage::Final => self.proof_final.as_ref(),
        }
    }

    pub fn payment_link(&self, stage: PaymentStage) -> Option<&str> {
        match stage {
            PaymentStage::Signal => self.payment_link_signal.as_deref(),
            PaymentStage::Final => self.payment_link_final.as_deref(),
        }
    }

    /// Absent and zero prices both mean nothing is owed.
    pub fn is_zero_price(&self) -> bool {
        self.price.map_or(true, |price| price.is_zero())
    }

    /// Apply a partial update. Payment status only ever moves forward and a
    /// price, once set, is kept.
    pub fn apply_patch(&mut self, patch: &ServicePatch) {
        if let Some(proof) = &patch.proof_signal {
            self.proof_signal = Some(proof.clone());
        }
        if let Some(proof) = &patch.proof_final {
            self.proof_final = Some(proof.clone());
        }
        if let Some(next) = patch.payment_status {
            self.payment_status = self.payment_status.max(next);
        }
        if self.price.is_none() {
            self.price = patch.price;
        }
    }
}

/// Partial service fields carried alongside a status update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePatch {
    #[serde(default)]
    pub proof_signal: Option<Attachment>,
    #[serde(default)]
    pub proof_final: Option<Attachment>,
    #[serde(default)]
    pub payment_status: Option<PaymentStatus>,
    #[serde(default)]
    pub price: Option<Decimal>,
}

impl ServicePatch {
    pub fn proof(stage: PaymentStage, attachment: Attachment) -> Self {
        match stage {
            PaymentStage::Signal => Self {
                proof_signal: Some(attachment),
                ..Self::default()
            },
            PaymentStage::Final => Self {
                proof_final: Some(attachment),
                ..Self::default()
            },
        }
    }

    pub fn payment_status(status: PaymentStatus) -> Self {
        Self {
            payment_status: Some(status),
            ..Self::default()
        }
    }

    pub fn price(price: Decimal) -> Self {
        Self {
            price: Some(price),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.proof_signal.is_none()
            && self.proof_final.is_none()
            && self.payment_status.is_none()
            && self.price.is_none()
    }
}

/// Read filter understood by every data store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFilter {
    pub client_id: Option<Uuid>,
    pub collaborator_id: Option<Uuid>,
    pub service_id: Option<Uuid>,
    /// Empty means any status.
    pub statuses: Vec<ServiceStatus>,
}

impl ServiceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: Uuid) -> Self {
        Self {
            service_id: Some(id),
            ..Self::default()
        }
    }

    pub fn for_client(client_id: Uuid) -> Self {
        Self {
            client_id: Some(client_id),
            ..Self::default()
        }
    }

    pub fn for_collaborator(collaborator_id: Uuid) -> Self {
        Self {
            collaborator_id: Some(collaborator_id),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
        self
    }

    pub fn matches(&self, service: &Service) -> bool {
        self.service_id.map_or(true, |id| service.id == id)
            && self.client_id.map_or(true, |id| service.client_id == id)
            && self
                .collaborator_id
                .map_or(true, |id| service.collaborator_id == Some(id))
            && (self.statuses.is_empty() || self.statuses.contains(&service.status))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Client {
    pub fn apply_update(&mut self, update: &ClientProfileUpdate) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(email) = &update.email {
            self.email = email.clone();
        }
        if let Some(phone) = &update.phone {
            self.phone = Some(phone.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Service provider. `level` is kept as stored; see [`CollaboratorLevel::normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub photo: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
}

impl Collaborator {
    pub fn level(&self) -> CollaboratorLevel {
        CollaboratorLevel::normalize(self.level.as_deref())
    }

    pub fn apply_update(&mut self, update: &CollaboratorProfileUpdate) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(email) = &update.email {
            self.email = email.clone();
        }
        if let Some(phone) = &update.phone {
            self.phone = Some(phone.clone());
        }
        if let Some(photo) = &update.photo {
            self.photo = Some(photo.clone());
        }
        if let Some(hash) = &update.password_hash {
            self.password_hash = hash.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub photo: Option<String>,
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollaboratorLevel {
    #[default]
    Junior,
    Senior,
    Master,
}

impl CollaboratorLevel {
    /// Missing or unrecognized levels fall back to `JUNIOR`.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_uppercase()).as_deref() {
            Some("SENIOR") => CollaboratorLevel::Senior,
            Some("MASTER") => CollaboratorLevel::Master,
            _ => CollaboratorLevel::Junior,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CollaboratorLevel::Junior => "JUNIOR",
            CollaboratorLevel::Senior => "SENIOR",
            CollaboratorLevel::Master => "MASTER",
        }
    }
}

impl fmt::Display for CollaboratorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payout per duration bucket for one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateRow {
    pub hours4: Decimal,
    pub hours6: Decimal,
    /// Catch-all for anything above six hours.
    pub hours8: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateTable {
    #[serde(default, rename = "JUNIOR")]
    pub junior: RateRow,
    #[serde(default, rename = "SENIOR")]
    pub senior: RateRow,
    #[serde(default, rename = "MASTER")]
    pub master: RateRow,
}

impl RateTable {
    pub fn row(&self, level: CollaboratorLevel) -> &RateRow {
        match level {
            CollaboratorLevel::Junior => &self.junior,
            CollaboratorLevel::Senior => &self.senior,
            CollaboratorLevel::Master => &self.master,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlatformSettings {
    pub payouts: RateTable,
}

/// Payment surfaces never show services that are unapproved or abandoned.
pub fn is_eligible_for_payment_display(service: &Service) -> bool {
    !matches!(
        service.status,
        ServiceStatus::Pending | ServiceStatus::Canceled
    )
}

/// The final stage opens only after the work is completed and the signal is
/// settled. A zero-price service has no signal to settle.
pub fn is_final_payment_unlocked(service: &Service) -> bool {
    let signal_settled =
        service.payment_status >= PaymentStatus::SignalPaid || service.is_zero_price();
    signal_settled && service.status == ServiceStatus::Completed
}

/// Move a service to `next`, rejecting edges outside the lifecycle graph.
pub fn transition(service: &mut Service, next: ServiceStatus) -> Result<(), SettlementError> {
    if !service.status.can_transition_to(next) {
        return Err(SettlementError::InvalidTransition {
            from: service.status,
            to: next,
        });
    }
    service.status = next;
    Ok(())
}

/// Record the agreed price and move a pending booking to `SCHEDULED`.
pub fn approve_quote(service: &mut Service, price: Decimal) -> Result<(), SettlementError> {
    if price < Decimal::ZERO {
        return Err(SettlementError::NegativePrice);
    }
    match service.price {
        Some(current) if current != price => {
            return Err(SettlementError::PriceLocked { current });
        }
        _ => {}
    }
    if service.status == ServiceStatus::Pending {
        transition(service, ServiceStatus::Scheduled)?;
    }
    service.price = Some(price);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentAction {
    Redirect { url: String },
    CollectProof,
    Blocked,
}

/// Where a stage stands from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageProgress {
    Unpaid,
    /// Proof recorded, waiting for an administrator to confirm it.
    AwaitingVerification,
    Paid,
}

pub fn is_well_formed_payment_link(link: &str) -> bool {
    let link = link.trim();
    let lower = link.to_ascii_lowercase();
    PAYMENT_LINK_SCHEMES
        .iter()
        .any(|scheme| lower.starts_with(scheme) && link.len() > scheme.len())
}

pub fn is_stage_unlocked(service: &Service, stage: PaymentStage) -> bool {
    match stage {
        PaymentStage::Signal => is_eligible_for_payment_display(service),
        PaymentStage::Final => is_final_payment_unlocked(service),
    }
}

pub fn resolve_payment_action(service: &Service, stage: PaymentStage) -> PaymentAction {
    if let Some(link) = service
        .payment_link(stage)
        .filter(|link| is_well_formed_payment_link(link))
    {
        return PaymentAction::Redirect {
            url: link.trim().to_string(),
        };
    }
    if is_stage_unlocked(service, stage) {
        PaymentAction::CollectProof
    } else {
        PaymentAction::Blocked
    }
}

/// Record a proof for `stage`. Payment status is left untouched: the proof
/// waits for verification. Locked stages take no proofs, payment link or not.
pub fn submit_proof(
    service: &Service,
    stage: PaymentStage,
    attachment: Option<Attachment>,
) -> Result<Service, SettlementError> {
    let attachment = attachment
        .filter(|a| !a.is_empty())
        .ok_or(SettlementError::MissingAttachment { stage })?;
    if !is_stage_unlocked(service, stage) {
        return Err(SettlementError::ActionBlocked { stage });
    }
    let mut updated = service.clone();
    updated.apply_patch(&ServicePatch::proof(stage, attachment));
    Ok(updated)
}

/// Administrative confirmation of a stage. Returns the new payment status.
///
/// The stage must be unlocked and carry a proof; only a zero-price service
/// is confirmed without one. A payment link does not stand in for a proof.
pub fn confirm_payment(
    service: &Service,
    stage: PaymentStage,
) -> Result<PaymentStatus, SettlementError> {
    let target = stage.settled_status();
    if service.payment_status >= target {
        return Ok(service.payment_status);
    }
    if !is_stage_unlocked(service, stage) {
        return Err(SettlementError::ActionBlocked { stage });
    }
    if service.proof(stage).is_none() && !service.is_zero_price() {
        return Err(SettlementError::ProofRequired { stage });
    }
    Ok(target)
}

/// Guard used by stores and the orchestrator before writing a payment status.
pub fn ensure_forward(from: PaymentStatus, to: PaymentStatus) -> Result<(), SettlementError> {
    if to < from {
        return Err(SettlementError::PaymentRegression { from, to });
    }
    Ok(())
}

pub fn stage_progress(service: &Service, stage: PaymentStage) -> StageProgress {
    if service.payment_status >= stage.settled_status() {
        StageProgress::Paid
    } else if service.proof(stage).is_some() {
        StageProgress::AwaitingVerification
    } else {
        StageProgress::Unpaid
    }
}

/// Each stage is exactly half of the price.
pub fn stage_amount(service: &Service, _stage: PaymentStage) -> Decimal {
    service.price.unwrap_or(Decimal::ZERO) / Decimal::TWO
}

/// Two-decimal rendering for display. Never written back to the service.
pub fn format_amount(amount: Decimal) -> String {
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    format!("{rounded:.2}")
}

/// Read hours out of a free-form duration descriptor ("4h", "5,5 horas",
/// "06:30"). Anything unparseable yields [`DEFAULT_DURATION_HOURS`].
pub fn parse_duration_hours(raw: Option<&str>) -> f64 {
    let Some(text) = raw.map(str::trim).filter(|t| !t.is_empty()) else {
        return DEFAULT_DURATION_HOURS;
    };

    if let Some((hours, minutes)) = text.split_once(':') {
        if let (Ok(hours), Ok(minutes)) = (hours.trim().parse::<u32>(), minutes.trim().parse::<u32>())
        {
            if minutes < 60 {
                return f64::from(hours) + f64::from(minutes) / 60.0;
            }
        }
        return DEFAULT_DURATION_HOURS;
    }

    let number = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect::<String>()
        .replace(',', ".");
    number
        .trim_end_matches('.')
        .parse::<f64>()
        .ok()
        .filter(|hours| hours.is_finite() && *hours >= 0.0)
        .unwrap_or(DEFAULT_DURATION_HOURS)
}

/// Step function over the level's rate row; no proration inside a bucket.
pub fn compute_payout(level: CollaboratorLevel, duration_hours: f64, rates: &RateTable) -> Decimal {
    let row = rates.row(level);
    if duration_hours <= 4.0 {
        row.hours4
    } else if duration_hours <= 6.0 {
        row.hours6
    } else {
        row.hours8
    }
}

pub fn payout_for(collaborator: &Collaborator, service: &Service, rates: &RateTable) -> Decimal {
    compute_payout(
        collaborator.level(),
        parse_duration_hours(service.duration.as_deref()),
        rates,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    fn rates() -> RateTable {
        RateTable {
            junior: RateRow {
                hours4: dec(80),
                hours6: dec(110),
                hours8: dec(140),
            },
            senior: RateRow {
                hours4: dec(95),
                hours6: dec(130),
                hours8: dec(165),
            },
            master: RateRow {
                hours4: dec(110),
                hours6: dec(150),
                hours8: dec(190),
            },
        }
    }

    fn priced(status: ServiceStatus, payment: PaymentStatus, price: i64) -> Service {
        let mut s = Service::new(Uuid::new_v4());
        s.status = status;
        s.payment_status = payment;
        s.price = Some(dec(price));
        s
    }

    fn proof() -> Attachment {
        Attachment::new(Some("image/png".into()), b"\x89PNG-receipt".to_vec())
    }

    #[test]
    fn pending_and_canceled_are_hidden_from_payment_views() {
        for status in ServiceStatus::ALL {
            let service = priced(status, PaymentStatus::Unpaid, 100);
            let expected = !matches!(status, ServiceStatus::Pending | ServiceStatus::Canceled);
            assert_eq!(is_eligible_for_payment_display(&service), expected, "{status}");
        }
    }

    #[test]
    fn final_stays_locked_until_completed_whatever_the_payment_status() {
        for status in ServiceStatus::ALL {
            for payment in [
                PaymentStatus::Unpaid,
                PaymentStatus::SignalPaid,
                PaymentStatus::FullPaid,
            ] {
                let service = priced(status, payment, 100);
                if status != ServiceStatus::Completed {
                    assert!(!is_final_payment_unlocked(&service));
                }
            }
        }
        assert!(!is_final_payment_unlocked(&priced(
            ServiceStatus::Completed,
            PaymentStatus::Unpaid,
            100
        )));
        assert!(is_final_payment_unlocked(&priced(
            ServiceStatus::Completed,
            PaymentStatus::SignalPaid,
            100
        )));
    }

    #[test]
    fn final_action_opens_once_work_is_completed() {
        let mut service = priced(ServiceStatus::InProgress, PaymentStatus::SignalPaid, 200);
        assert_eq!(
            resolve_payment_action(&service, PaymentStage::Final),
            PaymentAction::Blocked
        );
        transition(&mut service, ServiceStatus::Completed).unwrap();
        assert_eq!(
            resolve_payment_action(&service, PaymentStage::Final),
            PaymentAction::CollectProof
        );
    }

    #[test]
    fn completed_signal_paid_scenario() {
        let service = priced(ServiceStatus::Completed, PaymentStatus::SignalPaid, 200);
        assert_eq!(format_amount(stage_amount(&service, PaymentStage::Final)), "100.00");
        assert_eq!(
            resolve_payment_action(&service, PaymentStage::Final),
            PaymentAction::CollectProof
        );
    }

    #[test]
    fn external_link_takes_precedence_when_well_formed() {
        let mut service = priced(ServiceStatus::Scheduled, PaymentStatus::Unpaid, 150);
        service.payment_link_signal = Some(" https://pay.example.com/abc ".into());
        service.payment_link_final = Some("pay.example.com/final".into());

        assert_eq!(
            resolve_payment_action(&service, PaymentStage::Signal),
            PaymentAction::Redirect {
                url: "https://pay.example.com/abc".into()
            }
        );
        // malformed link falls through to the normal gating
        assert_eq!(
            resolve_payment_action(&service, PaymentStage::Final),
            PaymentAction::Blocked
        );
    }

    #[test]
    fn link_checks_scheme_and_content() {
        assert!(is_well_formed_payment_link("HTTPS://pay.example.com"));
        assert!(is_well_formed_payment_link("http://x"));
        assert!(!is_well_formed_payment_link("https://"));
        assert!(!is_well_formed_payment_link("ftp://pay.example.com"));
        assert!(!is_well_formed_payment_link(""));
    }

    #[test]
    fn signal_is_blocked_for_pending_services() {
        let service = priced(ServiceStatus::Pending, PaymentStatus::Unpaid, 100);
        assert_eq!(
            resolve_payment_action(&service, PaymentStage::Signal),
            PaymentAction::Blocked
        );
    }

    #[test]
    fn missing_attachment_leaves_service_untouched() {
        let service = priced(ServiceStatus::Scheduled, PaymentStatus::Unpaid, 100);
        let err = submit_proof(&service, PaymentStage::Signal, None).unwrap_err();
        assert_eq!(
            err,
            SettlementError::MissingAttachment {
                stage: PaymentStage::Signal
            }
        );
        assert!(service.proof_signal.is_none());

        let empty = Attachment::new(None, Vec::new());
        assert!(submit_proof(&service, PaymentStage::Signal, Some(empty)).is_err());
    }

    #[test]
    fn proof_is_recorded_pending_verification() {
        let service = priced(ServiceStatus::Scheduled, PaymentStatus::Unpaid, 100);
        let updated = submit_proof(&service, PaymentStage::Signal, Some(proof())).unwrap();
        assert_eq!(updated.proof_signal, Some(proof()));
        assert_eq!(updated.payment_status, PaymentStatus::Unpaid);
        assert_eq!(
            stage_progress(&updated, PaymentStage::Signal),
            StageProgress::AwaitingVerification
        );
        assert_eq!(stage_progress(&updated, PaymentStage::Final), StageProgress::Unpaid);
    }

    #[test]
    fn later_proof_supersedes_earlier_one() {
        let service = priced(ServiceStatus::Completed, PaymentStatus::SignalPaid, 100);
        let first = submit_proof(&service, PaymentStage::Final, Some(proof())).unwrap();
        let second_proof = Attachment::new(None, b"second".to_vec());
        let second = submit_proof(&first, PaymentStage::Final, Some(second_proof.clone())).unwrap();
        assert_eq!(second.proof_final, Some(second_proof));
    }

    #[test]
    fn confirmation_requires_a_proof() {
        let service = priced(ServiceStatus::Scheduled, PaymentStatus::Unpaid, 100);
        assert_eq!(
            confirm_payment(&service, PaymentStage::Signal),
            Err(SettlementError::ProofRequired {
                stage: PaymentStage::Signal
            })
        );
        let with_proof = submit_proof(&service, PaymentStage::Signal, Some(proof())).unwrap();
        assert_eq!(
            confirm_payment(&with_proof, PaymentStage::Signal),
            Ok(PaymentStatus::SignalPaid)
        );
    }

    #[test]
    fn final_confirmation_never_skips_the_signal() {
        let mut service = priced(ServiceStatus::Completed, PaymentStatus::Unpaid, 100);
        service.proof_final = Some(proof());
        assert_eq!(
            confirm_payment(&service, PaymentStage::Final),
            Err(SettlementError::ActionBlocked {
                stage: PaymentStage::Final
            })
        );
        service.payment_status = PaymentStatus::SignalPaid;
        assert_eq!(
            confirm_payment(&service, PaymentStage::Final),
            Ok(PaymentStatus::FullPaid)
        );
    }

    #[test]
    fn final_confirmation_waits_for_completion() {
        let mut service = priced(ServiceStatus::InProgress, PaymentStatus::SignalPaid, 100);
        service.payment_link_final = Some("https://pay.example.com/final".into());
        assert_eq!(
            confirm_payment(&service, PaymentStage::Final),
            Err(SettlementError::ActionBlocked {
                stage: PaymentStage::Final
            })
        );

        service.status = ServiceStatus::Completed;
        assert_eq!(
            confirm_payment(&service, PaymentStage::Final),
            Err(SettlementError::ProofRequired {
                stage: PaymentStage::Final
            })
        );
    }

    #[test]
    fn payment_link_never_stands_in_for_a_proof() {
        let mut service = priced(ServiceStatus::Scheduled, PaymentStatus::Unpaid, 100);
        service.payment_link_signal = Some("https://pay.example.com/signal".into());
        assert_eq!(
            confirm_payment(&service, PaymentStage::Signal),
            Err(SettlementError::ProofRequired {
                stage: PaymentStage::Signal
            })
        );
    }

    #[test]
    fn hidden_services_take_no_proofs_or_confirmations() {
        for status in [ServiceStatus::Pending, ServiceStatus::Canceled] {
            let mut service = priced(status, PaymentStatus::Unpaid, 100);
            service.payment_link_signal = Some("https://pay.example.com/signal".into());
            service.proof_signal = Some(proof());
            assert_eq!(
                submit_proof(&service, PaymentStage::Signal, Some(proof())),
                Err(SettlementError::ActionBlocked {
                    stage: PaymentStage::Signal
                })
            );
            assert_eq!(
                confirm_payment(&service, PaymentStage::Signal),
                Err(SettlementError::ActionBlocked {
                    stage: PaymentStage::Signal
                })
            );
        }
    }

    #[test]
    fn confirming_an_earlier_stage_never_regresses() {
        let service = priced(ServiceStatus::Completed, PaymentStatus::FullPaid, 100);
        assert_eq!(
            confirm_payment(&service, PaymentStage::Signal),
            Ok(PaymentStatus::FullPaid)
        );
        assert!(ensure_forward(PaymentStatus::FullPaid, PaymentStatus::SignalPaid).is_err());
    }

    #[test]
    fn payment_status_is_monotonic_under_patches() {
        let mut service = priced(ServiceStatus::Completed, PaymentStatus::Unpaid, 100);
        let sequence = [
            PaymentStatus::SignalPaid,
            PaymentStatus::Unpaid,
            PaymentStatus::FullPaid,
            PaymentStatus::SignalPaid,
        ];
        let mut previous = service.payment_status;
        for next in sequence {
            service.apply_patch(&ServicePatch::payment_status(next));
            assert!(service.payment_status >= previous);
            previous = service.payment_status;
        }
        assert_eq!(service.payment_status, PaymentStatus::FullPaid);
    }

    #[test]
    fn zero_price_services_never_block_progress() {
        let mut service = priced(ServiceStatus::Completed, PaymentStatus::Unpaid, 0);
        assert_eq!(stage_amount(&service, PaymentStage::Signal), Decimal::ZERO);
        assert!(is_final_payment_unlocked(&service));
        assert_eq!(
            confirm_payment(&service, PaymentStage::Signal),
            Ok(PaymentStatus::SignalPaid)
        );
        assert_eq!(
            confirm_payment(&service, PaymentStage::Final),
            Ok(PaymentStatus::FullPaid)
        );
        service.price = None;
        assert_eq!(format_amount(stage_amount(&service, PaymentStage::Final)), "0.00");
    }

    #[test]
    fn stage_amounts_split_the_price_exactly() {
        for raw in ["200", "0.01", "99.99", "1234.567", "0"] {
            let price: Decimal = raw.parse().unwrap();
            let mut service = priced(ServiceStatus::Scheduled, PaymentStatus::Unpaid, 0);
            service.price = Some(price);
            let signal = stage_amount(&service, PaymentStage::Signal);
            let fin = stage_amount(&service, PaymentStage::Final);
            assert_eq!(signal, fin);
            assert_eq!(signal + fin, price);
            assert_eq!(service.price, Some(price));
        }
        assert_eq!(format_amount("49.995".parse().unwrap()), "50.00");
    }

    #[test]
    fn lifecycle_graph() {
        let mut service = Service::new(Uuid::new_v4());
        assert!(transition(&mut service, ServiceStatus::InProgress).is_err());
        transition(&mut service, ServiceStatus::Scheduled).unwrap();
        transition(&mut service, ServiceStatus::InProgress).unwrap();
        assert_eq!(
            transition(&mut service, ServiceStatus::Pending),
            Err(SettlementError::InvalidTransition {
                from: ServiceStatus::InProgress,
                to: ServiceStatus::Pending
            })
        );
        transition(&mut service, ServiceStatus::Completed).unwrap();
        assert!(transition(&mut service, ServiceStatus::Scheduled).is_err());
        transition(&mut service, ServiceStatus::Canceled).unwrap();
    }

    #[test]
    fn quote_approval_sets_price_once() {
        let mut service = Service::new(Uuid::new_v4());
        assert_eq!(
            approve_quote(&mut service, dec(-1)),
            Err(SettlementError::NegativePrice)
        );
        approve_quote(&mut service, dec(200)).unwrap();
        assert_eq!(service.status, ServiceStatus::Scheduled);
        assert_eq!(service.price, Some(dec(200)));
        approve_quote(&mut service, dec(200)).unwrap();
        assert_eq!(
            approve_quote(&mut service, dec(250)),
            Err(SettlementError::PriceLocked { current: dec(200) })
        );
    }

    #[test]
    fn payout_buckets() {
        let table = rates();
        assert_eq!(compute_payout(CollaboratorLevel::Junior, 4.0, &table), table.junior.hours4);
        assert_eq!(compute_payout(CollaboratorLevel::Junior, 5.0, &table), table.junior.hours6);
        assert_eq!(compute_payout(CollaboratorLevel::Junior, 6.0, &table), table.junior.hours6);
        assert_eq!(compute_payout(CollaboratorLevel::Senior, 6.5, &table), table.senior.hours8);
        assert_eq!(compute_payout(CollaboratorLevel::Master, 10.0, &table), table.master.hours8);
        assert_eq!(compute_payout(CollaboratorLevel::Master, 0.0, &table), table.master.hours4);
    }

    #[test]
    fn duration_descriptors() {
        assert_eq!(parse_duration_hours(None), DEFAULT_DURATION_HOURS);
        assert_eq!(parse_duration_hours(Some("")), DEFAULT_DURATION_HOURS);
        assert_eq!(parse_duration_hours(Some("about a day")), DEFAULT_DURATION_HOURS);
        assert_eq!(parse_duration_hours(Some("5")), 5.0);
        assert_eq!(parse_duration_hours(Some("8h")), 8.0);
        assert_eq!(parse_duration_hours(Some("5,5 horas")), 5.5);
        assert_eq!(parse_duration_hours(Some("approx. 6.5 hours")), 6.5);
        assert_eq!(parse_duration_hours(Some("06:30")), 6.5);
        assert_eq!(parse_duration_hours(Some("06:75")), DEFAULT_DURATION_HOURS);
    }

    #[test]
    fn unknown_levels_default_to_junior() {
        let table = rates();
        let mut collaborator = Collaborator {
            id: Uuid::new_v4(),
            name: "Ana".into(),
            email: "ana@example.com".into(),
            phone: None,
            password_hash: String::new(),
            photo: None,
            level: Some("grandmaster".into()),
        };
        let mut service = Service::new(Uuid::new_v4());
        service.duration = Some("garbled".into());
        assert_eq!(payout_for(&collaborator, &service, &table), table.junior.hours4);

        collaborator.level = Some(" master ".into());
        service.duration = Some("9 horas".into());
        assert_eq!(payout_for(&collaborator, &service, &table), table.master.hours8);

        collaborator.level = None;
        assert_eq!(collaborator.level(), CollaboratorLevel::Junior);
    }

    #[test]
    fn filter_matching() {
        let client = Uuid::new_v4();
        let collaborator = Uuid::new_v4();
        let mut service = priced(ServiceStatus::Completed, PaymentStatus::Unpaid, 10);
        service.client_id = client;
        service.collaborator_id = Some(collaborator);

        assert!(ServiceFilter::all().matches(&service));
        assert!(ServiceFilter::for_client(client).matches(&service));
        assert!(!ServiceFilter::for_client(collaborator).matches(&service));
        assert!(ServiceFilter::for_collaborator(collaborator)
            .with_status(ServiceStatus::Completed)
            .matches(&service));
        assert!(!ServiceFilter::for_collaborator(collaborator)
            .with_status(ServiceStatus::Scheduled)
            .matches(&service));
        assert!(ServiceFilter::by_id(service.id).matches(&service));
    }

    #[test]
    fn wire_names_are_screaming_snake_case() {
        let mut service = priced(ServiceStatus::InProgress, PaymentStatus::SignalPaid, 200);
        service.proof_signal = Some(Attachment::new(None, vec![0xde, 0xad]));
        let json = serde_json::to_value(&service).unwrap();
        assert_eq!(json["status"], "IN_PROGRESS");
        assert_eq!(json["paymentStatus"], "SIGNAL_PAID");
        assert_eq!(json["proofSignal"]["data"], "dead");
        let typed = serde_json::to_value(Attachment::new(Some("image/png".into()), vec![1])).unwrap();
        assert_eq!(typed["mediaType"], "image/png");

        let action = serde_json::to_value(PaymentAction::Redirect {
            url: "https://p.example".into(),
        })
        .unwrap();
        assert_eq!(action["action"], "REDIRECT");
        assert_eq!("in-progress".parse::<ServiceStatus>().unwrap(), ServiceStatus::InProgress);
        assert_eq!("final".parse::<PaymentStage>().unwrap(), PaymentStage::Final);
        assert!("later".parse::<PaymentStage>().is_err());
    }
}

//! Monthly payroll processing.
//!
//! `ProcessPayroll` checks eligibility, starts the `ProcessPayments` fan-out
//! as a child orchestration, files the FPS with HMRC and polls it to a
//! verdict, then joins on the payments child. `PushPayDetails` and
//! `SyncDataFromBob` are the two HR-partner workflows that share the worker.
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PayrollConfig;
use crate::retry::ActivityFailure;
use crate::runtime::OrchestrationRegistry;

pub mod activities;
pub mod client;
pub mod pay_details;
pub mod process_payments;
pub mod process_payroll;
pub mod simulated;
pub mod state;

pub use activities::{PayDetailsActivities, PayrollActivities, register_pay_details_activities, register_payroll_activities};
pub use pay_details::{DataFromBob, PayDetails, PushPayDetailsInput};

pub const PROCESS_PAYROLL: &str = "ProcessPayroll";
pub const PROCESS_PAYMENTS: &str = "ProcessPayments";
pub const PUSH_PAY_DETAILS: &str = "PushPayDetails";
pub const SYNC_DATA_FROM_BOB: &str = "SyncDataFromBob";

/// One disbursement discovered for a payroll run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: String,
    pub amount: i64,
}

impl Payment {
    pub fn new(payment_id: impl Into<String>, amount: i64) -> Self {
        Self {
            payment_id: payment_id.into(),
            amount,
        }
    }
}

/// Opaque token identifying a submitted FPS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FpsReportReference(pub String);

impl fmt::Display for FpsReportReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of one FPS status poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FpsReportStatus {
    Pending,
    Rejected { detail: String },
    Accepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentsSummary {
    pub total: usize,
    pub reconciled: usize,
}

/// Serialized result of `ProcessPayroll`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PayrollOutcome {
    /// The payroll was not eligible; nothing was filed or paid.
    Skipped,
    Processed {
        fps_reference: FpsReportReference,
        payments: PaymentsSummary,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A counterparty gave a definitive negative answer.
    Business,
    /// Calls could not be completed.
    Infrastructure,
}

/// Terminal failures of the payroll orchestrations. The display text is
/// what ends up in the failed orchestration's history.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestrationError {
    #[error("eligibility check failed: {0}")]
    Eligibility(ActivityFailure),
    #[error("FPS submission failed: {0}")]
    FilingSubmission(ActivityFailure),
    #[error("FPS status check failed: {0}")]
    FilingStatus(ActivityFailure),
    #[error("FPS rejected by HMRC: {detail}")]
    FilingRejected { detail: String },
    #[error("{step} failed: {source}")]
    Notification { step: &'static str, source: ActivityFailure },
    #[error("payment discovery failed: {0}")]
    PaymentDiscovery(ActivityFailure),
    #[error("payments did not complete: {}", pending.join(", "))]
    PaymentsIncomplete { pending: Vec<String> },
    #[error("payments run failed: {0}")]
    ChildFailed(String),
    #[error("fetching pay details failed: {0}")]
    PayDetailsFetch(ActivityFailure),
    #[error("pushing pay details to Bob failed: {0}")]
    PayDetailsPush(ActivityFailure),
    #[error("{step} failed: {source}")]
    DataSync { step: &'static str, source: ActivityFailure },
    #[error("payload encoding: {0}")]
    Codec(String),
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrationError::FilingRejected { .. } => ErrorKind::Business,
            _ => ErrorKind::Infrastructure,
        }
    }
}

/// Registry with all payroll orchestrations bound to `config`.
pub fn payroll_orchestrations(config: Arc<PayrollConfig>) -> OrchestrationRegistry {
    let payroll_cfg = config.clone();
    let payments_cfg = config.clone();
    let push_cfg = config.clone();
    let sync_cfg = config;
    OrchestrationRegistry::builder()
        .register_typed(PROCESS_PAYROLL, move |ctx, payroll_id: String| {
            let cfg = payroll_cfg.clone();
            async move {
                process_payroll::process_payroll(ctx, payroll_id, cfg)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .register_typed(PROCESS_PAYMENTS, move |ctx, payroll_id: String| {
            let cfg = payments_cfg.clone();
            async move {
                process_payments::process_payments(ctx, payroll_id, cfg)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .register_typed(PUSH_PAY_DETAILS, move |ctx, input: PushPayDetailsInput| {
            let cfg = push_cfg.clone();
            async move {
                pay_details::push_pay_details(ctx, input, cfg)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .register_typed(SYNC_DATA_FROM_BOB, move |ctx, _input: ()| {
            let cfg = sync_cfg.clone();
            async move {
                pay_details::sync_data_from_bob(ctx, cfg)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .build()
}

//! Starting and observing payroll runs on a `Runtime`.
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::state::PayrollRun;
use super::{PROCESS_PAYROLL, PUSH_PAY_DETAILS, PayrollOutcome, PushPayDetailsInput, SYNC_DATA_FROM_BOB};
use crate::runtime::{IdReusePolicy, Runtime, StartError, WaitError};

/// Prefix of the failure text of a run that HMRC rejected.
const FILING_REJECTED: &str = "FPS rejected by HMRC: ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayrollRunError {
    #[error(transparent)]
    Wait(#[from] WaitError),
    #[error("payroll {instance}: FPS rejected: {detail}")]
    Rejected { instance: String, detail: String },
    #[error("payroll {instance} failed: {error}")]
    Failed { instance: String, error: String },
}

pub fn process_payroll_instance_id(payroll_id: &str) -> String {
    format!("process-payroll-{payroll_id}")
}

pub fn push_pay_details_instance_id(input: &PushPayDetailsInput) -> String {
    format!("push-pay-details-{}-{}", input.company_id, input.payslip_id)
}

/// Start `ProcessPayroll` for `payroll_id`. A new run is allowed only after a
/// failed one. Returns the instance id.
pub async fn start_process_payroll(rt: &Arc<Runtime>, payroll_id: &str) -> Result<String, StartError> {
    let instance = process_payroll_instance_id(payroll_id);
    rt.start_orchestration_typed(&instance, PROCESS_PAYROLL, payroll_id, IdReusePolicy::AllowDuplicateFailedOnly)
        .await?;
    Ok(instance)
}

/// Start `PushPayDetails`, superseding a push of the same payslip that is
/// still running.
pub async fn start_push_pay_details(rt: &Arc<Runtime>, input: &PushPayDetailsInput) -> Result<String, StartError> {
    let instance = push_pay_details_instance_id(input);
    rt.start_orchestration_typed(&instance, PUSH_PAY_DETAILS, input, IdReusePolicy::TerminateIfRunning)
        .await?;
    Ok(instance)
}

pub async fn start_sync_data_from_bob(rt: &Arc<Runtime>, instance: &str) -> Result<(), StartError> {
    rt.start_orchestration_typed(instance, SYNC_DATA_FROM_BOB, &(), IdReusePolicy::AllowDuplicateFailedOnly)
        .await?;
    Ok(())
}

/// Wait for the payroll run to finish and decode its outcome.
pub async fn wait_for_payroll(
    rt: &Runtime,
    payroll_id: &str,
    timeout: Duration,
) -> Result<PayrollOutcome, PayrollRunError> {
    let instance = process_payroll_instance_id(payroll_id);
    match rt.wait_for_orchestration_typed::<PayrollOutcome>(&instance, timeout).await? {
        Ok(outcome) => Ok(outcome),
        Err(error) => match error.strip_prefix(FILING_REJECTED) {
            Some(detail) => Err(PayrollRunError::Rejected {
                instance,
                detail: detail.to_string(),
            }),
            None => Err(PayrollRunError::Failed { instance, error }),
        },
    }
}

/// Current view of the payroll run, including its payments child once that
/// has started. `None` when the run does not exist.
pub async fn payroll_snapshot(rt: &Runtime, payroll_id: &str) -> Option<PayrollRun> {
    let history = rt.get_execution_history(&process_payroll_instance_id(payroll_id)).await;
    if history.is_empty() {
        return None;
    }
    let run = PayrollRun::from_history(&history);
    let payments_history = match &run.payments_instance {
        Some(child) => rt.get_execution_history(child).await,
        None => Vec::new(),
    };
    Some(run.with_payments(&payments_history))
}

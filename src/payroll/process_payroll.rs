use std::sync::Arc;

use futures::future::try_join;

use super::activities::names;
use super::{FpsReportReference, FpsReportStatus, OrchestrationError, PROCESS_PAYMENTS, PaymentsSummary, PayrollOutcome};
use crate::config::PayrollConfig;
use crate::retry::ActivityOptions;
use crate::{OrchestrationContext, durable_debug, durable_info, durable_warn};

/// `ProcessPayroll`: eligibility, then the FPS filing branch concurrently
/// with the `ProcessPayments` child, then the join.
///
/// A filing failure ends the run at once; the payments child is left
/// running. A failed payments child is reported only after filing has
/// finished.
pub async fn process_payroll(
    ctx: OrchestrationContext,
    payroll_id: String,
    config: Arc<PayrollConfig>,
) -> Result<PayrollOutcome, OrchestrationError> {
    let eligible: bool = ctx
        .call_activity_typed(names::CAN_PAYROLL_BE_PROCESSED, &payroll_id, &config.default_activity)
        .await
        .map_err(OrchestrationError::Eligibility)?;
    if !eligible {
        durable_info!(ctx, payroll_id = %payroll_id, "payroll cannot be processed; skipping");
        return Ok(PayrollOutcome::Skipped);
    }

    // Claimed immediately: the child starts before the FPS is submitted
    let payments = ctx
        .schedule_sub_orchestration_typed(PROCESS_PAYMENTS, &payroll_id)
        .map_err(OrchestrationError::Codec)?;
    let payments_branch = async move {
        Ok::<_, OrchestrationError>(payments.into_sub_orchestration_typed::<PaymentsSummary>().await)
    };

    let (fps_reference, payments) = try_join(file_fps(&ctx, &payroll_id, &config), payments_branch).await?;
    let payments = payments.map_err(OrchestrationError::ChildFailed)?;

    durable_info!(
        ctx,
        payroll_id = %payroll_id,
        fps_reference = %fps_reference,
        payments = payments.total,
        "payroll processed"
    );
    Ok(PayrollOutcome::Processed {
        fps_reference,
        payments,
    })
}

/// Submit the FPS, poll HMRC until it decides, then send the post-acceptance
/// notifications in order.
async fn file_fps(
    ctx: &OrchestrationContext,
    payroll_id: &str,
    config: &PayrollConfig,
) -> Result<FpsReportReference, OrchestrationError> {
    let reference: FpsReportReference = ctx
        .call_activity_typed(names::REPORT_FPS, payroll_id, &config.default_activity)
        .await
        .map_err(OrchestrationError::FilingSubmission)?;
    durable_info!(ctx, payroll_id = %payroll_id, fps_reference = %reference, "FPS submitted");

    let mut polls: u32 = 0;
    loop {
        let status: FpsReportStatus = ctx
            .call_activity_typed(names::CHECK_FPS_REPORT, &reference, &config.fps_check)
            .await
            .map_err(OrchestrationError::FilingStatus)?;
        polls += 1;
        match status {
            FpsReportStatus::Pending => {
                durable_debug!(ctx, fps_reference = %reference, polls, "FPS still pending");
                if !config.fps_poll_interval.is_zero() {
                    ctx.schedule_timer(config.fps_poll_interval).into_timer().await;
                }
            }
            FpsReportStatus::Rejected { detail } => {
                durable_warn!(ctx, fps_reference = %reference, detail = %detail, "FPS rejected");
                return Err(OrchestrationError::FilingRejected { detail });
            }
            FpsReportStatus::Accepted => break,
        }
    }
    durable_info!(ctx, fps_reference = %reference, polls, "FPS accepted");

    notify(ctx, names::MARK_FPS_AS_SUCCESSFUL, payroll_id, &config.notification).await?;
    notify(ctx, names::SEND_DOCUMENTS, payroll_id, &config.notification).await?;
    Ok(reference)
}

async fn notify(
    ctx: &OrchestrationContext,
    step: &'static str,
    payroll_id: &str,
    options: &ActivityOptions,
) -> Result<(), OrchestrationError> {
    ctx.call_activity_typed::<_, ()>(step, payroll_id, options)
        .await
        .map_err(|source| OrchestrationError::Notification { step, source })
}

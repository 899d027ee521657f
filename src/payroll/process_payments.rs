use std::sync::Arc;

use super::activities::names;
use super::state::PayrollProgress;
use super::{OrchestrationError, Payment, PaymentsSummary};
use crate::config::{PayrollConfig, StuckPaymentPolicy};
use crate::{ActivityFailure, OrchestrationContext, durable_error, durable_info, durable_warn, join_all};

/// `ProcessPayments`: discover the run's payments and drive each one to
/// reconciliation concurrently.
///
/// Payment tasks report back to this coordinator, which owns the progress
/// count. If any payment stops short of reconciliation the configured
/// `StuckPaymentPolicy` decides between parking the run and failing it.
pub async fn process_payments(
    ctx: OrchestrationContext,
    payroll_id: String,
    config: Arc<PayrollConfig>,
) -> Result<PaymentsSummary, OrchestrationError> {
    let payments: Vec<Payment> = ctx
        .call_activity_typed(names::FIND_PAYMENTS, &payroll_id, &config.default_activity)
        .await
        .map_err(OrchestrationError::PaymentDiscovery)?;
    let mut progress = PayrollProgress::new(payments.len());
    if payments.is_empty() {
        durable_info!(ctx, payroll_id = %payroll_id, "no payments to process");
        return Ok(progress.summary());
    }
    durable_info!(ctx, payroll_id = %payroll_id, payments = payments.len(), "processing payments");

    let outcomes = join_all(payments.iter().map(|p| drive_payment(&ctx, p, &config))).await;

    let mut pending = Vec::new();
    for (payment, outcome) in payments.iter().zip(outcomes) {
        match outcome {
            Ok(()) => progress.record_reconciled(),
            Err(_) => pending.push(payment.payment_id.clone()),
        }
    }
    if progress.is_complete() {
        durable_info!(ctx, payroll_id = %payroll_id, reconciled = progress.reconciled(), "all payments reconciled");
        return Ok(progress.summary());
    }

    match config.stuck_payments {
        StuckPaymentPolicy::Park => {
            durable_error!(
                ctx,
                payroll_id = %payroll_id,
                reconciled = progress.reconciled(),
                total = progress.total(),
                stuck = ?pending,
                "payments cannot complete; run parked until cancelled"
            );
            std::future::pending().await
        }
        StuckPaymentPolicy::Fail => Err(OrchestrationError::PaymentsIncomplete { pending }),
    }
}

/// One payment's own state machine: scheduled, confirmed paid, reconciled.
async fn drive_payment(
    ctx: &OrchestrationContext,
    payment: &Payment,
    config: &PayrollConfig,
) -> Result<(), ActivityFailure> {
    let payment_id = payment.payment_id.as_str();
    let outcome = async {
        ctx.call_activity_typed::<_, ()>(names::SCHEDULE_PAYMENT, payment, &config.schedule_payment)
            .await?;
        loop {
            let paid: bool = ctx
                .call_activity_typed(names::IS_PAYMENT_PAID, payment_id, &config.default_activity)
                .await?;
            if paid {
                break;
            }
            if !config.payment_poll_interval.is_zero() {
                ctx.schedule_timer(config.payment_poll_interval).into_timer().await;
            }
        }
        ctx.call_activity_typed::<_, ()>(names::RECONCILE_IN_ACCOUNTING_INTEGRATION, payment_id, &config.default_activity)
            .await
    }
    .await;
    if let Err(e) = &outcome {
        durable_warn!(ctx, payment_id, error = %e, "payment stopped before reconciliation");
    }
    outcome
}

//! HR-partner workflows: pushing a payslip's pay details to Bob, and the
//! periodic pull of employee data from Bob.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::OrchestrationError;
use super::activities::names;
use crate::config::PayrollConfig;
use crate::{OrchestrationContext, durable_info, durable_warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PushPayDetailsInput {
    pub company_id: String,
    pub payslip_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayDetails {
    pub company_id: String,
    pub payslip_id: String,
    /// ISO-8601 date.
    pub payday: String,
    pub first_name: String,
    pub last_name: String,
    /// Minor currency units.
    pub salary: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFromBob {
    pub employee_id: String,
    pub salary: i64,
}

/// Send one payslip's pay details to Bob.
///
/// The push runs under the bounded `pay_details_push` policy. Exhaustion
/// fails the run after a best-effort "failed" mark; the "sent" mark after a
/// successful push is best-effort too.
pub async fn push_pay_details(
    ctx: OrchestrationContext,
    input: PushPayDetailsInput,
    config: Arc<PayrollConfig>,
) -> Result<(), OrchestrationError> {
    let details: PayDetails = ctx
        .call_activity_typed(names::PULL_PAY_DETAILS, &input, &config.default_activity)
        .await
        .map_err(OrchestrationError::PayDetailsFetch)?;

    ctx.call_activity_typed::<_, ()>(names::MARK_PAY_DETAILS_AS_BEING_SENT, &details, &config.default_activity)
        .await
        .map_err(|source| OrchestrationError::Notification {
            step: names::MARK_PAY_DETAILS_AS_BEING_SENT,
            source,
        })?;

    let pushed = ctx
        .call_activity_typed::<_, ()>(names::PUSH_PAY_DETAILS_TO_BOB, &details, &config.pay_details_push)
        .await;
    if let Err(push_error) = pushed {
        durable_warn!(ctx, payslip_id = %input.payslip_id, error = %push_error, "giving up on pushing pay details");
        if let Err(e) = ctx
            .call_activity_typed::<_, ()>(names::MARK_PAY_DETAILS_AS_FAILED, &details, &config.default_activity)
            .await
        {
            durable_warn!(ctx, payslip_id = %input.payslip_id, error = %e, "could not mark pay details as failed");
        }
        return Err(OrchestrationError::PayDetailsPush(push_error));
    }

    if let Err(e) = ctx
        .call_activity_typed::<_, ()>(names::MARK_PAY_DETAILS_AS_SENT, &details, &config.default_activity)
        .await
    {
        durable_warn!(ctx, payslip_id = %input.payslip_id, error = %e, "could not mark pay details as sent");
    }
    durable_info!(ctx, company_id = %input.company_id, payslip_id = %input.payslip_id, "pay details pushed");
    Ok(())
}

pub async fn sync_data_from_bob(ctx: OrchestrationContext, config: Arc<PayrollConfig>) -> Result<(), OrchestrationError> {
    let data: DataFromBob = ctx
        .call_activity_typed(names::PULL_DATA, &(), &config.default_activity)
        .await
        .map_err(|source| OrchestrationError::DataSync {
            step: names::PULL_DATA,
            source,
        })?;
    ctx.call_activity_typed::<_, ()>(names::STORE_DATA, &data, &config.default_activity)
        .await
        .map_err(|source| OrchestrationError::DataSync {
            step: names::STORE_DATA,
            source,
        })?;
    durable_info!(ctx, employee_id = %data.employee_id, "data from Bob stored");
    Ok(())
}

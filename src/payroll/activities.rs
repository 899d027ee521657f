//! Activity contracts consumed by the payroll orchestrations and their
//! binding into an `ActivityRegistry`.
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{DataFromBob, FpsReportReference, FpsReportStatus, PayDetails, Payment, PushPayDetailsInput};
use crate::ActivityFailure;
use crate::runtime::ActivityRegistryBuilder;

/// Registered activity names. These appear in history, so renaming one
/// breaks replay of runs that are in flight.
pub mod names {
    pub const CAN_PAYROLL_BE_PROCESSED: &str = "CanPayrollBeProcessed";
    pub const REPORT_FPS: &str = "ReportFPS";
    pub const CHECK_FPS_REPORT: &str = "CheckFPSReport";
    pub const MARK_FPS_AS_SUCCESSFUL: &str = "MarkFPSAsSuccessful";
    pub const SEND_DOCUMENTS: &str = "SendDocuments";
    pub const FIND_PAYMENTS: &str = "FindPayments";
    pub const SCHEDULE_PAYMENT: &str = "SchedulePayment";
    pub const IS_PAYMENT_PAID: &str = "IsPaymentPaid";
    pub const RECONCILE_IN_ACCOUNTING_INTEGRATION: &str = "ReconcileInAccountingIntegration";

    pub const PULL_PAY_DETAILS: &str = "PullPayDetails";
    pub const MARK_PAY_DETAILS_AS_BEING_SENT: &str = "MarkPayDetailsAsBeingSent";
    pub const PUSH_PAY_DETAILS_TO_BOB: &str = "PushPayDetailsToBob";
    pub const MARK_PAY_DETAILS_AS_FAILED: &str = "MarkPayDetailsAsFailed";
    pub const MARK_PAY_DETAILS_AS_SENT: &str = "MarkPayDetailsAsSent";
    pub const PULL_DATA: &str = "PullData";
    pub const STORE_DATA: &str = "StoreData";
}

/// Remote calls made by `ProcessPayroll` and `ProcessPayments`.
#[async_trait]
pub trait PayrollActivities: Send + Sync {
    async fn can_payroll_be_processed(&self, payroll_id: String) -> Result<bool, ActivityFailure>;
    async fn report_fps(&self, payroll_id: String) -> Result<FpsReportReference, ActivityFailure>;
    async fn check_fps_report(&self, reference: FpsReportReference) -> Result<FpsReportStatus, ActivityFailure>;
    async fn mark_fps_as_successful(&self, payroll_id: String) -> Result<(), ActivityFailure>;
    async fn send_documents(&self, payroll_id: String) -> Result<(), ActivityFailure>;
    async fn find_payments(&self, payroll_id: String) -> Result<Vec<Payment>, ActivityFailure>;
    async fn schedule_payment(&self, payment: Payment) -> Result<(), ActivityFailure>;
    async fn is_payment_paid(&self, payment_id: String) -> Result<bool, ActivityFailure>;
    async fn reconcile_in_accounting_integration(&self, payment_id: String) -> Result<(), ActivityFailure>;
}

/// Remote calls made by the HR-partner workflows.
#[async_trait]
pub trait PayDetailsActivities: Send + Sync {
    async fn pull_pay_details(&self, input: PushPayDetailsInput) -> Result<PayDetails, ActivityFailure>;
    async fn mark_pay_details_as_being_sent(&self, details: PayDetails) -> Result<(), ActivityFailure>;
    async fn push_pay_details_to_bob(&self, details: PayDetails) -> Result<(), ActivityFailure>;
    async fn mark_pay_details_as_failed(&self, details: PayDetails) -> Result<(), ActivityFailure>;
    async fn mark_pay_details_as_sent(&self, details: PayDetails) -> Result<(), ActivityFailure>;
    async fn pull_data(&self) -> Result<DataFromBob, ActivityFailure>;
    async fn store_data(&self, data: DataFromBob) -> Result<(), ActivityFailure>;
}

// Adapt one trait method to the registry's JSON-in/JSON-out shape. Failures
// keep their retry classification by travelling in wire form.
fn bind<A, In, Out, F, Fut>(builder: ActivityRegistryBuilder, name: &str, target: &Arc<A>, call: F) -> ActivityRegistryBuilder
where
    A: ?Sized + Send + Sync + 'static,
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    F: Fn(Arc<A>, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, ActivityFailure>> + Send + 'static,
{
    let target = target.clone();
    builder.register_typed(name, move |input: In| {
        let pending = call(target.clone(), input);
        async move { pending.await.map_err(|e| e.to_wire()) }
    })
}

pub fn register_payroll_activities(
    builder: ActivityRegistryBuilder,
    activities: Arc<dyn PayrollActivities>,
) -> ActivityRegistryBuilder {
    let b = bind(builder, names::CAN_PAYROLL_BE_PROCESSED, &activities, |a, id: String| async move {
        a.can_payroll_be_processed(id).await
    });
    let b = bind(b, names::REPORT_FPS, &activities, |a, id: String| async move { a.report_fps(id).await });
    let b = bind(b, names::CHECK_FPS_REPORT, &activities, |a, r: FpsReportReference| async move {
        a.check_fps_report(r).await
    });
    let b = bind(b, names::MARK_FPS_AS_SUCCESSFUL, &activities, |a, id: String| async move {
        a.mark_fps_as_successful(id).await
    });
    let b = bind(b, names::SEND_DOCUMENTS, &activities, |a, id: String| async move { a.send_documents(id).await });
    let b = bind(b, names::FIND_PAYMENTS, &activities, |a, id: String| async move { a.find_payments(id).await });
    let b = bind(b, names::SCHEDULE_PAYMENT, &activities, |a, p: Payment| async move {
        a.schedule_payment(p).await
    });
    let b = bind(b, names::IS_PAYMENT_PAID, &activities, |a, id: String| async move {
        a.is_payment_paid(id).await
    });
    bind(b, names::RECONCILE_IN_ACCOUNTING_INTEGRATION, &activities, |a, id: String| async move {
        a.reconcile_in_accounting_integration(id).await
    })
}

pub fn register_pay_details_activities(
    builder: ActivityRegistryBuilder,
    activities: Arc<dyn PayDetailsActivities>,
) -> ActivityRegistryBuilder {
    let b = bind(builder, names::PULL_PAY_DETAILS, &activities, |a, input: PushPayDetailsInput| async move {
        a.pull_pay_details(input).await
    });
    let b = bind(b, names::MARK_PAY_DETAILS_AS_BEING_SENT, &activities, |a, d: PayDetails| async move {
        a.mark_pay_details_as_being_sent(d).await
    });
    let b = bind(b, names::PUSH_PAY_DETAILS_TO_BOB, &activities, |a, d: PayDetails| async move {
        a.push_pay_details_to_bob(d).await
    });
    let b = bind(b, names::MARK_PAY_DETAILS_AS_FAILED, &activities, |a, d: PayDetails| async move {
        a.mark_pay_details_as_failed(d).await
    });
    let b = bind(b, names::MARK_PAY_DETAILS_AS_SENT, &activities, |a, d: PayDetails| async move {
        a.mark_pay_details_as_sent(d).await
    });
    let b = bind(b, names::PULL_DATA, &activities, |a, _: ()| async move { a.pull_data().await });
    bind(b, names::STORE_DATA, &activities, |a, data: DataFromBob| async move { a.store_data(data).await })
}

//! Stand-in activities for the demo worker: each call sleeps for a while and
//! fails transiently some of the time.
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{
    DataFromBob, FpsReportReference, FpsReportStatus, PayDetails, PayDetailsActivities, Payment, PayrollActivities,
    PushPayDetailsInput,
};
use crate::ActivityFailure;

fn outage(rate: f64, what: &str) -> Result<(), ActivityFailure> {
    if rand::random::<f64>() < rate {
        Err(ActivityFailure::retryable(format!("{what}: service unavailable")))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedPayrollActivities {
    pub latency: Duration,
    /// Chance that any single call fails transiently.
    pub failure_rate: f64,
    /// Chance that an FPS poll still reports `Pending`.
    pub pending_rate: f64,
    /// Chance that a decided FPS is rejected.
    pub rejection_rate: f64,
    pub payments: Vec<Payment>,
}

impl Default for SimulatedPayrollActivities {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(200),
            failure_rate: 0.3,
            pending_rate: 0.5,
            rejection_rate: 0.0,
            payments: vec![Payment::new("1", 100), Payment::new("2", 200), Payment::new("3", 300)],
        }
    }
}

impl SimulatedPayrollActivities {
    async fn call(&self, what: &str) -> Result<(), ActivityFailure> {
        tokio::time::sleep(self.latency).await;
        outage(self.failure_rate, what)
    }
}

#[async_trait]
impl PayrollActivities for SimulatedPayrollActivities {
    async fn can_payroll_be_processed(&self, _payroll_id: String) -> Result<bool, ActivityFailure> {
        Ok(true)
    }

    async fn report_fps(&self, payroll_id: String) -> Result<FpsReportReference, ActivityFailure> {
        self.call("ReportFPS").await?;
        Ok(FpsReportReference(format!("fps-{payroll_id}")))
    }

    async fn check_fps_report(&self, _reference: FpsReportReference) -> Result<FpsReportStatus, ActivityFailure> {
        self.call("CheckFPSReport").await?;
        if rand::random::<f64>() < self.pending_rate {
            return Ok(FpsReportStatus::Pending);
        }
        if rand::random::<f64>() < self.rejection_rate {
            return Ok(FpsReportStatus::Rejected {
                detail: "HMRC is down".to_string(),
            });
        }
        Ok(FpsReportStatus::Accepted)
    }

    async fn mark_fps_as_successful(&self, payroll_id: String) -> Result<(), ActivityFailure> {
        info!(payroll_id = %payroll_id, "FPS accepted by HMRC");
        Ok(())
    }

    async fn send_documents(&self, payroll_id: String) -> Result<(), ActivityFailure> {
        info!(payroll_id = %payroll_id, "sending payslips to employees");
        Ok(())
    }

    async fn find_payments(&self, _payroll_id: String) -> Result<Vec<Payment>, ActivityFailure> {
        Ok(self.payments.clone())
    }

    async fn schedule_payment(&self, payment: Payment) -> Result<(), ActivityFailure> {
        self.call("SchedulePayment").await?;
        info!(payment_id = %payment.payment_id, amount = payment.amount, "payment scheduled");
        Ok(())
    }

    async fn is_payment_paid(&self, _payment_id: String) -> Result<bool, ActivityFailure> {
        self.call("IsPaymentPaid").await?;
        Ok(true)
    }

    async fn reconcile_in_accounting_integration(&self, payment_id: String) -> Result<(), ActivityFailure> {
        tokio::time::sleep(self.latency).await;
        info!(payment_id = %payment_id, "payment reconciled");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedPayDetails {
    pub latency: Duration,
    /// Chance that a push to Bob goes through.
    pub push_success_rate: f64,
}

impl Default for SimulatedPayDetails {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(200),
            push_success_rate: 1.0 / 3.0,
        }
    }
}

#[async_trait]
impl PayDetailsActivities for SimulatedPayDetails {
    async fn pull_pay_details(&self, input: PushPayDetailsInput) -> Result<PayDetails, ActivityFailure> {
        Ok(PayDetails {
            company_id: input.company_id,
            payslip_id: input.payslip_id,
            payday: "1970-01-01".to_string(),
            first_name: "Joe".to_string(),
            last_name: "Smith".to_string(),
            salary: 1_000_000,
        })
    }

    async fn mark_pay_details_as_being_sent(&self, details: PayDetails) -> Result<(), ActivityFailure> {
        info!(payslip_id = %details.payslip_id, "trying to send pay details");
        Ok(())
    }

    async fn push_pay_details_to_bob(&self, _details: PayDetails) -> Result<(), ActivityFailure> {
        tokio::time::sleep(self.latency).await;
        outage(1.0 - self.push_success_rate, "PushPayDetailsToBob")
    }

    async fn mark_pay_details_as_failed(&self, details: PayDetails) -> Result<(), ActivityFailure> {
        info!(payslip_id = %details.payslip_id, "pay details failed");
        Ok(())
    }

    async fn mark_pay_details_as_sent(&self, details: PayDetails) -> Result<(), ActivityFailure> {
        info!(payslip_id = %details.payslip_id, "pay details sent");
        Ok(())
    }

    async fn pull_data(&self) -> Result<DataFromBob, ActivityFailure> {
        Ok(DataFromBob {
            employee_id: "employee-1".to_string(),
            salary: 1_000_000,
        })
    }

    async fn store_data(&self, data: DataFromBob) -> Result<(), ActivityFailure> {
        info!(employee_id = %data.employee_id, salary = data.salary, "storing data from Bob");
        Ok(())
    }
}

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use payroll_dtf::config::PayrollConfig;
use payroll_dtf::payroll::process_payments::process_payments;
use payroll_dtf::payroll::{
    DataFromBob, FpsReportReference, FpsReportStatus, PROCESS_PAYMENTS, PayDetails, PayDetailsActivities, Payment,
    PayrollActivities, PushPayDetailsInput, payroll_orchestrations, register_pay_details_activities,
    register_payroll_activities,
};
use payroll_dtf::providers::HistoryStore;
use payroll_dtf::providers::in_memory::InMemoryHistoryStore;
use payroll_dtf::runtime::registry::ActivityHandler;
use payroll_dtf::runtime::{ActivityRegistry, Runtime};
use payroll_dtf::{Action, ActivityFailure, Event, Executor};

/// Ordered record of every activity invocation, as `Name(arg)`.
#[derive(Default)]
pub struct CallLog(Mutex<Vec<String>>);

impl CallLog {
    pub fn record(&self, name: &str, arg: &str) {
        self.0.lock().unwrap().push(format!("{name}({arg})"));
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .map(|e| e.split('(').next().unwrap_or_default().to_string())
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().iter().filter(|n| *n == name).count()
    }

    /// Entries whose name is one of `names`, in call order.
    pub fn only(&self, names: &[&str]) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| names.iter().any(|n| e.starts_with(&format!("{n}("))))
            .collect()
    }
}

/// Fake payroll backend answering from a script.
pub struct ScriptedPayroll {
    pub log: CallLog,
    eligible: bool,
    fps: Mutex<VecDeque<FpsReportStatus>>,
    fps_after_script: FpsReportStatus,
    payments: Vec<Payment>,
    never_paid: HashSet<String>,
    unpaid_polls: Mutex<HashMap<String, u32>>,
    payments_held: AtomicBool,
    rejected_schedules: HashSet<String>,
    transient: Mutex<HashMap<String, u32>>,
}

impl Default for ScriptedPayroll {
    fn default() -> Self {
        Self {
            log: CallLog::default(),
            eligible: true,
            fps: Mutex::new(VecDeque::new()),
            fps_after_script: FpsReportStatus::Accepted,
            payments: vec![Payment::new("A", 100), Payment::new("B", 200)],
            never_paid: HashSet::new(),
            unpaid_polls: Mutex::new(HashMap::new()),
            payments_held: AtomicBool::new(false),
            rejected_schedules: HashSet::new(),
            transient: Mutex::new(HashMap::new()),
        }
    }
}

impl ScriptedPayroll {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ineligible(mut self) -> Self {
        self.eligible = false;
        self
    }

    /// Answers for successive FPS polls; `Accepted` once the script runs out.
    pub fn fps_script(self, statuses: impl IntoIterator<Item = FpsReportStatus>) -> Self {
        *self.fps.lock().unwrap() = statuses.into_iter().collect();
        self
    }

    pub fn fps_after_script(mut self, status: FpsReportStatus) -> Self {
        self.fps_after_script = status;
        self
    }

    pub fn payments(mut self, payments: Vec<Payment>) -> Self {
        self.payments = payments;
        self
    }

    pub fn never_paid(mut self, payment_id: &str) -> Self {
        self.never_paid.insert(payment_id.to_string());
        self
    }

    /// `payment_id` reports unpaid for its first `polls` checks.
    pub fn paid_after(self, payment_id: &str, polls: u32) -> Self {
        self.unpaid_polls.lock().unwrap().insert(payment_id.to_string(), polls);
        self
    }

    /// Every payment reports unpaid until `release_payments`.
    pub fn hold_payments(self) -> Self {
        self.payments_held.store(true, Ordering::SeqCst);
        self
    }

    pub fn release_payments(&self) {
        self.payments_held.store(false, Ordering::SeqCst);
    }

    pub fn reject_schedule(mut self, payment_id: &str) -> Self {
        self.rejected_schedules.insert(payment_id.to_string());
        self
    }

    /// The first `times` calls of `activity` fail with a retryable error.
    pub fn transient(self, activity: &str, times: u32) -> Self {
        self.transient.lock().unwrap().insert(activity.to_string(), times);
        self
    }

    /// Drop the first `polls` scripted answers, as if they had already been
    /// handed out before a restart.
    pub fn skip_fps_polls(self, polls: usize) -> Self {
        {
            let mut fps = self.fps.lock().unwrap();
            for _ in 0..polls {
                fps.pop_front();
            }
        }
        self
    }

    fn call(&self, name: &str, arg: &str) -> Result<(), ActivityFailure> {
        self.log.record(name, arg);
        let mut transient = self.transient.lock().unwrap();
        if let Some(left) = transient.get_mut(name)
            && *left > 0
        {
            *left -= 1;
            return Err(ActivityFailure::retryable(format!("{name} unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl PayrollActivities for ScriptedPayroll {
    async fn can_payroll_be_processed(&self, payroll_id: String) -> Result<bool, ActivityFailure> {
        self.call("CanPayrollBeProcessed", &payroll_id)?;
        Ok(self.eligible)
    }

    async fn report_fps(&self, payroll_id: String) -> Result<FpsReportReference, ActivityFailure> {
        self.call("ReportFPS", &payroll_id)?;
        Ok(FpsReportReference(format!("fps-{payroll_id}")))
    }

    async fn check_fps_report(&self, reference: FpsReportReference) -> Result<FpsReportStatus, ActivityFailure> {
        self.call("CheckFPSReport", &reference.0)?;
        let next = self.fps.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fps_after_script.clone()))
    }

    async fn mark_fps_as_successful(&self, payroll_id: String) -> Result<(), ActivityFailure> {
        self.call("MarkFPSAsSuccessful", &payroll_id)
    }

    async fn send_documents(&self, payroll_id: String) -> Result<(), ActivityFailure> {
        self.call("SendDocuments", &payroll_id)
    }

    async fn find_payments(&self, payroll_id: String) -> Result<Vec<Payment>, ActivityFailure> {
        self.call("FindPayments", &payroll_id)?;
        Ok(self.payments.clone())
    }

    async fn schedule_payment(&self, payment: Payment) -> Result<(), ActivityFailure> {
        self.call("SchedulePayment", &payment.payment_id)?;
        if self.rejected_schedules.contains(&payment.payment_id) {
            return Err(ActivityFailure::non_retryable(format!(
                "payment {} rejected by bank",
                payment.payment_id
            )));
        }
        Ok(())
    }

    async fn is_payment_paid(&self, payment_id: String) -> Result<bool, ActivityFailure> {
        self.call("IsPaymentPaid", &payment_id)?;
        if self.payments_held.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if let Some(left) = self.unpaid_polls.lock().unwrap().get_mut(&payment_id)
            && *left > 0
        {
            *left -= 1;
            return Ok(false);
        }
        Ok(!self.never_paid.contains(&payment_id))
    }

    async fn reconcile_in_accounting_integration(&self, payment_id: String) -> Result<(), ActivityFailure> {
        self.call("ReconcileInAccountingIntegration", &payment_id)
    }
}

/// Fake HR partner. Pushes fail until `push_failures` is used up.
#[derive(Default)]
pub struct ScriptedPayDetails {
    pub log: CallLog,
    push_failures: Mutex<u32>,
}

impl ScriptedPayDetails {
    pub fn failing_pushes(times: u32) -> Self {
        Self {
            log: CallLog::default(),
            push_failures: Mutex::new(times),
        }
    }
}

#[async_trait]
impl PayDetailsActivities for ScriptedPayDetails {
    async fn pull_pay_details(&self, input: PushPayDetailsInput) -> Result<PayDetails, ActivityFailure> {
        self.log.record("PullPayDetails", &input.payslip_id);
        Ok(PayDetails {
            company_id: input.company_id,
            payslip_id: input.payslip_id,
            payday: "2024-01-31".to_string(),
            first_name: "Joe".to_string(),
            last_name: "Smith".to_string(),
            salary: 1_000_000,
        })
    }

    async fn mark_pay_details_as_being_sent(&self, details: PayDetails) -> Result<(), ActivityFailure> {
        self.log.record("MarkPayDetailsAsBeingSent", &details.payslip_id);
        Ok(())
    }

    async fn push_pay_details_to_bob(&self, details: PayDetails) -> Result<(), ActivityFailure> {
        self.log.record("PushPayDetailsToBob", &details.payslip_id);
        let mut left = self.push_failures.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(ActivityFailure::retryable("failed to push pay details to Bob"));
        }
        Ok(())
    }

    async fn mark_pay_details_as_failed(&self, details: PayDetails) -> Result<(), ActivityFailure> {
        self.log.record("MarkPayDetailsAsFailed", &details.payslip_id);
        Ok(())
    }

    async fn mark_pay_details_as_sent(&self, details: PayDetails) -> Result<(), ActivityFailure> {
        self.log.record("MarkPayDetailsAsSent", &details.payslip_id);
        Ok(())
    }

    async fn pull_data(&self) -> Result<DataFromBob, ActivityFailure> {
        self.log.record("PullData", "");
        Ok(DataFromBob {
            employee_id: "employee-1".to_string(),
            salary: 1_000_000,
        })
    }

    async fn store_data(&self, data: DataFromBob) -> Result<(), ActivityFailure> {
        self.log.record("StoreData", &data.employee_id);
        Ok(())
    }
}

/// Fast intervals with short, bounded waits between polls.
pub fn test_config() -> PayrollConfig {
    let mut config = PayrollConfig::fast();
    config.fps_poll_interval = Duration::from_millis(5);
    config.payment_poll_interval = Duration::from_millis(5);
    config
}

pub fn activity_registry(payroll: Arc<ScriptedPayroll>, pay_details: Arc<ScriptedPayDetails>) -> ActivityRegistry {
    let builder = register_payroll_activities(ActivityRegistry::builder(), payroll);
    register_pay_details_activities(builder, pay_details).build()
}

pub async fn start_runtime(
    payroll: Arc<ScriptedPayroll>,
    pay_details: Arc<ScriptedPayDetails>,
    config: PayrollConfig,
) -> Arc<Runtime> {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    start_runtime_with_store(store, payroll, pay_details, config).await
}

pub async fn start_runtime_with_store(
    store: Arc<dyn HistoryStore>,
    payroll: Arc<ScriptedPayroll>,
    pay_details: Arc<ScriptedPayDetails>,
    config: PayrollConfig,
) -> Arc<Runtime> {
    Runtime::start_with_store(
        store,
        Arc::new(activity_registry(payroll, pay_details)),
        payroll_orchestrations(Arc::new(config)),
    )
    .await
}

/// Poll `check` until it holds or `timeout_ms` elapses.
pub async fn wait_until<F, Fut>(timeout_ms: u64, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Synchronous host for `Executor`-driven tests. Activities run inline
/// against the registry, timers fire at once, and a `ProcessPayments` child
/// is driven to completion in place. A child that is still running after
/// `child_turn_cap` turns is left unfinished.
pub struct TestHost {
    registry: ActivityRegistry,
    config: Arc<PayrollConfig>,
    child_turn_cap: usize,
}

impl TestHost {
    pub fn new(registry: ActivityRegistry, config: PayrollConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
            child_turn_cap: 50,
        }
    }

    pub fn config(&self) -> Arc<PayrollConfig> {
        self.config.clone()
    }

    pub fn execute(&self, actions: Vec<Action>, history: &mut Vec<Event>) {
        for action in actions {
            match action {
                Action::CallActivity { id, name, input, .. } => {
                    let handler = self.registry.get(&name).expect("activity registered");
                    match futures::executor::block_on(handler.invoke(input)) {
                        Ok(result) => history.push(Event::ActivityCompleted { id, result }),
                        Err(error) => history.push(Event::ActivityFailed { id, error }),
                    }
                }
                Action::CreateTimer { id, .. } => history.push(Event::TimerFired { id }),
                Action::StartSubOrchestration { id, name, input, .. } => {
                    assert_eq!(name, PROCESS_PAYMENTS);
                    let config = self.config.clone();
                    let mut turns = 0;
                    let (_, output) = Executor::drive_to_completion(
                        Vec::new(),
                        |ctx| process_payments(ctx, input.clone(), config.clone()),
                        |actions, child_history| {
                            turns += 1;
                            if turns <= self.child_turn_cap {
                                self.execute(actions, child_history);
                            }
                        },
                    )
                    .expect("child replays deterministically");
                    match output {
                        Some(Ok(summary)) => history.push(Event::SubOrchestrationCompleted {
                            id,
                            result: serde_json::to_string(&summary).unwrap(),
                        }),
                        Some(Err(e)) => history.push(Event::SubOrchestrationFailed { id, error: e.to_string() }),
                        None => {}
                    }
                }
            }
        }
    }
}

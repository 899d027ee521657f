//! Read-only projections of payroll runs, rebuilt from stored history.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::activities::names;
use super::{FpsReportReference, FpsReportStatus, Payment, PaymentsSummary};
use crate::_typed_codec::{Codec, Json};
use crate::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayrollPhase {
    /// Waiting on the eligibility check.
    Start,
    /// Eligible; payments started and the FPS is being submitted.
    Running,
    /// Submitted; polling HMRC for a verdict.
    Polling,
    /// Filing finished; waiting on the payments run.
    Joining,
    Done,
    Failed,
}

/// Per-payment progress. Ordered so a payment only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PaymentState {
    Discovered,
    Scheduled,
    Paid,
    Reconciled,
}

/// Reconciled count against the number of discovered payments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayrollProgress {
    total: usize,
    reconciled: usize,
}

impl PayrollProgress {
    pub fn new(total: usize) -> Self {
        Self { total, reconciled: 0 }
    }

    pub fn record_reconciled(&mut self) {
        self.reconciled = (self.reconciled + 1).min(self.total);
    }

    pub fn is_complete(&self) -> bool {
        self.reconciled == self.total
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn reconciled(&self) -> usize {
        self.reconciled
    }

    pub fn summary(&self) -> PaymentsSummary {
        PaymentsSummary {
            total: self.total,
            reconciled: self.reconciled,
        }
    }
}

/// View of a `ProcessPayments` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentsRun {
    pub payments: BTreeMap<String, PaymentState>,
    pub progress: PayrollProgress,
}

impl PaymentsRun {
    pub fn from_history(history: &[Event]) -> Self {
        let scheduled = scheduled_activities(history);
        let mut payments: BTreeMap<String, PaymentState> = BTreeMap::new();
        let mut discovered = 0;
        for ev in history {
            let Event::ActivityCompleted { id, result } = ev else { continue };
            let Some((name, input)) = scheduled.get(id) else { continue };
            match *name {
                names::FIND_PAYMENTS => {
                    for p in Json::decode::<Vec<Payment>>(result).unwrap_or_default() {
                        discovered += 1;
                        payments.entry(p.payment_id).or_insert(PaymentState::Discovered);
                    }
                }
                names::SCHEDULE_PAYMENT => {
                    if let Ok(p) = Json::decode::<Payment>(input) {
                        advance(&mut payments, p.payment_id, PaymentState::Scheduled);
                    }
                }
                names::IS_PAYMENT_PAID => {
                    if Json::decode::<bool>(result).unwrap_or(false) {
                        advance(&mut payments, (*input).to_string(), PaymentState::Paid);
                    }
                }
                names::RECONCILE_IN_ACCOUNTING_INTEGRATION => {
                    advance(&mut payments, (*input).to_string(), PaymentState::Reconciled);
                }
                _ => {}
            }
        }
        let mut progress = PayrollProgress::new(discovered);
        for _ in payments.values().filter(|s| **s == PaymentState::Reconciled) {
            progress.record_reconciled();
        }
        Self { payments, progress }
    }
}

fn advance(payments: &mut BTreeMap<String, PaymentState>, payment_id: String, to: PaymentState) {
    let state = payments.entry(payment_id).or_insert(PaymentState::Discovered);
    *state = (*state).max(to);
}

fn scheduled_activities(history: &[Event]) -> HashMap<u64, (&str, &str)> {
    history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { id, name, input, .. } => Some((*id, (name.as_str(), input.as_str()))),
            _ => None,
        })
        .collect()
}

/// View of a `ProcessPayroll` run, optionally joined with its payments child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayrollRun {
    pub payroll_id: String,
    pub phase: PayrollPhase,
    pub eligible: Option<bool>,
    pub fps_reference: Option<FpsReportReference>,
    pub fps_status: Option<FpsReportStatus>,
    /// Answered status polls, including the deciding one.
    pub fps_polls: u32,
    /// Instance id of the `ProcessPayments` child, once started.
    pub payments_instance: Option<String>,
    pub payments: Option<PaymentsRun>,
    pub error: Option<String>,
}

impl PayrollRun {
    pub fn from_history(history: &[Event]) -> Self {
        let scheduled = scheduled_activities(history);
        let mut run = PayrollRun {
            payroll_id: String::new(),
            phase: PayrollPhase::Start,
            eligible: None,
            fps_reference: None,
            fps_status: None,
            fps_polls: 0,
            payments_instance: None,
            payments: None,
            error: None,
        };
        for ev in history {
            match ev {
                Event::OrchestrationStarted { input, .. } => {
                    run.payroll_id = Json::decode::<String>(input).unwrap_or_else(|_| input.clone());
                }
                Event::SubOrchestrationScheduled { instance, .. } => {
                    run.payments_instance = Some(instance.clone());
                }
                Event::ActivityScheduled { name, .. } if name == names::CHECK_FPS_REPORT => {
                    if run.phase == PayrollPhase::Running {
                        run.phase = PayrollPhase::Polling;
                    }
                }
                Event::ActivityCompleted { id, result } => {
                    let Some((name, _)) = scheduled.get(id) else { continue };
                    match *name {
                        names::CAN_PAYROLL_BE_PROCESSED => {
                            let eligible = Json::decode::<bool>(result).unwrap_or(false);
                            run.eligible = Some(eligible);
                            if eligible {
                                run.phase = PayrollPhase::Running;
                            }
                        }
                        names::REPORT_FPS => {
                            run.fps_reference = Json::decode::<FpsReportReference>(result).ok();
                        }
                        names::CHECK_FPS_REPORT => {
                            run.fps_polls += 1;
                            run.fps_status = Json::decode::<FpsReportStatus>(result).ok();
                        }
                        names::SEND_DOCUMENTS => run.phase = PayrollPhase::Joining,
                        _ => {}
                    }
                }
                Event::OrchestrationCompleted { .. } => run.phase = PayrollPhase::Done,
                Event::OrchestrationFailed { error } => {
                    run.phase = PayrollPhase::Failed;
                    run.error = Some(error.clone());
                }
                _ => {}
            }
        }
        run
    }

    pub fn with_payments(mut self, payments_history: &[Event]) -> Self {
        if !payments_history.is_empty() {
            self.payments = Some(PaymentsRun::from_history(payments_history));
        }
        self
    }
}

use std::sync::Arc;
use std::time::Duration;

use payroll_dtf::config::PayrollConfig;
use payroll_dtf::payroll::client::{
    start_process_payroll, start_push_pay_details, start_sync_data_from_bob, wait_for_payroll,
};
use payroll_dtf::payroll::simulated::{SimulatedPayDetails, SimulatedPayrollActivities};
use payroll_dtf::payroll::{
    PushPayDetailsInput, payroll_orchestrations, register_pay_details_activities, register_payroll_activities,
};
use payroll_dtf::providers::HistoryStore;
use payroll_dtf::providers::fs::FsHistoryStore;
use payroll_dtf::providers::in_memory::InMemoryHistoryStore;
use payroll_dtf::runtime::{ActivityRegistry, Runtime, StartError};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    payroll_dtf::logging::init_tracing();

    // Demo defaults keep intervals short; PAYROLL_CONFIG points at a TOML file
    let config = match std::env::var("PAYROLL_CONFIG") {
        Ok(path) => PayrollConfig::from_path(&path)?,
        Err(_) => PayrollConfig::fast(),
    };
    let store: Arc<dyn HistoryStore> = match std::env::var("PAYROLL_DATA_DIR") {
        Ok(dir) => Arc::new(FsHistoryStore::new(dir, false)),
        Err(_) => Arc::new(InMemoryHistoryStore::default()),
    };

    let activities = register_payroll_activities(
        ActivityRegistry::builder(),
        Arc::new(SimulatedPayrollActivities {
            latency: Duration::from_millis(50),
            ..Default::default()
        }),
    );
    let activities = register_pay_details_activities(activities, Arc::new(SimulatedPayDetails::default())).build();
    let rt = Runtime::start_with_store(store, Arc::new(activities), payroll_orchestrations(Arc::new(config))).await;

    let resumed = rt.resume_all().await;
    if resumed > 0 {
        info!(resumed, "picked up runs from a previous worker");
    }

    let payroll_id = std::env::args().nth(1).unwrap_or_else(|| "2024-01".to_string());
    match start_process_payroll(&rt, &payroll_id).await {
        Ok(instance) => info!(instance = %instance, "payroll started"),
        Err(StartError::AlreadyRunning(instance)) => info!(instance = %instance, "payroll already running"),
        Err(e) => warn!(error = %e, "payroll not started"),
    }
    let push = PushPayDetailsInput {
        company_id: "acme".to_string(),
        payslip_id: format!("{payroll_id}-001"),
    };
    let push_instance = start_push_pay_details(&rt, &push).await?;
    let sync_instance = format!("sync-data-from-bob-{payroll_id}");
    if let Err(e) = start_sync_data_from_bob(&rt, &sync_instance).await {
        warn!(error = %e, "sync not started");
    }

    match wait_for_payroll(&rt, &payroll_id, Duration::from_secs(120)).await {
        Ok(outcome) => info!(?outcome, "payroll finished"),
        Err(e) => warn!(error = %e, "payroll did not succeed"),
    }
    for instance in [push_instance, sync_instance] {
        match rt.wait_for_orchestration(&instance, Duration::from_secs(60)).await {
            Ok(status) => info!(instance = %instance, ?status, "finished"),
            Err(e) => warn!(instance = %instance, error = %e, "still running"),
        }
    }

    rt.shutdown().await;
    Ok(())
}

//! Range Manager operator front-end
//!
//! Loads the configuration, takes the run lock, then asks the operator
//! whether to create or delete a tenant's accounts.

use anyhow::{Context, Result};
use tracing::{info, Instrument};
use uuid::Uuid;

use range_orchestrator::lock::RunLock;
use range_orchestrator::wizard::{MenuAction, OperatorWizard};
use range_orchestrator::{load_config, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "range_orchestrator=info,range_manager=info".into()),
        )
        .init();

    let config = load_config().await.context("Failed to load configuration")?;
    let _lock = RunLock::acquire(
        &config.run_lock.path,
        std::time::Duration::from_secs(config.run_lock.stale_after_secs),
    )
    .context("Cannot start a run")?;

    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("run", %run_id);
    run(config).instrument(span).await
}

async fn run(config: range_orchestrator::RangeConfig) -> Result<()> {
    info!("🛰️ Range Manager starting with {} host(s)", config.hosts.len());
    let max_accounts = config.provisioning.max_accounts;
    let orchestrator = Orchestrator::from_config(config).context("Failed to set up the remote clients")?;

    OperatorWizard::banner();
    match OperatorWizard::choose_action()? {
        MenuAction::Create => {
            let tenant = OperatorWizard::prompt_tenant()?;
            let count = OperatorWizard::prompt_count(max_accounts)?;
            let report = orchestrator
                .create_for_tenant(&tenant, count)
                .await
                .with_context(|| format!("Provisioning for tenant {tenant} failed"))?;
            OperatorWizard::print_create_report(&report);
        }
        MenuAction::Delete => {
            let wizard = OperatorWizard;
            match orchestrator
                .delete_with_selection(&wizard)
                .await
                .context("Deletion failed")?
            {
                Some(report) => OperatorWizard::print_delete_report(&report),
                None => println!("No tenant deleted."),
            }
        }
        MenuAction::Quit => println!("Bye."),
    }

    Ok(())
}

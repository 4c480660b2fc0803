//! Credential manifest written at the end of a create run.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::models::{tenant_of, ProvisionedAccount};

const HEADER: &str = "--- Provisioned accounts ---";
const DELIMITER_WIDTH: usize = 30;

/// `<dir>/<tenant>_accounts.txt`
pub fn manifest_path(dir: &Path, tenant: &str) -> PathBuf {
    dir.join(format!("{tenant}_accounts.txt"))
}

pub fn render(accounts: &[ProvisionedAccount]) -> String {
    let delimiter = "-".repeat(DELIMITER_WIDTH);
    let mut out = format!("{HEADER}\n\n");
    for account in accounts {
        out.push_str(&format!("Username: {}\n", account.username));
        out.push_str(&format!("Password: {}\n", account.password));
        out.push_str(&format!("Connection: {}\n", account.connection_name));
        out.push_str(&format!("IP: {}\n", account.ip_display()));
        out.push_str(&delimiter);
        out.push_str("\n\n");
    }
    out
}

/// Write the manifest and return its path.
///
/// The file is named after the tenant of the first account, falling back to
/// `tenant` when no account was reconciled.
pub async fn write_manifest(dir: &Path, tenant: &str, accounts: &[ProvisionedAccount]) -> std::io::Result<PathBuf> {
    let name = accounts
        .first()
        .map(|a| tenant_of(&a.username))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| tenant.to_string());

    fs::create_dir_all(dir).await?;
    let path = manifest_path(dir, &name);
    fs::write(&path, render(accounts)).await?;

    info!("Manifest with {} account(s) written to {}", accounts.len(), path.display());
    Ok(path)
}

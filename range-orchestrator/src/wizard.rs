//! Interactive operator prompts
//!
//! The `range-manager` front-end: action menu, tenant name and account
//! count prompts, tenant choice for deletion and run summaries.

use anyhow::Result;
use std::io::{self, Write};

use crate::models::NO_IP_SENTINEL;
use crate::orchestrator::{AccessOutcome, CreateReport, DeleteReport, TenantSelector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    Create,
    Delete,
    Quit,
}

pub struct OperatorWizard;

/// Account count between 1 and `max`.
pub fn parse_count(input: &str, max: u32) -> std::result::Result<u32, String> {
    let count: u32 = input
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number", input.trim()))?;
    if count == 0 || count > max {
        return Err(format!("enter a number between 1 and {max}"));
    }
    Ok(count)
}

/// 1-based choice among `candidates`; empty input cancels.
pub fn parse_selection(input: &str, candidates: &[String]) -> std::result::Result<Option<String>, String> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }
    if let Some(name) = candidates.iter().find(|c| c.as_str() == input) {
        return Ok(Some(name.clone()));
    }
    let index: usize = input.parse().map_err(|_| format!("unknown tenant '{input}'"))?;
    candidates
        .get(index.wrapping_sub(1))
        .cloned()
        .map(Some)
        .ok_or_else(|| format!("choose between 1 and {}", candidates.len()))
}

pub fn is_valid_tenant(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}

impl OperatorWizard {
    pub fn banner() {
        println!();
        println!("🛰️  ======================================");
        println!("   RANGE MANAGER");
        println!("🛰️  ======================================");
        println!();
    }

    pub fn choose_action() -> Result<MenuAction> {
        println!("❓ What do you want to do?");
        println!("  1 - Create accounts");
        println!("  2 - Delete accounts");
        println!("  q - Quit");

        loop {
            match Self::read_line("Choice [1]: ")?.as_str() {
                "" | "1" => return Ok(MenuAction::Create),
                "2" => return Ok(MenuAction::Delete),
                "q" | "quit" => return Ok(MenuAction::Quit),
                _ => println!("❌ Invalid choice. Please select 1, 2 or q."),
            }
        }
    }

    pub fn prompt_tenant() -> Result<String> {
        loop {
            let name = Self::read_line("❓ Tenant name (letters and digits): ")?;
            if is_valid_tenant(&name) {
                return Ok(name);
            }
            println!("❌ The tenant name must be alphanumeric. Please try again.");
        }
    }

    pub fn prompt_count(max: u32) -> Result<u32> {
        loop {
            let input = Self::read_line(&format!("❓ Number of accounts (1-{max}): "))?;
            match parse_count(&input, max) {
                Ok(count) => return Ok(count),
                Err(e) => println!("❌ Invalid input: {}. Please try again.", e),
            }
        }
    }

    pub fn print_create_report(report: &CreateReport) {
        println!();
        println!("📋 CREATE SUMMARY ({})", report.tenant);
        println!("────────────────────────────────────────");
        println!("🖥️  Host: {}", report.host);
        println!("✅ Accounts: {}/{}", report.accounts.len(), report.requested);
        for account in &report.accounts {
            let marker = if account.ip.is_some() { "  " } else { "⚠️" };
            println!("   {} {} -> {}", marker, account.username, account.ip_display());
        }
        if report.accounts.iter().any(|a| a.ip.is_none()) {
            println!("   ({} means the instance had no address yet)", NO_IP_SENTINEL);
        }
        match &report.manifest {
            Some(path) => println!("💾 Manifest: {}", path.display()),
            None => println!("💾 No manifest written"),
        }
        Self::print_failures(report.failures.iter().map(|f| (f.stage.to_string(), &f.entity, &f.detail)));
        println!();
    }

    pub fn print_delete_report(report: &DeleteReport) {
        println!();
        println!("📋 DELETE SUMMARY ({})", report.tenant);
        println!("────────────────────────────────────────");
        println!("🗑️  Instances deleted: {}", report.deleted.len());
        if !report.already_absent.is_empty() {
            println!("   Already absent: {:?}", report.already_absent);
        }
        match &report.access {
            AccessOutcome::Revoked(revoked) => {
                println!("🔐 Connections deleted: {}", revoked.connections_deleted.len());
                println!("🔐 Users deleted: {}", revoked.users_deleted.len());
                for absent in &revoked.already_absent {
                    println!("   {} already deleted", absent);
                }
                Self::print_failures(revoked.failures.iter().map(|f| (f.stage.to_string(), &f.entity, &f.detail)));
            }
            AccessOutcome::Failed(reason) => println!("❌ Access not revoked: {}", reason),
        }
        Self::print_failures(report.failures.iter().map(|f| (f.stage.to_string(), &f.entity, &f.detail)));
        println!();
    }

    fn print_failures<'a>(failures: impl Iterator<Item = (String, &'a String, &'a String)>) {
        for (stage, entity, detail) in failures {
            println!("❌ [{}] {}: {}", stage, entity, detail);
        }
    }

    fn read_line(prompt: &str) -> io::Result<String> {
        print!("{}", prompt);
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim().to_string())
    }
}

impl TenantSelector for OperatorWizard {
    fn select_tenant(&self, candidates: &[String]) -> io::Result<Option<String>> {
        println!("❓ Select the tenant to delete:");
        for (i, name) in candidates.iter().enumerate() {
            println!("  {} - {}", i + 1, name);
        }

        loop {
            let input = Self::read_line("Choice (empty to cancel): ")?;
            match parse_selection(&input, candidates) {
                Ok(choice) => return Ok(choice),
                Err(e) => println!("❌ {}. Please try again.", e),
            }
        }
    }
}

//! `permgraph verify-activities`

use anyhow::{Context as _, Result};
use permgraph_core::audit::SignatureAudit;
use permgraph_core::{AuditGuard, IntegritySigner};

use super::{Context, exit_codes, finish};

/// Verifies every stored activity signature. Exits with
/// [`exit_codes::FINDINGS`] when any record fails verification.
pub fn run(ctx: &Context, json: bool) -> u8 {
    finish("verify-activities", execute(ctx, json))
}

fn execute(ctx: &Context, json: bool) -> Result<u8> {
    let key_env = &ctx.config.integrity.signing_key_env;
    let key = ctx
        .config
        .integrity
        .signing_key()
        .with_context(|| format!("signing key not set (expected in ${key_env})"))?;

    let store = ctx.open_store()?;
    let guard = AuditGuard::from_config(store, &ctx.config, IntegritySigner::new(key))?;
    let audit = guard
        .audit_signatures()
        .context("signature verification failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&audit)?);
    } else {
        print_audit(&audit);
    }

    Ok(if audit.is_clean() {
        exit_codes::SUCCESS
    } else {
        exit_codes::FINDINGS
    })
}

fn print_audit(audit: &SignatureAudit) {
    println!(
        "Checked {} activities: {} valid, {} tampered, {} unsigned",
        audit.checked,
        audit.valid,
        audit.tampered.len(),
        audit.unsigned.len()
    );
    for id in &audit.tampered {
        println!("  tampered: activity {id}");
    }
    for id in &audit.unsigned {
        println!("  unsigned: activity {id}");
    }
}

//! `permgraph validate`

use anyhow::{Context as _, Result};
use permgraph_core::{DependencyService, IntegrityReport};

use super::{Context, exit_codes, finish};

/// Runs the integrity audit. Exits with [`exit_codes::FINDINGS`] when the
/// graph has cycles or dangling edges.
pub fn run(ctx: &Context, json: bool) -> u8 {
    finish("validate", execute(ctx, json))
}

fn execute(ctx: &Context, json: bool) -> Result<u8> {
    let store = ctx.open_store()?;
    let service = DependencyService::from_config(store, &ctx.config.graph);
    let report = service
        .validate_integrity()
        .context("integrity validation failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.is_valid {
        exit_codes::SUCCESS
    } else {
        exit_codes::FINDINGS
    })
}

fn print_report(report: &IntegrityReport) {
    if report.is_valid {
        println!("Dependency graph is valid");
    } else {
        println!("Dependency graph is INVALID");
    }

    for cycle in &report.cycles {
        let mut names: Vec<&str> = cycle.iter().map(|p| p.name.as_str()).collect();
        if let Some(first) = names.first().copied() {
            names.push(first);
        }
        println!("  cycle: {}", names.join(" -> "));
    }
    for edge in &report.dangling_edges {
        println!("  dangling edge: {edge}");
    }
    for finding in &report.cross_module {
        println!(
            "  note: cross-module dependency {} -> {}",
            finding.permission.name, finding.depends_on.name
        );
    }
}

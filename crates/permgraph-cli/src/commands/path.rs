//! `permgraph path <from> <to>`

use anyhow::{Context as _, Result, anyhow};
use permgraph_core::store::PermissionStore;
use permgraph_core::{DependencyService, Permission, SqliteStore};

use super::{Context, exit_codes, finish};

/// Prints the shortest dependency path from `from` to `to`. Exits with
/// [`exit_codes::FINDINGS`] when `from` does not depend on `to`.
pub fn run(ctx: &Context, from: &str, to: &str) -> u8 {
    finish("path", execute(ctx, from, to))
}

fn execute(ctx: &Context, from: &str, to: &str) -> Result<u8> {
    let store = ctx.open_store()?;
    let from = lookup(&store, from)?;
    let to = lookup(&store, to)?;

    let service = DependencyService::from_config(store, &ctx.config.graph);
    match service
        .dependency_path(from.id, to.id)
        .context("path query failed")?
    {
        Some(path) => {
            let names: Vec<&str> = path.iter().map(|p| p.name.as_str()).collect();
            println!("{}", names.join(" -> "));
            Ok(exit_codes::SUCCESS)
        },
        None => {
            println!("{} does not depend on {}", from.name, to.name);
            Ok(exit_codes::FINDINGS)
        },
    }
}

fn lookup(store: &SqliteStore, name: &str) -> Result<Permission> {
    store
        .permission_by_name(name)
        .with_context(|| format!("failed to look up permission {name}"))?
        .ok_or_else(|| anyhow!("unknown permission: {name}"))
}

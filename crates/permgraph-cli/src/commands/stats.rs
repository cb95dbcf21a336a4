//! `permgraph stats`

use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use permgraph_core::audit::risk_distribution;
use permgraph_core::store::ActivityStore;
use permgraph_core::{DependencyService, GraphStatistics};
use serde::Serialize;

use super::{Context, exit_codes, finish};

#[derive(Debug, Serialize)]
struct StatsOutput {
    graph: GraphStatistics,
    activity_count: usize,
    activities_by_risk_level: BTreeMap<u8, usize>,
}

/// Prints graph statistics and the activity risk distribution as JSON.
pub fn run(ctx: &Context) -> u8 {
    finish("stats", execute(ctx))
}

fn execute(ctx: &Context) -> Result<u8> {
    let store = ctx.open_store()?;
    let activities = store.activities().context("failed to read activities")?;
    let activities_by_risk_level = risk_distribution(&activities);

    let service = DependencyService::from_config(store, &ctx.config.graph);
    let output = StatsOutput {
        graph: service.statistics().context("failed to compute statistics")?,
        activity_count: activities.len(),
        activities_by_risk_level,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(exit_codes::SUCCESS)
}

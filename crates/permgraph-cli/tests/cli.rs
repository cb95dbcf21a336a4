//! Runs the `permgraph` binary against databases prepared with the library.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;

use permgraph_core::audit::NewActivity;
use permgraph_core::cache::InMemoryClosureCache;
use permgraph_core::graph::DependencyEdge;
use permgraph_core::permission::{NewPermission, PermissionId};
use permgraph_core::store::{ActivityStore, PermissionStore};
use permgraph_core::{
    AuditGuard, DependencyService, IntegritySigner, PermissionCatalog, SigningPolicy, SqliteStore,
};
use secrecy::SecretString;
use tempfile::TempDir;

const KEY_ENV: &str = "PERMGRAPH_SIGNING_KEY";
const KEY: &str = "cli-test-signing-key";

fn permgraph(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_permgraph"))
        .current_dir(dir)
        .env(KEY_ENV, KEY)
        .args(args)
        .output()
        .unwrap()
}

fn id_of(store: &SqliteStore, name: &str) -> PermissionId {
    store.permission_by_name(name).unwrap().unwrap().id
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Creates `users.delete -> users.edit -> users.view -> dashboard.view`.
fn seeded(dir: &TempDir) -> (PathBuf, Arc<SqliteStore>) {
    let path = dir.path().join("permgraph.db");
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let cache = Arc::new(InMemoryClosureCache::new());
    let catalog = PermissionCatalog::new(Arc::clone(&store), cache.clone());
    let graph = DependencyService::new(Arc::clone(&store), cache);

    let ids: Vec<_> = ["users.delete", "users.edit", "users.view", "dashboard.view"]
        .into_iter()
        .map(|name| catalog.create(&NewPermission::new(name)).unwrap().id)
        .collect();
    for pair in ids.windows(2) {
        graph.add_dependency(pair[0], pair[1]).unwrap();
    }
    (path, store)
}

#[test]
fn validate_reports_clean_then_injected_cycle() {
    let dir = TempDir::new().unwrap();
    let (db, store) = seeded(&dir);
    let db = db.to_str().unwrap();

    let ok = permgraph(dir.path(), &["--database", db, "validate"]);
    assert_eq!(ok.status.code(), Some(0), "{}", stdout(&ok));
    assert!(stdout(&ok).contains("valid"));

    let delete = id_of(&store, "users.delete");
    let dashboard = id_of(&store, "dashboard.view");
    store
        .insert_edge_unchecked(DependencyEdge::new(dashboard, delete))
        .unwrap();

    let bad = permgraph(dir.path(), &["--database", db, "validate", "--json"]);
    assert_eq!(bad.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_str(&stdout(&bad)).unwrap();
    assert_eq!(report["is_valid"], false);
    assert_eq!(report["cycles"].as_array().unwrap().len(), 1);
}

#[test]
fn path_prints_names() {
    let dir = TempDir::new().unwrap();
    let (db, _store) = seeded(&dir);
    let db = db.to_str().unwrap();

    let found = permgraph(
        dir.path(),
        &["--database", db, "path", "users.delete", "dashboard.view"],
    );
    assert_eq!(found.status.code(), Some(0));
    assert_eq!(
        stdout(&found).trim(),
        "users.delete -> users.edit -> users.view -> dashboard.view"
    );

    let none = permgraph(
        dir.path(),
        &["--database", db, "path", "dashboard.view", "users.delete"],
    );
    assert_eq!(none.status.code(), Some(1));

    let unknown = permgraph(dir.path(), &["--database", db, "path", "nope.x", "users.view"]);
    assert_eq!(unknown.status.code(), Some(2));
}

#[test]
fn verify_activities_detects_tampering() {
    let dir = TempDir::new().unwrap();
    let (db, store) = seeded(&dir);
    let db = db.to_str().unwrap();

    let guard = AuditGuard::new(
        Arc::clone(&store),
        IntegritySigner::new(SecretString::from(KEY.to_string())),
        SigningPolicy::FailClosed,
    );
    let activity = guard
        .create(NewActivity::new("role_assigned", "Granted editor").causer("user", 1))
        .unwrap();

    let clean = permgraph(dir.path(), &["--database", db, "verify-activities"]);
    assert_eq!(clean.status.code(), Some(0), "{}", stdout(&clean));

    let mut forged = activity;
    forged.description = "Granted viewer".to_string();
    store.replace_activity(&forged).unwrap();

    let tampered = permgraph(dir.path(), &["--database", db, "verify-activities", "--json"]);
    assert_eq!(tampered.status.code(), Some(1));
    let audit: serde_json::Value = serde_json::from_str(&stdout(&tampered)).unwrap();
    assert_eq!(audit["tampered"], serde_json::json!([forged.id.unwrap().0]));
}

#[test]
fn stats_and_missing_database() {
    let dir = TempDir::new().unwrap();
    let (db, store) = seeded(&dir);
    let guard = AuditGuard::new(
        Arc::clone(&store),
        IntegritySigner::new(SecretString::from(KEY.to_string())),
        SigningPolicy::FailClosed,
    );
    for level in [4, 4, 8] {
        guard
            .create(NewActivity::new("role_assigned", "Granted editor").risk_level(level))
            .unwrap();
    }

    let stats = permgraph(dir.path(), &["--database", db.to_str().unwrap(), "stats"]);
    assert_eq!(stats.status.code(), Some(0));
    let json: serde_json::Value = serde_json::from_str(&stdout(&stats)).unwrap();
    assert_eq!(json["graph"]["permission_count"], 4);
    assert_eq!(json["graph"]["edge_count"], 3);
    assert_eq!(json["graph"]["max_depth"], 3);
    assert_eq!(json["activity_count"], 3);
    assert_eq!(json["activities_by_risk_level"]["4"], 2);
    assert_eq!(json["activities_by_risk_level"]["8"], 1);

    let missing = permgraph(dir.path(), &["--database", "absent.db", "stats"]);
    assert_eq!(missing.status.code(), Some(2));
}

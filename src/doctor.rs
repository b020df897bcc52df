use sluice_core::config::AppConfig;
use sluice_core::traits::MetadataBackend;

use crate::demo;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

pub fn run_doctor(config: &AppConfig) {
    let mut checks = Vec::new();

    // 1. Workspace dir exists and writable
    checks.push(check_workspace(config));

    // 2. Metadata backend opens
    checks.push(check_metadata(config));

    // 3. Resource directories and include patterns
    checks.extend(check_resources(config));

    // 4. Graph builds: unique names, known predecessors, no cycles
    checks.push(check_graph(config));

    // 5. Event log directory
    checks.push(check_log_dir(config));

    // Print results
    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_workspace(config: &AppConfig) -> CheckResult {
    let ws = config.workspace_dir();
    if ws.exists() && ws.is_dir() {
        // Check writable by attempting to create a temp file
        let test_file = ws.join(".doctor_test");
        match std::fs::write(&test_file, "test") {
            Ok(_) => {
                std::fs::remove_file(&test_file).ok();
                CheckResult {
                    label: "Workspace".into(),
                    ok: true,
                    detail: format!("{}", ws.display()),
                }
            }
            Err(e) => CheckResult {
                label: "Workspace".into(),
                ok: false,
                detail: format!("{} (not writable: {})", ws.display(), e),
            },
        }
    } else {
        CheckResult {
            label: "Workspace".into(),
            ok: false,
            detail: format!("{} (does not exist)", ws.display()),
        }
    }
}

fn check_metadata(config: &AppConfig) -> CheckResult {
    match demo::open_metadata_backend(config) {
        Ok(backend) => {
            let runs = backend.runs().map(|r| r.len()).unwrap_or(0);
            CheckResult {
                label: "Metadata".into(),
                ok: true,
                detail: format!("{} backend, {} runs recorded", backend.name(), runs),
            }
        }
        Err(e) => CheckResult {
            label: "Metadata".into(),
            ok: false,
            detail: format!("{}: {}", config.resolve(&config.metadata.path).display(), e),
        },
    }
}

fn check_resources(config: &AppConfig) -> Vec<CheckResult> {
    demo::resources(config)
        .iter()
        .map(|res| {
            let label = format!("Resource '{}'", res.name);
            match demo::open_resource(config, res) {
                Ok(_) => CheckResult {
                    label,
                    ok: true,
                    detail: format!(
                        "{} ({}, threshold {})",
                        config.resolve(&res.path).display(),
                        if res.monitoring { "monitored" } else { "passive" },
                        res.trigger_threshold
                    ),
                },
                Err(e) => CheckResult {
                    label,
                    ok: false,
                    detail: e.to_string(),
                },
            }
        })
        .collect()
}

fn check_graph(config: &AppConfig) -> CheckResult {
    // Read-only build runs the same name, predecessor and cycle validation as `run`
    match demo::inspect(config) {
        Ok(demo) => CheckResult {
            label: "Graph".into(),
            ok: true,
            detail: format!("{} nodes", demo.pipeline.node_names().len()),
        },
        Err(e) => CheckResult {
            label: "Graph".into(),
            ok: false,
            detail: e.to_string(),
        },
    }
}

fn check_log_dir(config: &AppConfig) -> CheckResult {
    match config.log_dir() {
        Some(dir) => match std::fs::create_dir_all(&dir) {
            Ok(_) => CheckResult {
                label: "Event log".into(),
                ok: true,
                detail: format!("{}", dir.display()),
            },
            Err(e) => CheckResult {
                label: "Event log".into(),
                ok: false,
                detail: format!("{} ({})", dir.display(), e),
            },
        },
        None => CheckResult {
            label: "Event log".into(),
            ok: true,
            detail: "Disabled".into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::config::{MetadataBackendKind, ResourceConfig};

    use super::*;

    fn config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.pipeline.workspace = dir.display().to_string();
        config.metadata.backend = MetadataBackendKind::Memory;
        config
    }

    fn store(name: &str, predecessor: &str) -> ResourceConfig {
        ResourceConfig {
            name: name.into(),
            path: name.into(),
            predecessors: vec![predecessor.into()],
            ..demo::default_resources().remove(0)
        }
    }

    #[test]
    fn test_graph_check_passes_default_demo() {
        let dir = tempfile::tempdir().unwrap();
        let check = check_graph(&config(dir.path()));
        assert!(check.ok);
        assert_eq!(check.detail, "8 nodes");
    }

    #[test]
    fn test_graph_check_reports_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.resources = vec![store("raw", "cleaned"), store("cleaned", "raw")];

        let check = check_graph(&config);
        assert!(!check.ok);
        assert!(check.detail.starts_with("Cycle detected"), "{}", check.detail);
        assert!(check.detail.contains("raw") && check.detail.contains("cleaned"));
    }

    #[test]
    fn test_graph_check_reports_unknown_predecessor() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.resources = vec![store("raw", "nowhere")];

        let check = check_graph(&config);
        assert!(!check.ok);
        assert!(check.detail.contains("nowhere"));
    }
}

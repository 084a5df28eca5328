use std::fs;
use std::path::{Path, PathBuf};

fn rs_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|s| s.to_str()) == Some("rs") {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

fn rel(path: &Path) -> String {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let rel = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string();
    rel.replace('\\', "/")
}

fn violations_under(dir: &str, forbidden: &[&str]) -> Vec<String> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join(dir);
    let files = if root.is_file() {
        vec![root]
    } else {
        rs_files(&root)
    };

    let mut violations = Vec::new();
    for file in files {
        let content = fs::read_to_string(&file).unwrap_or_default();
        for needle in forbidden {
            if content.contains(needle) {
                violations.push(format!("{} imports forbidden dependency `{}`", rel(&file), needle));
            }
        }
    }
    violations
}

#[test]
fn telemetry_does_not_reach_into_the_upgrade_pipeline() {
    let mut violations = violations_under("src/system", &["crate::upgrade", "reqwest", "zip::"]);
    violations.extend(violations_under(
        "src/diagnostics.rs",
        &["crate::upgrade", "crate::system", "reqwest", "zip::"],
    ));

    assert!(
        violations.is_empty(),
        "Telemetry layering violations:\n{}",
        violations.join("\n")
    );
}

#[test]
fn upgrade_pipeline_does_not_sample_the_host() {
    let violations = violations_under(
        "src/upgrade",
        &["sysinfo", "crate::system::collector", "crate::system::host"],
    );

    assert!(
        violations.is_empty(),
        "Upgrade layering violations:\n{}",
        violations.join("\n")
    );
}

#[test]
fn supervisor_is_independent_of_telemetry_and_upgrade() {
    let violations = violations_under("src/supervisor.rs", &["crate::system", "crate::upgrade"]);

    assert!(
        violations.is_empty(),
        "Supervisor layering violations:\n{}",
        violations.join("\n")
    );
}

#[test]
fn target_os_cfg_is_scoped_to_system_platform() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut violations = Vec::new();

    for file in rs_files(&root) {
        let content = fs::read_to_string(&file).unwrap_or_default();
        if !content.contains("target_os") {
            continue;
        }

        let rel_path = rel(&file);
        if !rel_path.starts_with("src/system/platform/") {
            violations.push(format!(
                "{} contains `target_os` cfg but is outside allowed boundary",
                rel_path
            ));
        }
    }

    assert!(
        violations.is_empty(),
        "Unexpected target_os cfg usage:\n{}",
        violations.join("\n")
    );
}

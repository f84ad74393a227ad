//! Env-variable mapping: detection and child-environment construction.
//!
//! Detection scans the project's own `.env*` files for assignments whose
//! literal value equals a discovered port and rewrites each match into a
//! template keyed by that port's index (`PORT=3000` with discovered ports
//! `[3000, 5173]` becomes `PORT → ${0}`). The mapping is persisted once via
//! the config and reused — it is not recomputed per start.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::{EnvMappingEntry, ProjectConfig};

/// `KEY=3000` style assignment, optionally `export`ed or quoted.
static ENV_ASSIGN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=\s*"?(\d{2,5})"?\s*$"#)
        .expect("env assignment regex")
});

/// Scan `.env*` files in `project_dir` and build the mapping.
///
/// Entries are ordered by file then line; the first assignment of a variable
/// wins. Returns an empty mapping when nothing matches — that simply means
/// no env substitution will occur and the shim carries the whole load.
pub fn detect_env_mapping(project_dir: &Path, ports: &[u16]) -> Vec<EnvMappingEntry> {
    let mut mapping: Vec<EnvMappingEntry> = Vec::new();

    for file in env_files(project_dir) {
        let contents = match std::fs::read_to_string(&file) {
            Ok(c) => c,
            Err(_) => continue,
        };
        for line in contents.lines() {
            let caps = match ENV_ASSIGN_RE.captures(line) {
                Some(c) => c,
                None => continue,
            };
            let var = &caps[1];
            let value: u16 = match caps[2].parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            let index = match ports.iter().position(|p| *p == value) {
                Some(i) => i,
                None => continue,
            };
            if mapping.iter().any(|m| m.var == var) {
                continue;
            }
            debug!(var, port = value, index, file = %file.display(), "env mapping detected");
            mapping.push(EnvMappingEntry {
                var: var.to_string(),
                template: format!("${{{index}}}"),
            });
        }
    }
    mapping
}

/// `.env`, `.env.local`, `.env.development`, … at the project root, sorted
/// for deterministic ordering.
fn env_files(project_dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(project_dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(".env"))
        })
        .collect();
    files.sort();
    files
}

/// Evaluate a `${index}` template against the discovered-port list with the
/// given offset. Returns `None` for malformed templates or out-of-range
/// indices.
pub fn apply_template(template: &str, ports: &[u16], offset: u16) -> Option<u16> {
    let index: usize = template.strip_prefix("${")?.strip_suffix('}')?.parse().ok()?;
    let base = *ports.get(index)?;
    base.checked_add(offset)
}

/// Compute the full child environment for a worktree holding `offset`.
///
/// With virtualization disabled or offset 0 this returns an empty list: no
/// rewriting happens and the child inherits the literal configured ports.
/// Otherwise each mapping entry gets its offset-adjusted literal value, plus
/// the two control variables consumed only by the preload shim.
pub fn build_child_env(config: &ProjectConfig, offset: u16) -> Vec<(String, String)> {
    if !config.virtualization_enabled() || offset == 0 {
        return Vec::new();
    }
    let ports = &config.ports.discovered_ports;

    let mut env: Vec<(String, String)> = config
        .env_mapping
        .iter()
        .filter_map(|entry| {
            apply_template(&entry.template, ports, offset)
                .map(|port| (entry.var.clone(), port.to_string()))
        })
        .collect();

    super::shim::inject_control_vars(&mut env, offset, ports);
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn detects_port_literals_and_indexes_them() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            ".env",
            "# comment\nPORT=3000\nexport VITE_PORT=\"5173\"\nDATABASE_URL=postgres://x\n",
        );

        let mapping = detect_env_mapping(tmp.path(), &[3000, 5173]);
        assert_eq!(
            mapping,
            vec![
                EnvMappingEntry {
                    var: "PORT".into(),
                    template: "${0}".into()
                },
                EnvMappingEntry {
                    var: "VITE_PORT".into(),
                    template: "${1}".into()
                },
            ]
        );
    }

    #[test]
    fn first_assignment_wins_across_files() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), ".env", "PORT=3000\n");
        write(tmp.path(), ".env.local", "PORT=5173\n");

        let mapping = detect_env_mapping(tmp.path(), &[3000, 5173]);
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping[0].template, "${0}");
    }

    #[test]
    fn non_discovered_values_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), ".env", "PORT=8080\nTIMEOUT=30\n");
        assert!(detect_env_mapping(tmp.path(), &[3000]).is_empty());
    }

    #[test]
    fn template_round_trip() {
        // A detected template applied with offset k evaluates to base + k.
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), ".env", "PORT=3000\n");
        let mapping = detect_env_mapping(tmp.path(), &[3000]);
        let port = apply_template(&mapping[0].template, &[3000], 40).unwrap();
        assert_eq!(port, 3040);
    }

    #[test]
    fn malformed_templates_evaluate_to_none() {
        assert_eq!(apply_template("${9}", &[3000], 10), None);
        assert_eq!(apply_template("$0", &[3000], 10), None);
        assert_eq!(apply_template("${x}", &[3000], 10), None);
    }

    fn virt_config(ports: Vec<u16>, step: u16) -> ProjectConfig {
        ProjectConfig {
            ports: PortConfig {
                discovered_ports: ports,
                offset_step: step,
            },
            env_mapping: vec![
                EnvMappingEntry {
                    var: "PORT".into(),
                    template: "${0}".into(),
                },
                EnvMappingEntry {
                    var: "VITE_PORT".into(),
                    template: "${1}".into(),
                },
            ],
            ..ProjectConfig::default()
        }
    }

    #[test]
    fn child_env_maps_offset_adjusted_literals() {
        // Step 10, ports [3000, 5173], first worktree holds offset 10.
        let env = build_child_env(&virt_config(vec![3000, 5173], 10), 10);
        let get = |k: &str| {
            env.iter()
                .find(|(name, _)| name == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("PORT"), Some("3010"));
        assert_eq!(get("VITE_PORT"), Some("5183"));
        assert_eq!(get(orchard_shim::PORT_OFFSET_ENV), Some("10"));
        assert_eq!(get(orchard_shim::KNOWN_PORTS_ENV), Some("3000,5173"));
    }

    #[test]
    fn step_zero_disables_all_rewriting() {
        assert!(build_child_env(&virt_config(vec![3000, 5173], 0), 10).is_empty());
    }

    #[test]
    fn empty_port_set_disables_all_rewriting() {
        assert!(build_child_env(&virt_config(vec![], 10), 10).is_empty());
    }
}

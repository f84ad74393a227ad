//! Base-port discovery: scan the project's own files for the ports its dev
//! stack uses. Triggered explicitly (`ports.discover`), never automatically.

use std::collections::BTreeSet;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

/// Candidate sources inside package.json and framework config files.
static SCRIPT_PORT_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"--port[=\s]+(\d{4,5})",
        r#""port"\s*:\s*(\d{4,5})"#,
        r"port\s*:\s*(\d{4,5})",
        r"localhost:(\d{4,5})",
        r"127\.0\.0\.1:(\d{4,5})",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("port discovery regex"))
    .collect()
});

/// `PORT=3000`-style assignments in env files.
static ENV_PORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*(?:export\s+)?[A-Za-z_][A-Za-z0-9_]*\s*=\s*"?(\d{4,5})"?\s*$"#)
        .expect("env port regex")
});

const CONFIG_FILES: &[&str] = &[
    "package.json",
    "vite.config.js",
    "vite.config.ts",
    "vite.config.mjs",
    "vite.config.mts",
    "next.config.js",
    "next.config.mjs",
    "next.config.ts",
];

/// Scan env files and dev-stack config files, returning a deduped, sorted
/// list of plausible base ports (registered range only).
pub fn discover_ports(project_dir: &Path) -> Vec<u16> {
    let mut found: BTreeSet<u16> = BTreeSet::new();

    for entry in std::fs::read_dir(project_dir).into_iter().flatten().flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        if !path.is_file() {
            continue;
        }

        if name.starts_with(".env") {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                for caps in ENV_PORT_RE.captures_iter(&contents) {
                    if let Some(port) = parse_port(&caps[1]) {
                        found.insert(port);
                    }
                }
            }
        } else if CONFIG_FILES.contains(&name.as_str()) {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                for re in SCRIPT_PORT_RES.iter() {
                    for caps in re.captures_iter(&contents) {
                        if let Some(port) = parse_port(&caps[1]) {
                            found.insert(port);
                        }
                    }
                }
            }
        }
    }

    let ports: Vec<u16> = found.into_iter().collect();
    info!(?ports, "port discovery completed");
    ports
}

/// Registered-port range only: well-known ports are never a dev server's,
/// and matching them produces false positives from version strings.
fn parse_port(s: &str) -> Option<u16> {
    let port: u16 = s.parse().ok()?;
    (port >= 1024).then_some(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_ports_in_env_and_package_json() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".env"), "PORT=3000\nAPI_TIMEOUT=30\n").unwrap();
        std::fs::write(
            tmp.path().join("package.json"),
            r#"{"scripts": {"dev": "vite --port 5173", "api": "node server.js"}}"#,
        )
        .unwrap();

        assert_eq!(discover_ports(tmp.path()), vec![3000, 5173]);
    }

    #[test]
    fn dedupes_across_sources() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".env"), "PORT=3000\n").unwrap();
        std::fs::write(
            tmp.path().join("vite.config.ts"),
            "export default { server: { port: 3000 } }",
        )
        .unwrap();

        assert_eq!(discover_ports(tmp.path()), vec![3000]);
    }

    #[test]
    fn ignores_low_numbers() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".env"), "RETRIES=3000\nHTTP_PORT=0080\n").unwrap();
        std::fs::write(
            tmp.path().join("package.json"),
            r#"{"proxy": "http://localhost:8080"}"#,
        )
        .unwrap();

        // 3000 from the env assignment is legitimate; 0080 is below 1024.
        assert_eq!(discover_ports(tmp.path()), vec![3000, 8080]);
    }

    #[test]
    fn empty_project_discovers_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(discover_ports(tmp.path()).is_empty());
    }
}

//! Package version introspection.
//!
//! Runs the interpreter once with a short script that prints a JSON object
//! of `{package: version}`. Packages that are not installed are omitted.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};

const INTROSPECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Packages whose versions matter for launching a lab server.
pub const INTROSPECTED_PACKAGES: &[&str] = &["jupyterlab", "jupyter_server", "ipykernel"];

const INTROSPECT_SCRIPT: &str = r#"
import json, sys
from importlib import metadata
out = {"python": "%d.%d.%d" % tuple(sys.version_info[:3])}
for name in sys.argv[1:]:
    try:
        out[name] = metadata.version(name)
    except Exception:
        pass
print(json.dumps(out))
"#;

/// Ask the interpreter for its own and its packages' versions.
///
/// Never fails: a broken interpreter, a timeout, or unparsable output all
/// yield an empty map.
pub async fn introspect_versions(python: &Path) -> BTreeMap<String, String> {
    let mut cmd = tokio::process::Command::new(python);
    cmd.arg("-c")
        .arg(INTROSPECT_SCRIPT)
        .args(INTROSPECTED_PACKAGES)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(INTROSPECT_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("[env-versions] Failed to run {}: {}", python.display(), e);
            return BTreeMap::new();
        }
        Err(_) => {
            warn!("[env-versions] Timed out introspecting {}", python.display());
            return BTreeMap::new();
        }
    };

    if !output.status.success() {
        warn!(
            "[env-versions] {} exited with {}",
            python.display(),
            output.status
        );
        return BTreeMap::new();
    }

    let versions = parse_versions_output(&String::from_utf8_lossy(&output.stdout));
    debug!("[env-versions] {}: {:?}", python.display(), versions);
    versions
}

/// Parse the last JSON line printed by the introspection script.
///
/// Earlier lines are ignored so that `sitecustomize` chatter does not break
/// parsing.
pub fn parse_versions_output(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .and_then(|l| serde_json::from_str::<BTreeMap<String, String>>(l).ok())
        .unwrap_or_default()
}

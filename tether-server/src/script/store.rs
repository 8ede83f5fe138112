//! Script files on disk.
//!
//! Layout under the scripts directory:
//! `<email>/<network>/<name>.toml` for network scripts and
//! `<email>/global/<name>.toml` for an account's global chain.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::Script;
use super::rules::RuleScript;

/// Directory holding the global scripts of `email`.
pub fn global_dir(root: &Path, email: &str) -> PathBuf {
    root.join(email).join("global")
}

/// Directory holding the scripts of one network.
pub fn network_dir(root: &Path, email: &str, network: &str) -> PathBuf {
    root.join(email).join(network)
}

/// Load every `*.toml` rule script in `dir`, sorted by file name.
///
/// A missing directory is an empty chain. Files that fail to parse are
/// logged and skipped.
pub fn load_dir(dir: &Path) -> std::io::Result<Vec<Arc<dyn Script>>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut scripts: Vec<Arc<dyn Script>> = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read script");
                continue;
            }
        };
        match RuleScript::parse(name, &source) {
            Ok(script) => scripts.push(Arc::new(script)),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to parse script"),
        }
    }
    Ok(scripts)
}

/// Write every script that has source text into `dir`.
///
/// Native scripts have nothing to write and are skipped. Returns the number
/// of files written.
pub fn save_dir(dir: &Path, scripts: &[Arc<dyn Script>]) -> std::io::Result<usize> {
    std::fs::create_dir_all(dir)?;
    let mut written = 0;
    for script in scripts {
        let Some(source) = script.source() else {
            continue;
        };
        std::fs::write(dir.join(format!("{}.toml", script.name())), source)?;
        written += 1;
    }
    Ok(written)
}

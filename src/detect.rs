//! Build-output detection for a checked-out repository, used by deploy
//! tooling to decide between a static site and a long-running app.

use serde::Serialize;
use std::path::{Path, PathBuf};

/// Directories that typically hold a static build, in lookup order.
const OUTPUT_DIRS: &[&str] = &["dist", "build", "public", "out", "_site"];

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SiteKind {
    Static,
    Nodejs,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteReport {
    #[serde(rename = "type")]
    pub kind: SiteKind,
    /// Empty when no output directory was found.
    pub output_dir: String,
    pub spa: bool,
}

pub fn detect_site_kind(dir: &Path) -> SiteKind {
    let pkg_path = dir.join("package.json");
    if pkg_path.is_file() {
        let has_build_script = std::fs::read_to_string(&pkg_path)
            .ok()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            .map(|pkg| {
                pkg.get("scripts")
                    .and_then(|s| s.get("build"))
                    .is_some_and(is_set)
            });
        return match has_build_script {
            Some(true) => SiteKind::Static,
            _ => SiteKind::Nodejs,
        };
    }

    let has_output = dir.join("index.html").exists() || OUTPUT_DIRS.iter().any(|d| dir.join(d).exists());
    if has_output {
        SiteKind::Static
    } else {
        SiteKind::Nodejs
    }
}

/// `null`, `false`, `0` and `""` count as unset.
fn is_set(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

pub fn detect_output_dir(dir: &Path) -> Option<PathBuf> {
    OUTPUT_DIRS
        .iter()
        .map(|d| dir.join(d))
        .find(|p| p.exists())
        .or_else(|| dir.join("index.html").exists().then(|| dir.to_path_buf()))
}

/// Client-routed unless the site ships its own `404.html`.
pub fn detect_spa(output_dir: &Path) -> bool {
    !output_dir.join("404.html").exists()
}

pub fn detect(dir: &Path) -> SiteReport {
    let kind = detect_site_kind(dir);
    let output_dir = detect_output_dir(dir);
    let spa = detect_spa(output_dir.as_deref().unwrap_or(dir));
    SiteReport {
        kind,
        output_dir: output_dir
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default(),
        spa,
    }
}

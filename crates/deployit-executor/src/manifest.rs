//! `package.json` detection.

use deployit_core::pipeline::StageError;
use serde_json::Value;
use std::path::Path;
use tokio::fs;

/// File that marks a directory as a package with install/build steps.
pub const MANIFEST_FILE: &str = "package.json";

/// What a manifest declares about installing and building.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub name: Option<String>,
    /// `dependencies` or `devDependencies` is present.
    pub has_dependencies: bool,
    /// The `scripts.build` command, if declared.
    pub build_script: Option<String>,
}

impl Manifest {
    pub fn has_build(&self) -> bool {
        self.build_script.is_some()
    }
}

/// Read the manifest in `dir`. `Ok(None)` when there is none.
pub async fn detect(dir: &Path) -> Result<Option<Manifest>, StageError> {
    let path = dir.join(MANIFEST_FILE);
    match fs::read_to_string(&path).await {
        Ok(text) => parse_manifest(&text).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StageError::ManifestParse(format!(
            "cannot read {}: {}",
            path.display(),
            e
        ))),
    }
}

pub fn parse_manifest(text: &str) -> Result<Manifest, StageError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| StageError::ManifestParse(e.to_string()))?;
    let Value::Object(root) = value else {
        return Err(StageError::ManifestParse(
            "expected a JSON object".to_string(),
        ));
    };

    let declared = |key: &str| root.get(key).is_some_and(|v| !v.is_null());

    let build_script = root
        .get("scripts")
        .and_then(|s| s.get("build"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(Manifest {
        name: root.get("name").and_then(Value::as_str).map(str::to_string),
        has_dependencies: declared("dependencies") || declared("devDependencies"),
        build_script,
    })
}

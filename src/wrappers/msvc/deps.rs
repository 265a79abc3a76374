// Purpose: Parse the dependency report emitted by cl.exe /sourceDependencies.
// Inputs/Outputs: Reads the per-input JSON document into an ordered dependency list.
// Invariants: Only schema version "1.0" is accepted; any shape deviation fails the read.
// Gotchas: Reported paths are lowercase with backslash separators; keep them verbatim.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const SOURCE_DEPENDENCIES_VERSION: &str = "1.0";

#[derive(Debug, Deserialize)]
struct DependencyReport {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "Data")]
    data: ReportData,
}

#[derive(Debug, Deserialize)]
struct ReportData {
    #[serde(rename = "PCH")]
    pch: Option<String>,
    #[serde(rename = "Includes")]
    includes: Vec<String>,
}

pub fn read_source_dependencies(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read dependency report {}", path.display()))?;
    parse_source_dependencies(&text)
}

pub fn parse_source_dependencies(text: &str) -> anyhow::Result<Vec<String>> {
    let report: DependencyReport =
        serde_json::from_str(text).context("malformed dependency report")?;
    if report.version != SOURCE_DEPENDENCIES_VERSION {
        bail!("unknown dependency report version: {}", report.version);
    }
    let mut dependencies = Vec::new();
    if let Some(pch) = report.data.pch {
        dependencies.push(pch);
    }
    dependencies.extend(report.data.includes);
    Ok(dependencies)
}

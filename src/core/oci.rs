use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The subset of an OCI runtime spec the starter consumes. The engine JSON
/// embeds one of these; `config.json` on the control surface renders it
/// back out pretty-printed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub process: OciProcess,
    pub root: OciRoot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<OciMount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciProcess {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, rename = "type")]
    pub fstype: String,
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_cwd() -> String {
    "/".to_string()
}

/// Render the spec as pretty-printed JSON with 4-space indentation. This is
/// the exact byte sequence `config.json` reports through the control
/// surface, so its length must match the stat size there.
pub fn render_pretty(spec: &OciSpec) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, fmt);
    spec.serialize(&mut ser)
        .context("failed to render OCI spec")?;
    Ok(out)
}

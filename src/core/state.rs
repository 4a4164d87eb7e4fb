use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the per-instance record file.
const INSTANCE_FILE: &str = "instance.json";

/// Record written for a container running in instance mode, so a later
/// invocation can find it by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Random hex instance id.
    pub id: String,
    /// Engine name the instance was started with.
    pub engine: String,
    /// PID of the supervised container process.
    pub pid: u32,
    /// When the instance entered the running state.
    pub started_at: DateTime<Utc>,
}

/// Return the base state directory.
///
/// `CAPSRUN_STATE_DIR` overrides everything. Otherwise, running as root
/// (`euid == 0`) uses `/var/lib/capsrun`, and anyone else gets
/// `$HOME/.capsrun`.
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("CAPSRUN_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if nix::unistd::geteuid().is_root() {
        return Ok(PathBuf::from("/var/lib/capsrun"));
    }

    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".capsrun"))
}

/// Return the directory for a specific instance.
pub fn instance_dir(id: &str) -> Result<PathBuf> {
    Ok(state_dir()?.join(id))
}

/// Persist an instance record.
pub fn save_instance(record: &InstanceRecord) -> Result<()> {
    let dir = instance_dir(&record.id)?;
    crate::util::fs::ensure_dir(&dir)?;

    let path = dir.join(INSTANCE_FILE);
    let json =
        serde_json::to_string_pretty(record).context("failed to serialize instance record")?;
    crate::util::fs::write_file(&path, &json)?;
    Ok(())
}

/// Load an instance record by id.
pub fn load_instance(id: &str) -> Result<InstanceRecord> {
    let path = instance_dir(id)?.join(INSTANCE_FILE);
    let data = fs::read_to_string(&path)
        .with_context(|| format!("failed to read instance record {}", path.display()))?;
    serde_json::from_str(&data).context("failed to parse instance record")
}

/// Remove an instance record directory. Missing directories are fine; this
/// runs on the cleanup path, which must be idempotent.
pub fn remove_instance(id: &str) -> Result<()> {
    let dir = instance_dir(id)?;
    if dir.exists() {
        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove instance directory {}", dir.display()))?;
    }
    Ok(())
}

/// List ids of all recorded instances.
pub fn list_instances() -> Result<Vec<String>> {
    let dir = match state_dir() {
        Ok(d) => d,
        Err(_) => return Ok(Vec::new()),
    };
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        if entry.path().join(INSTANCE_FILE).exists() {
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// Serializes tests that repoint the state directory; the environment is
/// process-global.
#[cfg(test)]
pub(crate) static TEST_STATE_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) fn set_test_state_dir(dir: &std::path::Path) {
    std::env::set_var("CAPSRUN_STATE_DIR", dir.as_os_str());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> InstanceRecord {
        InstanceRecord {
            id: id.into(),
            engine: "capsule".into(),
            pid: 4242,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn save_load_remove() {
        let _env = TEST_STATE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let tmp = tempfile::tempdir().unwrap();
        set_test_state_dir(tmp.path());

        save_instance(&sample("aabbccdd11223344")).unwrap();
        let back = load_instance("aabbccdd11223344").unwrap();
        assert_eq!(back.pid, 4242);
        assert_eq!(back.engine, "capsule");

        remove_instance("aabbccdd11223344").unwrap();
        assert!(load_instance("aabbccdd11223344").is_err());
        // Removing again is a no-op, not an error.
        remove_instance("aabbccdd11223344").unwrap();
    }

    #[test]
    fn list_returns_sorted_ids() {
        let _env = TEST_STATE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let tmp = tempfile::tempdir().unwrap();
        set_test_state_dir(tmp.path());

        save_instance(&sample("beef000000000000")).unwrap();
        save_instance(&sample("0abc000000000000")).unwrap();

        let ids = list_instances().unwrap();
        assert_eq!(ids, vec!["0abc000000000000", "beef000000000000"]);
    }
}

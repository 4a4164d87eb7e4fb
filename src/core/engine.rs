use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use nix::sys::wait::WaitStatus;

use crate::core::capsule::CapsuleEngine;
use crate::core::config::StarterConfig;
use crate::core::oci::OciSpec;
use crate::platform::linux::rpc::ContainerRpc;

/// Engine-observable lifecycle. Transitions may only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Configured,
    Prepared,
    ChildForked,
    Running,
    Exited,
    Cleaned,
}

/// Common header every engine variant carries: the engine name, the raw
/// JSON it was constructed from (immutable afterwards), the parsed OCI
/// spec subset, and the lifecycle cell shared by the supervision threads.
pub struct EngineCommon {
    pub name: String,
    pub json: Vec<u8>,
    pub oci: OciSpec,
    pub instance: bool,
    state: Mutex<Lifecycle>,
    cleaned: AtomicBool,
}

impl EngineCommon {
    pub fn new(name: &str, json: &[u8], oci: OciSpec, instance: bool) -> Self {
        EngineCommon {
            name: name.to_string(),
            json: json.to_vec(),
            oci,
            instance,
            state: Mutex::new(Lifecycle::Configured),
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> Lifecycle {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance the lifecycle. Moving backwards is a contract violation.
    pub fn advance(&self, to: Lifecycle) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if to < *state {
            bail!("lifecycle cannot move from {:?} back to {to:?}", *state);
        }
        *state = to;
        Ok(())
    }

    /// Claim the one effective cleanup. Returns false when cleanup already
    /// ran; callers then return without side effects.
    pub fn begin_cleanup(&self) -> bool {
        !self.cleaned.swap(true, Ordering::SeqCst)
    }
}

/// The pluggable runtime back-end. One engine instance per invocation,
/// shared read-mostly across the supervision threads; mutation is confined
/// to interior cells so `PostStartProcess` and `CleanupContainer` cannot
/// race the readers.
pub trait Engine: Send + Sync {
    fn common(&self) -> &EngineCommon;

    /// Populate namespace flags and uid/gid maps before the launcher forks.
    fn prepare_config(&self, config: &mut StarterConfig) -> Result<()>;

    /// Wire the common header early in each child.
    fn init_config(&self) -> Result<()>;

    /// Perform image/mount setup via RPC, from the container child.
    fn create_container(&self, pid: libc::pid_t, rpc: &dyn ContainerRpc) -> Result<()>;

    /// Exec the payload. Only returns on failure.
    fn start_process(&self, master: UnixStream) -> Result<()>;

    /// Record post-start state (e.g. the instance file) from the master.
    fn post_start_process(&self, pid: libc::pid_t) -> Result<()>;

    /// Block until the supervised pid is gone. Advisory; the reaper is
    /// authoritative for the exit code.
    fn monitor_container(&self, pid: libc::pid_t) -> Result<()>;

    /// Idempotent teardown, callable from any state past PREPARED.
    fn cleanup_container(&self, status: Option<WaitStatus>) -> Result<()>;

    fn is_run_as_instance(&self) -> bool {
        self.common().instance
    }
}

/// Construct an engine from (name, JSON). The name string selects the
/// variant; the JSON is the engine configuration payload.
pub fn new_engine(name: &str, json: &[u8]) -> Result<Box<dyn Engine>> {
    match name {
        CapsuleEngine::NAME => Ok(Box::new(
            CapsuleEngine::new(json).context("failed to build capsule engine")?,
        )),
        StubEngine::NAME => Ok(Box::new(StubEngine::new(json)?)),
        _ => bail!("unknown engine '{name}'"),
    }
}

/// Inert engine used by the test harness: every operation succeeds and is
/// counted, nothing touches the host.
pub struct StubEngine {
    common: EngineCommon,
    pub cleanups: AtomicUsize,
    pub monitors: AtomicUsize,
}

impl StubEngine {
    pub const NAME: &'static str = "stub";

    pub fn new(json: &[u8]) -> Result<Self> {
        let oci: OciSpec = if json.is_empty() {
            placeholder_oci()
        } else {
            serde_json::from_slice(json).unwrap_or_else(|_| placeholder_oci())
        };
        Ok(StubEngine {
            common: EngineCommon::new(Self::NAME, json, oci, false),
            cleanups: AtomicUsize::new(0),
            monitors: AtomicUsize::new(0),
        })
    }
}

fn placeholder_oci() -> OciSpec {
    OciSpec {
        oci_version: "1.0.2".into(),
        process: crate::core::oci::OciProcess {
            args: vec!["/bin/true".into()],
            env: Vec::new(),
            cwd: "/".into(),
        },
        root: crate::core::oci::OciRoot {
            path: crate::core::config::CONTAINER_FINALDIR.into(),
            readonly: true,
        },
        hostname: None,
        mounts: Vec::new(),
    }
}

impl Engine for StubEngine {
    fn common(&self) -> &EngineCommon {
        &self.common
    }

    fn prepare_config(&self, _config: &mut StarterConfig) -> Result<()> {
        self.common.advance(Lifecycle::Prepared)
    }

    fn init_config(&self) -> Result<()> {
        self.common.advance(Lifecycle::ChildForked)
    }

    fn create_container(&self, _pid: libc::pid_t, _rpc: &dyn ContainerRpc) -> Result<()> {
        Ok(())
    }

    fn start_process(&self, _master: UnixStream) -> Result<()> {
        Ok(())
    }

    fn post_start_process(&self, _pid: libc::pid_t) -> Result<()> {
        self.common.advance(Lifecycle::Running)
    }

    fn monitor_container(&self, _pid: libc::pid_t) -> Result<()> {
        self.monitors.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cleanup_container(&self, status: Option<WaitStatus>) -> Result<()> {
        if !self.common.begin_cleanup() {
            return Ok(());
        }
        if status.is_some() {
            self.common.advance(Lifecycle::Exited)?;
        }
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.common.advance(Lifecycle::Cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_its_variants() {
        assert!(new_engine("stub", b"").is_ok());
        assert!(new_engine("no-such-engine", b"{}").is_err());
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let common = EngineCommon::new("stub", b"", placeholder_oci(), false);
        assert_eq!(common.state(), Lifecycle::Configured);
        common.advance(Lifecycle::Prepared).unwrap();
        common.advance(Lifecycle::Running).unwrap();
        assert!(common.advance(Lifecycle::Prepared).is_err());
        assert_eq!(common.state(), Lifecycle::Running);
    }

    #[test]
    fn advancing_to_current_state_is_allowed() {
        let common = EngineCommon::new("stub", b"", placeholder_oci(), false);
        common.advance(Lifecycle::Prepared).unwrap();
        common.advance(Lifecycle::Prepared).unwrap();
    }

    #[test]
    fn cleanup_is_idempotent() {
        let engine = StubEngine::new(b"").unwrap();
        let mut config = StarterConfig::default();
        engine.prepare_config(&mut config).unwrap();

        engine
            .cleanup_container(Some(WaitStatus::Exited(nix::unistd::Pid::from_raw(1), 42)))
            .unwrap();
        engine.cleanup_container(None).unwrap();
        engine.cleanup_container(None).unwrap();

        assert_eq!(engine.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(engine.common().state(), Lifecycle::Cleaned);
    }

    #[test]
    fn engine_json_is_kept_verbatim() {
        let json = br#"{"instance":true}"#;
        let engine = StubEngine::new(json).unwrap();
        assert_eq!(engine.common().json, json.to_vec());
    }
}

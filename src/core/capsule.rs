use std::ffi::CString;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use log::debug;
use nix::sys::wait::WaitStatus;
use serde::Deserialize;

use crate::core::config::{IdMap, StarterConfig, CONTAINER_FINALDIR};
use crate::core::engine::{Engine, EngineCommon, Lifecycle};
use crate::core::image::HeaderInspector;
use crate::core::oci::OciSpec;
use crate::core::{id, state};
use crate::platform::linux::fused;
use crate::platform::linux::namespaces;
use crate::platform::linux::rpc::ContainerRpc;

/// Engine configuration payload for the capsule engine.
#[derive(Debug, Deserialize)]
struct CapsuleConfig {
    #[serde(default)]
    instance: bool,
    #[serde(default)]
    image: Option<String>,
    oci: OciSpec,
}

/// The production engine: builds the container filesystem over RPC from the
/// configured image, execs the OCI payload, and keeps instance records.
pub struct CapsuleEngine {
    common: EngineCommon,
    image: Option<PathBuf>,
    inspector: HeaderInspector,
    instance_id: Mutex<Option<String>>,
}

impl CapsuleEngine {
    pub const NAME: &'static str = "capsule";

    pub fn new(json: &[u8]) -> Result<Self> {
        let conf: CapsuleConfig =
            serde_json::from_slice(json).context("failed to parse capsule engine JSON")?;
        Ok(CapsuleEngine {
            common: EngineCommon::new(Self::NAME, json, conf.oci, conf.instance),
            image: conf.image.map(PathBuf::from),
            inspector: HeaderInspector,
            instance_id: Mutex::new(None),
        })
    }
}

impl Engine for CapsuleEngine {
    fn common(&self) -> &EngineCommon {
        &self.common
    }

    fn prepare_config(&self, config: &mut StarterConfig) -> Result<()> {
        config.ns_flags = namespaces::container_ns_flags().bits() as u32;

        // Root inside the container maps to the invoking identity.
        config.uid_map[0] = IdMap {
            container_id: 0,
            host_id: nix::unistd::geteuid().as_raw(),
            size: 1,
        };
        config.gid_map[0] = IdMap {
            container_id: 0,
            host_id: nix::unistd::getegid().as_raw(),
            size: 1,
        };

        self.common.advance(Lifecycle::Prepared)
    }

    fn init_config(&self) -> Result<()> {
        self.common.advance(Lifecycle::ChildForked)
    }

    fn create_container(&self, pid: libc::pid_t, rpc: &dyn ContainerRpc) -> Result<()> {
        debug!("creating container filesystem for pid {pid}");

        let image = match &self.image {
            Some(image) => image.clone(),
            None => bail!("capsule engine has no image configured"),
        };
        // The same action sequence the control surface produces
        // declaratively, driven directly by the engine.
        fused::mount_image_action(&self.inspector, &image.to_string_lossy(), rpc)?;

        debug!("chroot into {CONTAINER_FINALDIR}");
        rpc.chroot(CONTAINER_FINALDIR)?;
        Ok(())
    }

    fn start_process(&self, master: UnixStream) -> Result<()> {
        let process = &self.common.oci.process;
        if process.args.is_empty() {
            bail!("no process arguments in OCI spec");
        }

        nix::unistd::chdir(process.cwd.as_str())
            .with_context(|| format!("chdir to {} failed", process.cwd))?;

        let program = CString::new(process.args[0].as_str())
            .with_context(|| format!("invalid command: '{}'", process.args[0]))?;
        let args: Vec<CString> = process
            .args
            .iter()
            .map(|a| CString::new(a.as_str()).context("invalid argument"))
            .collect::<Result<_>>()?;
        let env: Vec<CString> = process
            .env
            .iter()
            .map(|e| CString::new(e.as_str()).context("invalid environment entry"))
            .collect::<Result<_>>()?;

        // Dropping our endpoint delivers EOF to the master's instance
        // handoff; the inherited descriptor is close-on-exec anyway.
        drop(master);

        nix::unistd::execve(&program, &args, &env)
            .with_context(|| format!("execve '{}' failed", process.args[0]))?;
        unreachable!();
    }

    fn post_start_process(&self, pid: libc::pid_t) -> Result<()> {
        if self.common.instance {
            let record = state::InstanceRecord {
                id: id::generate_id(),
                engine: self.common.name.clone(),
                pid: pid as u32,
                started_at: chrono::Utc::now(),
            };
            state::save_instance(&record)?;
            *self.instance_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(record.id);
        }
        self.common.advance(Lifecycle::Running)
    }

    fn monitor_container(&self, pid: libc::pid_t) -> Result<()> {
        let pid = nix::unistd::Pid::from_raw(pid);
        loop {
            match nix::sys::signal::kill(pid, None) {
                Ok(()) => std::thread::sleep(std::time::Duration::from_millis(100)),
                Err(nix::errno::Errno::ESRCH) => return Ok(()),
                Err(e) => return Err(e).context("failed to probe container pid"),
            }
        }
    }

    fn cleanup_container(&self, status: Option<WaitStatus>) -> Result<()> {
        if !self.common.begin_cleanup() {
            return Ok(());
        }
        if let Some(status) = status {
            debug!("container wait status at cleanup: {status:?}");
            self.common.advance(Lifecycle::Exited)?;
        }

        let instance_id = self
            .instance_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(id) = instance_id {
            state::remove_instance(&id)?;
        }

        self.common.advance(Lifecycle::Cleaned)
    }
}

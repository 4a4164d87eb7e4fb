use std::fs::File;
use std::io::Read;
use std::mem;
use std::os::unix::io::FromRawFd;

use anyhow::{bail, Context, Result};

/// Build-time constant: the directory that becomes the container's root
/// after the pivot. All image and bind mounts target this path.
pub const CONTAINER_FINALDIR: &str = "/var/lib/capsrun/mnt/final";

/// Build-time constant: the session directory under which the FUSE control
/// surface is mounted.
pub const SESSION_DIR: &str = "/var/lib/capsrun/mnt/session";

/// Number of uid/gid mapping slots in the fixed-layout block.
pub const MAX_ID_MAPS: usize = 5;

/// One uid or gid mapping entry, `newuidmap(1)` style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// The fixed-layout configuration block shared with the native launcher.
///
/// The launcher writes this struct followed by exactly `json_conf_size`
/// bytes of engine JSON onto an inherited descriptor. The layout is the
/// launcher ABI: field order and widths must not change. Immutable after
/// fork; `container_pid` is set exactly once, by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct StarterConfig {
    pub container_pid: libc::pid_t,
    pub ns_flags: u32,
    pub uid_map: [IdMap; MAX_ID_MAPS],
    pub gid_map: [IdMap; MAX_ID_MAPS],
    pub json_conf_size: u32,
}

impl Default for StarterConfig {
    fn default() -> Self {
        StarterConfig {
            container_pid: 0,
            ns_flags: 0,
            uid_map: [IdMap::default(); MAX_ID_MAPS],
            gid_map: [IdMap::default(); MAX_ID_MAPS],
            json_conf_size: 0,
        }
    }
}

impl StarterConfig {
    /// Read the config block plus its trailing JSON payload from an
    /// inherited descriptor. Takes ownership of the descriptor.
    pub fn read_from_fd(fd: i32) -> Result<(StarterConfig, Vec<u8>)> {
        if fd < 0 {
            bail!("invalid config descriptor {fd}");
        }
        // SAFETY: the launcher hands us exclusive ownership of this fd.
        let mut file = unsafe { File::from_raw_fd(fd) };

        let mut raw = [0u8; mem::size_of::<StarterConfig>()];
        file.read_exact(&mut raw)
            .context("failed to read starter config block")?;
        // SAFETY: raw holds size_of::<StarterConfig>() bytes and the struct
        // is repr(C) with no padding-sensitive invariants beyond the ABI.
        let config: StarterConfig = unsafe { mem::transmute(raw) };

        if config.json_conf_size as usize > MAX_JSON_SIZE {
            bail!(
                "engine JSON size {} exceeds limit {MAX_JSON_SIZE}",
                config.json_conf_size
            );
        }

        let mut json = vec![0u8; config.json_conf_size as usize];
        file.read_exact(&mut json)
            .context("failed to read engine JSON payload")?;

        Ok((config, json))
    }

    /// Serialize the block for the launcher side (and for tests). The JSON
    /// payload must be appended separately and match `json_conf_size`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let ptr = self as *const StarterConfig as *const u8;
        // SAFETY: repr(C) struct, reading its own size.
        unsafe { std::slice::from_raw_parts(ptr, mem::size_of::<StarterConfig>()) }.to_vec()
    }
}

/// Upper bound on the attached engine JSON; anything larger is a corrupted
/// or hostile launcher handoff.
const MAX_JSON_SIZE: usize = 1 << 20;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::unix::io::IntoRawFd;

    #[test]
    fn block_round_trips_through_fd() {
        let mut config = StarterConfig {
            container_pid: 4242,
            ns_flags: 0x0002_0000,
            json_conf_size: 0,
            ..Default::default()
        };
        config.uid_map[0] = IdMap {
            container_id: 0,
            host_id: 1000,
            size: 1,
        };
        let json = br#"{"instance":false}"#;
        config.json_conf_size = json.len() as u32;

        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(&config.to_bytes()).unwrap();
        tmp.write_all(json).unwrap();
        tmp.seek(SeekFrom::Start(0)).unwrap();

        let (back, payload) = StarterConfig::read_from_fd(tmp.into_raw_fd()).unwrap();
        assert_eq!(back, config);
        assert_eq!(payload, json);
    }

    #[test]
    fn truncated_json_is_an_error() {
        let config = StarterConfig {
            container_pid: 1,
            json_conf_size: 64,
            ..Default::default()
        };

        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(&config.to_bytes()).unwrap();
        tmp.write_all(b"short").unwrap();
        tmp.seek(SeekFrom::Start(0)).unwrap();

        assert!(StarterConfig::read_from_fd(tmp.into_raw_fd()).is_err());
    }

    #[test]
    fn negative_fd_is_rejected() {
        assert!(StarterConfig::read_from_fd(-1).is_err());
    }

    #[test]
    fn oversized_json_is_rejected() {
        let config = StarterConfig {
            json_conf_size: (MAX_JSON_SIZE + 1) as u32,
            ..Default::default()
        };

        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(&config.to_bytes()).unwrap();
        tmp.seek(SeekFrom::Start(0)).unwrap();

        assert!(StarterConfig::read_from_fd(tmp.into_raw_fd()).is_err());
    }
}

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;

use crate::platform::linux::rpc::LoopInfo;

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

const LOOP_CONTROL: &str = "/dev/loop-control";

/// Kernel `struct loop_info64`, as consumed by LOOP_SET_STATUS64.
#[repr(C)]
#[derive(Clone, Copy)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; 64],
    lo_crypt_name: [u8; 64],
    lo_encrypt_key: [u8; 32],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        // SAFETY: all-zero is a valid value for every field.
        unsafe { std::mem::zeroed() }
    }
}

/// Attach `image` to the next free loop device with the requested
/// offset/size-limit/flags and return the device number. The flags always
/// include auto-clear, so the device detaches on last close.
pub fn attach(image: &Path, open_flags: i32, info: LoopInfo) -> Result<u32> {
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open(LOOP_CONTROL)
        .with_context(|| format!("failed to open {LOOP_CONTROL}"))?;

    // SAFETY: LOOP_CTL_GET_FREE takes no argument and returns the index.
    let number = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE) };
    if number < 0 {
        bail!(
            "LOOP_CTL_GET_FREE failed: {}",
            std::io::Error::last_os_error()
        );
    }

    let device = format!("/dev/loop{number}");
    let device_file = OpenOptions::new()
        .read(true)
        .write(open_flags & libc::O_ACCMODE != libc::O_RDONLY)
        .open(&device)
        .with_context(|| format!("failed to open {device}"))?;

    let read_only = open_flags & libc::O_ACCMODE == libc::O_RDONLY;
    let backing = OpenOptions::new()
        .read(true)
        .write(!read_only)
        .custom_flags(open_flags & !libc::O_ACCMODE)
        .open(image)
        .with_context(|| format!("failed to open image {}", image.display()))?;

    // SAFETY: LOOP_SET_FD takes the backing file descriptor by value.
    if unsafe { libc::ioctl(device_file.as_raw_fd(), LOOP_SET_FD, backing.as_raw_fd()) } < 0 {
        bail!(
            "LOOP_SET_FD on {device} failed: {}",
            std::io::Error::last_os_error()
        );
    }

    let mut status = LoopInfo64 {
        lo_offset: info.offset,
        lo_sizelimit: info.size_limit,
        lo_flags: info.flags,
        ..Default::default()
    };
    let name = image.as_os_str().as_encoded_bytes();
    let n = name.len().min(status.lo_file_name.len() - 1);
    status.lo_file_name[..n].copy_from_slice(&name[..n]);

    // SAFETY: LOOP_SET_STATUS64 reads a loop_info64 from the pointer.
    if unsafe { libc::ioctl(device_file.as_raw_fd(), LOOP_SET_STATUS64, &status) } < 0 {
        bail!(
            "LOOP_SET_STATUS64 on {device} failed: {}",
            std::io::Error::last_os_error()
        );
    }

    debug!("attached {} to {device}", image.display());
    Ok(number as u32)
}

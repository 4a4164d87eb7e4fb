use std::io::{Read, Write};
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::linux::{loopdev, mounts};

/// Auto-clear flag for loop devices: detach on last close.
pub const LO_FLAGS_AUTOCLEAR: u32 = 4;

/// Loop-device parameters carried in a `LoopDevice` request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopInfo {
    pub offset: u64,
    pub size_limit: u64,
    pub flags: u32,
}

/// The privileged actions the helper performs on behalf of the container.
/// Implemented over the wire by [`RpcClient`] and in-process by recording
/// doubles in tests.
pub trait ContainerRpc: Send + Sync {
    /// Attach `image` to the next free loop device, returning its number.
    fn loop_device(&self, image: &str, open_flags: i32, info: LoopInfo) -> Result<u32>;

    /// Perform a mount; empty fstype with a bind flag means bind mount.
    fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: &str,
        flags: u64,
        options: &str,
    ) -> Result<()>;

    /// Chroot the helper (and therefore the shared mount view) into `path`.
    fn chroot(&self, path: &str) -> Result<()>;
}

/// Typed client-side failures.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("rpc protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Remote(String),
}

#[derive(Debug, Serialize, Deserialize)]
enum RpcRequest {
    LoopDevice {
        image: String,
        open_flags: i32,
        info: LoopInfo,
    },
    Mount {
        source: String,
        target: String,
        fstype: String,
        flags: u64,
        options: String,
    },
    Chroot {
        path: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
enum RpcResponse {
    Ok,
    LoopNumber(u32),
    Error(String),
}

/// Frame limit; control messages are tiny and anything bigger is a
/// corrupted stream.
const MAX_FRAME: u32 = 1 << 16;

fn write_frame<T: Serialize>(stream: &mut (impl Write + ?Sized), msg: &T) -> Result<(), RpcError> {
    let body = serde_json::to_vec(msg).map_err(|e| RpcError::Protocol(e.to_string()))?;
    let len = (body.len() as u32).to_le_bytes();
    stream.write_all(&len)?;
    stream.write_all(&body)?;
    stream.flush()?;
    Ok(())
}

/// Read one frame; `Ok(None)` is a clean EOF at a frame boundary.
fn read_frame<T: for<'de> Deserialize<'de>>(
    stream: &mut (impl Read + ?Sized),
) -> Result<Option<T>, RpcError> {
    let mut len = [0u8; 4];
    match stream.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME {
        return Err(RpcError::Protocol(format!("frame length {len} too large")));
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    let msg = serde_json::from_slice(&body).map_err(|e| RpcError::Protocol(e.to_string()))?;
    Ok(Some(msg))
}

/// Client half of the RPC socket. Calls are synchronous and FIFO; the
/// mutex serializes in-flight calls so concurrent control-surface writes
/// cannot interleave frames. Owns the connection; dropping it closes the
/// stream and lets the server proceed to the pivot.
pub struct RpcClient {
    stream: Mutex<UnixStream>,
    pub name: String,
}

impl RpcClient {
    pub fn new(stream: UnixStream, name: &str) -> Self {
        RpcClient {
            stream: Mutex::new(stream),
            name: name.to_string(),
        }
    }

    fn call(&self, request: &RpcRequest) -> Result<RpcResponse, RpcError> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        write_frame(&mut *stream, request)?;
        match read_frame(&mut *stream)? {
            Some(response) => Ok(response),
            None => Err(RpcError::Protocol(
                "connection closed mid-call".to_string(),
            )),
        }
    }
}

impl ContainerRpc for RpcClient {
    fn loop_device(&self, image: &str, open_flags: i32, info: LoopInfo) -> Result<u32> {
        let response = self.call(&RpcRequest::LoopDevice {
            image: image.to_string(),
            open_flags,
            info,
        })?;
        match response {
            RpcResponse::LoopNumber(n) => Ok(n),
            RpcResponse::Error(e) => Err(RpcError::Remote(e).into()),
            other => Err(RpcError::Protocol(format!("unexpected response {other:?}")).into()),
        }
    }

    fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: &str,
        flags: u64,
        options: &str,
    ) -> Result<()> {
        let response = self.call(&RpcRequest::Mount {
            source: source.to_string(),
            target: target.to_string(),
            fstype: fstype.to_string(),
            flags,
            options: options.to_string(),
        })?;
        match response {
            RpcResponse::Ok => Ok(()),
            RpcResponse::Error(e) => Err(RpcError::Remote(e).into()),
            other => Err(RpcError::Protocol(format!("unexpected response {other:?}")).into()),
        }
    }

    fn chroot(&self, path: &str) -> Result<()> {
        let response = self.call(&RpcRequest::Chroot {
            path: path.to_string(),
        })?;
        match response {
            RpcResponse::Ok => Ok(()),
            RpcResponse::Error(e) => Err(RpcError::Remote(e).into()),
            other => Err(RpcError::Protocol(format!("unexpected response {other:?}")).into()),
        }
    }
}

/// The syscall surface behind the server, split out so tests can swap in
/// a recording implementation.
pub trait PrivilegedOps: Send {
    fn loop_device(&self, image: &Path, open_flags: i32, info: LoopInfo) -> Result<u32>;
    fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: &str,
        flags: u64,
        options: &str,
    ) -> Result<()>;
    fn chroot(&self, path: &str) -> Result<()>;
}

/// Production operations: real loop ioctls, mount(2), chroot(2).
pub struct HostOps;

impl PrivilegedOps for HostOps {
    fn loop_device(&self, image: &Path, open_flags: i32, info: LoopInfo) -> Result<u32> {
        loopdev::attach(image, open_flags, info)
    }

    fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: &str,
        flags: u64,
        options: &str,
    ) -> Result<()> {
        mounts::mount_with_flags(source, target, fstype, flags, options)
    }

    fn chroot(&self, path: &str) -> Result<()> {
        mounts::chroot(path)
    }
}

/// Serve requests on the stream until the peer closes it. Operation
/// failures go back over the wire; only transport failures end the loop
/// early.
pub fn serve(stream: &mut UnixStream, engine_name: &str, ops: &dyn PrivilegedOps) -> Result<()> {
    debug!("serving privileged requests for engine {engine_name}");

    loop {
        let request: RpcRequest = match read_frame(stream) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e).context("failed to read request frame"),
        };

        let response = match &request {
            RpcRequest::LoopDevice {
                image,
                open_flags,
                info,
            } => match ops.loop_device(Path::new(image), *open_flags, *info) {
                Ok(n) => RpcResponse::LoopNumber(n),
                Err(e) => RpcResponse::Error(format!("{e:#}")),
            },
            RpcRequest::Mount {
                source,
                target,
                fstype,
                flags,
                options,
            } => match ops.mount(source, target, fstype, *flags, options) {
                Ok(()) => RpcResponse::Ok,
                Err(e) => RpcResponse::Error(format!("{e:#}")),
            },
            RpcRequest::Chroot { path } => match ops.chroot(path) {
                Ok(()) => RpcResponse::Ok,
                Err(e) => RpcResponse::Error(format!("{e:#}")),
            },
        };

        write_frame(stream, &response).context("failed to write response frame")?;
    }
}

/// Entry point for the `rpc-server` role: adopt the inherited socket,
/// serve until the container side is done, then pivot into the container
/// root and exit 0.
pub fn server_main(socket: i32, engine_name: &str) -> Result<()> {
    if socket < 0 {
        bail!("invalid rpc socket descriptor {socket}");
    }
    // SAFETY: the launcher hands us exclusive ownership of this fd.
    let mut stream = unsafe { UnixStream::from_raw_fd(socket) };

    if let Err(e) = serve(&mut stream, engine_name, &HostOps) {
        error!("rpc server error: {e:#}");
    }

    mounts::pivot_into_final();
    std::process::exit(0);
}

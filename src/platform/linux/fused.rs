use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, Session, TimeOrNow,
};
use log::{debug, error};

use crate::core::config::{CONTAINER_FINALDIR, SESSION_DIR};
use crate::core::engine::Engine;
use crate::core::image::{ImageFormat, ImageInspector};
use crate::core::oci;
use crate::platform::linux::rpc::{ContainerRpc, LoopInfo, RpcClient, LO_FLAGS_AUTOCLEAR};

/// External helper used for unprivileged image mounts.
const UNPRIV_IMAGE_HELPER: &str = "/usr/libexec/capsrun/imgfuse";

const TTL: Duration = Duration::from_secs(1);

/// Write-only control files.
const MODE_CONTROL: u16 = 0o220;
/// The read-only `config.json` view.
const MODE_CONFIG: u16 = 0o440;
const MODE_DIR: u16 = 0o750;

/// Dispatches control-file writes into engine actions. Closes over the
/// engine, the RPC client, and the image inspector; one handler serves the
/// whole surface.
pub struct ControlHandler {
    engine: Arc<dyn Engine>,
    rpc: Arc<dyn ContainerRpc>,
    inspector: Arc<dyn ImageInspector>,
}

impl ControlHandler {
    pub fn new(
        engine: Arc<dyn Engine>,
        rpc: Arc<dyn ContainerRpc>,
        inspector: Arc<dyn ImageInspector>,
    ) -> Self {
        ControlHandler {
            engine,
            rpc,
            inspector,
        }
    }

    /// The rendered `config.json` contents; its length is also the size
    /// reported by stat.
    pub fn config_json(&self) -> Vec<u8> {
        oci::render_pretty(&self.engine.common().oci).unwrap_or_default()
    }

    /// Map a write on a recognized control file to its action. Unrecognized
    /// names are a no-op. The payload arrives already trimmed.
    pub fn dispatch_write(&self, name: &str, payload: &str) -> Result<()> {
        match name {
            "image" => mount_image_action(self.inspector.as_ref(), payload, self.rpc.as_ref()),
            "chroot" => {
                debug!("chroot into {CONTAINER_FINALDIR}");
                self.rpc
                    .chroot(CONTAINER_FINALDIR)
                    .context("chroot failed")
            }
            "mount" => {
                let target = join_inside_final(payload);
                debug!("mounting {payload} at {target}");
                self.rpc
                    .mount(payload, &target, "", libc::MS_BIND as u64, "")
                    .with_context(|| format!("mount {payload} failed"))
            }
            "image_unpriv" => spawn_unpriv_helper(payload),
            _ => Ok(()),
        }
    }
}

/// Mount an image at the container final directory: bind directories,
/// loop-mount recognized filesystem images. Unrecognized image files get a
/// direct mount attempt with empty fstype — it fails, and no loop device
/// is left attached.
pub fn mount_image_action(
    inspector: &dyn ImageInspector,
    payload: &str,
    rpc: &dyn ContainerRpc,
) -> Result<()> {
    let info = inspector.inspect(Path::new(payload))?;

    match info.format {
        ImageFormat::Directory => {
            debug!("mounting image directory {payload}");
            rpc.mount(
                payload,
                CONTAINER_FINALDIR,
                "",
                (libc::MS_BIND | libc::MS_NOSUID | libc::MS_RDONLY | libc::MS_NODEV) as u64,
                "errors=remount-ro",
            )
            .with_context(|| format!("failed to mount directory filesystem {payload}"))
        }
        ImageFormat::Unknown => rpc
            .mount(
                payload,
                CONTAINER_FINALDIR,
                "",
                (libc::MS_NOSUID | libc::MS_RDONLY | libc::MS_NODEV) as u64,
                "errors=remount-ro",
            )
            .with_context(|| format!("failed to mount unrecognized image {payload}")),
        ImageFormat::Squashfs | ImageFormat::Ext3 => {
            let loop_info = LoopInfo {
                offset: info.offset,
                size_limit: info.size,
                flags: LO_FLAGS_AUTOCLEAR,
            };
            let number = rpc.loop_device(payload, libc::O_RDONLY, loop_info)?;

            let device = format!("/dev/loop{number}");
            debug!("mounting loop device {device}");
            rpc.mount(
                &device,
                CONTAINER_FINALDIR,
                info.format.fstype(),
                (libc::MS_NOSUID | libc::MS_RDONLY | libc::MS_NODEV) as u64,
                "errors=remount-ro",
            )
            .with_context(|| {
                format!("failed to mount {} filesystem", info.format.fstype())
            })
        }
    }
}

/// Resolve a bind-mount payload to its target under the final directory.
fn join_inside_final(payload: &str) -> String {
    if payload.starts_with('/') {
        format!("{CONTAINER_FINALDIR}{payload}")
    } else {
        format!("{CONTAINER_FINALDIR}/{payload}")
    }
}

/// Launch the external unprivileged FUSE helper in a detached thread with
/// the caller's identity and PDEATHSIG=SIGKILL. A start failure is fatal;
/// the wait result is intentionally dropped.
fn spawn_unpriv_helper(payload: &str) -> Result<()> {
    let payload = payload.to_string();
    let groups: Vec<libc::gid_t> = nix::unistd::getgroups()
        .map(|gs| gs.iter().map(|g| g.as_raw()).collect())
        .unwrap_or_default();

    let (started_tx, started_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let mut cmd = std::process::Command::new(UNPRIV_IMAGE_HELPER);
        cmd.args([
            payload.as_str(),
            CONTAINER_FINALDIR,
            "-f",
            "-o",
            "allow_root",
        ])
        .uid(nix::unistd::getuid().as_raw())
        .gid(nix::unistd::getgid().as_raw());

        // SAFETY: only async-signal-safe calls before exec.
        unsafe {
            cmd.pre_exec(move || {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if !groups.is_empty()
                    && libc::setgroups(groups.len(), groups.as_ptr()) != 0
                {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        match cmd.spawn() {
            Ok(mut child) => {
                let _ = started_tx.send(Ok(()));
                let _ = child.wait();
            }
            Err(e) => {
                let _ = started_tx.send(Err(e));
            }
        }
    });

    match started_rx.recv() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("failed to start {UNPRIV_IMAGE_HELPER}: {e}");
            std::process::exit(1);
        }
        Err(_) => {
            error!("unprivileged helper thread died before reporting");
            std::process::exit(1);
        }
    }
}

struct Node {
    ino: u64,
    name: String,
    mode: u16,
}

struct ControlFile {
    node: Node,
    data: Mutex<Vec<u8>>,
}

struct ControlDir {
    node: Node,
    files: Mutex<Vec<Arc<ControlFile>>>,
    dirs: Mutex<Vec<Arc<ControlDir>>>,
}

#[derive(Clone)]
enum Entry {
    File(Arc<ControlFile>),
    Dir(Arc<ControlDir>),
}

/// The in-memory control filesystem. Inodes come from an atomic counter
/// owned by this surface; no two live nodes share one. The root claims
/// inode 1 (FUSE_ROOT_ID) and owns the control files; the index maps
/// inodes back to nodes for the attribute and data paths.
pub struct ControlFs {
    handler: Arc<ControlHandler>,
    index: HashMap<u64, Entry>,
    next_inode: AtomicU64,
}

impl ControlFs {
    pub fn new(handler: Arc<ControlHandler>) -> Self {
        let counter = AtomicU64::new(0);
        let alloc = |counter: &AtomicU64| counter.fetch_add(1, Ordering::SeqCst) + 1;

        let root = Arc::new(ControlDir {
            node: Node {
                ino: alloc(&counter),
                name: "head".into(),
                mode: MODE_DIR,
            },
            files: Mutex::new(Vec::new()),
            dirs: Mutex::new(Vec::new()),
        });

        {
            let mut files = root.files.lock().unwrap_or_else(|e| e.into_inner());
            for (name, mode) in [
                ("image", MODE_CONTROL),
                ("image_unpriv", MODE_CONTROL),
                ("mount", MODE_CONTROL),
                ("chroot", MODE_CONTROL),
                ("config.json", MODE_CONFIG),
            ] {
                files.push(Arc::new(ControlFile {
                    node: Node {
                        ino: alloc(&counter),
                        name: name.into(),
                        mode,
                    },
                    data: Mutex::new(Vec::new()),
                }));
            }
        }

        let mut index = HashMap::new();
        index.insert(root.node.ino, Entry::Dir(root.clone()));
        for f in root.files.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            index.insert(f.node.ino, Entry::File(f.clone()));
        }

        ControlFs {
            handler,
            index,
            next_inode: counter,
        }
    }

    /// Pre-increment allocation, so the root claims inode 1 (FUSE_ROOT_ID).
    fn alloc_inode(&self) -> u64 {
        self.next_inode.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn attr_for(&self, entry: &Entry) -> FileAttr {
        let (ino, kind, perm, size) = match entry {
            Entry::Dir(d) => (d.node.ino, FileType::Directory, d.node.mode, 0),
            Entry::File(f) => {
                let size = if f.node.name == "config.json" {
                    self.handler.config_json().len() as u64
                } else {
                    0
                };
                (f.node.ino, FileType::RegularFile, f.node.mode, size)
            }
        };
        FileAttr {
            ino,
            size,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind,
            perm,
            nlink: 1,
            uid: 0,
            gid: nix::unistd::getegid().as_raw(),
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn lookup_child(&self, parent: u64, name: &str) -> Option<Entry> {
        let dir = match self.index.get(&parent) {
            Some(Entry::Dir(d)) => d.clone(),
            _ => return None,
        };
        let files = dir.files.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(f) = files.iter().find(|f| f.node.name == name) {
            return Some(Entry::File(f.clone()));
        }
        drop(files);
        let dirs = dir.dirs.lock().unwrap_or_else(|e| e.into_inner());
        dirs.iter()
            .find(|d| d.node.name == name)
            .map(|d| Entry::Dir(d.clone()))
    }
}

impl Filesystem for ControlFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_string_lossy();
        match self.lookup_child(parent, &name) {
            Some(entry) => reply.entry(&TTL, &self.attr_for(&entry), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.index.get(&ino).cloned() {
            Some(entry) => reply.attr(&TTL, &self.attr_for(&entry)),
            None => reply.error(libc::ENOENT),
        }
    }

    // Truncate-on-open lands here; the control files have nothing to keep.
    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.index.get(&ino).cloned() {
            Some(entry) => {
                if let (Entry::File(f), Some(0)) = (&entry, size) {
                    f.data.lock().unwrap_or_else(|e| e.into_inner()).clear();
                }
                reply.attr(&TTL, &self.attr_for(&entry))
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.index.get(&ino) {
            Some(_) => reply.opened(0, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let file = match self.index.get(&ino) {
            Some(Entry::File(f)) => f.clone(),
            Some(Entry::Dir(_)) => return reply.error(libc::EISDIR),
            None => return reply.error(libc::ENOENT),
        };

        let data = if file.node.name == "config.json" {
            self.handler.config_json()
        } else {
            file.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
        };

        let start = (offset as usize).min(data.len());
        let end = (start + size as usize).min(data.len());
        reply.data(&data[start..end]);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let file = match self.index.get(&ino) {
            Some(Entry::File(f)) => f.clone(),
            Some(Entry::Dir(_)) => return reply.error(libc::EISDIR),
            None => return reply.error(libc::ENOENT),
        };

        let payload = String::from_utf8_lossy(data).trim().to_string();
        if let Err(e) = self.handler.dispatch_write(&file.node.name, &payload) {
            error!("control write to {} failed: {e:#}", file.node.name);
            return reply.error(libc::EIO);
        }

        *file.data.lock().unwrap_or_else(|e| e.into_inner()) = data.to_vec();
        reply.written(data.len() as u32);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let dir = match self.index.get(&ino) {
            Some(Entry::Dir(d)) => d.clone(),
            Some(Entry::File(_)) => return reply.error(libc::ENOTDIR),
            None => return reply.error(libc::ENOENT),
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (dir.node.ino, FileType::Directory, ".".into()),
            (dir.node.ino, FileType::Directory, "..".into()),
        ];
        for f in dir.files.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            entries.push((f.node.ino, FileType::RegularFile, f.node.name.clone()));
        }
        for d in dir.dirs.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            entries.push((d.node.ino, FileType::Directory, d.node.name.clone()));
        }

        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(entry.0, (i + 1) as i64, entry.1, &entry.2) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let dir = match self.index.get(&parent) {
            Some(Entry::Dir(d)) => d.clone(),
            _ => return reply.error(libc::ENOENT),
        };

        let file = Arc::new(ControlFile {
            node: Node {
                ino: self.alloc_inode(),
                name: name.to_string_lossy().into_owned(),
                mode: MODE_CONTROL,
            },
            data: Mutex::new(Vec::new()),
        });
        dir.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(file.clone());
        let entry = Entry::File(file.clone());
        self.index.insert(file.node.ino, entry.clone());
        reply.created(&TTL, &self.attr_for(&entry), 0, 0, 0);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let dir = match self.index.get(&parent) {
            Some(Entry::Dir(d)) => d.clone(),
            _ => return reply.error(libc::ENOENT),
        };

        let child = Arc::new(ControlDir {
            node: Node {
                ino: self.alloc_inode(),
                name: name.to_string_lossy().into_owned(),
                mode: MODE_DIR,
            },
            files: Mutex::new(Vec::new()),
            dirs: Mutex::new(Vec::new()),
        });
        dir.dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(child.clone());
        let entry = Entry::Dir(child.clone());
        self.index.insert(child.node.ino, entry.clone());
        reply.entry(&TTL, &self.attr_for(&entry), 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let dir = match self.index.get(&parent) {
            Some(Entry::Dir(d)) => d.clone(),
            _ => return reply.error(libc::ENOENT),
        };
        let name = name.to_string_lossy();

        let mut files = dir.files.lock().unwrap_or_else(|e| e.into_inner());
        match files.iter().position(|f| f.node.name == name) {
            Some(i) => {
                let removed = files.remove(i);
                drop(files);
                self.index.remove(&removed.node.ino);
                reply.ok();
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let dir = match self.index.get(&parent) {
            Some(Entry::Dir(d)) => d.clone(),
            _ => return reply.error(libc::ENOENT),
        };
        let name = name.to_string_lossy();

        let mut dirs = dir.dirs.lock().unwrap_or_else(|e| e.into_inner());
        match dirs.iter().position(|d| d.node.name == name) {
            Some(i) => {
                let removed = dirs.remove(i);
                drop(dirs);
                self.index.remove(&removed.node.ino);
                reply.ok();
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }
}

/// Mount the control surface at the session directory and serve it until
/// the kernel connection closes. Readiness is signalled once the mount is
/// in place, before the serve loop, so the user command observes any
/// mounts performed during setup. Mount failure is fatal to the master.
pub fn start_daemon(
    engine: Arc<dyn Engine>,
    rpc_stream: UnixStream,
    ready: Sender<()>,
) -> Result<()> {
    let rpc = Arc::new(RpcClient::new(rpc_stream, &engine.common().name));
    debug!("rpc client bound under engine name {}", rpc.name);

    let inspector: Arc<dyn ImageInspector> = Arc::new(crate::core::image::HeaderInspector);
    let handler = Arc::new(ControlHandler::new(engine, rpc, inspector));
    let fs = ControlFs::new(handler);

    let options = [
        MountOption::FSName("ocifs".to_string()),
        MountOption::Subtype("ocifs".to_string()),
        MountOption::DefaultPermissions,
    ];
    let mut session = Session::new(fs, Path::new(SESSION_DIR), &options)
        .with_context(|| format!("failed to mount control surface at {SESSION_DIR}"))?;

    // The session owns the mount point from here; dropping it (any exit
    // path below) releases the mount.
    let _ = ready.send(());

    session.run().context("control surface serve loop failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::StubEngine;
    use crate::core::image::{ImageInfo, ImageInspector};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingRpc {
        loops: Mutex<Vec<(String, i32, LoopInfo)>>,
        mounts: Mutex<Vec<(String, String, String, u64, String)>>,
        chroots: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl ContainerRpc for RecordingRpc {
        fn loop_device(&self, image: &str, open_flags: i32, info: LoopInfo) -> Result<u32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.loops
                .lock()
                .unwrap()
                .push((image.into(), open_flags, info));
            Ok(5)
        }

        fn mount(
            &self,
            source: &str,
            target: &str,
            fstype: &str,
            flags: u64,
            options: &str,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.mounts.lock().unwrap().push((
                source.into(),
                target.into(),
                fstype.into(),
                flags,
                options.into(),
            ));
            Ok(())
        }

        fn chroot(&self, path: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.chroots.lock().unwrap().push(path.into());
            Ok(())
        }
    }

    struct FixedInspector(ImageInfo);

    impl ImageInspector for FixedInspector {
        fn inspect(&self, _path: &Path) -> Result<ImageInfo> {
            Ok(self.0)
        }
    }

    fn handler_with(
        inspector: Arc<dyn ImageInspector>,
    ) -> (Arc<ControlHandler>, Arc<RecordingRpc>) {
        let engine: Arc<dyn Engine> = Arc::new(StubEngine::new(b"").unwrap());
        let rpc = Arc::new(RecordingRpc::default());
        (
            Arc::new(ControlHandler::new(engine, rpc.clone(), inspector)),
            rpc,
        )
    }

    #[test]
    fn image_write_loop_mounts_squashfs() {
        let inspector = Arc::new(FixedInspector(ImageInfo {
            format: ImageFormat::Squashfs,
            offset: 0,
            size: 4096,
        }));
        let (handler, rpc) = handler_with(inspector);

        handler.dispatch_write("image", "/img/app.sqsh").unwrap();

        let loops = rpc.loops.lock().unwrap();
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].0, "/img/app.sqsh");
        assert_eq!(loops[0].1, libc::O_RDONLY);
        assert_eq!(loops[0].2.flags, LO_FLAGS_AUTOCLEAR);
        assert_eq!(loops[0].2.size_limit, 4096);

        let mounts = rpc.mounts.lock().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].0, "/dev/loop5");
        assert_eq!(mounts[0].1, CONTAINER_FINALDIR);
        assert_eq!(mounts[0].2, "squashfs");
        assert_eq!(
            mounts[0].3,
            (libc::MS_NOSUID | libc::MS_RDONLY | libc::MS_NODEV) as u64
        );
        assert_eq!(mounts[0].4, "errors=remount-ro");
    }

    #[test]
    fn image_write_binds_directories_without_loop() {
        let inspector = Arc::new(FixedInspector(ImageInfo {
            format: ImageFormat::Directory,
            offset: 0,
            size: 0,
        }));
        let (handler, rpc) = handler_with(inspector);

        handler.dispatch_write("image", "/srv/rootfs").unwrap();

        assert!(rpc.loops.lock().unwrap().is_empty());
        let mounts = rpc.mounts.lock().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].0, "/srv/rootfs");
        assert_eq!(mounts[0].2, "");
        assert_eq!(
            mounts[0].3,
            (libc::MS_BIND | libc::MS_NOSUID | libc::MS_RDONLY | libc::MS_NODEV) as u64
        );
    }

    #[test]
    fn unknown_image_attempts_mount_without_loop() {
        let inspector = Arc::new(FixedInspector(ImageInfo {
            format: ImageFormat::Unknown,
            offset: 0,
            size: 100,
        }));
        let (handler, rpc) = handler_with(inspector);

        handler.dispatch_write("image", "/img/odd.bin").unwrap();

        assert!(rpc.loops.lock().unwrap().is_empty());
        let mounts = rpc.mounts.lock().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].2, "");
    }

    #[test]
    fn chroot_write_targets_the_final_dir() {
        let (handler, rpc) = handler_with(Arc::new(crate::core::image::HeaderInspector));

        handler.dispatch_write("chroot", "anything").unwrap();

        assert_eq!(
            rpc.chroots.lock().unwrap().as_slice(),
            [CONTAINER_FINALDIR]
        );
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mount_write_binds_by_name() {
        let (handler, rpc) = handler_with(Arc::new(crate::core::image::HeaderInspector));

        handler.dispatch_write("mount", "/etc/hosts").unwrap();

        let mounts = rpc.mounts.lock().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].0, "/etc/hosts");
        assert_eq!(
            mounts[0].1,
            format!("{CONTAINER_FINALDIR}/etc/hosts")
        );
        assert_eq!(mounts[0].2, "");
        assert_eq!(mounts[0].3, libc::MS_BIND as u64);
        assert_eq!(mounts[0].4, "");
    }

    #[test]
    fn unrecognized_name_is_a_no_op() {
        let (handler, rpc) = handler_with(Arc::new(crate::core::image::HeaderInspector));

        handler.dispatch_write("notes", "whatever").unwrap();
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn config_json_is_pretty_with_stat_size() {
        let (handler, _rpc) = handler_with(Arc::new(crate::core::image::HeaderInspector));

        let json = handler.config_json();
        let text = String::from_utf8(json.clone()).unwrap();
        assert!(text.contains("\n    \"ociVersion\""));

        let engine: Arc<dyn Engine> = Arc::new(StubEngine::new(b"").unwrap());
        let rpc: Arc<dyn ContainerRpc> = Arc::new(RecordingRpc::default());
        let fs = ControlFs::new(Arc::new(ControlHandler::new(
            engine,
            rpc,
            Arc::new(crate::core::image::HeaderInspector),
        )));
        let entry = fs
            .lookup_child(1, "config.json")
            .expect("config.json exists");
        assert_eq!(fs.attr_for(&entry).size, json.len() as u64);
    }

    #[test]
    fn inodes_are_unique_and_increasing() {
        let (handler, _rpc) = handler_with(Arc::new(crate::core::image::HeaderInspector));
        let fs = ControlFs::new(handler);

        assert!(matches!(fs.index.get(&1), Some(Entry::Dir(_))));
        let mut seen: Vec<u64> = fs.index.keys().copied().collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), fs.index.len());

        let a = fs.alloc_inode();
        let b = fs.alloc_inode();
        assert!(b > a);
        assert!(a > *seen.last().unwrap());
    }

    #[test]
    fn control_file_modes_match_contract() {
        let (handler, _rpc) = handler_with(Arc::new(crate::core::image::HeaderInspector));
        let fs = ControlFs::new(handler);

        for name in ["image", "image_unpriv", "mount", "chroot"] {
            let entry = fs.lookup_child(1, name).expect(name);
            assert_eq!(fs.attr_for(&entry).perm, 0o220, "{name}");
        }
        let config = fs.lookup_child(1, "config.json").unwrap();
        assert_eq!(fs.attr_for(&config).perm, 0o440);

        let root = fs.index.get(&1).cloned().unwrap();
        let attr = fs.attr_for(&root);
        assert_eq!(attr.perm, 0o750);
        assert_eq!(attr.uid, 0);
        assert_eq!(attr.gid, nix::unistd::getegid().as_raw());
    }
}

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use nix::sys::socket::{
    getsockopt, recvmsg, sendmsg, sockopt, ControlMessage, ControlMessageOwned, MsgFlags,
    UnixCredentials,
};
use nix::sys::stat::{umask, Mode};

/// UNIX socket addresses cap out around 108 bytes (sun_path).
const SUN_PATH_MAX: usize = 108;

/// Serializes every chdir-based socket operation: the working directory is
/// process-global, so concurrent long-path listens/dials would race.
static CHDIR_LOCK: Mutex<()> = Mutex::new(());

/// Scoped working-directory change. Holds the process-wide lock for its
/// lifetime and restores the saved directory on drop, on all exit paths.
struct ScopedChdir<'a> {
    saved: PathBuf,
    _guard: MutexGuard<'a, ()>,
}

impl ScopedChdir<'_> {
    fn enter(dir: &Path) -> Result<Self> {
        let guard = CHDIR_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved = std::env::current_dir().context("failed to get current working directory")?;
        std::env::set_current_dir(dir)
            .with_context(|| format!("failed to go into {}", dir.display()))?;
        Ok(ScopedChdir {
            saved,
            _guard: guard,
        })
    }
}

impl Drop for ScopedChdir<'_> {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.saved);
    }
}

/// Bind a listening socket at `path`, working around the sun_path limit:
/// long paths bind by basename from inside their directory.
pub fn listen(path: &Path) -> Result<UnixListener> {
    if path.as_os_str().len() >= SUN_PATH_MAX {
        let dir = path.parent().context("socket path has no directory")?;
        let base = path.file_name().context("socket path has no basename")?;

        let _cwd = ScopedChdir::enter(dir)?;
        return UnixListener::bind(base)
            .with_context(|| format!("failed to listen on {}", path.display()));
    }

    UnixListener::bind(path).with_context(|| format!("failed to listen on {}", path.display()))
}

/// Connect to the socket at `path`, with the same long-path workaround.
pub fn dial(path: &Path) -> Result<UnixStream> {
    if path.as_os_str().len() >= SUN_PATH_MAX {
        let dir = path.parent().context("socket path has no directory")?;
        let base = path.file_name().context("socket path has no basename")?;

        let _cwd = ScopedChdir::enter(dir)?;
        return UnixStream::connect(base)
            .with_context(|| format!("failed to connect to {}", path.display()));
    }

    UnixStream::connect(path).with_context(|| format!("failed to connect to {}", path.display()))
}

/// Create a listening socket whose file ends up mode 0600; the umask is
/// restored on return.
pub fn create_socket(path: &Path) -> Result<UnixListener> {
    let old = umask(Mode::from_bits_truncate(0o177));
    let result = listen(path);
    umask(old);
    result
}

/// Dial `path` and write `data` in one shot.
pub fn write_socket(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut conn =
        dial(path).with_context(|| format!("failed to connect to {} socket", path.display()))?;
    conn.write_all(data)
        .context("failed to send data over socket")?;
    Ok(())
}

/// Send a data buffer plus a set of descriptors as one SCM_RIGHTS message.
pub fn send_fds(conn: &UnixStream, buf: &[u8], fds: &[RawFd]) -> Result<()> {
    let iov = [IoSlice::new(buf)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    sendmsg::<()>(conn.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
        .context("failed to send descriptors over unix socket")?;
    Ok(())
}

/// Receive a data buffer plus passed descriptors. Exactly one control
/// message must be present; the data is returned with trailing NULs
/// stripped. Received descriptors belong to the caller.
pub fn recv_fds(conn: &UnixStream) -> Result<(Vec<u8>, Vec<RawFd>)> {
    let mut buf = vec![0u8; 4096];
    let mut cmsg_buf = vec![0u8; 4096];
    let mut iov = [IoSliceMut::new(&mut buf)];

    let msg = recvmsg::<()>(
        conn.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .context("while reading unix socket")?;

    let mut fds = Vec::new();
    let mut messages = 0;
    for cmsg in msg.cmsgs().context("while parsing control messages")? {
        messages += 1;
        match cmsg {
            ControlMessageOwned::ScmRights(received) => fds.extend(received),
            _ => bail!("unexpected control message on unix socket"),
        }
    }
    if messages != 1 {
        // Late failure still must not leak what we already received.
        for fd in &fds {
            let _ = nix::unistd::close(*fd);
        }
        bail!("no control message found on unix socket");
    }

    let data_len = msg.bytes;
    let mut data = buf;
    data.truncate(data_len);
    while data.last() == Some(&0) {
        data.pop();
    }

    Ok((data, fds))
}

/// Retrieve the connected peer's (pid, uid, gid).
pub fn peer_cred(conn: &UnixStream) -> Result<UnixCredentials> {
    getsockopt(conn, sockopt::PeerCredentials).context("can't get peer credentials")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::io::FromRawFd;

    fn long_socket_path(dir: &Path) -> PathBuf {
        let mut name = String::from("s");
        while dir.join(&name).as_os_str().len() < SUN_PATH_MAX {
            name.push('x');
        }
        dir.join(name)
    }

    #[test]
    fn short_path_listen_and_dial() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ctrl.sock");

        let listener = listen(&path).unwrap();
        let mut client = dial(&path).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        client.write_all(b"ping").unwrap();
        let mut got = [0u8; 4];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");
    }

    #[test]
    fn long_path_listen_and_dial_restore_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        let path = long_socket_path(tmp.path());
        assert!(path.as_os_str().len() >= SUN_PATH_MAX);

        let before = std::env::current_dir().unwrap();
        let listener = listen(&path).unwrap();
        assert_eq!(std::env::current_dir().unwrap(), before);

        let mut client = dial(&path).unwrap();
        assert_eq!(std::env::current_dir().unwrap(), before);

        let (mut server, _) = listener.accept().unwrap();
        client.write_all(b"hello").unwrap();
        let mut got = [0u8; 5];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn cwd_restored_when_bind_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = long_socket_path(tmp.path());

        let before = std::env::current_dir().unwrap();
        listen(&path).unwrap();
        // Second bind on the same path fails; the cwd must still come back.
        assert!(listen(&path).is_err());
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn boundary_lengths_bind_either_way() {
        let tmp = tempfile::tempdir().unwrap();
        let base_len = tmp.path().as_os_str().len() + 1;
        if base_len >= 106 {
            // Temp dir too deep to build a 107-byte path; nothing to test.
            return;
        }

        // 107 bytes: the direct bind path.
        let p107 = tmp.path().join("a".repeat(107 - base_len));
        assert_eq!(p107.as_os_str().len(), 107);
        let _short = listen(&p107).unwrap();
        let _conn = dial(&p107).unwrap();

        // 108 bytes: the chdir workaround kicks in.
        let p108 = tmp.path().join("b".repeat(108 - base_len));
        assert_eq!(p108.as_os_str().len(), 108);
        let before = std::env::current_dir().unwrap();
        let _long = listen(&p108).unwrap();
        let _conn = dial(&p108).unwrap();
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn create_socket_sets_file_mode_0600() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("secure.sock");

        let _listener = create_socket(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // The umask is back to its previous value.
        let current = umask(Mode::from_bits_truncate(0o022));
        umask(current);
        assert_ne!(current, Mode::from_bits_truncate(0o177));
    }

    #[test]
    fn write_socket_delivers_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("w.sock");
        let listener = listen(&path).unwrap();

        write_socket(&path, b"payload").unwrap();

        let (mut server, _) = listener.accept().unwrap();
        let mut got = Vec::new();
        server.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"payload");
    }

    #[test]
    fn fd_passing_round_trip() {
        let (tx, rx) = UnixStream::pair().unwrap();

        let file = tempfile::tempfile().unwrap();
        let orig_fd = file.as_raw_fd();
        send_fds(&tx, b"desc\0\0\0", &[orig_fd]).unwrap();

        let (data, fds) = recv_fds(&rx).unwrap();
        assert_eq!(data, b"desc");
        assert_eq!(fds.len(), 1);

        // The received descriptor points at the same kernel object.
        let orig_ino = nix::sys::stat::fstat(orig_fd).unwrap().st_ino;
        let got_ino = nix::sys::stat::fstat(fds[0]).unwrap().st_ino;
        assert_eq!(orig_ino, got_ino);

        // Receiver owns the new descriptor.
        drop(unsafe { std::fs::File::from_raw_fd(fds[0]) });
    }

    #[test]
    fn multiple_fds_arrive_together() {
        let (tx, rx) = UnixStream::pair().unwrap();

        let a = tempfile::tempfile().unwrap();
        let b = tempfile::tempfile().unwrap();
        send_fds(&tx, b"two", &[a.as_raw_fd(), b.as_raw_fd()]).unwrap();

        let (data, fds) = recv_fds(&rx).unwrap();
        assert_eq!(data, b"two");
        assert_eq!(fds.len(), 2);
        for fd in fds {
            drop(unsafe { std::fs::File::from_raw_fd(fd) });
        }
    }

    #[test]
    fn plain_data_without_ancillary_is_an_error() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"no fds here").unwrap();

        assert!(recv_fds(&rx).is_err());
    }

    #[test]
    fn peer_cred_reports_own_identity_on_socketpair() {
        let (a, _b) = UnixStream::pair().unwrap();
        let cred = peer_cred(&a).unwrap();
        assert_eq!(cred.pid(), std::process::id() as libc::pid_t);
        assert_eq!(cred.uid(), nix::unistd::getuid().as_raw());
    }
}

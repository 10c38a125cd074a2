//! Namespace jail for user processes.
//!
//! Every launch runs three processes:
//!
//! 1. the spawned child, which unshares user, mount, PID, IPC, UTS and
//!    network namespaces, builds a fresh root on a tmpfs and then only
//!    waits for the namespace init and mirrors its exit status;
//! 2. the namespace init (PID 1), which mounts `/proc`, pivots into the new
//!    root, reaps everything in the namespace and reports the payload's
//!    wait status and CPU time over a pipe;
//! 3. the payload, which gets rlimits and `no_new_privs` and is exec'd by
//!    the standard library.
//!
//! When the init exits the kernel kills every process left in the PID
//! namespace, whatever session or process group it moved to. Inside, the
//! payload only sees read-only system directories, its own run directory at
//! [`WORKDIR`], a private `/tmp`, a few character devices and its own
//! `/proc`.
//!
//! Everything that runs between `fork` and `exec` is restricted to
//! async-signal-safe calls on data prepared in [`Jail::new`].

use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{AT_FDCWD, OFlag, open};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare};
use nix::sys::prctl;
use nix::sys::resource::{Resource, UsageWho, getrlimit, getrusage};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::stat::Mode;
use nix::sys::statvfs::{FsFlags, statvfs};
use nix::sys::time::TimeValLike;
use nix::unistd::{
    ForkResult, Pid, chdir, fork, getgid, getuid, mkdir, pipe2, pivot_root, symlinkat,
};

/// Where the run directory appears inside the jail.
pub(crate) const WORKDIR: &str = "/sandbox";
const WORKDIR_C: &CStr = c"/sandbox";

/// Unprivileged ids the payload runs as. Being non-zero, `execve` drops
/// every capability the user namespace granted.
const JAIL_ID: u32 = 1000;

const SYSTEM_DIRS: &[&str] = &[
    "/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/libx32", "/etc",
];
const DEVICES: &[&str] = &["null", "zero", "full", "random", "urandom"];
const DEV_LINKS: &[(&str, &str)] = &[
    ("/proc/self/fd", "fd"),
    ("/proc/self/fd/0", "stdin"),
    ("/proc/self/fd/1", "stdout"),
    ("/proc/self/fd/2", "stderr"),
];

const ROOT_OPTIONS: &CStr = c"mode=0755,size=1m";
const TMP_OPTIONS: &CStr = c"mode=1777,size=64m";

/// Exit status of the jail processes when they cannot report anything better.
const EXIT_SETUP_FAILED: i32 = 125;
/// Upper bound for the descriptor scan when `close_range` is unavailable.
const FD_SCAN_LIMIT: u64 = 65_536;

/// Host directories mirrored read-only into every jail: the system
/// directories plus the install prefix of every `PATH` entry outside them
/// (so that interpreter shims find their runtime). Nothing that overlaps a
/// `private` directory is mirrored.
pub(crate) fn mirrored_dirs(search_path: &str, private: &[&Path]) -> Vec<PathBuf> {
    let overlaps = |dir: &Path| {
        private
            .iter()
            .any(|p| p.starts_with(dir) || dir.starts_with(p))
    };
    let system = SYSTEM_DIRS.iter().map(PathBuf::from);
    let prefixes = std::env::split_paths(search_path)
        .filter(|entry| entry.is_absolute())
        .filter(|entry| !SYSTEM_DIRS.iter().any(|dir| entry.starts_with(dir)))
        .filter_map(|entry| {
            let prefix = entry
                .parent()
                .filter(|p| *p != Path::new("/") && !overlaps(*p));
            match prefix {
                Some(prefix) => Some(prefix.to_path_buf()),
                None => Some(entry).filter(|e| !overlaps(e.as_path())),
            }
        });

    let candidates: BTreeSet<PathBuf> = system
        .chain(prefixes)
        .filter(|dir| !overlaps(dir.as_path()) && dir.is_dir())
        .collect();
    // Sorted, so a parent always comes before anything inside it.
    let mut dirs: Vec<PathBuf> = Vec::new();
    for dir in candidates {
        if !dirs.iter().any(|kept| dir.starts_with(kept)) {
            dirs.push(dir);
        }
    }
    dirs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindKind {
    ReadOnly,
    Writable,
    Device,
}

#[derive(Debug, Clone)]
struct Bind {
    source: CString,
    target: CString,
    kind: BindKind,
}

impl Bind {
    fn apply(&self) -> nix::Result<()> {
        if self.kind == BindKind::Device {
            drop(open(
                self.target.as_c_str(),
                OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
                Mode::from_bits_truncate(0o644),
            )?);
        }
        mount(
            Some(self.source.as_c_str()),
            self.target.as_c_str(),
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )?;

        let mut flags = MsFlags::MS_REMOUNT
            | MsFlags::MS_BIND
            | MsFlags::MS_NOSUID
            | locked_flags(&self.source)?;
        flags |= match self.kind {
            BindKind::ReadOnly => MsFlags::MS_RDONLY | MsFlags::MS_NODEV,
            BindKind::Writable => MsFlags::MS_NODEV,
            BindKind::Device => MsFlags::MS_NOEXEC,
        };
        mount(
            None::<&str>,
            self.target.as_c_str(),
            None::<&str>,
            flags,
            None::<&str>,
        )
    }
}

/// Flags of the mount under `path` that a user namespace may not clear.
/// A remount that drops any of them fails with `EPERM`.
fn locked_flags(path: &CStr) -> nix::Result<MsFlags> {
    let current = statvfs(path)?.flags();
    let mut locked = MsFlags::empty();
    for (fs, ms) in [
        (FsFlags::ST_RDONLY, MsFlags::MS_RDONLY),
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if current.contains(fs) {
            locked |= ms;
        }
    }
    if !current.intersects(FsFlags::ST_NOATIME | FsFlags::ST_RELATIME) {
        locked |= MsFlags::MS_STRICTATIME;
    }
    Ok(locked)
}

/// Everything the jail needs after `fork`, prepared while allocation is
/// still allowed.
#[derive(Debug, Clone)]
pub(crate) struct Jail {
    root: CString,
    proc_dir: CString,
    tmp_dir: CString,
    dirs: Vec<CString>,
    binds: Vec<Bind>,
    links: Vec<(CString, CString)>,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path contains a NUL byte: {}", path.display()),
        )
    })
}

impl Jail {
    /// Lay out a jail rooted at the empty directory `root`, with `work`
    /// bound read-write at [`WORKDIR`] and `mirrored` bound read-only at
    /// their own paths.
    pub fn new(root: &Path, work: &Path, mirrored: &[PathBuf]) -> io::Result<Self> {
        let inside = |path: &Path| root.join(path.strip_prefix("/").unwrap_or(path));
        let dev = inside(Path::new("/dev"));

        let mut dirs = BTreeSet::new();
        let mut add_dir = |target: &Path| {
            for dir in target.ancestors().take_while(|dir| *dir != root) {
                dirs.insert(dir.to_path_buf());
            }
        };
        for path in ["/proc", "/tmp", "/dev", WORKDIR] {
            add_dir(&inside(Path::new(path)));
        }
        for dir in mirrored {
            add_dir(&inside(dir));
        }

        let mut binds = Vec::new();
        for dir in mirrored {
            binds.push(Bind {
                source: c_path(dir)?,
                target: c_path(&inside(dir))?,
                kind: BindKind::ReadOnly,
            });
        }
        for name in DEVICES {
            let source = Path::new("/dev").join(name);
            if source.exists() {
                binds.push(Bind {
                    source: c_path(&source)?,
                    target: c_path(&dev.join(name))?,
                    kind: BindKind::Device,
                });
            }
        }
        binds.push(Bind {
            source: c_path(work)?,
            target: c_path(&inside(Path::new(WORKDIR)))?,
            kind: BindKind::Writable,
        });

        let links = DEV_LINKS
            .iter()
            .map(|(target, name)| {
                Ok((c_path(Path::new(target))?, c_path(&dev.join(name))?))
            })
            .collect::<io::Result<_>>()?;

        Ok(Self {
            root: c_path(root)?,
            proc_dir: c_path(&inside(Path::new("/proc")))?,
            tmp_dir: c_path(&inside(Path::new("/tmp")))?,
            dirs: dirs.iter().map(|dir| c_path(dir)).collect::<io::Result<_>>()?,
            binds,
            links,
            uid_map: format!("{JAIL_ID} {} 1\n", getuid()).into_bytes(),
            gid_map: format!("{JAIL_ID} {} 1\n", getgid()).into_bytes(),
        })
    }

    /// Move the calling process into the jail. Returns only in the payload
    /// process, which the caller then execs. The other two jail processes
    /// end inside this call.
    ///
    /// # Safety
    ///
    /// Must be called in a freshly forked, single-threaded child before
    /// `exec`, as in a `pre_exec` hook.
    pub unsafe fn enter(&self, report: RawFd) -> io::Result<()> {
        unshare(
            CloneFlags::CLONE_NEWUSER
                | CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWIPC
                | CloneFlags::CLONE_NEWUTS
                | CloneFlags::CLONE_NEWNET,
        )?;
        write_file(c"/proc/self/setgroups", b"deny")?;
        write_file(c"/proc/self/uid_map", &self.uid_map)?;
        write_file(c"/proc/self/gid_map", &self.gid_map)?;
        self.build_root()?;
        install_forwarder()?;

        // SAFETY: the caller guarantees a single-threaded child.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => supervise(child),
            ForkResult::Child => self.become_init(report),
        }
    }

    fn build_root(&self) -> nix::Result<()> {
        mount(
            None::<&str>,
            c"/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )?;
        mount(
            Some(c"tmpfs"),
            self.root.as_c_str(),
            Some(c"tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(ROOT_OPTIONS),
        )?;
        for dir in &self.dirs {
            mkdir(dir.as_c_str(), Mode::from_bits_truncate(0o755))?;
        }
        for bind in &self.binds {
            bind.apply()?;
        }
        mount(
            Some(c"tmpfs"),
            self.tmp_dir.as_c_str(),
            Some(c"tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(TMP_OPTIONS),
        )?;
        for (target, link) in &self.links {
            symlinkat(target.as_c_str(), AT_FDCWD, link.as_c_str())?;
        }
        mount(
            None::<&str>,
            self.root.as_c_str(),
            None::<&str>,
            MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            None::<&str>,
        )
    }

    fn become_init(&self, report: RawFd) -> io::Result<()> {
        match self.prepare_init() {
            Ok(ForkResult::Child) => Ok(()),
            Ok(ForkResult::Parent { child }) => reap(child, report),
            Err(errno) => {
                send(report, Report::SetupFailed(errno));
                // SAFETY: terminating a forked child without running destructors.
                unsafe { libc::_exit(EXIT_SETUP_FAILED) }
            }
        }
    }

    fn prepare_init(&self) -> nix::Result<ForkResult> {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: restores the default disposition, no handler involved.
        unsafe { sigaction(Signal::SIGTERM, &default) }?;
        prctl::set_pdeathsig(Signal::SIGKILL)?;
        prctl::set_no_new_privs()?;
        // Mounting proc needs the host's proc still visible in this namespace.
        mount(
            Some(c"proc"),
            self.proc_dir.as_c_str(),
            Some(c"proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )?;
        chdir(self.root.as_c_str())?;
        pivot_root(c".", c".")?;
        umount2(c".", MntFlags::MNT_DETACH)?;
        chdir(WORKDIR_C)?;
        // SAFETY: still single-threaded.
        unsafe { fork() }
    }
}

fn write_file(path: &CStr, contents: &[u8]) -> nix::Result<()> {
    let fd = open(path, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())?;
    nix::unistd::write(&fd, contents)?;
    Ok(())
}

static INIT_PID: AtomicI32 = AtomicI32::new(0);
static TERMINATING: AtomicBool = AtomicBool::new(false);

/// SIGTERM to the outer jail process takes the whole namespace down.
extern "C" fn forward_termination(_: libc::c_int) {
    TERMINATING.store(true, Ordering::SeqCst);
    let init = INIT_PID.load(Ordering::SeqCst);
    if init > 0 {
        // SAFETY: kill is async-signal-safe.
        unsafe { libc::kill(init, libc::SIGKILL) };
    }
}

fn install_forwarder() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(forward_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only touches atomics and calls kill.
    unsafe { sigaction(Signal::SIGTERM, &action) }?;
    Ok(())
}

/// Outer jail process: wait for the namespace init and exit the same way.
fn supervise(init: Pid) -> ! {
    INIT_PID.store(init.as_raw(), Ordering::SeqCst);
    if TERMINATING.load(Ordering::SeqCst) {
        // SAFETY: kill is async-signal-safe.
        unsafe { libc::kill(init.as_raw(), libc::SIGKILL) };
    }
    close_range(0, u32::MAX);
    exit_like(wait_for(init.as_raw()))
}

/// Namespace init: reap everything until the payload is gone, then report.
fn reap(payload: Pid, report: RawFd) -> ! {
    if let Ok(keep) = u32::try_from(report) {
        if keep > 0 {
            close_range(0, keep - 1);
        }
        close_range(keep.saturating_add(1), u32::MAX);
    }
    let status = loop {
        let mut status = 0;
        // SAFETY: plain waitpid on our own children.
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid == payload.as_raw() {
            break status;
        }
        if pid < 0 && Errno::last() != Errno::EINTR {
            break EXIT_SETUP_FAILED << 8;
        }
    };
    send(
        report,
        Report::Finished {
            status,
            cpu: children_cpu_time(),
        },
    );
    // SAFETY: terminating without running destructors.
    unsafe { libc::_exit(0) }
}

fn wait_for(pid: libc::pid_t) -> libc::c_int {
    loop {
        let mut status = 0;
        // SAFETY: plain waitpid on our own child.
        if unsafe { libc::waitpid(pid, &mut status, 0) } == pid {
            return status;
        }
        if Errno::last() != Errno::EINTR {
            return EXIT_SETUP_FAILED << 8;
        }
    }
}

fn exit_like(status: libc::c_int) -> ! {
    if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        // SAFETY: re-raising a fatal signal on ourselves, then exiting.
        unsafe {
            libc::signal(signal, libc::SIG_DFL);
            libc::kill(libc::getpid(), signal);
            libc::_exit(128 + signal)
        }
    }
    let code = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else {
        EXIT_SETUP_FAILED
    };
    // SAFETY: terminating without running destructors.
    unsafe { libc::_exit(code) }
}

fn close_range(first: u32, last: u32) {
    if first > last {
        return;
    }
    // SAFETY: closes descriptors of this process only.
    let closed = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0u32) };
    if closed == 0 {
        return;
    }
    let limit = getrlimit(Resource::RLIMIT_NOFILE)
        .map_or(FD_SCAN_LIMIT, |(soft, _)| soft.min(FD_SCAN_LIMIT));
    let end = u64::from(last).min(limit);
    for fd in u64::from(first)..end {
        if let Ok(fd) = libc::c_int::try_from(fd) {
            // SAFETY: as above.
            unsafe { libc::close(fd) };
        }
    }
}

fn children_cpu_time() -> Duration {
    getrusage(UsageWho::RUSAGE_CHILDREN).map_or(Duration::ZERO, |usage| {
        let micros =
            usage.user_time().num_microseconds() + usage.system_time().num_microseconds();
        Duration::from_micros(u64::try_from(micros).unwrap_or(0))
    })
}

/// What the namespace init tells the daemon once the payload is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Report {
    /// Raw wait status of the payload and the CPU time of everything that
    /// ran in the namespace.
    Finished { status: i32, cpu: Duration },
    /// The jail could not be set up.
    SetupFailed(Errno),
}

const REPORT_LEN: usize = 13;
const TAG_FINISHED: u8 = 1;
const TAG_SETUP_FAILED: u8 = 2;

impl Report {
    fn encode(self) -> [u8; REPORT_LEN] {
        let (tag, value, extra) = match self {
            Report::Finished { status, cpu } => (
                TAG_FINISHED,
                status,
                u64::try_from(cpu.as_micros()).unwrap_or(u64::MAX),
            ),
            Report::SetupFailed(errno) => (TAG_SETUP_FAILED, errno as i32, 0),
        };
        let [v0, v1, v2, v3] = value.to_ne_bytes();
        let [e0, e1, e2, e3, e4, e5, e6, e7] = extra.to_ne_bytes();
        [tag, v0, v1, v2, v3, e0, e1, e2, e3, e4, e5, e6, e7]
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let (&tag, rest) = bytes.split_first()?;
        let (value, rest) = rest.split_first_chunk::<4>()?;
        let extra: &[u8; 8] = rest.try_into().ok()?;
        let value = i32::from_ne_bytes(*value);
        match tag {
            TAG_FINISHED => Some(Report::Finished {
                status: value,
                cpu: Duration::from_micros(u64::from_ne_bytes(*extra)),
            }),
            TAG_SETUP_FAILED => Some(Report::SetupFailed(Errno::from_raw(value))),
            _ => None,
        }
    }
}

fn send(fd: RawFd, report: Report) {
    let bytes = report.encode();
    // SAFETY: a single write of a stack buffer; failure leaves the daemon
    // with the outer exit status only.
    unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
}

/// Pipe carrying the [`Report`] out of the jail.
pub(crate) struct ReportPipe {
    read: OwnedFd,
    write: Option<OwnedFd>,
}

impl ReportPipe {
    pub fn new() -> io::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Self {
            read,
            write: Some(write),
        })
    }

    /// Descriptor number the jail writes to; stays valid across `fork`.
    pub fn writer(&self) -> RawFd {
        self.write.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    /// Drop the daemon's copy once the child has its own.
    pub fn close_writer(&mut self) {
        self.write = None;
    }

    /// The report, if the jail wrote one. Call after the child was reaped.
    pub fn take(&self) -> Option<Report> {
        let mut buf = [0u8; REPORT_LEN + 1];
        let n = nix::unistd::read(&self.read, &mut buf).ok()?;
        Report::decode(buf.get(..n)?)
    }
}

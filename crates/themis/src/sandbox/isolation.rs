//! Limits and namespaces applied to a child between fork and exec
//!
//! Without a jail the plan is applied to the spawned process, which then
//! execs the program. With a jail the spawned process becomes a keeper: it
//! creates the namespaces and forks the namespace's init, which pivots into
//! the jail and forks the program. The init reaps the program and writes an
//! [`ExitReport`] to the report pipe before exiting, which tears down
//! everything left in the namespace. The report carries the program's real
//! wait status: a signal death cannot be mirrored by a namespace init.

use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::libc;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare};
use nix::sys::prctl::set_no_new_privs;
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::stat::Mode;
use nix::sys::statvfs::{FsFlags, statvfs};
use nix::unistd::{
    ForkResult, Pid, chdir, fork, geteuid, pivot_root, read, setgroups, setresgid, setresuid,
    setsid, write,
};

use super::identity::Identity;
use super::jail::BindMount;

/// Size of an encoded [`ExitReport`]
const REPORT_LEN: usize = 4;

/// Wait status `exit(1)`, reported when a child cannot be reaped
const LOST_CHILD_STATUS: i32 = 1 << 8;

/// Everything the child applies to itself before exec.
///
/// Built in the parent; `apply` only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IsolationPlan {
    /// RLIMIT_CPU soft limit in seconds (hard limit is one second more)
    pub cpu_seconds: u64,
    /// RLIMIT_AS in bytes
    pub address_space_bytes: Option<u64>,
    /// RLIMIT_FSIZE in bytes
    pub file_size_bytes: u64,
    pub isolate_network: bool,
    /// The judge lacks CAP_SYS_ADMIN, so namespaces need a user namespace
    pub unprivileged: bool,
    pub identity: Identity,
    /// RLIMIT_NPROC, applied with a switched identity
    pub max_processes: u64,
    pub jail: Option<JailPlan>,
}

/// Root filesystem and reporting channel of a jailed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JailPlan {
    pub root: CString,
    pub mounts: Vec<BindMount>,
    /// Working directory of the program after the pivot
    pub cwd: CString,
    /// Write end of the report pipe
    pub report_fd: RawFd,
}

/// How a jailed program ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitReport {
    /// Raw wait status
    pub status: i32,
}

impl IsolationPlan {
    pub fn new(
        time_limit_ms: u64,
        address_space_bytes: Option<u64>,
        file_size_bytes: u64,
        isolate_network: bool,
    ) -> Self {
        Self {
            // CPU backstop behind the wall clock deadline
            cpu_seconds: time_limit_ms.div_ceil(1000) + 1,
            address_space_bytes,
            file_size_bytes,
            isolate_network,
            unprivileged: !geteuid().is_root(),
            identity: Identity::Inherit,
            max_processes: 0,
            jail: None,
        }
    }

    pub fn with_identity(mut self, identity: Identity, max_processes: u64) -> Self {
        self.identity = identity;
        self.max_processes = max_processes;
        self
    }

    pub fn in_jail(mut self, jail: JailPlan) -> Self {
        self.jail = Some(jail);
        self
    }

    /// Namespaces unshared by the spawned process.
    pub fn namespaces(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.jail.is_some() {
            flags |= CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWIPC
                | CloneFlags::CLONE_NEWUTS;
        }
        if self.isolate_network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.unprivileged && !flags.is_empty() {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        flags
    }

    /// Apply the plan to the current process.
    ///
    /// Runs in the forked child: only raw syscalls, no allocation, no locks.
    /// With a jail, only the program process returns from here.
    pub fn apply(&self) -> io::Result<()> {
        // Own process group so the whole tree can be killed at once
        setsid()?;

        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        setrlimit(Resource::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1)?;
        setrlimit(
            Resource::RLIMIT_FSIZE,
            self.file_size_bytes,
            self.file_size_bytes,
        )?;

        match &self.jail {
            Some(jail) => self.enter_jail(jail)?,
            None if self.isolate_network => unshare(self.namespaces())?,
            None => {}
        }

        self.become_program()
    }

    fn enter_jail(&self, jail: &JailPlan) -> io::Result<()> {
        unshare(self.namespaces())?;
        if let Identity::Mapped { uid_map, gid_map } = &self.identity {
            write_proc(c"/proc/self/setgroups", b"deny")?;
            write_proc(c"/proc/self/gid_map", gid_map)?;
            write_proc(c"/proc/self/uid_map", uid_map)?;
        }

        // SAFETY: the fork child of `Command::spawn` is single threaded.
        if let ForkResult::Parent { child } = unsafe { fork() }? {
            keep(child);
        }

        // PID 1 of the new namespace
        jail.build_root()?;

        // SAFETY: as above.
        if let ForkResult::Parent { child } = unsafe { fork() }? {
            reap(child, jail.report_fd);
        }
        Ok(())
    }

    fn become_program(&self) -> io::Result<()> {
        if let Identity::Switch { uid, gid } = &self.identity {
            setrlimit(
                Resource::RLIMIT_NPROC,
                self.max_processes,
                self.max_processes,
            )?;
            setgroups(&[])?;
            setresgid(*gid, *gid, *gid)?;
            setresuid(*uid, *uid, *uid)?;
        }
        if let Some(jail) = &self.jail {
            chdir(jail.cwd.as_c_str())?;
        }
        set_no_new_privs()?;
        if let Some(bytes) = self.address_space_bytes {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        Ok(())
    }
}

impl JailPlan {
    /// Bind everything into the jail and make it the root.
    fn build_root(&self) -> io::Result<()> {
        // Nothing below may propagate back to the host
        mount(
            None::<&CStr>,
            c"/",
            None::<&CStr>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&CStr>,
        )?;
        bind(&self.root, &self.root)?;
        for bind_mount in &self.mounts {
            bind(&bind_mount.source, &bind_mount.target)?;
            if !bind_mount.writable {
                remount_read_only(&bind_mount.target)?;
            }
        }

        chdir(self.root.as_c_str())?;
        pivot_root(c".", c".")?;
        umount2(c".", MntFlags::MNT_DETACH)?;
        chdir(c"/")?;
        remount_read_only(c"/")?;
        Ok(())
    }
}

impl ExitReport {
    fn encode(&self) -> [u8; REPORT_LEN] {
        self.status.to_le_bytes()
    }

    /// Read the report of an exited keeper. `None` when the init was killed
    /// before writing one.
    pub fn read_from(reader: &OwnedFd) -> Option<Self> {
        let mut bytes = [0u8; REPORT_LEN];
        match read(reader, &mut bytes) {
            Ok(REPORT_LEN) => Some(Self {
                status: i32::from_le_bytes(bytes),
            }),
            _ => None,
        }
    }
}

fn bind(source: &CStr, target: &CStr) -> io::Result<()> {
    mount(
        Some(source),
        target,
        None::<&CStr>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&CStr>,
    )?;
    Ok(())
}

/// Remount a bind read-only, keeping the flags a user namespace may not drop.
fn remount_read_only(target: &CStr) -> io::Result<()> {
    let current = statvfs(target)?.flags();
    let mut flags =
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID;
    for (kept, flag) in [
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if current.contains(kept) {
            flags |= flag;
        }
    }
    mount(None::<&CStr>, target, None::<&CStr>, flags, None::<&CStr>)?;
    Ok(())
}

fn write_proc(path: &CStr, contents: &[u8]) -> io::Result<()> {
    let fd = open(path, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())?;
    write(&fd, contents)?;
    Ok(())
}

/// Keeper: wait for the namespace's init and exit like it.
fn keep(init: Pid) -> ! {
    close_fds_except(None);
    exit_like(reap_until(init))
}

/// Init: reap the program, report it and exit like it.
fn reap(program: Pid, report_fd: RawFd) -> ! {
    close_fds_except(Some(report_fd));
    let status = reap_until(program);
    let report = ExitReport { status };
    // SAFETY: `report_fd` was inherited open and nothing here closes it.
    let _ = write(unsafe { BorrowedFd::borrow_raw(report_fd) }, &report.encode());
    exit_like(status)
}

/// Reap children, orphans included, until `target` exits; its wait status.
fn reap_until(target: Pid) -> i32 {
    loop {
        let mut status = 0;
        // SAFETY: the out-pointer is valid for the call.
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid == target.as_raw() {
            return status;
        }
        if pid < 0 && Errno::last() != Errno::EINTR {
            return LOST_CHILD_STATUS;
        }
    }
}

fn exit_like(status: i32) -> ! {
    let code = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    };
    // SAFETY: terminates without running any of the parent's destructors.
    unsafe { libc::_exit(code) }
}

/// Close every descriptor but `keep`, including the spawn error pipe the
/// parent waits on.
fn close_fds_except(keep: Option<RawFd>) {
    match keep {
        Some(fd) if fd > 0 => {
            close_range(0, fd as u32 - 1);
            close_range(fd as u32 + 1, u32::MAX);
        }
        _ => close_range(0, u32::MAX),
    }
}

fn close_range(first: u32, last: u32) {
    // SAFETY: closing descriptors has no memory effects.
    let closed = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            last as libc::c_uint,
            0 as libc::c_uint,
        )
    };
    if closed != 0 {
        // Kernels before 5.9
        for fd in first..=last.min(4095) {
            // SAFETY: as above.
            unsafe { libc::close(fd as libc::c_int) };
        }
    }
}

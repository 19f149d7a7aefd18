//! System call classes a domain may be allowed to issue.

bitflags::bitflags! {
    /// Allow-mask of a domain.
    #[derive(Default)]
    pub struct SyscallClass: u32 {
        /// Files and file descriptors.
        const FILE = 1 << 0;
        /// Sockets.
        const NET = 1 << 1;
        /// Address space management.
        const MEMORY = 1 << 2;
        /// Process identity and termination.
        const PROCESS = 1 << 3;
        /// Clocks and timers.
        const TIME = 1 << 4;
        /// Signal masks and handlers.
        const SIGNAL = 1 << 5;
        /// Futexes.
        const SYNC = 1 << 6;
        /// Housekeeping a language runtime does on its own.
        const RUNTIME = 1 << 7;
    }
}

/// System calls that only the host may issue. Guest code never gets them,
/// whatever its mask says.
pub const HOST_ONLY: &[u64] = &[
    libc::SYS_rt_sigreturn as u64,
    libc::SYS_clone as u64,
    libc::SYS_fork as u64,
    libc::SYS_vfork as u64,
    libc::SYS_execve as u64,
    libc::SYS_ptrace as u64,
    libc::SYS_arch_prctl as u64,
    libc::SYS_seccomp as u64,
    libc::SYS_execveat as u64,
    libc::SYS_pkey_mprotect as u64,
    libc::SYS_pkey_alloc as u64,
    libc::SYS_pkey_free as u64,
    libc::SYS_clone3 as u64,
];

/// Class of system call `nr`, if it belongs to one.
pub fn classify(nr: u64) -> Option<SyscallClass> {
    use libc::*;
    let nr = nr as c_long;
    let class = match nr {
        SYS_read | SYS_write | SYS_open | SYS_close | SYS_stat | SYS_fstat | SYS_lstat
        | SYS_poll | SYS_lseek | SYS_ioctl | SYS_pread64 | SYS_pwrite64 | SYS_readv
        | SYS_writev | SYS_access | SYS_pipe | SYS_select | SYS_dup | SYS_dup2 | SYS_fcntl
        | SYS_flock | SYS_fsync | SYS_fdatasync | SYS_truncate | SYS_ftruncate
        | SYS_getdents | SYS_getcwd | SYS_chdir | SYS_rename | SYS_mkdir | SYS_rmdir
        | SYS_creat | SYS_link | SYS_unlink | SYS_readlink | SYS_chmod | SYS_fchmod
        | SYS_chown | SYS_getdents64 | SYS_openat | SYS_mkdirat | SYS_newfstatat
        | SYS_unlinkat | SYS_renameat | SYS_readlinkat | SYS_faccessat | SYS_pselect6
        | SYS_ppoll | SYS_dup3 | SYS_pipe2 | SYS_epoll_create | SYS_epoll_wait
        | SYS_epoll_ctl | SYS_epoll_pwait | SYS_epoll_create1 | SYS_eventfd2 | SYS_statx => {
            SyscallClass::FILE
        }
        SYS_socket | SYS_connect | SYS_accept | SYS_sendto | SYS_recvfrom | SYS_sendmsg
        | SYS_recvmsg | SYS_shutdown | SYS_bind | SYS_listen | SYS_getsockname
        | SYS_getpeername | SYS_socketpair | SYS_setsockopt | SYS_getsockopt | SYS_accept4
        | SYS_recvmmsg | SYS_sendmmsg => SyscallClass::NET,
        SYS_mmap | SYS_mprotect | SYS_munmap | SYS_brk | SYS_mremap | SYS_msync
        | SYS_mincore | SYS_madvise => SyscallClass::MEMORY,
        SYS_getpid | SYS_exit | SYS_wait4 | SYS_kill | SYS_uname | SYS_getuid | SYS_getgid
        | SYS_geteuid | SYS_getegid | SYS_getppid | SYS_gettid | SYS_tgkill
        | SYS_exit_group => SyscallClass::PROCESS,
        SYS_nanosleep | SYS_getitimer | SYS_alarm | SYS_setitimer | SYS_gettimeofday
        | SYS_time | SYS_timer_create | SYS_timer_settime | SYS_timer_gettime
        | SYS_timer_delete | SYS_clock_gettime | SYS_clock_getres | SYS_clock_nanosleep => {
            SyscallClass::TIME
        }
        SYS_rt_sigaction | SYS_rt_sigprocmask | SYS_rt_sigpending | SYS_rt_sigtimedwait
        | SYS_rt_sigqueueinfo | SYS_rt_sigsuspend | SYS_sigaltstack => SyscallClass::SIGNAL,
        SYS_futex | SYS_set_robust_list | SYS_get_robust_list => SyscallClass::SYNC,
        SYS_sched_yield | SYS_sched_getaffinity | SYS_set_tid_address | SYS_prlimit64
        | SYS_getrandom | SYS_membarrier | SYS_rseq => SyscallClass::RUNTIME,
        _ => return None,
    };
    Some(class)
}

/// Whether guest code holding `mask` may issue `nr`.
pub fn allowed(mask: SyscallClass, nr: u64) -> bool {
    !HOST_ONLY.contains(&nr) && classify(nr).map_or(false, |c| mask.contains(c))
}

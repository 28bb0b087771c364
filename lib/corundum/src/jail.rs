use crate::shared::{ErrorType, ProtoError, ProtoResult};
use byteorder::{NativeEndian, ReadBytesExt};
use flux::choose;
use std::fs;
use std::io;
use std::path::Path;

/// Size of one BPF filter instruction on the wire; raw filter files must be
/// an exact multiple of it.
pub const FILTER_ENTRY_SIZE: usize = 8;

// Classic BPF instruction set, the subset seccomp programs use.
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_LOG: u32 = 0x7ffc_0000;

// Offset of the syscall number in seccomp_data.
const SECCOMP_DATA_NR_OFFSET: u32 = 0;

const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;
const SECCOMP_FILTER_FLAG_TSYNC: libc::c_ulong = 2;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct SockFilter {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

/// A seccomp policy applied inside a freshly forked worker, before it starts
/// dispatching guest requests. Built either from a raw BPF filter file or
/// from a textual allow-list. `Jail::none` never restricts anything and is
/// what thread workers use.
#[derive(Debug)]
pub struct Jail {
    filter: Option<Vec<SockFilter>>,
}

impl Jail {
    /// A jail that restricts nothing.
    #[inline]
    pub fn none() -> Jail {
        Jail { filter: None }
    }

    /// True when entering this jail installs a filter.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.filter.is_some()
    }

    /// Loads a raw BPF filter. The file is the byte image of a
    /// `sock_filter` array and its length must be a multiple of
    /// [`FILTER_ENTRY_SIZE`].
    pub fn from_bpf_file<P: AsRef<Path>>(path: P) -> ProtoResult<Jail> {
        let raw = fs::read(path)?;
        Jail::from_bpf_bytes(&raw)
    }

    pub fn from_bpf_bytes(raw: &[u8]) -> ProtoResult<Jail> {
        if raw.is_empty() || raw.len() % FILTER_ENTRY_SIZE != 0 {
            return Err(ProtoError::Fatal(ErrorType::Jail));
        }

        let mut filter = Vec::with_capacity(raw.len() / FILTER_ENTRY_SIZE);

        for mut entry in raw.chunks_exact(FILTER_ENTRY_SIZE) {
            filter.push(SockFilter {
                code: entry.read_u16::<NativeEndian>()?,
                jt: entry.read_u8()?,
                jf: entry.read_u8()?,
                k: entry.read_u32::<NativeEndian>()?,
            });
        }

        Ok(Jail { filter: Some(filter) })
    }

    /// Loads a textual policy: one allowed syscall name per line, `#`
    /// comments, and an optional `@log-only` directive that reports
    /// violations instead of killing the worker.
    pub fn from_policy_file<P: AsRef<Path>>(path: P) -> ProtoResult<Jail> {
        let text = fs::read_to_string(path)?;
        Jail::from_policy_str(&text)
    }

    pub fn from_policy_str(text: &str) -> ProtoResult<Jail> {
        let mut allowed = Vec::new();
        let mut log_only = false;

        for line in text.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line == "@log-only" {
                log_only = true;
                continue;
            }

            match syscall_number(line) {
                Some(nr) => allowed.push(nr),
                None => return Err(ProtoError::Fatal(ErrorType::Jail)),
            }
        }

        // The jump targets below are 8-bit offsets.
        if allowed.is_empty() || allowed.len() > u8::max_value() as usize {
            return Err(ProtoError::Fatal(ErrorType::Jail));
        }

        Ok(Jail {
            filter: Some(Self::assemble(&allowed, log_only)),
        })
    }

    /// Assembles the allow-list program: load the syscall number, one
    /// equality test per allowed syscall jumping to the trailing ALLOW, and
    /// a default action of kill (or log) for everything else.
    fn assemble(allowed: &[u32], log_only: bool) -> Vec<SockFilter> {
        let n = allowed.len();
        let mut prog = Vec::with_capacity(n + 3);

        prog.push(SockFilter {
            code: BPF_LD | BPF_W | BPF_ABS,
            jt: 0,
            jf: 0,
            k: SECCOMP_DATA_NR_OFFSET,
        });

        for (i, &nr) in allowed.iter().enumerate() {
            prog.push(SockFilter {
                code: BPF_JMP | BPF_JEQ | BPF_K,
                jt: (n - i) as u8,
                jf: 0,
                k: nr,
            });
        }

        prog.push(SockFilter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: choose!(log_only => SECCOMP_RET_LOG, SECCOMP_RET_KILL_PROCESS),
        });

        prog.push(SockFilter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: SECCOMP_RET_ALLOW,
        });

        prog
    }

    /// Applies the jail to the current process. Runs in the forked worker
    /// between fork and the dispatch loop; after it returns the worker
    /// cannot execute disallowed syscalls.
    pub fn enter(&self) -> ProtoResult<()> {
        let filter = match &self.filter {
            Some(filter) => filter,
            None => return Ok(()),
        };

        // A filter may only be installed without privileges once new
        // privilege acquisition is disabled for good.
        let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }

        let prog = SockFprog {
            len: filter.len() as u16,
            filter: filter.as_ptr(),
        };

        let ret = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                SECCOMP_FILTER_FLAG_TSYNC,
                &prog as *const SockFprog,
            )
        };

        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(())
    }
}

/// Resolves a policy syscall name to its number on the build architecture.
/// The vocabulary covers what a dispatch worker needs; anything else is a
/// policy authoring error.
fn syscall_number(name: &str) -> Option<u32> {
    let nr = match name {
        "brk" => libc::SYS_brk,
        "clock_gettime" => libc::SYS_clock_gettime,
        "close" => libc::SYS_close,
        "dup" => libc::SYS_dup,
        "dup3" => libc::SYS_dup3,
        "eventfd2" => libc::SYS_eventfd2,
        "exit" => libc::SYS_exit,
        "exit_group" => libc::SYS_exit_group,
        "fcntl" => libc::SYS_fcntl,
        "fstat" => libc::SYS_fstat,
        "fsync" => libc::SYS_fsync,
        "ftruncate" => libc::SYS_ftruncate,
        "futex" => libc::SYS_futex,
        "getpid" => libc::SYS_getpid,
        "getrandom" => libc::SYS_getrandom,
        "gettid" => libc::SYS_gettid,
        "ioctl" => libc::SYS_ioctl,
        "lseek" => libc::SYS_lseek,
        "madvise" => libc::SYS_madvise,
        "memfd_create" => libc::SYS_memfd_create,
        "mmap" => libc::SYS_mmap,
        "mprotect" => libc::SYS_mprotect,
        "mremap" => libc::SYS_mremap,
        "munmap" => libc::SYS_munmap,
        "ppoll" => libc::SYS_ppoll,
        "prctl" => libc::SYS_prctl,
        "read" => libc::SYS_read,
        "readv" => libc::SYS_readv,
        "recvmsg" => libc::SYS_recvmsg,
        "restart_syscall" => libc::SYS_restart_syscall,
        "rt_sigaction" => libc::SYS_rt_sigaction,
        "rt_sigprocmask" => libc::SYS_rt_sigprocmask,
        "rt_sigreturn" => libc::SYS_rt_sigreturn,
        "sched_yield" => libc::SYS_sched_yield,
        "sendmsg" => libc::SYS_sendmsg,
        "set_robust_list" => libc::SYS_set_robust_list,
        "shutdown" => libc::SYS_shutdown,
        "sigaltstack" => libc::SYS_sigaltstack,
        "write" => libc::SYS_write,
        "writev" => libc::SYS_writev,
        _ => return None,
    };

    Some(nr as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_inactive() {
        assert!(!Jail::none().is_active());
        assert!(Jail::none().enter().is_ok());
    }

    #[test]
    fn test_policy_parse() {
        let jail = Jail::from_policy_str(
            r#"
# dispatch loop essentials
read
write
recvmsg
sendmsg
close
exit_group
"#,
        )
        .unwrap();

        assert!(jail.is_active());

        let filter = jail.filter.unwrap();

        // Load, six tests, deny, allow.
        assert_eq!(filter.len(), 9);
        assert_eq!(filter[0].code, BPF_LD | BPF_W | BPF_ABS);
        assert_eq!(filter[1].k, libc::SYS_read as u32);
        assert_eq!(filter[7].k, SECCOMP_RET_KILL_PROCESS);
        assert_eq!(filter[8].k, SECCOMP_RET_ALLOW);

        // Every test jumps to the trailing allow instruction.
        for (i, entry) in filter[1..7].iter().enumerate() {
            assert_eq!(entry.jt as usize, 6 - i);
            assert_eq!(entry.jf, 0);
        }
    }

    #[test]
    fn test_policy_log_only() {
        let jail = Jail::from_policy_str("@log-only\nread\n").unwrap();

        let filter = jail.filter.unwrap();

        assert_eq!(filter[2].k, SECCOMP_RET_LOG);
    }

    #[test]
    fn test_policy_err_unknown_syscall() {
        let result = Jail::from_policy_str("read\nopen_by_handle_at\n");

        assert_eq!(result.unwrap_err(), ProtoError::Fatal(ErrorType::Jail));
    }

    #[test]
    fn test_policy_err_empty() {
        let result = Jail::from_policy_str("# nothing allowed\n");

        assert_eq!(result.unwrap_err(), ProtoError::Fatal(ErrorType::Jail));
    }

    #[test]
    fn test_bpf_image_roundtrip() {
        let image: &[u8] = &[
            0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // LD [0]
            0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x7f, // RET ALLOW
        ];

        let jail = Jail::from_bpf_bytes(image).unwrap();
        let filter = jail.filter.unwrap();

        assert_eq!(filter.len(), 2);
        assert_eq!(filter[0].code, BPF_LD | BPF_W | BPF_ABS);
        assert_eq!(filter[1].code, BPF_RET | BPF_K);
        assert_eq!(filter[1].k, SECCOMP_RET_ALLOW);
    }

    #[test]
    fn test_bpf_image_err_partial_entry() {
        let result = Jail::from_bpf_bytes(&[0u8; FILTER_ENTRY_SIZE + 3]);

        assert_eq!(result.unwrap_err(), ProtoError::Fatal(ErrorType::Jail));
    }

    #[test]
    fn test_bpf_image_err_empty() {
        let result = Jail::from_bpf_bytes(&[]);

        assert_eq!(result.unwrap_err(), ProtoError::Fatal(ErrorType::Jail));
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cross-process descriptor import.
//!
//! Shareable memory handles are plain file descriptors that are only valid in
//! the exporting process. A peer duplicates them into its own descriptor table
//! with `pidfd_open` + `pidfd_getfd` (Linux 5.6+), which requires every rank
//! to run on the same host.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::unistd::getpid;

use crate::{Result, SymmMemError};

/// Returns the id of the calling process.
pub(crate) fn current_pid() -> i32 {
    getpid().as_raw()
}

fn pidfd_open(pid: i32) -> Result<OwnedFd> {
    // SAFETY: pidfd_open takes a pid and flags and returns a new descriptor or -1.
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if ret < 0 {
        return Err(map_errno("pidfd_open", Errno::last()));
    }
    // SAFETY: the kernel returned a fresh descriptor that we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

fn pidfd_getfd(pidfd: BorrowedFd<'_>, target_fd: RawFd) -> Result<OwnedFd> {
    // SAFETY: pidfd is a valid pidfd and flags must be 0.
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd.as_raw_fd(), target_fd, 0) };
    if ret < 0 {
        return Err(map_errno("pidfd_getfd", Errno::last()));
    }
    // SAFETY: the kernel returned a fresh descriptor that we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

fn map_errno(op: &str, errno: Errno) -> SymmMemError {
    match errno {
        Errno::ENOSYS => SymmMemError::Unsupported(format!(
            "{} is not available; importing descriptors from peer processes requires Linux 5.6+",
            op
        )),
        other => SymmMemError::Io(std::io::Error::from_raw_os_error(other as i32)),
    }
}

/// Produces a descriptor in this process equivalent to descriptor `fd` of
/// process `pid`.
///
/// Descriptors exported by this very process are duplicated directly.
pub(crate) fn import_remote_fd(pid: i32, fd: RawFd) -> Result<OwnedFd> {
    if pid == current_pid() {
        // SAFETY: the descriptor belongs to this process and stays open for the
        // duration of the rendezvous that published it.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        return Ok(borrowed.try_clone_to_owned()?);
    }

    let pidfd = pidfd_open(pid)?;
    let imported = pidfd_getfd(pidfd.as_fd(), fd)?;
    tracing::trace!(pid, fd, "imported peer descriptor");
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_import_from_own_process_duplicates() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"shared").unwrap();

        let imported = import_remote_fd(current_pid(), file.as_raw_fd()).unwrap();
        assert_ne!(imported.as_raw_fd(), file.as_raw_fd());

        let mut dup = std::fs::File::from(imported);
        dup.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        dup.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "shared");
    }

    #[test]
    fn test_import_from_child_process() {
        use std::os::unix::fs::MetadataExt;
        use std::process::{Command, Stdio};

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"from child").unwrap();
        let expected = file.metadata().unwrap();

        let mut child = Command::new("sleep")
            .arg("5")
            .stdin(Stdio::from(file.try_clone().unwrap()))
            .spawn()
            .unwrap();
        let result = import_remote_fd(child.id() as i32, 0);
        child.kill().unwrap();
        child.wait().unwrap();

        let imported = match result {
            Err(SymmMemError::Unsupported(_)) => return,
            other => other.unwrap(),
        };
        let mut dup = std::fs::File::from(imported);
        let actual = dup.metadata().unwrap();
        assert_eq!((actual.dev(), actual.ino()), (expected.dev(), expected.ino()));

        dup.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        dup.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "from child");
    }

    #[test]
    fn test_import_from_missing_process_fails() {
        // pid_max never reaches i32::MAX, so this process cannot exist.
        assert!(import_remote_fd(i32::MAX, 0).is_err());
    }
}

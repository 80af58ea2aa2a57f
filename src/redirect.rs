//! Opening redirection targets and binding descriptors onto the standard
//! streams of the calling process.

use crate::error::RedirectionError;
use crate::parser::{Direction, StagePlan};
use nix::fcntl::{open, OFlag};
use nix::libc::{STDIN_FILENO, STDOUT_FILENO};
use nix::sys::stat::Mode;
use nix::unistd::dup2;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;

impl Direction {
    fn stream(self) -> RawFd {
        match self {
            Direction::Input => STDIN_FILENO,
            Direction::Output => STDOUT_FILENO,
        }
    }

    fn flags(self) -> OFlag {
        match self {
            Direction::Input => OFlag::O_RDONLY,
            Direction::Output => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        }
    }
}

/// Opens `path` with the access mode `direction` needs. Output files are
/// created with mode 0644 and truncated.
pub fn open_target(path: &Path, direction: Direction) -> Result<OwnedFd, RedirectionError> {
    let mode = Mode::from_bits_truncate(0o644);
    let fd = open(path, direction.flags() | OFlag::O_CLOEXEC, mode).map_err(|source| {
        RedirectionError::Open {
            direction,
            path: path.to_path_buf(),
            source,
        }
    })?;
    // SAFETY: `open` just returned this descriptor and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Makes `fd` the process's stdin or stdout and releases the original.
pub fn rebind(fd: OwnedFd, direction: Direction) -> Result<(), RedirectionError> {
    let target = direction.stream();
    if fd.as_raw_fd() == target {
        // Already in place; dropping it would close the stream.
        let _ = fd.into_raw_fd();
        return Ok(());
    }
    dup2(fd.as_raw_fd(), target)
        .map_err(|source| RedirectionError::Rebind { direction, source })?;
    Ok(())
}

/// Opens and binds every redirection in `plan`, input first.
pub fn apply(plan: &StagePlan) -> Result<(), RedirectionError> {
    let targets = [
        (Direction::Input, plan.input.as_deref()),
        (Direction::Output, plan.output.as_deref()),
    ];
    for (direction, path) in targets {
        if let Some(path) = path {
            let fd = open_target(path, direction)?;
            rebind(fd, direction)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::process_lock;
    use std::fs::{self, File};
    use std::io::{Read, Write};

    #[test]
    fn test_output_target_is_created_and_truncated() {
        let _lock = process_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        fs::write(&path, "stale contents\n").unwrap();

        let fd = open_target(&path, Direction::Output).unwrap();
        let mut file = File::from(fd);
        file.write_all(b"hi\n").unwrap();
        drop(file);

        assert_eq!(fs::read_to_string(&path).unwrap(), "hi\n");
    }

    #[test]
    fn test_input_target_reads_file() {
        let _lock = process_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        fs::write(&path, "one\ntwo\n").unwrap();

        let mut file = File::from(open_target(&path, Direction::Input).unwrap());
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "one\ntwo\n");
    }

    #[test]
    fn test_missing_input_file() {
        let _lock = process_lock();
        let dir = tempfile::tempdir().unwrap();
        let err = open_target(&dir.path().join("absent"), Direction::Input).unwrap_err();
        match err {
            RedirectionError::Open {
                direction, source, ..
            } => {
                assert_eq!(direction, Direction::Input);
                assert_eq!(source, nix::errno::Errno::ENOENT);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!dir.path().join("absent").exists());
    }

    #[test]
    fn test_output_into_missing_directory() {
        let _lock = process_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no/such/dir/out.txt");
        assert!(matches!(
            open_target(&path, Direction::Output),
            Err(RedirectionError::Open { .. })
        ));
    }

    #[test]
    fn test_apply_without_redirections_is_noop() {
        let plan = StagePlan {
            argv: vec!["true".into()],
            ..StagePlan::default()
        };
        assert!(apply(&plan).is_ok());
    }
}

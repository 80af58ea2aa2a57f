use crate::error::{exec_reason, RedirectionError, ShellError};
use crate::parser::{build_stage, CommandLine, Direction, StagePlan, StageRole};
use crate::redirect;
use crate::signals::ForegroundChild;
use nix::errno::Errno;
use nix::libc::{self, STDERR_FILENO};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, execvp, fork, pipe, ForkResult, Pid};
use std::ffi::CString;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use tracing::{debug, warn};

/// Exit code a child uses when it cannot reach its new program image.
const CHILD_FAILURE: i32 = 1;

/// A stage resolved in the parent, so the forked child only has to open
/// files, rebind streams and exec.
struct Launch {
    plan: StagePlan,
    argv: Vec<CString>,
}

/// Either a ready launch or the line the child prints before giving up.
type Prepared = Result<Launch, String>;

/// Runs one classified command line to completion and returns the exit code
/// of the command (the reader's, for a pipeline).
pub fn execute_command(line: CommandLine<'_>, foreground: &ForegroundChild) -> Result<i32, ShellError> {
    match line {
        CommandLine::Simple(tokens) => run_simple(tokens, foreground),
        CommandLine::Pipeline { writer, reader } => run_pipeline(writer, reader),
    }
}

/// Non-pipe path: one child, tracked as the foreground child while the shell
/// waits on it.
pub fn run_simple(tokens: &[String], foreground: &ForegroundChild) -> Result<i32, ShellError> {
    if tokens.is_empty() {
        return Ok(0);
    }
    let prepared = prepare(tokens, StageRole::Standalone);

    // SAFETY: the child only touches pre-built data, then calls exec or _exit.
    match unsafe { fork() }.map_err(ShellError::Spawn)? {
        ForkResult::Child => {
            ignore_interrupts();
            run_child(prepared, None)
        }
        ForkResult::Parent { child } => {
            debug!(pid = %child, program = %tokens[0], "spawned foreground child");
            {
                let _guard = foreground.track(child);
                wait_terminated(child)?;
            }
            // The slot is already clear, so the pid cannot be signalled after
            // it is released here.
            reap(child)
        }
    }
}

/// Pipe path: writer's stdout feeds reader's stdin. Both children are spawned
/// before the parent drops its copies of the pipe ends.
pub fn run_pipeline(writer: &[String], reader: &[String]) -> Result<i32, ShellError> {
    let writer_stage = prepare(writer, StageRole::Writer);
    let reader_stage = prepare(reader, StageRole::Reader);

    let (read_end, write_end) = pipe().map_err(ShellError::Pipe)?;
    // SAFETY: fresh descriptors from pipe(2), owned by nobody else.
    let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(read_end), OwnedFd::from_raw_fd(write_end)) };

    // SAFETY: see run_simple.
    let writer_pid = match unsafe { fork() }.map_err(ShellError::Spawn)? {
        ForkResult::Child => {
            drop(read_end);
            run_child(writer_stage, Some((write_end, Direction::Output)))
        }
        ForkResult::Parent { child } => child,
    };

    // SAFETY: see run_simple.
    let reader_pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(write_end);
            run_child(reader_stage, Some((read_end, Direction::Input)))
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(errno) => {
            drop(read_end);
            drop(write_end);
            reap_all(None)?;
            return Err(ShellError::Spawn(errno));
        }
    };
    debug!(writer = %writer_pid, reader = %reader_pid, "spawned pipeline");

    drop(read_end);
    drop(write_end);

    Ok(reap_all(Some(reader_pid))?.unwrap_or(0))
}

fn prepare(tokens: &[String], role: StageRole) -> Prepared {
    let plan = build_stage(tokens, role).map_err(child_message)?;
    let argv = plan
        .argv
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| child_message(ShellError::exec(plan.program().unwrap_or_default(), Errno::EINVAL)))?;
    Ok(Launch { plan, argv })
}

fn child_message(err: ShellError) -> String {
    format!("mysh: {err}\n")
}

fn ignore_interrupts() {
    // SAFETY: SIG_IGN installs no handler code.
    let _ = unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) };
}

/// Child side of a fork: binds the pipe end (if any), then the stage's own
/// redirections, then replaces the process image. Never returns.
fn run_child(prepared: Prepared, pipe_end: Option<(OwnedFd, Direction)>) -> ! {
    let launch = match prepared {
        Ok(launch) => launch,
        Err(message) => exit_child(&[message.as_bytes()]),
    };
    if let Some((fd, direction)) = pipe_end {
        if let Err(err) = redirect::rebind(fd, direction) {
            redirection_failure(&err);
        }
    }
    if let Err(err) = redirect::apply(&launch.plan) {
        redirection_failure(&err);
    }

    let errno = match execvp(&launch.argv[0], &launch.argv) {
        Ok(never) => match never {},
        Err(errno) => errno,
    };
    exit_child(&[
        b"mysh: ",
        launch.argv[0].as_bytes(),
        b": ",
        exec_reason(errno).as_bytes(),
        b"\n",
    ])
}

fn redirection_failure(err: &RedirectionError) -> ! {
    match err {
        RedirectionError::Open {
            direction,
            path,
            source,
        } => exit_child(&[
            b"mysh: invalid standard ",
            direction.as_str().as_bytes(),
            b" redirect `",
            path.as_os_str().as_bytes(),
            b"`: ",
            source.desc().as_bytes(),
            b"\n",
        ]),
        RedirectionError::Rebind { direction, source } => exit_child(&[
            b"mysh: cannot rebind standard ",
            direction.as_str().as_bytes(),
            b": ",
            source.desc().as_bytes(),
            b"\n",
        ]),
        RedirectionError::MissingFile(_) | RedirectionError::Duplicate(_) => {
            exit_child(&[b"mysh: invalid redirection\n"])
        }
    }
}

/// Writes `parts` to stderr with plain write(2) calls and leaves without
/// running any of the shell's exit machinery.
fn exit_child(parts: &[&[u8]]) -> ! {
    for part in parts {
        let _ = unistd::write(STDERR_FILENO, part);
    }
    // SAFETY: _exit skips atexit handlers and stdio flushing, which belong to
    // the parent shell's state copied by fork.
    unsafe { libc::_exit(CHILD_FAILURE) }
}

/// Blocks until `child` has exited or been killed, without reaping it. Until
/// it is reaped the pid cannot be reused, so it is safe to signal.
fn wait_terminated(child: Pid) -> Result<(), ShellError> {
    loop {
        // SAFETY: an all-zero siginfo_t is a valid out-parameter.
        let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
        // SAFETY: `info` outlives the call; WNOWAIT leaves the child waitable.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                child.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        match Errno::last() {
            Errno::EINTR => continue,
            errno => return Err(ShellError::Wait(errno)),
        }
    }
}

/// Reaps `child` and returns its exit code; stops and continues are ignored.
fn reap(child: Pid) -> Result<i32, ShellError> {
    loop {
        match waitpid(child, None) {
            Ok(status) => {
                if let Some(code) = exit_code(status) {
                    debug!(pid = %child, code, "foreground child finished");
                    return Ok(code);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(ShellError::Wait(errno)),
        }
    }
}

/// Reaps every outstanding child of the shell, not only the ones this
/// command spawned. Returns the exit code of `watch` if it was seen.
fn reap_all(watch: Option<Pid>) -> Result<Option<i32>, ShellError> {
    let mut watched = None;
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(status) => {
                if let (Some(pid), Some(code)) = (status.pid(), exit_code(status)) {
                    debug!(%pid, code, "reaped child");
                    if Some(pid) == watch {
                        watched = Some(code);
                    }
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(watched),
            Err(errno) => {
                warn!(%errno, "waiting for pipeline children failed");
                return Err(ShellError::Wait(errno));
            }
        }
    }
}

/// Shell-style exit code for a terminal wait status: the exit code, or
/// 128 + signal number.
fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

/// Serializes tests that spawn children or count descriptors: pipelines
/// reap every child of the process, and fd counts are process-wide.
#[cfg(test)]
pub(crate) fn process_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::tokenize;
    use std::fs;
    use std::process::Command;

    fn pipeline(line: &str) -> Result<i32, ShellError> {
        let tokens = tokenize(line);
        match crate::parser::classify(&tokens) {
            CommandLine::Pipeline { writer, reader } => run_pipeline(writer, reader),
            CommandLine::Simple(_) => panic!("`{line}` has no pipe"),
        }
    }

    #[test]
    fn test_exit_code_mapping() {
        let pid = Pid::from_raw(10);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 3)), Some(3));
        assert_eq!(
            exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(137)
        );
        assert_eq!(exit_code(WaitStatus::Stopped(pid, Signal::SIGSTOP)), None);
        assert_eq!(exit_code(WaitStatus::Continued(pid)), None);
    }

    #[test]
    fn test_simple_command_clears_foreground() {
        let _lock = process_lock();
        let fg = ForegroundChild::new();
        assert_eq!(run_simple(&tokenize("true"), &fg).unwrap(), 0);
        assert_eq!(fg.get(), None);
        assert_eq!(run_simple(&tokenize("false"), &fg).unwrap(), 1);
        assert_eq!(fg.get(), None);
    }

    #[test]
    fn test_empty_command_spawns_nothing() {
        let fg = ForegroundChild::new();
        assert_eq!(run_simple(&[], &fg).unwrap(), 0);
    }

    #[test]
    fn test_child_failures_stay_in_child() {
        let _lock = process_lock();
        let fg = ForegroundChild::new();
        let missing = run_simple(&tokenize("definitely-not-a-program-mysh"), &fg).unwrap();
        assert_eq!(missing, CHILD_FAILURE);
        let dup = run_simple(&tokenize("true > a > b"), &fg).unwrap();
        assert_eq!(dup, CHILD_FAILURE);
        assert_eq!(fg.get(), None);
    }

    #[test]
    fn test_append_marker_is_rejected_not_a_file() {
        let _lock = process_lock();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f");
        let line = format!("echo hi >> {}", target.display());
        let fg = ForegroundChild::new();
        assert_eq!(run_simple(&tokenize(&line), &fg).unwrap(), CHILD_FAILURE);
        assert!(!target.exists());
        assert!(!std::path::Path::new(">").exists());
    }

    #[test]
    fn test_simple_command_output_redirect() {
        let _lock = process_lock();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let line = format!("echo hi > {}", out.display());
        let fg = ForegroundChild::new();
        assert_eq!(run_simple(&tokenize(&line), &fg).unwrap(), 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "hi\n");
    }

    #[test]
    fn test_wait_terminated_leaves_child_to_reap() {
        let _lock = process_lock();
        let child = Command::new("false").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        wait_terminated(pid).unwrap();
        // Still a zombie: the pid stays ours until reaped.
        assert_eq!(reap(pid).unwrap(), 1);
    }

    #[test]
    fn test_pipeline_reports_reader_status() {
        let _lock = process_lock();
        assert_eq!(pipeline("true | false").unwrap(), 1);
        assert_eq!(pipeline("false | true").unwrap(), 0);
    }

    #[test]
    fn test_pipeline_reader_output_redirect() {
        let _lock = process_lock();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let line = format!("echo piped | cat > {}", out.display());
        assert_eq!(pipeline(&line).unwrap(), 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "piped\n");
    }

    #[test]
    fn test_pipeline_stage_errors_stay_in_children() {
        let _lock = process_lock();
        assert_eq!(pipeline("echo hi > x | cat").unwrap(), 0);
        assert_eq!(pipeline("echo hi | cat < x").unwrap(), CHILD_FAILURE);
        assert_eq!(pipeline("echo hi | no-such-program-mysh").unwrap(), CHILD_FAILURE);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pipelines_leave_no_descriptors_open() {
        let _lock = process_lock();
        let open_fds = || fs::read_dir("/proc/self/fd").unwrap().count();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let line = format!("echo x | cat > {}", out.display());

        let before = open_fds();
        for _ in 0..20 {
            assert_eq!(pipeline(&line).unwrap(), 0);
            assert_eq!(pipeline("true | false").unwrap(), 1);
        }
        assert_eq!(open_fds(), before);
    }
}

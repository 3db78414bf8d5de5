use std::process::Child;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Grace period granted to subprocesses between the termination signal and
/// the forced kill.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Stop a child process: termination signal, bounded wait, then forced kill.
///
/// Safe to call on a child that has already exited. Applied identically on
/// user-interrupt and error shutdown paths.
pub fn terminate_child(child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(pid = child.id(), %status, "process already exited");
        return;
    }

    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }

    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), %status, "process terminated");
                return;
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!(pid = child.id(), "failed to poll process: {}", e);
                break;
            }
        }
    }

    warn!(pid = child.id(), "process did not exit in time, killing");
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn test_terminate_exited_child_is_noop() {
        let mut child = Command::new("true")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        child.wait().unwrap();
        // Must not panic or block
        terminate_child(&mut child, Duration::from_millis(100));
    }

    #[test]
    #[cfg(unix)]
    fn test_terminate_long_running_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();

        let started = Instant::now();
        terminate_child(&mut child, Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(child.try_wait().unwrap().is_some());
    }
}

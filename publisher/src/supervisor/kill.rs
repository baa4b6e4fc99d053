//! Signalling a runtime together with everything it spawned.
//!
//! Runtimes are launched as session and process-group leaders (see `detach`),
//! so on Unix the whole tree is addressed through the negative pid.

use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ask the tree to shut down.
    Terminate,
    /// Force the tree down.
    Kill,
}

/// Outcome of signalling a process tree.
#[derive(Debug, PartialEq, Eq)]
pub enum KillOutcome {
    Signalled,
    /// The group no longer exists; it already exited.
    NotFound,
}

/// Put the child into its own process group so it can be signalled as a unit.
pub fn detach(cmd: &mut Command) {
    #[cfg(unix)]
    {
        // SAFETY: setsid(2) is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

#[cfg(unix)]
pub fn kill_process_tree(pid: u32, signal: Signal) -> std::io::Result<KillOutcome> {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signo) };
    if rc == 0 {
        return Ok(KillOutcome::Signalled);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(KillOutcome::NotFound)
    } else {
        Err(err)
    }
}

#[cfg(windows)]
pub fn kill_process_tree(pid: u32, signal: Signal) -> std::io::Result<KillOutcome> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.arg("/pid").arg(pid.to_string()).arg("/T");
    if signal == Signal::Kill {
        cmd.arg("/F");
    }
    let output = cmd.output()?;
    if output.status.success() {
        return Ok(KillOutcome::Signalled);
    }
    // taskkill exits with 128 when the pid is unknown.
    if output.status.code() == Some(128) {
        Ok(KillOutcome::NotFound)
    } else {
        Err(std::io::Error::other(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;

    #[tokio::test]
    async fn terminates_whole_group() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("sleep 30 & sleep 30; wait")
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        assert_eq!(
            kill_process_tree(pid, Signal::Terminate).unwrap(),
            KillOutcome::Signalled
        );
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child should exit after SIGTERM")
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn missing_group_reports_not_found() {
        let mut cmd = Command::new("true");
        detach(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        assert_eq!(
            kill_process_tree(pid, Signal::Terminate).unwrap(),
            KillOutcome::NotFound
        );
    }
}

use std::ffi::OsStr;
use std::process::Command;

/// Builds a command that runs detached from the console in its own process
/// group, so one group signal reaches every helper the tool spawns.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Prevent console windows from stealing focus on Windows while running tools.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(unix)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    cmd.process_group(0);
}

#[cfg(not(any(unix, windows)))]
fn configure_for_background(_cmd: &mut Command) {}

/// Sends the graceful stop request to a whole process group.
#[cfg(unix)]
pub(crate) fn signal_group_terminate(pgid: u32) -> bool {
    // SAFETY: killpg only reads its arguments; an unknown group yields ESRCH.
    unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(windows)]
pub(crate) fn signal_group_terminate(pgid: u32) -> bool {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

    // Only reaches groups attached to our console. Children started with
    // CREATE_NO_WINDOW have none, so for them the grace wait always ends in
    // kill_group (taskkill /T /F).
    // SAFETY: plain FFI call, the group id comes from a child we spawned.
    unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pgid) != 0 }
}

#[cfg(not(any(unix, windows)))]
pub(crate) fn signal_group_terminate(_pgid: u32) -> bool {
    false
}

/// Forcibly kills a whole process group.
#[cfg(unix)]
pub(crate) fn kill_group(pgid: u32) {
    // SAFETY: see signal_group_terminate.
    unsafe {
        libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(windows)]
pub(crate) fn kill_group(pgid: u32) {
    let pid = pgid.to_string();
    let _ = command("taskkill").args(["/PID", &pid, "/T", "/F"]).status();
}

#[cfg(not(any(unix, windows)))]
pub(crate) fn kill_group(_pgid: u32) {}

#![cfg(unix)]

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use workbench_engine::supervisor::ProcessSupervisor;
use workbench_engine::EngineError;

#[test]
fn cancel_terminates_a_streaming_child_and_empties_the_registry() {
    let supervisor = Arc::new(ProcessSupervisor::with_timeouts(
        Duration::from_millis(500),
        Duration::from_secs(2),
    ));
    let worker = {
        let supervisor = supervisor.clone();
        std::thread::spawn(move || {
            supervisor.stream_run(&["sleep", "30"], None, None, |_| ControlFlow::Continue(()))
        })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while supervisor.tracked_count() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(supervisor.tracked_count(), 1);

    let started = Instant::now();
    supervisor.cancel();
    assert_eq!(supervisor.tracked_count(), 0);

    let result = worker.join().expect("worker thread");
    assert!(matches!(result, Err(EngineError::Canceled)), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn shell_wrapped_children_die_with_their_group() {
    let supervisor = ProcessSupervisor::with_timeouts(
        Duration::from_millis(300),
        Duration::from_secs(1),
    );
    let started = Instant::now();
    let result = supervisor.capture_run(
        &["sh", "-c", "sleep 30 & sleep 30; wait"],
        Some(Duration::from_millis(300)),
    );
    assert!(matches!(result, Err(EngineError::TimeoutEscalated { .. })), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(supervisor.tracked_count(), 0);
}

#[test]
fn spawned_child_hands_out_its_pipes_and_deregisters_on_exit() {
    use std::io::Read;

    let supervisor = ProcessSupervisor::new();
    let mut child = supervisor
        .spawn_tracked(&["sh", "-c", "echo out; echo err >&2"], None)
        .expect("spawn");
    assert_eq!(child.tool(), "sh");
    assert!(child.pid() > 0);
    let mut stdout = child.take_stdout().expect("stdout");
    let mut stderr = child.take_stderr().expect("stderr");
    assert!(child.take_stdout().is_none());

    let mut out = String::new();
    stdout.read_to_string(&mut out).expect("read stdout");
    let mut err = String::new();
    stderr.read_to_string(&mut err).expect("read stderr");
    let status = child
        .wait_with_timeout(Some(Duration::from_secs(5)))
        .expect("wait");
    drop(child);

    assert!(status.success());
    assert_eq!(out.trim(), "out");
    assert_eq!(err.trim(), "err");
    assert_eq!(supervisor.tracked_count(), 0);
}

fn pid_is_gone(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence; nothing is delivered.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

#[test]
fn cancel_racing_with_spawns_leaves_no_live_or_tracked_child() {
    let supervisor = Arc::new(ProcessSupervisor::with_timeouts(
        Duration::from_millis(300),
        Duration::from_secs(1),
    ));

    let spawners: Vec<_> = (0..4)
        .map(|_| {
            let supervisor = supervisor.clone();
            std::thread::spawn(move || {
                let mut pids = Vec::new();
                loop {
                    match supervisor.spawn_tracked(&["sleep", "30"], None) {
                        Ok(mut child) => {
                            pids.push(child.pid());
                            if child.wait_with_timeout(None).is_err() {
                                break;
                            }
                        }
                        Err(EngineError::Canceled) => break,
                        Err(err) => panic!("unexpected spawn error: {err}"),
                    }
                }
                pids
            })
        })
        .collect();

    let canceller = {
        let supervisor = supervisor.clone();
        std::thread::spawn(move || {
            let until = Instant::now() + Duration::from_millis(400);
            while Instant::now() < until {
                supervisor.cancel_all();
                std::thread::sleep(Duration::from_millis(5));
            }
            supervisor.cancel();
        })
    };

    canceller.join().expect("canceller thread");
    let mut pids = Vec::new();
    for spawner in spawners {
        pids.extend(spawner.join().expect("spawner thread"));
    }

    assert!(!pids.is_empty());
    assert_eq!(supervisor.tracked_count(), 0);
    for pid in pids {
        assert!(pid_is_gone(pid), "pid {pid} still exists");
    }
}

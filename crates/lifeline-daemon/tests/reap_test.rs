//! Non-blocking reaping of terminated children.

#![cfg(unix)]

use std::process::Command;
use std::time::Duration;

use lifeline_daemon::signal::reap_children;

#[test]
fn test_reap_collects_exited_children() {
    let first = Command::new("true").spawn().unwrap();
    let second = Command::new("true").spawn().unwrap();
    let (first, second) = (first.id(), second.id());
    assert_ne!(first, second);

    let mut reaped = 0;
    for _ in 0..200 {
        reaped += reap_children();
        if reaped >= 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(reaped, 2);

    // Nothing left to reap, and the call does not block.
    assert_eq!(reap_children(), 0);
}

#![cfg(unix)]
mod common;

use common::{Daemon, root_string};
use serde_json::json;
use std::fs;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[test]
fn watch_is_idempotent_and_listed() {
    let daemon = Daemon::start();
    let dir = tempdir().expect("tempdir");
    let root = root_string(dir.path());
    let mut client = daemon.client();

    let first = client.request(json!(["watch", root]));
    let second = client.request(json!(["watch", root]));
    assert_eq!(first["created"], json!(true));
    assert_eq!(second["created"], json!(false));

    let list = client.request(json!(["watch-list"]));
    assert_eq!(list["roots"], json!([root]));

    let removed = client.request(json!(["watch-del", root]));
    assert_eq!(removed["watch-del"], json!(true));
    let list = client.request(json!(["watch-list"]));
    assert_eq!(list["roots"], json!([]));
}

#[test]
fn invalid_roots_are_rejected() {
    let daemon = Daemon::start();
    let mut client = daemon.client();

    let relative = client.request(json!(["watch", "relative/path"]));
    assert_eq!(relative["error_kind"], json!("root_resolve"));
    assert!(relative["error"].as_str().expect("error").contains("must be absolute"));

    let slash = client.request(json!(["watch", "/"]));
    assert!(slash["error"].as_str().expect("error").contains("cannot watch \"/\""));

    let dir = tempdir().expect("tempdir");
    let missing = dir.path().join("missing").display().to_string();
    let response = client.request(json!(["watch", missing]));
    let message = response["error"].as_str().expect("error");
    assert!(message.starts_with("unable to resolve root"));
    assert!(message.contains("No such file or directory"));
}

#[test]
fn root_files_restriction_blocks_bare_directories() {
    let daemon = Daemon::start_with_env(&[
        ("WATCHD_ROOT_FILES", ".git,.foo"),
        ("WATCHD_ENFORCE_ROOT_FILES", "true"),
    ]);
    let dir = tempdir().expect("tempdir");
    let root = root_string(dir.path());
    let mut client = daemon.client();

    let refused = client.request(json!(["watch", root]));
    let message = refused["error"].as_str().expect("error");
    assert!(message.contains("includes `.git` and `.foo`"));
    assert!(message.ends_with("Try pulling and checking out a newer version of the project?"));

    fs::create_dir(dir.path().join(".git")).expect("mkdir");
    let allowed = client.request(json!(["watch", root]));
    assert_eq!(allowed["watch"], json!(root));
}

#[test]
fn subscription_initial_event_is_not_blocked_by_pause() {
    let daemon = Daemon::start();
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("old_file"), "x").expect("write");
    let root = root_string(dir.path());
    let mut client = daemon.client();
    // Pause control goes over its own connection so responses never race
    // with subscription PDUs.
    let mut control = daemon.client();
    client.request(json!(["watch", root]));
    control.request(json!(["debug-pause-watchers"]));

    let ack = client.request(json!(["subscribe", root, "subs", {"fields": ["name"], "sync_timeout": 0}]));
    assert_eq!(ack["subscribe"], json!("subs"));
    let initial = client
        .next_unilateral(Duration::from_secs(2))
        .expect("initial subscription PDU");
    assert_eq!(initial["subscription"], json!("subs"));
    assert_eq!(initial["files"], json!(["old_file"]));

    fs::write(dir.path().join("new_file"), "x").expect("write");
    assert!(
        client.next_unilateral(Duration::from_millis(800)).is_none(),
        "no delivery while paused"
    );

    control.request(json!(["debug-unpause-watchers"]));
    let delta = client
        .next_unilateral(Duration::from_secs(5))
        .expect("flushed delta");
    assert_eq!(delta["files"], json!(["new_file"]));
}

#[test]
fn states_are_owned_by_their_session() {
    let daemon = Daemon::start();
    let dir = tempdir().expect("tempdir");
    let root = root_string(dir.path());
    let mut owner = daemon.client();
    let mut other = daemon.client();
    owner.request(json!(["watch", root]));

    let entered = owner.request(json!(["state-enter", root, {"name": "build", "sync_timeout": 0}]));
    assert_eq!(entered["state-enter"], json!("build"));

    let dup = other.request(json!(["state-enter", root, {"name": "build", "sync_timeout": 0}]));
    assert!(dup["error"].as_str().expect("error").contains("already asserted"));
    let foreign = other.request(json!(["state-leave", root, {"name": "build", "sync_timeout": 0}]));
    assert!(
        foreign["error"]
            .as_str()
            .expect("error")
            .contains("not asserted by this session")
    );

    drop(owner);
    // The abandoned state is vacated once the owner's connection closes.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let retry =
            other.request(json!(["state-enter", root, {"name": "build", "sync_timeout": 0}]));
        if retry.get("error").is_none() {
            break;
        }
        assert!(Instant::now() < deadline, "state never vacated");
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn removing_the_root_directory_cancels_the_watch() {
    let daemon = Daemon::start();
    let parent = tempdir().expect("tempdir");
    let dir = parent.path().join("doomed");
    fs::create_dir(&dir).expect("mkdir");
    let root = root_string(&dir);
    let mut client = daemon.client();
    client.request(json!(["watch", root]));

    fs::remove_dir_all(&dir).expect("remove");
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let response = client.request(json!(["clock", root, {"sync_timeout": 0}]));
        if response["error_kind"] == json!("not_watched") {
            break;
        }
        let _ = client.request(json!(["debug-recrawl", root]));
        assert!(Instant::now() < deadline, "root was never cancelled");
        thread::sleep(Duration::from_millis(50));
    }
}

#![cfg(unix)]
mod common;

use common::{Daemon, root_string, sorted_names};
use serde_json::json;
use std::fs;
use tempfile::tempdir;

#[test]
fn glob_skips_dotfiles_unless_included() {
    let daemon = Daemon::start();
    let dir = tempdir().expect("tempdir");
    for name in ["a.c", "b.c", ".a.c"] {
        fs::write(dir.path().join(name), "x").expect("write");
    }
    let root = root_string(dir.path());
    let mut client = daemon.client();
    client.request(json!(["watch", root]));

    let plain = client.request(json!(["query", root, {"glob": ["*.c"], "fields": ["name"]}]));
    assert_eq!(sorted_names(&plain), vec!["a.c", "b.c"]);

    let dotted = client.request(json!([
        "query", root, {"glob": ["*.c"], "fields": ["name"], "glob_includedotfiles": true}
    ]));
    assert_eq!(sorted_names(&dotted), vec![".a.c", "a.c", "b.c"]);
}

#[test]
fn backslash_relative_root_matches_slash_form() {
    let daemon = Daemon::start();
    let dir = tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("includes/second")).expect("mkdir");
    fs::write(dir.path().join("includes/second/foo.h"), "x").expect("write");
    fs::write(dir.path().join("includes/bar.h"), "x").expect("write");
    let root = root_string(dir.path());
    let mut client = daemon.client();
    client.request(json!(["watch", root]));

    let slash = client.request(json!([
        "query", root, {"glob": ["*.h"], "fields": ["name"], "relative_root": "includes/second"}
    ]));
    let backslash = client.request(json!([
        "query", root, {"glob": ["*.h"], "fields": ["name"], "relative_root": "includes\\second"}
    ]));
    assert_eq!(sorted_names(&slash), vec!["foo.h"]);
    assert_eq!(sorted_names(&slash), sorted_names(&backslash));
}

#[test]
fn overlapping_globs_report_each_file_once() {
    let daemon = Daemon::start();
    let dir = tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("includes/second/third")).expect("mkdir");
    for rel in [
        "includes/a.h",
        "includes/b.h",
        "includes/second/c.h",
        "includes/second/third/d.h",
        "main.c",
    ] {
        fs::write(dir.path().join(rel), "x").expect("write");
    }
    let root = root_string(dir.path());
    let mut client = daemon.client();
    client.request(json!(["watch", root]));

    let response = client.request(json!([
        "query", root, {"glob": ["**/*.h", "**/**/*.h", "includes/*.h"], "fields": ["name"]}
    ]));
    assert_eq!(
        sorted_names(&response),
        vec![
            "includes/a.h",
            "includes/b.h",
            "includes/second/c.h",
            "includes/second/third/d.h"
        ]
    );
}

#[test]
fn bad_parameters_are_rejected_before_waiting() {
    let daemon = Daemon::start();
    let dir = tempdir().expect("tempdir");
    let root = root_string(dir.path());
    let mut client = daemon.client();
    client.request(json!(["watch", root]));
    // Paused: anything that reached a cookie wait would time out instead.
    client.request(json!(["debug-pause-watchers"]));

    let bad_glob = client.request(json!(["query", root, {"glob": ["*.c", 1], "sync_timeout": 5000}]));
    assert_eq!(bad_glob["error_kind"], json!("invalid_argument"));
    assert!(
        bad_glob["error"]
            .as_str()
            .expect("error")
            .contains("expected json string object")
    );

    let bad_rel = client.request(json!([
        "query", root, {"relative_root": "does/not/exist", "sync_timeout": 5000}
    ]));
    assert_eq!(bad_rel["error_kind"], json!("invalid_argument"));
    assert!(
        bad_rel["error"]
            .as_str()
            .expect("error")
            .contains("check your relative_root")
    );

    let negative = client.request(json!(["query", root, {"sync_timeout": -1}]));
    assert_eq!(negative["error_kind"], json!("invalid_argument"));
}

#[test]
fn since_returns_only_later_changes() {
    let daemon = Daemon::start();
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("old"), "x").expect("write");
    let root = root_string(dir.path());
    let mut client = daemon.client();
    client.request(json!(["watch", root]));
    let clock = client.request(json!(["clock", root, {"sync_timeout": 2000}]));
    let since = clock["clock"].as_str().expect("clock").to_string();

    fs::write(dir.path().join("new"), "x").expect("write");
    fs::remove_file(dir.path().join("old")).expect("remove");
    let delta = client.request(json!([
        "query", root, {"since": since, "fields": ["name", "exists"], "sync_timeout": 5000}
    ]));
    assert_eq!(delta["is_fresh_instance"], json!(false));
    let files = delta["files"].as_array().expect("files");
    assert!(files.contains(&json!({"name": "new", "exists": true})));
    assert!(files.contains(&json!({"name": "old", "exists": false})));
}

#![allow(dead_code)]

use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};

const START_TIMEOUT: Duration = Duration::from_secs(15);

/// A `watchd serve` process with its own home directory.
pub struct Daemon {
    home: TempDir,
    child: Child,
}

impl Daemon {
    pub fn start() -> Self {
        Self::start_with_env(&[])
    }

    pub fn start_with_env(extra_env: &[(&str, &str)]) -> Self {
        let home = tempdir().expect("tempdir");
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_watchd"));
        cmd.arg("serve")
            .current_dir(home.path())
            .env("WATCHD_HOME", home.path())
            .env("WATCHD_LOG", "warn")
            .env_remove("WATCHD_SOCK")
            .env_remove("WATCHD_LOGS_DIR")
            .env_remove("WATCHD_CONFIG_PATH")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in extra_env {
            cmd.env(key, value);
        }
        let child = cmd.spawn().expect("spawn watchd serve");
        let daemon = Self { home, child };

        let deadline = Instant::now() + START_TIMEOUT;
        while Instant::now() < deadline {
            if UnixStream::connect(daemon.sock_path()).is_ok() {
                return daemon;
            }
            thread::sleep(Duration::from_millis(25));
        }
        panic!("watchd did not start listening");
    }

    pub fn home(&self) -> &Path {
        self.home.path()
    }

    pub fn sock_path(&self) -> PathBuf {
        self.home.path().join("watchd.sock")
    }

    pub fn client(&self) -> Client {
        Client::connect(&self.sock_path())
    }

    /// The CLI, pointed at this daemon.
    pub fn cli(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("watchd");
        cmd.current_dir(self.home.path())
            .env("WATCHD_HOME", self.home.path())
            .env("WATCHD_LOG", "warn")
            .env_remove("WATCHD_SOCK")
            .env_remove("WATCHD_LOGS_DIR")
            .env_remove("WATCHD_CONFIG_PATH");
        cmd
    }

    pub fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.child.try_wait().expect("try_wait").is_some() {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Ok(mut stream) = UnixStream::connect(self.sock_path()) {
            let _ = stream.write_all(b"[\"shutdown-server\"]\n");
        }
        if !self.wait_for_exit(Duration::from_secs(5)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Raw newline-delimited JSON connection.
pub struct Client {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Client {
    pub fn connect(sock: &Path) -> Self {
        let stream = UnixStream::connect(sock).expect("connect");
        let reader = BufReader::new(stream.try_clone().expect("clone"));
        Self {
            reader,
            writer: stream,
        }
    }

    fn read_pdu(&mut self) -> Option<Value> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(serde_json::from_str(line.trim()).expect("json pdu")),
            Err(_) => None,
        }
    }

    /// Send a request and return its response, skipping unilateral PDUs.
    pub fn request(&mut self, request: Value) -> Value {
        let mut line = serde_json::to_vec(&request).expect("encode");
        line.push(b'\n');
        self.writer.write_all(&line).expect("send");
        self.reader
            .get_ref()
            .set_read_timeout(None)
            .expect("read timeout");
        loop {
            let pdu = self.read_pdu().expect("response");
            if pdu.get("unilateral").and_then(Value::as_bool) != Some(true) {
                return pdu;
            }
        }
    }

    /// Next unilateral PDU, or `None` if none arrives within `timeout`.
    pub fn next_unilateral(&mut self, timeout: Duration) -> Option<Value> {
        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout))
            .expect("read timeout");
        let pdu = self.read_pdu();
        self.reader
            .get_ref()
            .set_read_timeout(None)
            .expect("read timeout");
        pdu.filter(|pdu| pdu.get("unilateral").and_then(Value::as_bool) == Some(true))
    }
}

pub fn root_string(path: &Path) -> String {
    std::fs::canonicalize(path)
        .expect("canonicalize")
        .display()
        .to_string()
}

pub fn sorted_names(response: &Value) -> Vec<String> {
    let mut names: Vec<String> = response["files"]
        .as_array()
        .expect("files")
        .iter()
        .map(|file| file.as_str().expect("name").to_string())
        .collect();
    names.sort();
    names
}

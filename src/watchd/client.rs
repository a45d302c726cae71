use anyhow::{Context, Result};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Blocking request/response client for the daemon socket.
#[derive(Debug)]
pub struct DaemonClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl DaemonClient {
    pub fn connect(sock_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(sock_path).with_context(|| {
            format!(
                "failed to connect to watchd at {}; is `watchd serve` running?",
                sock_path.display()
            )
        })?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: stream,
        })
    }

    /// Send one request and return its response, skipping unilateral PDUs.
    pub fn request(&mut self, request: &Value) -> Result<Value> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .context("failed to send request to watchd")?;

        loop {
            let mut raw = String::new();
            let read = self
                .reader
                .read_line(&mut raw)
                .context("failed to read response from watchd")?;
            if read == 0 {
                anyhow::bail!("watchd closed the connection");
            }
            let pdu: Value = serde_json::from_str(raw.trim())
                .with_context(|| format!("invalid response from watchd: {}", raw.trim()))?;
            if pdu.get("unilateral").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            return Ok(pdu);
        }
    }
}

/// `(error_kind, message)` when the response reports a failure.
pub fn response_error(response: &Value) -> Option<(String, String)> {
    let message = response.get("error")?.as_str()?.to_string();
    let kind = response
        .get("error_kind")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    Some((kind, message))
}

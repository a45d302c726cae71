//! Newline-delimited JSON over the daemon socket.
//!
//! A request is an array `[command, args...]`. Every response is an object
//! carrying `version`; failures add `error` and `error_kind`. PDUs pushed
//! without a request carry `unilateral: true`.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::io::{self, Write};
use std::sync::Arc;

use crate::error::{WatchdError, WatchdResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Watch { path: String },
    WatchDel { path: String },
    WatchList,
    Clock { path: String, sync_timeout: Option<Value> },
    Query { path: String, spec: Value },
    Subscribe { path: String, name: String, spec: Value },
    Unsubscribe { path: String, name: String },
    StateEnter { path: String, state: StateArgs },
    StateLeave { path: String, state: StateArgs },
    PauseWatchers,
    UnpauseWatchers,
    Recrawl { path: String },
    AbortCookies { path: String },
    GetPid,
    Version,
    ShutdownServer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateArgs {
    pub name: String,
    pub metadata: Option<Value>,
    pub sync_timeout: Option<Value>,
}

fn arg_str(args: &[Value], idx: usize, cmd: &str, what: &str) -> WatchdResult<String> {
    match args.get(idx) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(WatchdError::invalid(format!(
            "{cmd}: expected {what} to be a string, got {other}"
        ))),
        None => Err(WatchdError::invalid(format!("{cmd}: missing {what}"))),
    }
}

fn parse_state_args(args: &[Value], cmd: &str) -> WatchdResult<StateArgs> {
    match args.get(2) {
        Some(Value::String(name)) => Ok(StateArgs {
            name: name.clone(),
            metadata: None,
            sync_timeout: None,
        }),
        Some(Value::Object(obj)) => {
            let name = match obj.get("name") {
                Some(Value::String(name)) => name.clone(),
                _ => {
                    return Err(WatchdError::invalid(format!(
                        "{cmd}: state name must be a string"
                    )));
                }
            };
            Ok(StateArgs {
                name,
                metadata: obj.get("metadata").cloned(),
                sync_timeout: obj.get("sync_timeout").cloned(),
            })
        }
        Some(other) => Err(WatchdError::invalid(format!(
            "{cmd}: expected state name or object, got {other}"
        ))),
        None => Err(WatchdError::invalid(format!("{cmd}: missing state name"))),
    }
}

impl Request {
    pub fn parse(raw: &Value) -> WatchdResult<Self> {
        let Some(args) = raw.as_array() else {
            return Err(WatchdError::invalid("request must be a json array"));
        };
        let Some(Value::String(cmd)) = args.first() else {
            return Err(WatchdError::invalid(
                "request must start with a command name",
            ));
        };
        let cmd = cmd.as_str();
        let path = || arg_str(args, 1, cmd, "path");

        let request = match cmd {
            "watch" | "watch-project" => Self::Watch { path: path()? },
            "watch-del" => Self::WatchDel { path: path()? },
            "watch-list" => Self::WatchList,
            "clock" => {
                let sync_timeout = match args.get(2) {
                    None | Some(Value::Null) => None,
                    Some(Value::Object(opts)) => opts.get("sync_timeout").cloned(),
                    Some(other) => {
                        return Err(WatchdError::invalid(format!(
                            "clock: expected options object, got {other}"
                        )));
                    }
                };
                Self::Clock {
                    path: path()?,
                    sync_timeout,
                }
            }
            "query" => Self::Query {
                path: path()?,
                spec: args.get(2).cloned().unwrap_or(Value::Object(Map::new())),
            },
            "subscribe" => Self::Subscribe {
                path: path()?,
                name: arg_str(args, 2, cmd, "subscription name")?,
                spec: args.get(3).cloned().unwrap_or(Value::Object(Map::new())),
            },
            "unsubscribe" => Self::Unsubscribe {
                path: path()?,
                name: arg_str(args, 2, cmd, "subscription name")?,
            },
            "state-enter" => Self::StateEnter {
                path: path()?,
                state: parse_state_args(args, cmd)?,
            },
            "state-leave" => Self::StateLeave {
                path: path()?,
                state: parse_state_args(args, cmd)?,
            },
            "debug-pause-watchers" => Self::PauseWatchers,
            "debug-unpause-watchers" => Self::UnpauseWatchers,
            "debug-recrawl" => Self::Recrawl { path: path()? },
            "debug-abort-cookies" => Self::AbortCookies { path: path()? },
            "get-pid" => Self::GetPid,
            "version" => Self::Version,
            "shutdown-server" => Self::ShutdownServer,
            other => {
                return Err(WatchdError::invalid(format!("unknown command {other}")));
            }
        };
        Ok(request)
    }

    /// Name used in logs and the audit trail.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Watch { .. } => "watch",
            Self::WatchDel { .. } => "watch-del",
            Self::WatchList => "watch-list",
            Self::Clock { .. } => "clock",
            Self::Query { .. } => "query",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::StateEnter { .. } => "state-enter",
            Self::StateLeave { .. } => "state-leave",
            Self::PauseWatchers => "debug-pause-watchers",
            Self::UnpauseWatchers => "debug-unpause-watchers",
            Self::Recrawl { .. } => "debug-recrawl",
            Self::AbortCookies { .. } => "debug-abort-cookies",
            Self::GetPid => "get-pid",
            Self::Version => "version",
            Self::ShutdownServer => "shutdown-server",
        }
    }
}

pub fn ok_response(mut body: Map<String, Value>) -> Value {
    body.insert("version".to_string(), Value::from(VERSION));
    Value::Object(body)
}

pub fn error_response(err: &WatchdError) -> Value {
    let mut body = Map::new();
    body.insert("version".to_string(), Value::from(VERSION));
    body.insert("error".to_string(), Value::from(err.to_string()));
    body.insert("error_kind".to_string(), Value::from(err.kind()));
    Value::Object(body)
}

/// Shared, line-oriented writer for one client connection.
#[derive(Clone)]
pub struct PduWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for PduWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PduWriter").finish_non_exhaustive()
    }
}

impl PduWriter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(out)),
        }
    }

    pub fn send(&self, pdu: &Value) -> io::Result<()> {
        let mut line = serde_json::to_vec(pdu)?;
        line.push(b'\n');
        let mut out = self.inner.lock();
        out.write_all(&line)?;
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::{Request, error_response};
    use crate::error::WatchdError;
    use serde_json::json;

    #[test]
    fn parses_clock_with_options() {
        let req = Request::parse(&json!(["clock", "/w", {"sync_timeout": 100}])).expect("parse");
        assert_eq!(
            req,
            Request::Clock {
                path: "/w".to_string(),
                sync_timeout: Some(json!(100)),
            }
        );
    }

    #[test]
    fn debug_commands_take_a_root() {
        assert!(Request::parse(&json!(["debug-recrawl"])).is_err());
        assert_eq!(
            Request::parse(&json!(["debug-abort-cookies", "/w"])).expect("parse"),
            Request::AbortCookies {
                path: "/w".to_string()
            }
        );
        assert_eq!(
            Request::parse(&json!(["debug-pause-watchers"])).expect("parse"),
            Request::PauseWatchers
        );
    }

    #[test]
    fn state_accepts_name_or_object() {
        let plain = Request::parse(&json!(["state-enter", "/w", "build"])).expect("parse");
        let full = Request::parse(&json!([
            "state-enter", "/w", {"name": "build", "metadata": {"rev": 1}}
        ]))
        .expect("parse");
        let (Request::StateEnter { state: a, .. }, Request::StateEnter { state: b, .. }) =
            (plain, full)
        else {
            panic!("expected state-enter");
        };
        assert_eq!(a.name, b.name);
        assert_eq!(b.metadata, Some(json!({"rev": 1})));
    }

    #[test]
    fn rejects_non_array_and_unknown() {
        assert!(Request::parse(&json!({"cmd": "watch"})).is_err());
        let err = Request::parse(&json!(["frobnicate"])).expect_err("unknown");
        assert_eq!(err.to_string(), "unknown command frobnicate");
    }

    #[test]
    fn error_response_carries_kind_and_version() {
        let body = error_response(&WatchdError::NotWatched("/w".to_string()));
        assert_eq!(body["error_kind"], "not_watched");
        assert_eq!(body["error"], "directory /w is not watched");
        assert!(body["version"].is_string());
    }
}

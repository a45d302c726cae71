use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crate::error::{WatchdError, WatchdResult};
use crate::watchd::audit::AuditLog;
use crate::watchd::config::WatchdConfig;
use crate::watchd::daemon_lock::acquire_daemon_lock;
use crate::watchd::paths::WatchdPaths;
use crate::watchd::pause::PauseController;
use crate::watchd::protocol::{self, PduWriter, Request, StateArgs};
use crate::watchd::query::{PreparedQuery, QuerySpec};
use crate::watchd::registry::RootRegistry;
use crate::watchd::root::{Root, RootSettings};
use crate::watchd::subscription::Subscription;
use crate::watchd::sync::{parse_sync_timeout, sync_to_now};
use crate::watchd::util;

/// Process-wide daemon state shared by every connection.
#[derive(Debug)]
pub struct Daemon {
    roots: RootRegistry,
    pause: Arc<PauseController>,
    audit: AuditLog,
    default_sync_ms: u64,
    sock_path: PathBuf,
    shutting_down: AtomicBool,
    next_session: AtomicU64,
}

impl Daemon {
    pub fn new(paths: &WatchdPaths, config: &WatchdConfig) -> Self {
        let pause = Arc::new(PauseController::new());
        let config_label = config
            .source_path
            .as_ref()
            .unwrap_or(&paths.config_file)
            .display()
            .to_string();
        Self {
            roots: RootRegistry::new(
                Arc::clone(&pause),
                RootSettings::from(&config.watcher),
                config.restrict.clone(),
                config_label,
            ),
            pause,
            audit: AuditLog::new(&paths.logs_dir),
            default_sync_ms: config.sync.default_query_sync_ms,
            sock_path: paths.sock_path.clone(),
            shutting_down: AtomicBool::new(false),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn begin_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.audit.record("shutdown-server", None, "shutdown requested");
        // Wake the accept loop.
        let _ = UnixStream::connect(&self.sock_path);
    }
}

/// Run the daemon in the foreground until `shutdown-server`.
pub fn serve(paths: &WatchdPaths, config: &WatchdConfig) -> Result<()> {
    util::process_start();
    let _lock = acquire_daemon_lock(paths)?;

    if let Some(parent) = paths.sock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    // Holding the lock means any socket file left here is stale.
    if paths.sock_path.exists() {
        fs::remove_file(&paths.sock_path).with_context(|| {
            format!("failed to remove stale socket {}", paths.sock_path.display())
        })?;
    }
    let listener = UnixListener::bind(&paths.sock_path)
        .with_context(|| format!("failed to bind {}", paths.sock_path.display()))?;

    let daemon = Arc::new(Daemon::new(paths, config));
    tracing::info!(
        pid = std::process::id(),
        sock = %paths.sock_path.display(),
        build = env!("BUILD_UUID"),
        "watchd listening"
    );

    for incoming in listener.incoming() {
        if daemon.is_shutting_down() {
            break;
        }
        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(
                    code = "ACCEPT_FAILED",
                    stage = "server",
                    action = "accept",
                    err = %err,
                    "failed to accept connection"
                );
                continue;
            }
        };
        let id = daemon.next_session.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&daemon);
        let spawned = thread::Builder::new()
            .name(format!("watchd-client-{id}"))
            .spawn(move || {
                if let Err(err) = Session::run(id, shared, stream) {
                    tracing::debug!(session = id, %err, "session ended with error");
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(
                code = "SESSION_SPAWN_FAILED",
                stage = "server",
                action = "spawn",
                err = %err,
                "failed to start session thread"
            );
        }
    }

    daemon.roots.stop_all();
    let _ = fs::remove_file(&paths.sock_path);
    tracing::info!("watchd stopped");
    Ok(())
}

enum Outcome {
    Reply(Map<String, Value>),
    Subscribe {
        body: Map<String, Value>,
        root: Arc<Root>,
        name: String,
        query: PreparedQuery,
    },
    Shutdown(Map<String, Value>),
}

struct Session {
    id: u64,
    daemon: Arc<Daemon>,
    writer: PduWriter,
    subscriptions: HashMap<(PathBuf, String), Arc<Subscription>>,
    states: Vec<(Arc<Root>, String)>,
}

impl Session {
    fn run(id: u64, daemon: Arc<Daemon>, stream: UnixStream) -> Result<()> {
        let reader = BufReader::new(stream.try_clone()?);
        let mut session = Session {
            id,
            daemon,
            writer: PduWriter::new(Box::new(stream)),
            subscriptions: HashMap::new(),
            states: Vec::new(),
        };
        let result = session.serve_lines(reader);
        session.close();
        result
    }

    fn serve_lines(&mut self, reader: BufReader<UnixStream>) -> Result<()> {
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let outcome = serde_json::from_str::<Value>(&line)
                .map_err(|err| WatchdError::invalid(format!("invalid json request: {err}")))
                .and_then(|raw| Request::parse(&raw))
                .and_then(|request| self.dispatch(request));

            match outcome {
                Ok(Outcome::Reply(body)) => self.writer.send(&protocol::ok_response(body))?,
                Ok(Outcome::Subscribe {
                    body,
                    root,
                    name,
                    query,
                }) => {
                    self.writer.send(&protocol::ok_response(body))?;
                    let sub = Subscription::start(
                        name.clone(),
                        self.id,
                        Arc::clone(&root),
                        query,
                        self.writer.clone(),
                    )?;
                    if let Some(old) = self
                        .subscriptions
                        .insert((root.path().to_path_buf(), name), sub)
                    {
                        old.cancel();
                    }
                }
                Ok(Outcome::Shutdown(body)) => {
                    self.writer.send(&protocol::ok_response(body))?;
                    self.daemon.begin_shutdown();
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(session = self.id, kind = err.kind(), %err, "request failed");
                    self.writer.send(&protocol::error_response(&err))?;
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, request: Request) -> WatchdResult<Outcome> {
        if self.daemon.is_shutting_down() {
            return Err(WatchdError::Shutdown);
        }
        tracing::debug!(session = self.id, command = request.name(), "request");
        let daemon = Arc::clone(&self.daemon);
        let body = match request {
            Request::Watch { path } => {
                let (root, created) = daemon.roots.watch(&path)?;
                if created {
                    daemon.audit.record("watch", Some(root.path()), "watch established");
                }
                object(json!({
                    "watch": root.path().display().to_string(),
                    "watcher": "notify",
                    "created": created,
                }))
            }
            Request::WatchDel { path } => {
                let root = daemon.roots.unwatch(&path)?;
                daemon.audit.record("watch-del", Some(root.path()), "watch removed");
                object(json!({
                    "watch-del": true,
                    "root": root.path().display().to_string(),
                }))
            }
            Request::WatchList => {
                let roots: Vec<String> = daemon
                    .roots
                    .list()
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect();
                object(json!({ "roots": roots }))
            }
            Request::Clock { path, sync_timeout } => {
                let root = daemon.roots.get(&path)?;
                let timeout = parse_sync_timeout(sync_timeout.as_ref(), 0)?;
                let clock = sync_to_now(&root, timeout)?;
                object(json!({ "clock": clock.to_string() }))
            }
            Request::Query { path, spec } => {
                let root = daemon.roots.get(&path)?;
                let spec = QuerySpec::parse(&spec, daemon.default_sync_ms)?;
                let query = PreparedQuery::prepare(&root, spec)?;
                let result = query.run(&root)?;
                object(json!(result))
            }
            Request::Subscribe { path, name, spec } => {
                let root = daemon.roots.get(&path)?;
                let spec = QuerySpec::parse(&spec, daemon.default_sync_ms)?;
                let query = PreparedQuery::prepare(&root, spec)?;
                let clock = sync_to_now(&root, query.spec().sync_timeout)?;
                let body = object(json!({
                    "subscribe": name,
                    "clock": clock.to_string(),
                }));
                return Ok(Outcome::Subscribe {
                    body,
                    root,
                    name,
                    query,
                });
            }
            Request::Unsubscribe { path, name } => {
                let root = daemon.roots.get(&path)?;
                let removed = self
                    .subscriptions
                    .remove(&(root.path().to_path_buf(), name.clone()));
                let deleted = removed.is_some();
                if let Some(sub) = removed {
                    sub.cancel();
                }
                object(json!({ "unsubscribe": name, "deleted": deleted }))
            }
            Request::StateEnter { path, state } => self.state_enter(&daemon, &path, state)?,
            Request::StateLeave { path, state } => self.state_leave(&daemon, &path, state)?,
            Request::PauseWatchers => {
                let ack = daemon.pause.pause();
                daemon
                    .audit
                    .record("debug-pause-watchers", None, &format!("epoch={}", ack.epoch));
                object(json!(ack))
            }
            Request::UnpauseWatchers => {
                let ack = daemon.pause.unpause();
                daemon.roots.wake_all();
                daemon
                    .audit
                    .record("debug-unpause-watchers", None, &format!("epoch={}", ack.epoch));
                object(json!(ack))
            }
            Request::Recrawl { path } => {
                let root = daemon.roots.get(&path)?;
                root.request_recrawl("debug-recrawl requested")?;
                daemon
                    .audit
                    .record("debug-recrawl", Some(root.path()), "recrawl scheduled");
                object(json!({ "recrawl": true }))
            }
            Request::AbortCookies { path } => {
                let root = daemon.roots.get(&path)?;
                let aborted = root.abort_cookies();
                daemon.audit.record(
                    "debug-abort-cookies",
                    Some(root.path()),
                    &format!("aborted={aborted} generation={}", root.generation()),
                );
                object(json!({ "aborted": aborted }))
            }
            Request::GetPid => object(json!({ "pid": std::process::id() })),
            Request::Version => object(json!({ "build_uuid": env!("BUILD_UUID") })),
            Request::ShutdownServer => {
                return Ok(Outcome::Shutdown(object(json!({ "shutdown-server": true }))));
            }
        };
        Ok(Outcome::Reply(body))
    }

    fn state_enter(
        &mut self,
        daemon: &Daemon,
        path: &str,
        state: StateArgs,
    ) -> WatchdResult<Map<String, Value>> {
        let root = daemon.roots.get(path)?;
        let timeout = parse_sync_timeout(state.sync_timeout.as_ref(), daemon.default_sync_ms)?;
        let clock = sync_to_now(&root, timeout)?.to_string();
        root.states()
            .enter(&state.name, self.id, state.metadata.clone())?;
        self.states.push((Arc::clone(&root), state.name.clone()));

        broadcast_state(&root, "state-enter", &state.name, &clock, state.metadata, false);
        Ok(object(json!({
            "root": root.path().display().to_string(),
            "state-enter": state.name,
            "clock": clock,
        })))
    }

    fn state_leave(
        &mut self,
        daemon: &Daemon,
        path: &str,
        state: StateArgs,
    ) -> WatchdResult<Map<String, Value>> {
        let root = daemon.roots.get(path)?;
        let timeout = parse_sync_timeout(state.sync_timeout.as_ref(), daemon.default_sync_ms)?;
        let clock = sync_to_now(&root, timeout)?.to_string();
        let entered_with = root.states().leave(&state.name, self.id)?;
        self.states
            .retain(|(held, name)| !(Arc::ptr_eq(held, &root) && *name == state.name));

        broadcast_state(
            &root,
            "state-leave",
            &state.name,
            &clock,
            state.metadata.or(entered_with),
            false,
        );
        Ok(object(json!({
            "root": root.path().display().to_string(),
            "state-leave": state.name,
            "clock": clock,
        })))
    }

    /// Release everything this connection held.
    fn close(&mut self) {
        for (_, sub) in self.subscriptions.drain() {
            sub.cancel();
        }
        let mut held: Vec<Arc<Root>> = Vec::new();
        for (root, _) in std::mem::take(&mut self.states) {
            if !held.iter().any(|seen| Arc::ptr_eq(seen, &root)) {
                held.push(root);
            }
        }
        for root in held {
            let vacated = root.states().vacate_owner(self.id);
            if vacated.is_empty() {
                continue;
            }
            let clock = root.clock().to_string();
            for name in vacated {
                tracing::info!(
                    root = %root.path().display(),
                    state = %name,
                    session = self.id,
                    "vacating abandoned state"
                );
                broadcast_state(&root, "state-leave", &name, &clock, None, true);
            }
        }
    }
}

fn broadcast_state(
    root: &Root,
    transition: &str,
    name: &str,
    clock: &str,
    metadata: Option<Value>,
    abandoned: bool,
) {
    for sub in root.subscribers() {
        let mut fields = Map::new();
        fields.insert(transition.to_string(), Value::from(name));
        fields.insert("clock".to_string(), Value::from(clock));
        if let Some(metadata) = &metadata {
            fields.insert("metadata".to_string(), metadata.clone());
        }
        if abandoned {
            fields.insert("abandoned".to_string(), Value::Bool(true));
        }
        sub.notify(fields);
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}

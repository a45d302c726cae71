//! Push delivery of view changes to a connected client.
//!
//! The initial result set goes out when the subscription is created,
//! regardless of the pause state. Every later PDU (file deltas and state
//! notices) is collected under a delivery permit, so nothing new is taken
//! for delivery while watchers are paused and the accumulated delta is
//! flushed as one PDU on unpause. The socket write itself happens after the
//! permit is released; a client that stops reading must not hold up a pause.

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::WatchdResult;
use crate::watchd::protocol::PduWriter;
use crate::watchd::query::PreparedQuery;
use crate::watchd::root::Root;

const POLL: Duration = Duration::from_millis(250);

pub struct Subscription {
    name: String,
    session: u64,
    root: Arc<Root>,
    query: PreparedQuery,
    writer: PduWriter,
    cancelled: AtomicBool,
    delivered_ticks: Mutex<u64>,
    notices: Mutex<VecDeque<Value>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("session", &self.session)
            .field("root", &self.root.path())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Register with `root`, send the initial PDU and start delivery.
    pub fn start(
        name: String,
        session: u64,
        root: Arc<Root>,
        query: PreparedQuery,
        writer: PduWriter,
    ) -> WatchdResult<Arc<Subscription>> {
        let sub = Arc::new(Subscription {
            name,
            session,
            root,
            query,
            writer,
            cancelled: AtomicBool::new(false),
            delivered_ticks: Mutex::new(0),
            notices: Mutex::new(VecDeque::new()),
        });

        let initial = {
            let view = sub.root.view();
            let ticks = view.ticks();
            *sub.delivered_ticks.lock() = ticks;
            sub.pdu(ticks, sub.query.files(&view, None), true)
        };
        sub.root.add_subscriber(&sub);
        sub.writer.send(&initial)?;

        let worker = Arc::clone(&sub);
        thread::Builder::new()
            .name(format!("watchd-sub-{}", sub.name))
            .spawn(move || worker.deliver_loop())?;
        tracing::debug!(
            root = %sub.root.path().display(),
            subscription = %sub.name,
            "subscription started"
        );
        Ok(sub)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Queue an out-of-band notice (state transitions) tagged with this
    /// subscription. It goes out through the same pause gate as deltas.
    pub fn notify(&self, fields: Map<String, Value>) {
        let mut pdu = self.header();
        pdu.extend(fields);
        self.notices.lock().push_back(Value::Object(pdu));
    }

    fn header(&self) -> Map<String, Value> {
        let mut pdu = Map::new();
        pdu.insert("unilateral".to_string(), Value::Bool(true));
        pdu.insert("subscription".to_string(), Value::from(self.name.as_str()));
        pdu.insert(
            "root".to_string(),
            Value::from(self.root.path().display().to_string()),
        );
        pdu
    }

    fn pdu(&self, ticks: u64, files: Vec<Value>, fresh: bool) -> Value {
        let mut pdu = self.header();
        pdu.insert(
            "clock".to_string(),
            json!(self.root.token_at(ticks).to_string()),
        );
        pdu.insert("files".to_string(), Value::Array(files));
        pdu.insert("is_fresh_instance".to_string(), Value::Bool(fresh));
        Value::Object(pdu)
    }

    fn deliver_loop(self: Arc<Self>) {
        let mut seen = self.root.update_count();
        while !self.is_cancelled() && !self.root.is_cancelled() {
            let delivered = *self.delivered_ticks.lock();
            let idle = self.notices.lock().is_empty() && self.root.view().ticks() == delivered;
            if idle {
                seen = self.root.wait_for_update(seen, POLL);
                continue;
            }
            let outgoing = {
                let Some(_permit) = self.root.pause().admit_timeout(POLL) else {
                    continue;
                };
                let mut outgoing: Vec<Value> = self.notices.lock().drain(..).collect();
                let view = self.root.view();
                let ticks = view.ticks();
                if ticks != delivered {
                    let files = self.query.files(&view, Some(delivered));
                    if !files.is_empty() {
                        outgoing.push(self.pdu(ticks, files, false));
                    }
                }
                *self.delivered_ticks.lock() = ticks;
                outgoing
            };
            for pdu in &outgoing {
                if let Err(err) = self.writer.send(pdu) {
                    tracing::debug!(subscription = %self.name, %err, "subscriber went away");
                    self.cancel();
                    break;
                }
            }
        }
        tracing::debug!(subscription = %self.name, "subscription ended");
    }
}

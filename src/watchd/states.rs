use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{WatchdError, WatchdResult};

#[derive(Debug, Clone)]
struct Assertion {
    owner: u64,
    metadata: Option<Value>,
}

/// Named states asserted against a root by client sessions.
#[derive(Debug, Default)]
pub struct StateTable {
    asserted: Mutex<BTreeMap<String, Assertion>>,
}

impl StateTable {
    pub fn enter(&self, name: &str, owner: u64, metadata: Option<Value>) -> WatchdResult<()> {
        let mut asserted = self.asserted.lock();
        if asserted.contains_key(name) {
            return Err(WatchdError::invalid(format!(
                "state {name} is already asserted"
            )));
        }
        asserted.insert(name.to_string(), Assertion { owner, metadata });
        Ok(())
    }

    /// Returns the metadata the state was entered with.
    pub fn leave(&self, name: &str, owner: u64) -> WatchdResult<Option<Value>> {
        let mut asserted = self.asserted.lock();
        match asserted.get(name) {
            None => Err(WatchdError::invalid(format!("state {name} is not asserted"))),
            Some(existing) if existing.owner != owner => Err(WatchdError::invalid(format!(
                "state {name} was not asserted by this session"
            ))),
            Some(_) => Ok(asserted.remove(name).and_then(|a| a.metadata)),
        }
    }

    /// Drop every state held by `owner`, returning their names.
    pub fn vacate_owner(&self, owner: u64) -> Vec<String> {
        let mut asserted = self.asserted.lock();
        let names: Vec<String> = asserted
            .iter()
            .filter(|(_, a)| a.owner == owner)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            asserted.remove(name);
        }
        names
    }
}

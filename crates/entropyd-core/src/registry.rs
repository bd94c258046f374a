//! Process-wide monitor registry.
//!
//! Monitors self-register on construction and deregister on drop; the
//! registry only holds weak references, so it never extends a monitor's
//! lifetime. The control server resolves ids against this table.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::health::HealthMonitor;

/// Registered monitor variants. Health monitors are the only kind today;
/// the sum leaves room for other monitor families.
pub enum Monitor {
    Health(Weak<HealthMonitor>),
}

impl Monitor {
    fn upgrade(&self) -> Option<Arc<HealthMonitor>> {
        match self {
            Monitor::Health(w) => w.upgrade(),
        }
    }
}

fn registry() -> &'static Mutex<BTreeMap<String, Monitor>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<String, Monitor>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

pub(crate) fn register(id: &str, monitor: Monitor) {
    let mut map = registry().lock().unwrap();
    if map.insert(id.to_string(), monitor).is_some() {
        log::warn!(target: "entropyd::registry", "monitor id {id:?} re-registered");
    }
}

/// Drop the entry for `id`, but only if it is dead: a replacement monitor
/// under the same id must survive the old one's destructor.
pub(crate) fn deregister(id: &str) {
    let mut map = registry().lock().unwrap();
    if let Some(entry) = map.get(id)
        && entry.upgrade().is_none()
    {
        map.remove(id);
    }
}

/// Ids of all live monitors, in stable (sorted) order.
pub fn ids() -> Vec<String> {
    let mut map = registry().lock().unwrap();
    map.retain(|_, m| m.upgrade().is_some());
    map.keys().cloned().collect()
}

/// Resolve one monitor by id.
pub fn get(id: &str) -> Option<Arc<HealthMonitor>> {
    registry().lock().unwrap().get(id).and_then(Monitor::upgrade)
}

/// Snapshot of every live monitor.
pub fn all() -> Vec<(String, Arc<HealthMonitor>)> {
    let mut map = registry().lock().unwrap();
    map.retain(|_, m| m.upgrade().is_some());
    map.iter()
        .filter_map(|(id, m)| m.upgrade().map(|arc| (id.clone(), arc)))
        .collect()
}

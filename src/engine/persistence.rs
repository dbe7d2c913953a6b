//! Action-set persistence
//!
//! Every mutating store call writes the affected table and flushes before
//! returning, so no edit is lost to a crash right after it. Loading is
//! tolerant: malformed pages, buttons, set ids or actions are skipped with a
//! warning instead of failing the whole table.

use super::types::{ActionInstance, ActionSetMap, ActionSets, ButtonConfig, ButtonConfigMap, SetId};
use crate::error::Result;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Key holding `page -> button -> set -> actions`
const ACTION_SETS_KEY: &[u8] = b"action_sets";

/// Key holding `page -> button -> config`
const BUTTONS_KEY: &[u8] = b"buttons";

/// Storage backend for the action-set store
pub trait SetPersistence: Send {
    fn load_action_sets(&self) -> Result<ActionSetMap>;

    fn save_action_sets(&self, sets: &ActionSetMap) -> Result<()>;

    fn load_buttons(&self) -> Result<ButtonConfigMap>;

    fn save_buttons(&self, buttons: &ButtonConfigMap) -> Result<()>;

    /// Save both tables so that either both or neither are written
    fn save_all(&self, sets: &ActionSetMap, buttons: &ButtonConfigMap) -> Result<()>;
}

/// Sled-backed persistence with synchronous flush
pub struct SledPersistence {
    db: sled::Db,
}

impl SledPersistence {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        info!("Action store opened database at: {}", path.display());
        Ok(Self { db })
    }

    fn write(&self, key: &[u8], json: Vec<u8>) -> Result<()> {
        self.db.insert(key, json)?;
        self.db.flush()?;
        trace!("Wrote {} to sled", String::from_utf8_lossy(key));
        Ok(())
    }

    fn read(&self, key: &[u8]) -> Result<Option<Value>> {
        match self.db.get(key)? {
            Some(data) => match serde_json::from_slice::<Value>(&data) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!(
                        "Stored {} is not valid JSON, starting empty: {}",
                        String::from_utf8_lossy(key),
                        e
                    );
                    Ok(None)
                }
            },
            None => {
                debug!("No {} found in database", String::from_utf8_lossy(key));
                Ok(None)
            }
        }
    }
}

impl SetPersistence for SledPersistence {
    fn load_action_sets(&self) -> Result<ActionSetMap> {
        Ok(self
            .read(ACTION_SETS_KEY)?
            .map(|v| parse_action_sets(&v))
            .unwrap_or_default())
    }

    fn save_action_sets(&self, sets: &ActionSetMap) -> Result<()> {
        self.write(ACTION_SETS_KEY, serde_json::to_vec(sets)?)
    }

    fn load_buttons(&self) -> Result<ButtonConfigMap> {
        Ok(self
            .read(BUTTONS_KEY)?
            .map(|v| parse_buttons(&v))
            .unwrap_or_default())
    }

    fn save_buttons(&self, buttons: &ButtonConfigMap) -> Result<()> {
        self.write(BUTTONS_KEY, serde_json::to_vec(buttons)?)
    }

    fn save_all(&self, sets: &ActionSetMap, buttons: &ButtonConfigMap) -> Result<()> {
        let mut batch = sled::Batch::default();
        batch.insert(ACTION_SETS_KEY, serde_json::to_vec(sets)?);
        batch.insert(BUTTONS_KEY, serde_json::to_vec(buttons)?);
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        trace!("Wrote action sets and buttons to sled");
        Ok(())
    }
}

/// In-memory persistence for tests and ephemeral runs
///
/// Clones share the same tables, so a test can keep one clone to inspect what
/// the store wrote.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    inner: Arc<Mutex<MemoryTables>>,
}

#[derive(Default)]
struct MemoryTables {
    sets: ActionSetMap,
    buttons: ButtonConfigMap,
    writes: u64,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of save calls received
    pub fn write_count(&self) -> u64 {
        self.inner.lock().writes
    }

    /// Last saved action-set table
    pub fn saved_action_sets(&self) -> ActionSetMap {
        self.inner.lock().sets.clone()
    }
}

impl SetPersistence for MemoryPersistence {
    fn load_action_sets(&self) -> Result<ActionSetMap> {
        Ok(self.inner.lock().sets.clone())
    }

    fn save_action_sets(&self, sets: &ActionSetMap) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.sets = sets.clone();
        inner.writes += 1;
        Ok(())
    }

    fn load_buttons(&self) -> Result<ButtonConfigMap> {
        Ok(self.inner.lock().buttons.clone())
    }

    fn save_buttons(&self, buttons: &ButtonConfigMap) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.buttons = buttons.clone();
        inner.writes += 1;
        Ok(())
    }

    fn save_all(&self, sets: &ActionSetMap, buttons: &ButtonConfigMap) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.sets = sets.clone();
        inner.buttons = buttons.clone();
        inner.writes += 1;
        Ok(())
    }
}

/// Memory persistence whose writes can be made to fail
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct FlakyPersistence {
    pub inner: MemoryPersistence,
    pub failing: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl FlakyPersistence {
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(sled::Error::Unsupported("disk full".to_string()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
impl SetPersistence for FlakyPersistence {
    fn load_action_sets(&self) -> Result<ActionSetMap> {
        self.inner.load_action_sets()
    }

    fn save_action_sets(&self, sets: &ActionSetMap) -> Result<()> {
        self.check()?;
        self.inner.save_action_sets(sets)
    }

    fn load_buttons(&self) -> Result<ButtonConfigMap> {
        self.inner.load_buttons()
    }

    fn save_buttons(&self, buttons: &ButtonConfigMap) -> Result<()> {
        self.check()?;
        self.inner.save_buttons(buttons)
    }

    fn save_all(&self, sets: &ActionSetMap, buttons: &ButtonConfigMap) -> Result<()> {
        self.check()?;
        self.inner.save_all(sets, buttons)
    }
}

/// Walk `page -> button -> value` keeping only numeric keys
fn for_each_button<'a>(value: &'a Value, mut f: impl FnMut(u32, u32, &'a Value)) {
    let Some(pages) = value.as_object() else {
        warn!("Stored table is not an object, ignoring it");
        return;
    };

    for (page_key, buttons) in pages {
        let (Ok(page), Some(buttons)) = (page_key.parse::<u32>(), buttons.as_object()) else {
            warn!("Skipping malformed page entry '{}'", page_key);
            continue;
        };
        for (button_key, entry) in buttons {
            match button_key.parse::<u32>() {
                Ok(button) => f(page, button, entry),
                Err(_) => warn!("Skipping malformed button entry '{}.{}'", page, button_key),
            }
        }
    }
}

/// Parse a stored action-set table, dropping anything malformed
pub fn parse_action_sets(value: &Value) -> ActionSetMap {
    let mut map = ActionSetMap::new();

    for_each_button(value, |page, button, entry| {
        let mut sets = ActionSets::new();
        if let Some(stored_sets) = entry.as_object() {
            for (set_key, actions) in stored_sets {
                let Ok(set_id) = set_key.parse::<SetId>() else {
                    warn!("Skipping unknown action set '{}' on {}.{}", set_key, page, button);
                    continue;
                };
                let actions: Vec<ActionInstance> = actions
                    .as_array()
                    .map(|list| {
                        list.iter()
                            .filter_map(|a| match serde_json::from_value(a.clone()) {
                                Ok(action) => Some(action),
                                Err(e) => {
                                    warn!("Dropping malformed action on {}.{}:{}: {}", page, button, set_id, e);
                                    None
                                }
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                sets.insert(set_id, actions);
            }
        }
        map.entry(page).or_default().insert(button, sets);
    });

    map
}

/// Parse a stored button-config table, dropping anything malformed
pub fn parse_buttons(value: &Value) -> ButtonConfigMap {
    let mut map: ButtonConfigMap = BTreeMap::new();

    for_each_button(value, |page, button, entry| {
        match serde_json::from_value::<ButtonConfig>(entry.clone()) {
            Ok(config) => {
                map.entry(page).or_default().insert(button, config);
            }
            Err(e) => warn!("Dropping malformed button config {}.{}: {}", page, button, e),
        }
    });

    map
}

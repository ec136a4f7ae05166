//! In-memory catalog of skill bundles and their commands.
//!
//! Readers clone an `Arc` snapshot under a read lock; the indexer swaps
//! the snapshot atomically per reload, so a reader sees either the old or
//! the new catalog, never a partial mix.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use omnihive_schema::{RegistryUpdate, SkillError, SkillState, ToolRecord};

use crate::bundle::SkillBundle;

/// In-process command implementation (the fast path).
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, args: serde_json::Value) -> Result<serde_json::Value, SkillError>;
}

/// How a resolved command executes.
#[derive(Clone)]
pub enum Handler {
    InProcess(Arc<dyn CommandHandler>),
    /// Runs under a dedicated worker via the subprocess pool.
    Isolated { node: String, script: PathBuf },
}

#[derive(Clone)]
struct SkillEntry {
    commands: Vec<ToolRecord>,
    mtime: i64,
    state: SkillState,
}

#[derive(Default)]
struct Snapshot {
    skills: HashMap<String, SkillEntry>,
}

type UpdateCallback = Box<dyn Fn(&RegistryUpdate) + Send + Sync>;

pub struct SkillRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    callbacks: Mutex<Vec<UpdateCallback>>,
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            handlers: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register an in-process handler for `skill.command`. Handlers win
    /// over the isolated path when a command is not marked isolated.
    pub fn register_handler(&self, tool_id: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(tool_id.into(), handler);
        }
    }

    /// Subscribe to reload deltas.
    pub fn on_update(&self, callback: impl Fn(&RegistryUpdate) + Send + Sync + 'static) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_default()
    }

    pub fn list_commands(&self) -> Vec<ToolRecord> {
        let snapshot = self.current();
        let mut records: Vec<ToolRecord> = snapshot
            .skills
            .values()
            .flat_map(|entry| entry.commands.iter().cloned())
            .collect();
        records.sort_by(|a, b| a.tool_id().cmp(&b.tool_id()));
        records
    }

    pub fn skill_names(&self) -> Vec<String> {
        let snapshot = self.current();
        let mut names: Vec<String> = snapshot.skills.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn skill_state(&self, skill: &str) -> Option<SkillState> {
        self.current().skills.get(skill).map(|entry| entry.state)
    }

    /// Bundle mtime at the last successful scan; the runner's cache
    /// soundness check keys on this.
    pub fn skill_mtime(&self, skill: &str) -> Option<i64> {
        self.current().skills.get(skill).map(|entry| entry.mtime)
    }

    /// Resolve `(skill, command)` to its record and execution handler.
    pub fn get_command(&self, skill: &str, command: &str) -> Option<(ToolRecord, Handler)> {
        let snapshot = self.current();
        let entry = snapshot.skills.get(skill)?;
        let record = entry
            .commands
            .iter()
            .find(|record| record.command_name == command)?
            .clone();
        Some(self.handler_for(record))
    }

    /// Resolve a bare command name to `skill.command` when exactly one
    /// skill defines it (tool aliasing).
    pub fn resolve_alias(&self, command: &str) -> Option<(String, String)> {
        let snapshot = self.current();
        let mut matches = snapshot.skills.values().flat_map(|entry| {
            entry
                .commands
                .iter()
                .filter(|record| record.command_name == command)
        });
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some((first.skill_name.clone(), first.command_name.clone()))
    }

    fn handler_for(&self, record: ToolRecord) -> (ToolRecord, Handler) {
        let tool_id = record.tool_id();
        let in_process = self
            .handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(&tool_id).cloned());
        // Explicit isolation wins even when a local handler exists.
        if !record.isolated {
            if let Some(handler) = in_process {
                return (record, Handler::InProcess(handler));
            }
        }
        let node = record.skill_name.clone();
        let script = PathBuf::from(record.file_path.clone());
        (record, Handler::Isolated { node, script })
    }

    /// Mark a skill dirty (FS event seen, reload pending).
    pub fn mark_dirty(&self, skill: &str) {
        if let Ok(mut guard) = self.snapshot.write() {
            let mut snapshot = (**guard).clone_shallow();
            if let Some(entry) = snapshot.skills.get_mut(skill) {
                entry.state = SkillState::Dirty;
            }
            *guard = Arc::new(snapshot);
        }
    }

    /// Atomically replace the listed skills (and drop removed ones),
    /// returning the delta. Skills outside `touched` are untouched, so
    /// partial reloads never disturb the rest of the catalog.
    pub fn apply_bundles(
        &self,
        touched: &[String],
        bundles: Vec<SkillBundle>,
    ) -> RegistryUpdate {
        let mut update = RegistryUpdate::default();
        let incoming: HashMap<String, SkillBundle> = bundles
            .into_iter()
            .map(|bundle| (bundle.manifest.name.clone(), bundle))
            .collect();

        {
            let Ok(mut guard) = self.snapshot.write() else {
                return update;
            };
            let mut snapshot = (**guard).clone_shallow();

            for skill in touched {
                match incoming.get(skill) {
                    Some(bundle) => {
                        let previous = snapshot.skills.get(skill);
                        let previous_ids: Vec<String> = previous
                            .map(|entry| {
                                entry.commands.iter().map(|r| r.tool_id()).collect()
                            })
                            .unwrap_or_default();
                        let state = if previous.is_some() {
                            SkillState::Reloaded
                        } else {
                            SkillState::Loaded
                        };
                        for record in &bundle.commands {
                            let id = record.tool_id();
                            if previous_ids.contains(&id) {
                                update.modified.push(id);
                            } else {
                                update.added.push(id);
                            }
                        }
                        for id in previous_ids {
                            let still_there =
                                bundle.commands.iter().any(|r| r.tool_id() == id);
                            if !still_there {
                                update.removed.push(id);
                            }
                        }
                        snapshot.skills.insert(
                            skill.clone(),
                            SkillEntry {
                                commands: bundle.commands.clone(),
                                mtime: bundle.mtime,
                                state,
                            },
                        );
                    }
                    None => {
                        if let Some(entry) = snapshot.skills.remove(skill) {
                            update
                                .removed
                                .extend(entry.commands.iter().map(|r| r.tool_id()));
                        }
                    }
                }
            }
            *guard = Arc::new(snapshot);
        }

        if !update.is_empty() {
            self.notify(&update);
        }
        update
    }

    fn notify(&self, update: &RegistryUpdate) {
        if let Ok(callbacks) = self.callbacks.lock() {
            for callback in callbacks.iter() {
                callback(update);
            }
        }
    }
}

impl Snapshot {
    fn clone_shallow(&self) -> Self {
        Self {
            skills: self.skills.clone(),
        }
    }
}

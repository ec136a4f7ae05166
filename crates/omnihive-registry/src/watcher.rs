//! Debounced filesystem watcher driving the live-wire indexer.
//!
//! Create/modify/delete/rename events under `skills_dir` are coalesced in
//! a debounce window; when it closes only the affected bundles are
//! reprocessed. At most one reindex pass runs at a time; events arriving
//! mid-pass are drained into exactly one follow-up pass.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify_debouncer_mini::{new_debouncer, notify::RecursiveMode, DebouncedEvent};
use tokio::sync::mpsc;

use crate::indexer::LiveWireIndexer;

pub struct SkillWatcher {
    handle: tokio::task::JoinHandle<()>,
}

impl SkillWatcher {
    /// Watch `skills_dir` and feed the indexer. The watcher owns the
    /// debouncer for its lifetime; dropping the handle stops watching.
    pub fn spawn(
        skills_dir: PathBuf,
        debounce: Duration,
        indexer: Arc<LiveWireIndexer>,
    ) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Vec<DebouncedEvent>>(16);

        let mut debouncer = new_debouncer(debounce, move |events: Result<Vec<_>, _>| {
            if let Ok(events) = events {
                let _ = tx.blocking_send(events);
            }
        })
        .context("creating filesystem watcher")?;
        debouncer
            .watcher()
            .watch(&skills_dir, RecursiveMode::Recursive)
            .with_context(|| format!("watching {}", skills_dir.display()))?;

        tracing::info!("watching {} for skill changes", skills_dir.display());

        let handle = tokio::spawn(async move {
            // Keep the debouncer alive inside the task.
            let _debouncer = debouncer;
            while let Some(events) = rx.recv().await {
                let mut affected = affected_bundles(&skills_dir, &events);
                loop {
                    if affected.is_empty() {
                        break;
                    }
                    for name in &affected {
                        indexer.registry().mark_dirty(name);
                    }
                    let names: Vec<String> = affected.iter().cloned().collect();
                    if let Err(e) = indexer.reindex_bundles(&names).await {
                        tracing::warn!("reindex pass failed, keeping previous index: {e}");
                    }
                    // Events that arrived mid-pass get one follow-up pass.
                    let mut more = BTreeSet::new();
                    while let Ok(events) = rx.try_recv() {
                        more.extend(affected_bundles(&skills_dir, &events));
                    }
                    affected = more;
                }
            }
        });

        Ok(Self { handle })
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for SkillWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Map event paths to bundle names: the first path component below
/// `skills_dir`. Editor junk and hidden files are ignored.
fn affected_bundles(skills_dir: &Path, events: &[DebouncedEvent]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for event in events {
        let Ok(relative) = event.path.strip_prefix(skills_dir) else {
            continue;
        };
        let Some(first) = relative.components().next() else {
            continue;
        };
        let name = first.as_os_str().to_string_lossy();
        if name.starts_with('.') || name.ends_with('~') {
            continue;
        }
        if let Some(file) = event.path.file_name().and_then(|f| f.to_str()) {
            if file.starts_with('.') || file.ends_with(".swp") || file.ends_with('~') {
                continue;
            }
        }
        names.insert(name.into_owned());
    }
    names
}

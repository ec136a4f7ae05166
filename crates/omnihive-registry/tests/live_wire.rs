//! Live-wire behavior: on-disk bundle edits flow through the debounce
//! window into the registry and index without restart.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use omnihive_memory::{HashEmbedding, VectorStore};
use omnihive_registry::{LiveWireIndexer, SkillRegistry, SkillWatcher, SKILLS_TABLE};

fn write_bundle(root: &Path, name: &str, commands: &[(&str, &str)]) {
    let dir = root.join(name);
    std::fs::create_dir_all(dir.join("scripts")).unwrap();
    std::fs::write(
        dir.join("SKILL.md"),
        format!("---\nname: {name}\ndescription: {name} skill\nversion: 1.0.0\n---\nbody"),
    )
    .unwrap();
    let mut source = String::new();
    for (command, description) in commands {
        source.push_str(&format!(
            "@skill_command(name=\"{command}\", description=\"{description}\")\ndef {command}(arg: str):\n    pass\n\n"
        ));
    }
    std::fs::write(dir.join("scripts").join("mod.py"), source).unwrap();
}

fn indexer(root: &Path) -> Arc<LiveWireIndexer> {
    Arc::new(LiveWireIndexer::new(
        root.to_path_buf(),
        VectorStore::open_in_memory().unwrap(),
        Arc::new(HashEmbedding::new(8)),
        Arc::new(SkillRegistry::new()),
    ))
}

#[tokio::test]
async fn reload_keeps_mtime_monotonic() {
    let root = tempfile::tempdir().unwrap();
    write_bundle(root.path(), "git", &[("commit", "commit changes")]);

    let indexer = indexer(root.path());
    indexer.reindex_all().await.unwrap();
    let registry = indexer.registry();
    let first_mtime = registry.skill_mtime("git").unwrap();

    // Edit the bundle and reprocess just that skill.
    std::thread::sleep(Duration::from_millis(1100));
    write_bundle(
        root.path(),
        "git",
        &[("commit", "commit changes"), ("push", "push commits")],
    );
    indexer.reindex_bundles(&["git".into()]).await.unwrap();

    let second_mtime = registry.skill_mtime("git").unwrap();
    assert!(second_mtime >= first_mtime);
    assert!(registry.get_command("git", "push").is_some());
}

#[tokio::test]
async fn watcher_reindexes_after_debounce_window() {
    let root = tempfile::tempdir().unwrap();
    write_bundle(root.path(), "demo", &[("echo", "echo a message")]);

    let indexer = indexer(root.path());
    indexer.reindex_all().await.unwrap();
    let registry = indexer.registry();
    assert!(registry.get_command("demo", "shout").is_none());

    let _watcher = SkillWatcher::spawn(
        root.path().to_path_buf(),
        Duration::from_millis(100),
        Arc::clone(&indexer),
    )
    .unwrap();

    // FS events need a moment to flow through the debouncer.
    tokio::time::sleep(Duration::from_millis(200)).await;
    write_bundle(
        root.path(),
        "demo",
        &[("echo", "echo a message"), ("shout", "echo but louder")],
    );

    let mut found = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if registry.get_command("demo", "shout").is_some() {
            found = true;
            break;
        }
    }
    assert!(found, "watcher did not pick up the new command in time");
}

#[tokio::test]
async fn watcher_removal_drops_skill() {
    let root = tempfile::tempdir().unwrap();
    write_bundle(root.path(), "demo", &[("echo", "echo a message")]);

    let indexer = indexer(root.path());
    indexer.reindex_all().await.unwrap();
    let registry = indexer.registry();
    assert!(registry.get_command("demo", "echo").is_some());

    let _watcher = SkillWatcher::spawn(
        root.path().to_path_buf(),
        Duration::from_millis(100),
        Arc::clone(&indexer),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    std::fs::remove_dir_all(root.path().join("demo")).unwrap();

    let mut removed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if registry.get_command("demo", "echo").is_none() {
            removed = true;
            break;
        }
    }
    assert!(removed, "watcher did not drop the removed skill in time");
}

#[tokio::test]
async fn update_callback_can_bust_external_caches() {
    let root = tempfile::tempdir().unwrap();
    write_bundle(root.path(), "demo", &[("echo", "echo a message")]);

    let indexer = indexer(root.path());
    let registry = indexer.registry();
    let busted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let busted = Arc::clone(&busted);
        registry.on_update(move |update| {
            assert!(update.touched_skills().contains(&"demo".to_string()));
            busted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
    }

    indexer.reindex_all().await.unwrap();
    assert_eq!(busted.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn store_rows_follow_registry_state() {
    let root = tempfile::tempdir().unwrap();
    write_bundle(root.path(), "git", &[("commit", "commit changes")]);

    let store = VectorStore::open_in_memory().unwrap();
    let indexer = Arc::new(LiveWireIndexer::new(
        root.path().to_path_buf(),
        store.clone(),
        Arc::new(HashEmbedding::new(8)),
        Arc::new(SkillRegistry::new()),
    ));
    indexer.reindex_all().await.unwrap();
    assert_eq!(store.list_ids(SKILLS_TABLE).await.unwrap(), vec!["git.commit"]);

    std::fs::remove_dir_all(root.path().join("git")).unwrap();
    indexer.reindex_bundles(&["git".into()]).await.unwrap();
    assert!(store.list_ids(SKILLS_TABLE).await.unwrap().is_empty());
}

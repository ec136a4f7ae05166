//! Skill bundles on disk: a directory with a SKILL.md manifest (YAML
//! frontmatter + body) and a `scripts/` directory of command modules.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use omnihive_schema::ToolRecord;
use serde::Deserialize;

use crate::scanner::scan_script;

#[derive(Debug, Clone, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub routing_keywords: Vec<String>,
    #[serde(default)]
    pub intents: Vec<String>,
    #[serde(default)]
    pub authors: Vec<String>,
}

/// A scanned bundle: manifest plus discovered command records.
#[derive(Debug, Clone)]
pub struct SkillBundle {
    pub manifest: SkillManifest,
    pub commands: Vec<ToolRecord>,
    pub dir: PathBuf,
    /// Newest mtime across the manifest and scripts, unix seconds.
    pub mtime: i64,
}

impl SkillBundle {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }
}

fn parse_frontmatter(raw: &str) -> Result<(SkillManifest, String)> {
    let trimmed = raw.trim_start();
    if !trimmed.starts_with("---") {
        anyhow::bail!("SKILL.md must start with YAML frontmatter (---)");
    }
    let after_first = &trimmed[3..];
    let end = after_first
        .find("---")
        .ok_or_else(|| anyhow::anyhow!("no closing --- for frontmatter"))?;
    let yaml_str = &after_first[..end];
    let body = after_first[end + 3..].trim().to_string();
    let manifest: SkillManifest =
        serde_yaml::from_str(yaml_str).context("parsing skill frontmatter YAML")?;
    Ok((manifest, body))
}

fn file_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Load one bundle directory. Commands come from decorated functions in
/// `scripts/*.py`; a module that fails to scan is skipped with a warning,
/// never aborting the bundle.
pub fn load_bundle(dir: &Path) -> Result<SkillBundle> {
    let manifest_path = dir.join("SKILL.md");
    let raw = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("reading {}", manifest_path.display()))?;
    let (manifest, _body) = parse_frontmatter(&raw)?;

    let mut mtime = file_mtime(&manifest_path);
    let mut commands = Vec::new();
    let scripts_dir = dir.join("scripts");
    if scripts_dir.is_dir() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&scripts_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("py"))
            .collect();
        entries.sort();

        for script in entries {
            mtime = mtime.max(file_mtime(&script));
            let source = match std::fs::read_to_string(&script) {
                Ok(source) => source,
                Err(e) => {
                    tracing::warn!("failed to read {}: {e}", script.display());
                    continue;
                }
            };
            commands.extend(scan_script(&manifest, &script, &source));
        }
    }

    Ok(SkillBundle {
        manifest,
        commands,
        dir: dir.to_path_buf(),
        mtime,
    })
}

/// Scan every bundle directory under `skills_dir`. Directories without a
/// SKILL.md are ignored; a bundle that fails to load is logged and
/// skipped so one bad manifest never hides the rest.
pub fn scan_bundles(skills_dir: &Path) -> Result<Vec<SkillBundle>> {
    let mut bundles = Vec::new();
    if !skills_dir.exists() {
        return Ok(bundles);
    }
    for entry in std::fs::read_dir(skills_dir)? {
        let entry = entry?;
        let dir = entry.path();
        if !dir.is_dir() || !dir.join("SKILL.md").exists() {
            continue;
        }
        match load_bundle(&dir) {
            Ok(bundle) => bundles.push(bundle),
            Err(e) => {
                tracing::warn!("failed to load skill from {}: {e}", dir.display());
            }
        }
    }
    bundles.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
    Ok(bundles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const MANIFEST: &str = "---\nname: git\ndescription: Git operations\nversion: 1.0.0\nrouting_keywords: [git, vcs]\nintents: [version control]\n---\n\n# Git skill\n";

    fn write_bundle(root: &Path, script: &str) -> PathBuf {
        let dir = root.join("git");
        fs::create_dir_all(dir.join("scripts")).unwrap();
        fs::write(dir.join("SKILL.md"), MANIFEST).unwrap();
        fs::write(dir.join("scripts").join("git_ops.py"), script).unwrap();
        dir
    }

    #[test]
    fn parse_frontmatter_extracts_fields() {
        let (manifest, body) = parse_frontmatter(MANIFEST).unwrap();
        assert_eq!(manifest.name, "git");
        assert_eq!(manifest.version, "1.0.0");
        assert_eq!(manifest.routing_keywords, vec!["git", "vcs"]);
        assert!(body.contains("# Git skill"));
    }

    #[test]
    fn parse_frontmatter_rejects_missing() {
        assert!(parse_frontmatter("# no frontmatter").is_err());
    }

    #[test]
    fn parse_frontmatter_requires_mandatory_fields() {
        let raw = "---\nname: x\n---\nbody";
        assert!(parse_frontmatter(raw).is_err());
    }

    #[test]
    fn load_bundle_discovers_commands() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_bundle(
            root.path(),
            r#"
@skill_command(name="commit", description="Commit staged changes", category="git")
def commit(message: str, amend: bool = False):
    pass
"#,
        );
        let bundle = load_bundle(&dir).unwrap();
        assert_eq!(bundle.name(), "git");
        assert_eq!(bundle.commands.len(), 1);
        assert_eq!(bundle.commands[0].command_name, "commit");
        assert_eq!(bundle.commands[0].skill_name, "git");
        assert!(bundle.mtime > 0);
    }

    #[test]
    fn scan_bundles_skips_broken_manifest() {
        let root = tempfile::tempdir().unwrap();
        write_bundle(root.path(), "");
        let broken = root.path().join("broken");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("SKILL.md"), "not yaml at all").unwrap();

        let bundles = scan_bundles(root.path()).unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].name(), "git");
    }

    #[test]
    fn scan_bundles_missing_dir_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let bundles = scan_bundles(&root.path().join("nope")).unwrap();
        assert!(bundles.is_empty());
    }
}

//! The skill runner: registry resolution, argument validation, result
//! cache, and dispatch to the in-process or isolated execution path.

use std::sync::Arc;
use std::time::Duration;

use omnihive_registry::{Handler, SkillRegistry};
use omnihive_schema::{parse_tool_id, SkillError};
use omnihive_swarm::SwarmPool;

use crate::cache::ResultCache;
use crate::validate::validate_args;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub bypass_cache: bool,
}

pub struct SkillRunner {
    registry: Arc<SkillRegistry>,
    pool: Arc<SwarmPool>,
    cache: ResultCache,
    default_timeout: Duration,
}

impl SkillRunner {
    pub fn new(registry: Arc<SkillRegistry>, pool: Arc<SwarmPool>) -> Self {
        Self {
            registry,
            pool,
            cache: ResultCache::new(),
            default_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> Arc<SkillRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bust cached results for the named skills (wired to registry
    /// `on_update` at assembly time).
    pub fn invalidate_skills(&self, skills: &[String]) {
        for skill in skills {
            self.cache.invalidate_skill(skill);
        }
    }

    /// Resolve a tool name: `skill.command`, or a bare command when
    /// exactly one skill defines it.
    pub fn resolve(&self, tool_name: &str) -> Result<(String, String), SkillError> {
        let (skill, command) = parse_tool_id(tool_name);
        if skill != command && self.registry.get_command(&skill, &command).is_some() {
            return Ok((skill, command));
        }
        if let Some((skill, command)) = self.registry.resolve_alias(tool_name) {
            return Ok((skill, command));
        }
        if self.registry.get_command(&skill, &command).is_some() {
            return Ok((skill, command));
        }
        Err(SkillError::UnknownCommand(tool_name.to_string()))
    }

    pub async fn run_tool(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        opts: RunOptions,
    ) -> Result<serde_json::Value, SkillError> {
        let (skill, command) = self.resolve(tool_name)?;
        self.run_skill(&skill, &command, args, opts).await
    }

    pub async fn run_skill(
        &self,
        skill: &str,
        command: &str,
        args: serde_json::Value,
        opts: RunOptions,
    ) -> Result<serde_json::Value, SkillError> {
        let (record, handler) = self
            .registry
            .get_command(skill, command)
            .ok_or_else(|| SkillError::UnknownCommand(format!("{skill}.{command}")))?;

        let args = validate_args(&record.input_schema, args)?;

        let cacheable = record.pure && record.cache_ttl_seconds > 0 && !opts.bypass_cache;
        let skill_mtime = self.registry.skill_mtime(skill).unwrap_or(0);
        let cache_key = if cacheable {
            let key = ResultCache::cache_key(skill, command, &args);
            if let Some(hit) = self.cache.get(skill, &key, skill_mtime) {
                tracing::debug!(tool = %record.tool_id(), "result cache hit");
                return Ok(hit);
            }
            Some(key)
        } else {
            None
        };

        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let tool_id = record.tool_id();
        let execution = async {
            match handler {
                Handler::InProcess(handler) => handler.execute(args.clone()).await,
                Handler::Isolated { node, script } => {
                    if self.pool.get(&node).is_none() {
                        self.pool.register(&node, script);
                    }
                    self.pool
                        .call_tool(&node, &tool_id, args.clone())
                        .await
                        .map_err(SkillError::from)
                }
            }
        };

        let result = match tokio::time::timeout(timeout, execution).await {
            Ok(result) => result?,
            Err(_) => return Err(SkillError::ExecutionTimeout(timeout)),
        };

        if let Some(key) = cache_key {
            self.cache.put(
                skill,
                key,
                result.clone(),
                Duration::from_secs(record.cache_ttl_seconds),
                skill_mtime,
            );
        }
        Ok(result)
    }
}

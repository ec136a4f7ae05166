//! Runtime assembly: one place constructs and owns every subsystem, and
//! wires registry updates into the router and runner caches.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use omnihive_memory::VectorStore;
use omnihive_registry::{LiveWireIndexer, SkillRegistry};
use omnihive_router::{QueryTranslator, SkillRouter};
use omnihive_runner::SkillRunner;
use omnihive_schema::RuntimeConfig;
use omnihive_swarm::{NodeConfig, SwarmPool};

pub struct Runtime {
    pub store: VectorStore,
    pub registry: Arc<SkillRegistry>,
    pub indexer: Arc<LiveWireIndexer>,
    pub router: Arc<SkillRouter>,
    pub pool: Arc<SwarmPool>,
    pub runner: Arc<SkillRunner>,
}

impl Runtime {
    /// Construct the full stack. `local` skips LLM-backed translation and
    /// intent classification even when credentials are present.
    pub fn assemble(config: &RuntimeConfig, local: bool) -> Result<Self> {
        let store = VectorStore::open(&config.db_path())?;
        let embedder = crate::build_embedder(config, &store);
        let registry = Arc::new(SkillRegistry::new());
        let indexer = Arc::new(LiveWireIndexer::new(
            config.skills_dir.clone(),
            store.clone(),
            Arc::clone(&embedder),
            Arc::clone(&registry),
        ));

        let chat = if local { None } else { crate::build_chat_provider() };
        let translator = match &chat {
            Some((provider, model)) => QueryTranslator::new(
                Some(Arc::clone(provider)),
                config.router.translation_enabled,
                model.clone(),
            ),
            None => QueryTranslator::disabled(),
        };

        let mut router = SkillRouter::new(
            store.clone(),
            Arc::clone(&embedder),
            translator,
            config.router.clone(),
        );
        if let Some((provider, model)) = &chat {
            router = router.with_intent_llm(Arc::clone(provider), model.clone());
        }
        let router = Arc::new(router);

        let pool = Arc::new(SwarmPool::new(NodeConfig {
            connect_timeout: Duration::from_secs(config.swarm.connect_timeout_secs),
            execute_timeout: Duration::from_secs(config.swarm.execute_timeout_secs),
            max_retries: config.swarm.max_retries,
            circuit_cooldown: Duration::from_secs(config.swarm.circuit_cooldown_secs),
        }));
        for (name, script) in &config.swarm.nodes {
            pool.register(name, script);
        }

        let runner = Arc::new(
            SkillRunner::new(Arc::clone(&registry), Arc::clone(&pool))
                .with_default_timeout(Duration::from_secs(config.ooda.tool_timeout_secs)),
        );

        // Index changes bust the router's result cache and the runner's
        // per-skill result caches.
        {
            let router = Arc::clone(&router);
            let runner = Arc::clone(&runner);
            registry.on_update(move |update| {
                router.invalidate_cache();
                runner.invalidate_skills(&update.touched_skills());
            });
        }

        Ok(Self {
            store,
            registry,
            indexer,
            router,
            pool,
            runner,
        })
    }
}

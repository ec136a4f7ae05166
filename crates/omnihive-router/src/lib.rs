//! Hybrid semantic+keyword router from natural-language queries to
//! ranked `skill.command` candidates.

pub mod intent;
pub mod router;
pub mod translate;

pub use intent::{classify, CategoryFilter, IntentResult, SearchIntent};
pub use router::{RouteOptions, SkillRouter};
pub use translate::{is_likely_english, QueryTranslator};

pub mod engine;
pub mod rules;
pub mod window;

pub use engine::RuleEngine;
pub use rules::{KeyExtractor, Predicate, RuleSpec};
pub use window::{Observation, WindowLimits, WindowState};

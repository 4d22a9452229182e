//! Governance Module
//!
//! Policy enforcement over canonical documents:
//! - Declarative rules (required, forbidden, pattern, range, enum, custom)
//! - Rule sets loaded from YAML/JSON
//! - An engine emitting governance events and violations, whose verdict can
//!   veto every downstream stage

pub mod engine;
pub mod rules;

pub use engine::{
    GovernanceContext, GovernanceEngine, GovernanceEvent, GovernanceResult, GovernanceSummary,
    Predicate, Violation,
};
pub use rules::{Rule, RuleKind, RuleSet, Severity};

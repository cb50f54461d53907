//! Flat-rate package (Pauschale) applicability: condition compilation and
//! evaluation, winner selection, and the rationale rendering.

pub mod conditions;
pub mod expression;
pub mod render;
pub mod selector;

pub use conditions::{
    compile_conditions, evaluate_structure, ConditionAtom, ConditionOutcome, StructureIndex,
};
pub use render::{render_condition_results, SiblingDiff};
pub use selector::{
    collect_candidates, determine_applicable_package, EvaluatedCandidate, SelectedPackage,
    Selection,
};

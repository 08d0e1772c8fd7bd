// registry + facade over the algorithms and the shipped envs
pub mod agent;
pub mod evaluator;
pub mod registry;

pub use agent::Agent;
pub use evaluator::{EvaluationSummary, Evaluator};
pub use registry::{ALGORITHMS, AlgorithmKind};

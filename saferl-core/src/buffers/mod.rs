pub mod on_policy_buffer;
pub mod vector_buffer;

pub use on_policy_buffer::{AdvEstimation, EstimationParams, OnPolicyBuffer, discount_cumsum};
pub use vector_buffer::{RolloutData, VectorOnPolicyBuffer};

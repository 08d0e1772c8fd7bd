pub mod actor_critic;
pub mod distributions;
pub mod optimizer;
pub mod tensors;
pub mod thread_safe_sequential;

pub use actor_critic::{ConstraintActorCritic, Critic};

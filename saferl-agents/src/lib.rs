pub mod ppo;

pub use ppo::{PPO, PPOVariant, ppo_early_terminated::PPOEarlyTerminated};

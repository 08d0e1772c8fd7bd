pub mod actor_critic;
pub mod adapter;
pub mod buffers;
pub mod config;
pub mod distributed;
pub mod env;
pub mod error;
pub mod logger;
pub mod on_policy_algorithm;
pub mod rng;
pub mod tensor;
pub mod utils;

pub use error::SafeRlError;
pub use on_policy_algorithm::{Algorithm, TrainingSummary};

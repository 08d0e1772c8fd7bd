use thiserror::Error;

/// Domain errors raised while setting up or running a safe RL experiment.
#[derive(Debug, Error)]
pub enum SafeRlError {
    #[error(
        "the number of steps per epoch ({steps_per_epoch}) is not divisible by the number of environments (world size {world_size} x {vector_env_nums} vectorized envs)"
    )]
    StepsNotDivisible {
        steps_per_epoch: usize,
        world_size: usize,
        vector_env_nums: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown algorithm `{name}`, supported algorithms: {supported}")]
    UnknownAlgorithm { name: String, supported: String },

    #[error("unknown environment `{name}`, supported environments: {supported}")]
    UnknownEnv { name: String, supported: String },

    #[error("invalid distributed setting {var}={value}")]
    InvalidDistributed { var: &'static str, value: String },

    #[error("buffer of env {env_idx} is full (capacity {capacity})")]
    BufferFull { env_idx: usize, capacity: usize },
}

//! Experiment configuration.
//!
//! A configuration is a YAML document made of five groups: the seed, the training
//! setup, the algorithm hyper-parameters, the logger settings and the model
//! architecture. Unknown keys are rejected so that a typo in an override does
//! not silently fall back to a default.
use crate::error::SafeRlError;
use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub seed: u64,
    pub train_cfgs: TrainCfgs,
    pub algo_cfgs: AlgoCfgs,
    pub logger_cfgs: LoggerCfgs,
    pub model_cfgs: ModelCfgs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainCfgs {
    /// `cpu` or `cuda:<ordinal>`.
    pub device: String,
    /// Size of the worker pool used for env stepping and tensor ops.
    pub torch_threads: usize,
    pub vector_env_nums: usize,
    pub parallel: usize,
    pub total_steps: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlgoCfgs {
    pub steps_per_epoch: usize,
    pub update_iters: usize,
    pub batch_size: usize,
    pub target_kl: f32,
    pub entropy_coef: f32,
    pub reward_normalize: bool,
    pub cost_normalize: bool,
    pub obs_normalize: bool,
    pub kl_early_stop: bool,
    pub use_max_grad_norm: bool,
    pub max_grad_norm: f32,
    pub use_critic_norm: bool,
    pub critic_norm_coef: f32,
    pub gamma: f32,
    pub cost_gamma: f32,
    pub lam: f32,
    pub lam_c: f32,
    pub clip: f32,
    pub adv_estimation_method: String,
    pub standardized_rew_adv: bool,
    pub standardized_cost_adv: bool,
    pub penalty_coef: f32,
    pub use_cost: bool,
    /// Accumulated episode cost above which early terminated adapters cut the episode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_limit: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerCfgs {
    pub save_model_freq: usize,
    pub log_dir: String,
    pub window_lens: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelCfgs {
    pub weight_initialization_mode: String,
    pub actor_type: String,
    pub linear_lr_decay: bool,
    pub exploration_noise_anneal: bool,
    pub std_range: [f32; 2],
    pub actor: NetworkCfgs,
    pub critic: NetworkCfgs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkCfgs {
    pub hidden_sizes: Vec<usize>,
    pub activation: String,
    pub lr: f64,
}

/// Merges `overrides` into `base`. Mappings are merged key by key, every other
/// value replaces the one in `base`.
pub fn recursive_update(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Mapping(base), Value::Mapping(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) => recursive_update(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

impl Config {
    /// Constructs [`Config`] from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Constructs [`Config`] from a YAML string with `overrides` merged on top.
    pub fn from_yaml_with_overrides(yaml: &str, overrides: Option<Value>) -> Result<Self> {
        let mut base: Value = serde_yaml::from_str(yaml)?;
        if let Some(overrides) = overrides {
            recursive_update(&mut base, overrides);
        }
        let config: Self = serde_yaml::from_value(base)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns a copy with `overrides` merged on top.
    pub fn updated(&self, overrides: Value) -> Result<Self> {
        let mut base = serde_yaml::to_value(self)?;
        recursive_update(&mut base, overrides);
        let config: Self = serde_yaml::from_value(base)?;
        config.validate()?;
        Ok(config)
    }

    /// Constructs [`Config`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let config: Self = serde_yaml::from_reader(rdr)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves [`Config`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(SafeRlError::InvalidConfig(msg).into()) };
        let algo = &self.algo_cfgs;
        if self.train_cfgs.vector_env_nums == 0 {
            return invalid("train_cfgs.vector_env_nums must be positive".into());
        }
        if algo.steps_per_epoch == 0 || algo.batch_size == 0 || algo.update_iters == 0 {
            return invalid(
                "algo_cfgs.steps_per_epoch, batch_size and update_iters must be positive".into(),
            );
        }
        if !(0. ..=1.).contains(&algo.gamma) || !(0. ..=1.).contains(&algo.cost_gamma) {
            return invalid("discount factors must lie in [0, 1]".into());
        }
        if !(0. ..=1.).contains(&algo.lam) || !(0. ..=1.).contains(&algo.lam_c) {
            return invalid("GAE lambdas must lie in [0, 1]".into());
        }
        if algo.clip <= 0. {
            return invalid(format!("algo_cfgs.clip must be positive, got {}", algo.clip));
        }
        if let Some(cost_limit) = algo.cost_limit {
            if cost_limit < 0. {
                return invalid(format!("algo_cfgs.cost_limit must be >= 0, got {cost_limit}"));
            }
        }
        let [std_start, std_end] = self.model_cfgs.std_range;
        if std_start <= 0. || std_end <= 0. {
            return invalid("model_cfgs.std_range must be positive".into());
        }
        if self.logger_cfgs.window_lens == 0 {
            return invalid("logger_cfgs.window_lens must be positive".into());
        }
        Ok(())
    }

    pub fn device(&self) -> Result<Device> {
        parse_device(&self.train_cfgs.device)
    }

    /// Number of epochs the run lasts.
    pub fn epochs(&self) -> usize {
        self.train_cfgs.total_steps / self.algo_cfgs.steps_per_epoch
    }
}

pub fn parse_device(device: &str) -> Result<Device> {
    match device.trim() {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => {
                let ordinal = ordinal.parse::<usize>().map_err(|_| {
                    SafeRlError::InvalidConfig(format!("invalid device `{device}`"))
                })?;
                Ok(Device::new_cuda(ordinal)?)
            }
            None => Err(SafeRlError::InvalidConfig(format!("invalid device `{device}`")).into()),
        },
    }
}

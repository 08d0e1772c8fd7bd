use crate::{config::Config, env::EnvironmentDescription, logger::EpochLogger, tensor::RawTensor};
use anyhow::Result;
use std::path::Path;

#[macro_export]
macro_rules! process_hook_result {
    ($hook_res:expr) => {
        match $hook_res? {
            $crate::on_policy_algorithm::HookResult::Continue => {}
            $crate::on_policy_algorithm::HookResult::Break => break,
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    Continue,
    Break,
}

/// Where a run stands once it stops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSummary {
    /// Number of finished epochs.
    pub epochs: usize,
    /// Windowed means of the episode metrics at the last epoch.
    pub ep_ret: f32,
    pub ep_cost: f32,
    pub ep_len: f32,
}

pub trait Algorithm {
    /// Runs the whole training loop.
    fn learn(&mut self) -> Result<TrainingSummary>;

    /// Env action for a single raw observation, observation normalization included.
    fn act(&self, observation: &RawTensor, deterministic: bool) -> Result<RawTensor>;

    fn env_description(&self) -> &EnvironmentDescription;

    /// Restores the model and the observation statistics of a checkpoint directory.
    fn load_checkpoint(&mut self, dir: &Path) -> Result<()>;
}

/// Callbacks around the epochs of an on-policy run. A hook returning [`HookResult::Break`]
/// ends the run after the current phase.
pub trait TrainingHooks {
    fn init_hook(&mut self, _cfgs: &Config) -> Result<HookResult> {
        Ok(HookResult::Continue)
    }

    fn post_rollout_hook(&mut self, _epoch: usize, _logger: &EpochLogger) -> Result<HookResult> {
        Ok(HookResult::Continue)
    }

    fn post_training_hook(&mut self, _epoch: usize, _logger: &EpochLogger) -> Result<HookResult> {
        Ok(HookResult::Continue)
    }

    fn shutdown_hook(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct DefaultTrainingHooks;

impl TrainingHooks for DefaultTrainingHooks {}

//! Early termination for safe exploration.
//!
//! Episodes are cut as soon as their accumulated cost exceeds the cost limit. The step that
//! crosses the limit earns no reward and counts as a termination, so the agent learns that
//! violating the constraint ends the episode without further return.
use super::{AdapterHooks, OnPolicyAdapter, StepVerdict};
use crate::{
    config::Config,
    env::{EnvBuilderTrait, SnapShot},
    error::SafeRlError,
};
use anyhow::Result;

/// Per-env cost accounting of the early terminated adapter.
#[derive(Debug, Clone)]
pub struct EarlyTermination {
    cost_limit: f32,
    cost_logger: Vec<f32>,
}

impl EarlyTermination {
    pub fn new(cost_limit: f32, num_envs: usize) -> Self {
        Self {
            cost_limit,
            cost_logger: vec![0.; num_envs],
        }
    }

    pub fn cost_limit(&self) -> f32 {
        self.cost_limit
    }

    /// Cost accumulated by env `env_idx` in its current episode.
    pub fn accumulated_cost(&self, env_idx: usize) -> f32 {
        self.cost_logger[env_idx]
    }
}

impl AdapterHooks for EarlyTermination {
    fn init_env<EB: EnvBuilderTrait>(
        env_builder: &EB,
        num_envs: usize,
        seed: u64,
        cfgs: &Config,
    ) -> Result<OnPolicyAdapter<EB::Env, Self>> {
        EarlyTerminatedAdapter::new(env_builder, num_envs, seed, cfgs)
    }

    fn step_hook(&mut self, env_idx: usize, snapshot: &SnapShot) -> Result<StepVerdict> {
        self.cost_logger[env_idx] += snapshot.cost;
        if self.cost_logger[env_idx] > self.cost_limit {
            return Ok(StepVerdict::TerminateWithoutReward);
        }
        Ok(StepVerdict::Keep)
    }

    fn reset_hook(&mut self, env_idx: usize) {
        self.cost_logger[env_idx] = 0.;
    }
}

/// On-policy adapter that terminates episodes once they exceed `algo_cfgs.cost_limit`.
pub type EarlyTerminatedAdapter<E> = OnPolicyAdapter<E, EarlyTermination>;

impl<E: crate::env::Env> EarlyTerminatedAdapter<E> {
    /// Builds `num_envs` environments, `algo_cfgs.cost_limit` has to be set.
    pub fn new<EB: EnvBuilderTrait<Env = E>>(
        env_builder: &EB,
        num_envs: usize,
        seed: u64,
        cfgs: &Config,
    ) -> Result<Self> {
        let cost_limit = cfgs.algo_cfgs.cost_limit.ok_or_else(|| {
            SafeRlError::InvalidConfig(
                "early terminated adapters need algo_cfgs.cost_limit".to_owned(),
            )
        })?;
        log::info!("episodes are terminated once their cost exceeds {cost_limit}");
        let hooks = EarlyTermination::new(cost_limit, num_envs);
        Self::with_hooks(env_builder, num_envs, seed, cfgs, hooks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::tests::{CountingEnv, PositionValueAgent, UNDISCOUNTED, test_config},
        buffers::VectorOnPolicyBuffer,
        logger::EpochLogger,
    };
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn terminates_once_cost_exceeds_limit() -> Result<()> {
        let cfgs = test_config("algo_cfgs:\n  obs_normalize: false\n  cost_limit: 2.5\n")?;
        let builder = || -> Result<CountingEnv> { Ok(CountingEnv::new(100, 1.)) };
        let mut adapter = EarlyTerminatedAdapter::new(&builder, 2, 0, &cfgs)?;
        adapter.reset()?;
        let actions = Tensor::zeros((2, 1), DType::F32, &Device::Cpu)?;
        for _ in 0..2 {
            let snapshot = adapter.step(&actions)?;
            assert_eq!(snapshot.terminated, vec![false, false]);
            assert_eq!(snapshot.original_rewards, vec![1., 1.]);
        }
        assert_eq!(adapter.hooks().accumulated_cost(0), 2.);

        let snapshot = adapter.step(&actions)?;
        assert_eq!(snapshot.terminated, vec![true, true]);
        assert_eq!(snapshot.original_rewards, vec![0., 0.]);
        // cost is reported untouched, the env was reset and the accumulator cleared
        assert_eq!(snapshot.original_costs, vec![1., 1.]);
        assert_eq!(snapshot.next_obs.to_vec2::<f32>()?, vec![vec![0.], vec![0.]]);
        assert_eq!(adapter.hooks().accumulated_cost(1), 0.);

        let snapshot = adapter.step(&actions)?;
        assert_eq!(snapshot.terminated, vec![false, false]);
        Ok(())
    }

    #[test]
    fn forfeited_reward_stays_zero_under_reward_normalization() -> Result<()> {
        let cfgs = test_config(
            "algo_cfgs:\n  obs_normalize: false\n  reward_normalize: true\n  cost_limit: 2.5\n",
        )?;
        let builder = || -> Result<CountingEnv> { Ok(CountingEnv::new(100, 1.)) };
        let mut adapter = EarlyTerminatedAdapter::new(&builder, 2, 0, &cfgs)?;
        adapter.reset()?;
        let actions = Tensor::zeros((2, 1), DType::F32, &Device::Cpu)?;
        adapter.step(&actions)?;
        adapter.step(&actions)?;
        let snapshot = adapter.step(&actions)?;
        assert_eq!(snapshot.terminated, vec![true, true]);
        assert_eq!(snapshot.original_rewards, vec![0., 0.]);
        assert_eq!(snapshot.rewards, vec![0., 0.]);
        // the statistics only ever saw the reward of 1 the env paid
        let normalizer = adapter
            .reward_normalizer
            .as_ref()
            .expect("reward normalization is enabled");
        assert_eq!(normalizer.count, 6.);
        assert_eq!(normalizer.mean.flatten_all()?.to_vec1::<f32>()?, vec![1.]);
        Ok(())
    }

    #[test]
    fn terminated_path_bootstraps_with_zero() -> Result<()> {
        let overrides = format!("{UNDISCOUNTED}  cost_limit: 1.5\n");
        let cfgs = test_config(&overrides)?;
        let builder = || -> Result<CountingEnv> { Ok(CountingEnv::new(100, 1.)) };
        let mut adapter = EarlyTerminatedAdapter::new(&builder, 1, 0, &cfgs)?;
        let mut buffer = VectorOnPolicyBuffer::from_config(&cfgs, 3, 1, 1, Device::Cpu)?;
        let mut logger = EpochLogger::in_memory();
        adapter.rollout(3, &PositionValueAgent, &mut buffer, &mut logger)?;
        // the second step crosses the limit: no reward and nothing to bootstrap from the
        // position 2 it reached, the third step is cut by the epoch end at position 1
        let targets: Vec<f32> = buffer.get()?.target_value_r.to_vec1()?;
        assert_eq!(targets, vec![1., 0., 2.]);
        let ep_ret = logger.get_stats("Metrics/EpRet").expect("one finished episode");
        assert_eq!(ep_ret.mean, 1.);
        Ok(())
    }

    #[test]
    fn cost_equal_to_limit_keeps_running() -> Result<()> {
        let cfgs = test_config("algo_cfgs:\n  cost_limit: 2.0\n")?;
        let builder = || -> Result<CountingEnv> { Ok(CountingEnv::new(100, 1.)) };
        let mut adapter = EarlyTerminatedAdapter::new(&builder, 1, 0, &cfgs)?;
        adapter.reset()?;
        let actions = Tensor::zeros((1, 1), DType::F32, &Device::Cpu)?;
        adapter.step(&actions)?;
        let snapshot = adapter.step(&actions)?;
        assert_eq!(snapshot.terminated, vec![false]);
        Ok(())
    }

    #[test]
    fn natural_episode_end_clears_accumulated_cost() -> Result<()> {
        let cfgs = test_config("algo_cfgs:\n  cost_limit: 10.0\n")?;
        let builder = || -> Result<CountingEnv> { Ok(CountingEnv::new(2, 1.)) };
        let mut adapter = EarlyTerminatedAdapter::new(&builder, 1, 0, &cfgs)?;
        adapter.reset()?;
        let actions = Tensor::zeros((1, 1), DType::F32, &Device::Cpu)?;
        adapter.step(&actions)?;
        let snapshot = adapter.step(&actions)?;
        assert_eq!(snapshot.truncated, vec![true]);
        assert_eq!(adapter.hooks().accumulated_cost(0), 0.);
        Ok(())
    }

    #[test]
    fn requires_cost_limit() -> Result<()> {
        let mut cfgs = test_config("seed: 1\n")?;
        cfgs.algo_cfgs.cost_limit = None;
        let builder = || -> Result<CountingEnv> { Ok(CountingEnv::new(2, 1.)) };
        let err = EarlyTerminatedAdapter::new(&builder, 1, 0, &cfgs)
            .err()
            .expect("missing cost limit");
        assert!(matches!(
            err.downcast_ref::<SafeRlError>(),
            Some(SafeRlError::InvalidConfig(_))
        ));
        Ok(())
    }
}

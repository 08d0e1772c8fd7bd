//! PPO trained on episodes that are cut once they exceed the cost limit.
use super::{PPO, PPOVariant};
use saferl_core::adapter::early_terminated::EarlyTermination;

impl PPOVariant for EarlyTermination {
    const NAME: &'static str = "PPOEarlyTerminated";
}

/// PPO collecting its data through an
/// [`EarlyTerminatedAdapter`](saferl_core::adapter::early_terminated::EarlyTerminatedAdapter).
/// The policy update is plain PPO on the reward advantage, the constraint only acts through
/// the shortened episodes.
pub type PPOEarlyTerminated<E> = PPO<E, EarlyTermination>;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result;
    use saferl_core::{
        Algorithm, SafeRlError,
        config::Config,
        env::{Env, EnvironmentDescription, SnapShot, Space},
        tensor::RawTensor,
    };

    pub const CONFIG: &str = r#"
seed: 0
train_cfgs:
  device: cpu
  torch_threads: 1
  vector_env_nums: 2
  parallel: 1
  total_steps: 128
algo_cfgs:
  steps_per_epoch: 64
  update_iters: 2
  batch_size: 32
  target_kl: 0.02
  entropy_coef: 0.0
  reward_normalize: false
  cost_normalize: false
  obs_normalize: true
  kl_early_stop: true
  use_max_grad_norm: true
  max_grad_norm: 40.0
  use_critic_norm: true
  critic_norm_coef: 0.001
  gamma: 0.99
  cost_gamma: 0.99
  lam: 0.95
  lam_c: 0.95
  clip: 0.2
  adv_estimation_method: gae
  standardized_rew_adv: true
  standardized_cost_adv: true
  penalty_coef: 0.0
  use_cost: true
  cost_limit: 5.0
logger_cfgs:
  save_model_freq: 1
  log_dir: ""
  window_lens: 10
model_cfgs:
  weight_initialization_mode: kaiming_uniform
  actor_type: gaussian_learning
  linear_lr_decay: true
  exploration_noise_anneal: false
  std_range: [0.5, 0.1]
  actor:
    hidden_sizes: [8]
    activation: tanh
    lr: 0.0003
  critic:
    hidden_sizes: [8]
    activation: tanh
    lr: 0.001
"#;

    /// Pays one reward and one cost per step, episodes truncate after 20 steps.
    pub struct CostlyWalk {
        steps: usize,
    }

    impl Env for CostlyWalk {
        fn reset(&mut self, _seed: u64) -> Result<RawTensor> {
            self.steps = 0;
            Ok(RawTensor::from_vec(vec![0.]))
        }

        fn step(&mut self, _action: &RawTensor) -> Result<SnapShot> {
            self.steps += 1;
            Ok(SnapShot {
                state: RawTensor::from_vec(vec![self.steps as f32]),
                reward: 1.,
                cost: 1.,
                terminated: false,
                truncated: self.steps >= 20,
            })
        }

        fn env_description(&self) -> EnvironmentDescription {
            EnvironmentDescription::new(
                Space::continous_from_dims(vec![1]),
                Space::bounded(vec![-1.], vec![1.]),
            )
        }
    }

    pub fn costly_walk() -> Result<CostlyWalk> {
        Ok(CostlyWalk { steps: 0 })
    }

    fn config(overrides: &str) -> Result<Config> {
        Config::from_yaml_with_overrides(CONFIG, Some(serde_yaml::from_str(overrides)?))
    }

    #[test]
    fn splits_steps_between_envs() -> Result<()> {
        let agent = PPOEarlyTerminated::new("CostlyWalk", &costly_walk, config("seed: 3")?)?;
        assert_eq!(agent.steps_per_epoch(), 32);
        assert_eq!(agent.adapter().num_envs(), 2);
        assert_eq!(agent.adapter().hooks().cost_limit(), 5.);
        Ok(())
    }

    #[test]
    fn rejects_uneven_step_budget() -> Result<()> {
        let cfgs = config("algo_cfgs:\n  steps_per_epoch: 63\ntrain_cfgs:\n  total_steps: 126\n")?;
        let err = PPOEarlyTerminated::new("CostlyWalk", &costly_walk, cfgs)
            .err()
            .expect("63 steps cannot be split between 2 envs");
        assert!(matches!(
            err.downcast_ref::<SafeRlError>(),
            Some(SafeRlError::StepsNotDivisible {
                steps_per_epoch: 63,
                world_size: 1,
                vector_env_nums: 2,
            })
        ));
        Ok(())
    }

    #[test]
    fn requires_cost_limit() -> Result<()> {
        let mut cfgs = config("seed: 1")?;
        cfgs.algo_cfgs.cost_limit = None;
        assert!(PPOEarlyTerminated::new("CostlyWalk", &costly_walk, cfgs).is_err());
        Ok(())
    }

    #[test]
    fn episodes_stop_at_the_cost_limit() -> Result<()> {
        let mut agent = PPOEarlyTerminated::new("CostlyWalk", &costly_walk, config("seed: 0")?)?;
        let summary = agent.learn()?;
        assert_eq!(summary.epochs, 2);
        // the sixth unit of cost exceeds the limit of 5 and ends the episode
        assert_eq!(summary.ep_len, 6.);
        assert_eq!(summary.ep_cost, 6.);
        assert_eq!(summary.ep_ret, 5.);
        assert!(agent.logger().last_value("Train/KL").is_some());
        assert!(agent.logger().last_value("Loss/Loss_cost_critic").is_some());
        Ok(())
    }
}

use crate::{
    distributions::{
        Actor, ActorKind, categorical_distribution::CategoricalActor,
        diagonal_distribution::GaussianLearningActor,
    },
    optimizer::OptimizerWithMaxGrad,
    tensors::ValuesPred,
    thread_safe_sequential::{Activation, ThreadSafeSequential, WeightInit, build_sequential},
};
use anyhow::{Result, bail};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use saferl_core::{
    actor_critic::{ActorCritic, StepOutput},
    config::{Config, NetworkCfgs},
    env::{EnvironmentDescription, Space},
};
use std::path::Path;

/// Linear interpolation from `start` to `end` over `total_iters` steps.
#[derive(Debug, Clone, Copy)]
pub struct LinearSchedule {
    pub start: f32,
    pub end: f32,
    pub total_iters: usize,
}

impl LinearSchedule {
    pub fn value(&self, iter: usize) -> f32 {
        let progress = if self.total_iters == 0 {
            1.
        } else {
            (iter as f32 / self.total_iters as f32).min(1.)
        };
        self.start + (self.end - self.start) * progress
    }
}

/// Value network with its own optimizer.
#[derive(Debug)]
pub struct Critic {
    net: ThreadSafeSequential,
    optimizer: OptimizerWithMaxGrad,
    device: Device,
}

impl Critic {
    pub fn build(
        obs_dim: usize,
        cfgs: &NetworkCfgs,
        init: WeightInit,
        max_grad_norm: Option<f32>,
        device: &Device,
        prefix: &str,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let activation: Activation = cfgs.activation.parse()?;
        let hidden_sizes = &cfgs.hidden_sizes;
        let net = build_sequential(obs_dim, hidden_sizes, 1, activation, init, &vb, prefix)?;
        let optimizer = OptimizerWithMaxGrad::adam(varmap, cfgs.lr, max_grad_norm)?;
        Ok(Self {
            net,
            optimizer,
            device: device.clone(),
        })
    }

    /// `[batch]` value estimates.
    pub fn values(&self, observations: &Tensor) -> Result<ValuesPred> {
        Ok(ValuesPred(self.net.forward(observations)?.squeeze(1)?))
    }

    /// Sum of the squared parameters, the critic norm penalty.
    pub fn squared_norm(&self) -> Result<Tensor> {
        let mut total = Tensor::zeros((), DType::F32, &self.device)?;
        for var in self.optimizer.varmap.all_vars() {
            total = (total + var.as_tensor().sqr()?.sum_all()?)?;
        }
        Ok(total)
    }

    pub fn optimizer(&mut self) -> &mut OptimizerWithMaxGrad {
        &mut self.optimizer
    }

    pub fn varmap(&self) -> &VarMap {
        &self.optimizer.varmap
    }
}

/// Actor with a reward critic and, for cost aware algorithms, a cost critic.
#[derive(Debug)]
pub struct ConstraintActorCritic {
    actor: ActorKind,
    actor_optimizer: OptimizerWithMaxGrad,
    reward_critic: Critic,
    cost_critic: Option<Critic>,
    initial_actor_lr: f64,
    epochs: usize,
    linear_lr_decay: bool,
    std_schedule: Option<LinearSchedule>,
    device: Device,
}

impl ConstraintActorCritic {
    pub fn build(
        env_description: &EnvironmentDescription,
        cfgs: &Config,
        epochs: usize,
        device: &Device,
    ) -> Result<Self> {
        let model = &cfgs.model_cfgs;
        let algo = &cfgs.algo_cfgs;
        let init: WeightInit = model.weight_initialization_mode.parse()?;
        let obs_dim = env_description.observation_size();
        let act_dim = env_description.action_size();
        let max_grad_norm = algo.use_max_grad_norm.then_some(algo.max_grad_norm);

        let actor_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&actor_varmap, DType::F32, device);
        let activation: Activation = model.actor.activation.parse()?;
        let hidden_sizes = &model.actor.hidden_sizes;
        let actor = match (model.actor_type.as_str(), &env_description.action_space) {
            ("gaussian_learning", Space::Continous { .. }) => {
                ActorKind::Gaussian(GaussianLearningActor::build(
                    obs_dim,
                    act_dim,
                    hidden_sizes,
                    activation,
                    init,
                    &actor_varmap,
                    &vb,
                    "actor",
                )?)
            }
            ("categorical", Space::Discrete(action_size)) => {
                ActorKind::Categorical(CategoricalActor::build(
                    obs_dim,
                    *action_size,
                    hidden_sizes,
                    activation,
                    init,
                    &vb,
                    "actor",
                )?)
            }
            (actor_type, action_space) => bail!(
                "actor_type `{actor_type}` does not fit the action space {action_space:?}"
            ),
        };
        let actor_optimizer =
            OptimizerWithMaxGrad::adam(actor_varmap, model.actor.lr, max_grad_norm)?;
        let reward_critic =
            Critic::build(obs_dim, &model.critic, init, max_grad_norm, device, "reward_critic")?;
        let cost_critic = if algo.use_cost {
            Some(Critic::build(
                obs_dim,
                &model.critic,
                init,
                max_grad_norm,
                device,
                "cost_critic",
            )?)
        } else {
            None
        };
        let std_schedule = model.exploration_noise_anneal.then_some(LinearSchedule {
            start: model.std_range[0],
            end: model.std_range[1],
            total_iters: epochs,
        });
        if let Some(schedule) = std_schedule {
            actor.set_std(schedule.value(0))?;
        }
        Ok(Self {
            actor,
            actor_optimizer,
            reward_critic,
            cost_critic,
            initial_actor_lr: model.actor.lr,
            epochs,
            linear_lr_decay: model.linear_lr_decay,
            std_schedule,
            device: device.clone(),
        })
    }

    pub fn actor(&self) -> &ActorKind {
        &self.actor
    }

    pub fn actor_optimizer(&mut self) -> &mut OptimizerWithMaxGrad {
        &mut self.actor_optimizer
    }

    pub fn reward_critic(&self) -> &Critic {
        &self.reward_critic
    }

    pub fn reward_critic_mut(&mut self) -> &mut Critic {
        &mut self.reward_critic
    }

    pub fn cost_critic(&self) -> Option<&Critic> {
        self.cost_critic.as_ref()
    }

    pub fn cost_critic_mut(&mut self) -> Option<&mut Critic> {
        self.cost_critic.as_mut()
    }

    pub fn actor_learning_rate(&self) -> f64 {
        self.actor_optimizer.learning_rate()
    }

    /// Epoch bookkeeping: anneals the exploration std and decays the actor learning rate
    /// linearly to zero at the last epoch.
    pub fn end_epoch(&mut self, epoch: usize) -> Result<()> {
        if let Some(schedule) = self.std_schedule {
            self.actor.set_std(schedule.value(epoch + 1))?;
        }
        if self.linear_lr_decay && self.epochs > 0 {
            let factor = 1. - ((epoch + 1) as f64 / self.epochs as f64).min(1.);
            self.actor_optimizer
                .set_learning_rate(self.initial_actor_lr * factor);
        }
        log::debug!(
            "after epoch {epoch}: actor lr {}, policy std {:?}",
            self.actor_learning_rate(),
            self.actor.std()?
        );
        Ok(())
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.actor_optimizer.varmap.save(dir.join("actor.safetensors"))?;
        self.reward_critic
            .varmap()
            .save(dir.join("reward_critic.safetensors"))?;
        if let Some(cost_critic) = self.cost_critic.as_ref() {
            cost_critic
                .varmap()
                .save(dir.join("cost_critic.safetensors"))?;
        }
        Ok(())
    }

    /// Loads the weights written by [`Self::save`] into this model.
    pub fn load(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        self.actor_optimizer
            .varmap
            .load(dir.join("actor.safetensors"))?;
        self.reward_critic
            .optimizer
            .varmap
            .load(dir.join("reward_critic.safetensors"))?;
        if let Some(cost_critic) = self.cost_critic.as_mut() {
            cost_critic
                .optimizer
                .varmap
                .load(dir.join("cost_critic.safetensors"))?;
        }
        Ok(())
    }
}

impl ActorCritic for ConstraintActorCritic {
    fn step(&self, observations: &Tensor, deterministic: bool) -> Result<StepOutput> {
        let (action, logp) = self.actor.sample(observations, deterministic)?;
        let (value_r, value_c) = self.values(observations)?;
        Ok(StepOutput {
            action,
            value_r,
            value_c,
            logp,
        })
    }

    fn values(&self, observations: &Tensor) -> Result<(Tensor, Tensor)> {
        let value_r = self.reward_critic.values(observations)?.0.detach();
        let value_c = match self.cost_critic.as_ref() {
            Some(critic) => critic.values(observations)?.0.detach(),
            None => Tensor::zeros(value_r.dims(), DType::F32, &self.device)?,
        };
        Ok((value_r, value_c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saferl_core::env::Space;
    use tempdir::TempDir;

    const CONFIG: &str = r#"
seed: 0
train_cfgs:
  device: cpu
  torch_threads: 1
  vector_env_nums: 2
  parallel: 1
  total_steps: 400
algo_cfgs:
  steps_per_epoch: 100
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
  cost_limit: 25.0
logger_cfgs:
  save_model_freq: 100
  log_dir: ./runs
  window_lens: 100
model_cfgs:
  weight_initialization_mode: kaiming_uniform
  actor_type: gaussian_learning
  linear_lr_decay: true
  exploration_noise_anneal: true
  std_range: [0.5, 0.1]
  actor:
    hidden_sizes: [16, 16]
    activation: tanh
    lr: 0.001
  critic:
    hidden_sizes: [16, 16]
    activation: tanh
    lr: 0.001
"#;

    fn description() -> EnvironmentDescription {
        EnvironmentDescription::new(
            Space::continous_from_dims(vec![4]),
            Space::bounded(vec![-1., -1.], vec![1., 1.]),
        )
    }

    #[test]
    fn steps_with_both_critics() -> Result<()> {
        let cfgs = Config::from_yaml_str(CONFIG)?;
        let model = ConstraintActorCritic::build(&description(), &cfgs, 4, &Device::Cpu)?;
        let obs = Tensor::zeros((3, 4), DType::F32, &Device::Cpu)?;
        let out = model.step(&obs, false)?;
        assert_eq!(out.action.dims(), &[3, 2]);
        assert_eq!(out.value_r.dims(), &[3]);
        assert_eq!(out.value_c.dims(), &[3]);
        assert_eq!(out.logp.dims(), &[3]);
        assert!(model.cost_critic().is_some());
        Ok(())
    }

    #[test]
    fn schedules_follow_epochs() -> Result<()> {
        let cfgs = Config::from_yaml_str(CONFIG)?;
        let mut model = ConstraintActorCritic::build(&description(), &cfgs, 4, &Device::Cpu)?;
        assert!((model.actor().std()?.unwrap_or_default() - 0.5).abs() < 1e-6);
        model.end_epoch(1)?;
        assert!((model.actor().std()?.unwrap_or_default() - 0.3).abs() < 1e-5);
        assert!((model.actor_learning_rate() - 0.0005).abs() < 1e-9);
        model.end_epoch(3)?;
        assert!((model.actor().std()?.unwrap_or_default() - 0.1).abs() < 1e-5);
        assert_eq!(model.actor_learning_rate(), 0.);
        Ok(())
    }

    #[test]
    fn rejects_mismatched_actor() -> Result<()> {
        let cfgs = Config::from_yaml_str(CONFIG)?;
        let discrete = EnvironmentDescription::new(
            Space::continous_from_dims(vec![4]),
            Space::Discrete(2),
        );
        assert!(ConstraintActorCritic::build(&discrete, &cfgs, 4, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn checkpoints_round_trip() -> Result<()> {
        let cfgs = Config::from_yaml_str(CONFIG)?;
        let model = ConstraintActorCritic::build(&description(), &cfgs, 4, &Device::Cpu)?;
        let dir = TempDir::new("checkpoint")?;
        model.save(dir.path())?;
        let mut restored = ConstraintActorCritic::build(&description(), &cfgs, 4, &Device::Cpu)?;
        restored.load(dir.path())?;
        let obs = Tensor::ones((2, 4), DType::F32, &Device::Cpu)?;
        let (expected, _) = model.values(&obs)?;
        let (actual, _) = restored.values(&obs)?;
        assert_eq!(expected.to_vec1::<f32>()?, actual.to_vec1::<f32>()?);
        let det = model.step(&obs, true)?.action.to_vec2::<f32>()?;
        let restored_det = restored.step(&obs, true)?.action.to_vec2::<f32>()?;
        assert_eq!(det, restored_det);
        Ok(())
    }
}

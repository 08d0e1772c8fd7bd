//! Adapters sit between vectorized environments and the learning algorithm.
//!
//! An adapter owns the environments, resets them when episodes end, normalizes what they
//! report and drives the on-policy collection loop. Algorithm specific behaviour is injected
//! through [`AdapterHooks`], see [`early_terminated`] for the safe RL variant.
pub mod early_terminated;

use crate::{
    actor_critic::ActorCritic,
    buffers::VectorOnPolicyBuffer,
    config::Config,
    env::{Env, EnvBuilderTrait, EnvironmentDescription, SnapShot, Space},
    logger::EpochLogger,
    tensor::{RawTensor, stack_raw},
    utils::running_mean::RunningMeanStd,
};
use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use std::{collections::HashMap, path::Path};

/// Normalized values are clipped to this magnitude.
const NORMALIZER_CLIP: f32 = 1e6;

pub trait AdapterHooks: Send + Sized {
    /// Builds the adapter the algorithm collects its data with.
    fn init_env<EB: EnvBuilderTrait>(
        env_builder: &EB,
        num_envs: usize,
        seed: u64,
        cfgs: &Config,
    ) -> Result<OnPolicyAdapter<EB::Env, Self>>;

    /// Sees the raw outcome of a step of env `env_idx` before it is normalized and before the
    /// env is reset.
    fn step_hook(&mut self, _env_idx: usize, _snapshot: &SnapShot) -> Result<StepVerdict> {
        Ok(StepVerdict::Keep)
    }

    /// Called whenever env `env_idx` is reset.
    fn reset_hook(&mut self, _env_idx: usize) {}
}

/// What the adapter makes of a step after its hook saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepVerdict {
    #[default]
    Keep,
    /// Ends the episode as terminated. The step is stored with a reward of 0, the reward
    /// normalizer still sees the reward the env paid.
    TerminateWithoutReward,
}

/// Plain on-policy adapter without extra step semantics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl AdapterHooks for NoHooks {
    fn init_env<EB: EnvBuilderTrait>(
        env_builder: &EB,
        num_envs: usize,
        seed: u64,
        cfgs: &Config,
    ) -> Result<OnPolicyAdapter<EB::Env, Self>> {
        OnPolicyAdapter::with_hooks(env_builder, num_envs, seed, cfgs, NoHooks)
    }
}

/// Outcome of one vectorized step, one entry per env.
#[derive(Debug, Clone)]
pub struct VecSnapShot {
    /// `[num_envs, obs_dim]`, already reset for envs that finished their episode.
    pub next_obs: Tensor,
    pub rewards: Vec<f32>,
    pub costs: Vec<f32>,
    pub original_rewards: Vec<f32>,
    pub original_costs: Vec<f32>,
    pub terminated: Vec<bool>,
    pub truncated: Vec<bool>,
    /// `[1, obs_dim]` last observation of the finished episodes.
    pub final_observations: Vec<Option<Tensor>>,
}

pub struct OnPolicyAdapter<E: Env, H: AdapterHooks = NoHooks> {
    envs: Vec<E>,
    hooks: H,
    env_description: EnvironmentDescription,
    seed: u64,
    rng: StdRng,
    first_reset: bool,
    device: Device,
    obs_normalizer: Option<RunningMeanStd>,
    reward_normalizer: Option<RunningMeanStd>,
    cost_normalizer: Option<RunningMeanStd>,
    use_cost: bool,
    ep_ret: Vec<f32>,
    ep_cost: Vec<f32>,
    ep_len: Vec<usize>,
}

impl<E: Env> OnPolicyAdapter<E, NoHooks> {
    pub fn new<EB: EnvBuilderTrait<Env = E>>(
        env_builder: &EB,
        num_envs: usize,
        seed: u64,
        cfgs: &Config,
    ) -> Result<Self> {
        Self::with_hooks(env_builder, num_envs, seed, cfgs, NoHooks)
    }
}

impl<E: Env, H: AdapterHooks> OnPolicyAdapter<E, H> {
    pub fn with_hooks<EB: EnvBuilderTrait<Env = E>>(
        env_builder: &EB,
        num_envs: usize,
        seed: u64,
        cfgs: &Config,
        hooks: H,
    ) -> Result<Self> {
        let envs = (0..num_envs)
            .map(|_| env_builder.build_env())
            .collect::<Result<Vec<_>>>()?;
        let env_description = envs
            .first()
            .map(Env::env_description)
            .ok_or_else(|| anyhow::anyhow!("an adapter needs at least one environment"))?;
        let device = cfgs.device()?;
        let algo = &cfgs.algo_cfgs;
        let obs_normalizer = if algo.obs_normalize {
            Some(RunningMeanStd::new(
                env_description.observation_size(),
                device.clone(),
            )?)
        } else {
            None
        };
        let reward_normalizer = if algo.reward_normalize {
            Some(RunningMeanStd::new(1, device.clone())?)
        } else {
            None
        };
        let cost_normalizer = if algo.cost_normalize {
            Some(RunningMeanStd::new(1, device.clone())?)
        } else {
            None
        };
        log::debug!(
            "adapter with {num_envs} envs, observation size {}, action space {:?}",
            env_description.observation_size(),
            env_description.action_space
        );
        Ok(Self {
            envs,
            hooks,
            env_description,
            seed,
            rng: StdRng::seed_from_u64(seed),
            first_reset: true,
            device,
            obs_normalizer,
            reward_normalizer,
            cost_normalizer,
            use_cost: algo.use_cost,
            ep_ret: vec![0.; num_envs],
            ep_cost: vec![0.; num_envs],
            ep_len: vec![0; num_envs],
        })
    }

    pub fn num_envs(&self) -> usize {
        self.envs.len()
    }

    pub fn env_description(&self) -> &EnvironmentDescription {
        &self.env_description
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn next_seed(&mut self, env_idx: usize) -> u64 {
        if self.first_reset {
            self.seed.wrapping_add(env_idx as u64)
        } else {
            self.rng.random()
        }
    }

    fn reset_env(&mut self, env_idx: usize) -> Result<RawTensor> {
        let seed = self.next_seed(env_idx);
        self.hooks.reset_hook(env_idx);
        self.envs[env_idx].reset(seed)
    }

    /// Resets every env and returns the stacked, normalized first observations.
    pub fn reset(&mut self) -> Result<Tensor> {
        let states = (0..self.num_envs())
            .map(|env_idx| self.reset_env(env_idx))
            .collect::<Result<Vec<_>>>()?;
        self.first_reset = false;
        let obs = stack_raw(&states, &self.device)?;
        self.process_observations(&obs, true)
    }

    fn process_observations(&mut self, obs: &Tensor, update: bool) -> Result<Tensor> {
        match self.obs_normalizer.as_mut() {
            Some(normalizer) => {
                if update {
                    normalizer.update(obs)?;
                }
                Ok(normalizer.normalize(obs, NORMALIZER_CLIP)?)
            }
            None => Ok(obs.clone()),
        }
    }

    /// Normalizes `[batch, obs_dim]` observations with the current statistics, without
    /// updating them.
    pub fn normalize_observation(&self, obs: &Tensor) -> Result<Tensor> {
        match self.obs_normalizer.as_ref() {
            Some(normalizer) => Ok(normalizer.normalize(obs, NORMALIZER_CLIP)?),
            None => Ok(obs.clone()),
        }
    }

    fn process_scalars(
        normalizer: Option<&mut RunningMeanStd>,
        values: &[f32],
        device: &Device,
    ) -> Result<Vec<f32>> {
        match normalizer {
            Some(normalizer) => {
                let t = Tensor::from_slice(values, (values.len(), 1), device)?;
                normalizer.update(&t)?;
                let normalized = normalizer.normalize(&t, NORMALIZER_CLIP)?;
                Ok(normalized.flatten_all()?.to_vec1()?)
            }
            None => Ok(values.to_vec()),
        }
    }

    /// Writes the observation statistics next to a checkpoint, a no-op without normalization.
    pub fn save_normalizer(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(normalizer) = self.obs_normalizer.as_ref() {
            let count = Tensor::new(&[normalizer.count], &self.device)?;
            let tensors = HashMap::from([
                ("mean", normalizer.mean.clone()),
                ("var", normalizer.var.clone()),
                ("count", count),
            ]);
            candle_core::safetensors::save(&tensors, path)?;
        }
        Ok(())
    }

    pub fn load_normalizer(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(normalizer) = self.obs_normalizer.as_mut() {
            let mut tensors = candle_core::safetensors::load(path, &self.device)?;
            let mut take = |name: &str| {
                tensors
                    .remove(name)
                    .ok_or_else(|| anyhow::anyhow!("normalizer checkpoint misses `{name}`"))
            };
            normalizer.mean = take("mean")?;
            normalizer.var = take("var")?;
            normalizer.count = take("count")?.to_vec1::<f32>()?[0];
        }
        Ok(())
    }

    /// Maps a policy action to what the env accepts, continuous actions are clamped to the
    /// action space bounds.
    pub fn to_env_action(&self, action: RawTensor) -> RawTensor {
        match &self.env_description.action_space {
            Space::Continous {
                min: Some(min),
                max: Some(max),
                ..
            } => action.clamp(min, max),
            _ => action,
        }
    }

    /// Steps every env with its row of `actions`.
    pub fn step(&mut self, actions: &Tensor) -> Result<VecSnapShot> {
        let rows: Vec<Vec<f32>> = actions.to_vec2()?;
        let actions: Vec<RawTensor> = rows
            .into_iter()
            .map(|row| self.to_env_action(RawTensor::from_vec(row)))
            .collect();
        let mut snapshots = self
            .envs
            .par_iter_mut()
            .zip(actions.par_iter())
            .map(|(env, action)| env.step(action))
            .collect::<Result<Vec<_>>>()?;

        let num_envs = self.num_envs();
        let mut next_states = Vec::with_capacity(num_envs);
        let mut final_states = Vec::with_capacity(num_envs);
        let mut env_rewards = Vec::with_capacity(num_envs);
        let mut original_rewards = Vec::with_capacity(num_envs);
        let mut original_costs = Vec::with_capacity(num_envs);
        let mut terminated = Vec::with_capacity(num_envs);
        let mut truncated = Vec::with_capacity(num_envs);
        let mut forfeited = Vec::with_capacity(num_envs);
        for (env_idx, snapshot) in snapshots.iter_mut().enumerate() {
            let forfeit =
                self.hooks.step_hook(env_idx, snapshot)? == StepVerdict::TerminateWithoutReward;
            env_rewards.push(snapshot.reward);
            if forfeit {
                snapshot.reward = 0.;
                snapshot.terminated = true;
            }
            forfeited.push(forfeit);
            original_rewards.push(snapshot.reward);
            original_costs.push(snapshot.cost);
            terminated.push(snapshot.terminated);
            truncated.push(snapshot.truncated);
            if snapshot.done() {
                final_states.push(Some(snapshot.state.clone()));
                next_states.push(self.reset_env(env_idx)?);
            } else {
                final_states.push(None);
                next_states.push(snapshot.state.clone());
            }
        }

        let raw_obs = stack_raw(&next_states, &self.device)?;
        let next_obs = self.process_observations(&raw_obs, true)?;
        let final_observations = final_states
            .into_iter()
            .map(|state| {
                state
                    .map(|state| {
                        let obs = stack_raw(std::slice::from_ref(&state), &self.device)?;
                        self.normalize_observation(&obs)
                    })
                    .transpose()
            })
            .collect::<Result<Vec<_>>>()?;
        let mut rewards =
            Self::process_scalars(self.reward_normalizer.as_mut(), &env_rewards, &self.device)?;
        for (reward, forfeited) in rewards.iter_mut().zip(forfeited) {
            if forfeited {
                *reward = 0.;
            }
        }
        let costs =
            Self::process_scalars(self.cost_normalizer.as_mut(), &original_costs, &self.device)?;
        Ok(VecSnapShot {
            next_obs,
            rewards,
            costs,
            original_rewards,
            original_costs,
            terminated,
            truncated,
            final_observations,
        })
    }

    fn reset_log(&mut self, env_idx: usize) {
        self.ep_ret[env_idx] = 0.;
        self.ep_cost[env_idx] = 0.;
        self.ep_len[env_idx] = 0;
    }

    fn log_metrics(&self, logger: &mut EpochLogger, env_idx: usize) {
        logger.store("Metrics/EpRet", self.ep_ret[env_idx]);
        logger.store("Metrics/EpCost", self.ep_cost[env_idx]);
        logger.store("Metrics/EpLen", self.ep_len[env_idx] as f32);
    }

    fn bootstrap<A: ActorCritic>(agent: &A, obs: &Tensor) -> Result<(f32, f32)> {
        let (value_r, value_c) = agent.values(obs)?;
        let value_r = value_r.flatten_all()?.to_vec1::<f32>()?;
        let value_c = value_c.flatten_all()?.to_vec1::<f32>()?;
        Ok((value_r[0], value_c[0]))
    }

    /// Collects `steps_per_epoch` vectorized steps into `buffer`.
    ///
    /// Every env starts a fresh episode. Paths are closed when an episode terminates
    /// (bootstrap value 0), is truncated (bootstrap with the final observation) or when the
    /// epoch ends (bootstrap with the current observation).
    pub fn rollout<A: ActorCritic>(
        &mut self,
        steps_per_epoch: usize,
        agent: &A,
        buffer: &mut VectorOnPolicyBuffer,
        logger: &mut EpochLogger,
    ) -> Result<()> {
        for env_idx in 0..self.num_envs() {
            self.reset_log(env_idx);
        }
        let mut obs = self.reset()?;
        for step in 0..steps_per_epoch {
            let out = agent.step(&obs, false)?;
            let snapshot = self.step(&out.action)?;
            let value_r: Vec<f32> = out.value_r.to_vec1()?;
            let value_c: Vec<f32> = out.value_c.to_vec1()?;
            let logp: Vec<f32> = out.logp.to_vec1()?;

            for env_idx in 0..self.num_envs() {
                self.ep_ret[env_idx] += snapshot.original_rewards[env_idx];
                self.ep_cost[env_idx] += snapshot.original_costs[env_idx];
                self.ep_len[env_idx] += 1;
                logger.store("Value/reward", value_r[env_idx]);
                if self.use_cost {
                    logger.store("Value/cost", value_c[env_idx]);
                }
            }
            buffer.store(
                &obs,
                &out.action,
                &snapshot.rewards,
                &snapshot.costs,
                &value_r,
                &value_c,
                &logp,
            )?;
            obs = snapshot.next_obs;

            let epoch_end = step + 1 >= steps_per_epoch;
            for env_idx in 0..self.num_envs() {
                let terminated = snapshot.terminated[env_idx];
                let truncated = snapshot.truncated[env_idx];
                if !(epoch_end || terminated || truncated) {
                    continue;
                }
                let (last_value_r, last_value_c) = if terminated {
                    (0., 0.)
                } else if truncated {
                    match &snapshot.final_observations[env_idx] {
                        Some(final_obs) => Self::bootstrap(agent, final_obs)?,
                        None => (0., 0.),
                    }
                } else {
                    log::debug!(
                        "trajectory of env {env_idx} cut off by the end of the epoch after {} steps",
                        self.ep_len[env_idx]
                    );
                    Self::bootstrap(agent, &obs.narrow(0, env_idx, 1)?)?
                };
                if terminated || truncated {
                    self.log_metrics(logger, env_idx);
                    self.reset_log(env_idx);
                }
                buffer.finish_path(last_value_r, last_value_c, env_idx);
            }
        }
        Ok(())
    }
}

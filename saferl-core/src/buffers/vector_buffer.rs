use super::on_policy_buffer::{EstimationParams, OnPolicyBuffer, PathData};
use crate::{config::Config, error::SafeRlError};
use anyhow::Result;
use candle_core::{Device, Tensor};

/// Epoch data ready for the update phase, one row per transition.
#[derive(Debug, Clone)]
pub struct RolloutData {
    pub obs: Tensor,
    pub act: Tensor,
    pub logp: Tensor,
    pub target_value_r: Tensor,
    pub target_value_c: Tensor,
    pub adv_r: Tensor,
    pub adv_c: Tensor,
}

impl RolloutData {
    pub fn len(&self) -> usize {
        self.logp.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Selects the rows in `indices`.
    pub fn select(&self, indices: &Tensor) -> Result<Self> {
        Ok(Self {
            obs: self.obs.index_select(indices, 0)?,
            act: self.act.index_select(indices, 0)?,
            logp: self.logp.index_select(indices, 0)?,
            target_value_r: self.target_value_r.index_select(indices, 0)?,
            target_value_c: self.target_value_c.index_select(indices, 0)?,
            adv_r: self.adv_r.index_select(indices, 0)?,
            adv_c: self.adv_c.index_select(indices, 0)?,
        })
    }
}

fn mean_std(xs: &[f32]) -> (f32, f32) {
    if xs.is_empty() {
        return (0., 0.);
    }
    let n = xs.len() as f32;
    let mean = xs.iter().sum::<f32>() / n;
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
    (mean, var.sqrt())
}

/// One [`OnPolicyBuffer`] per vectorized env.
#[derive(Debug, Clone)]
pub struct VectorOnPolicyBuffer {
    buffers: Vec<OnPolicyBuffer>,
    obs_dim: usize,
    act_dim: usize,
    standardized_adv_r: bool,
    standardized_adv_c: bool,
    device: Device,
}

impl VectorOnPolicyBuffer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_envs: usize,
        steps_per_env: usize,
        obs_dim: usize,
        act_dim: usize,
        params: EstimationParams,
        standardized_adv_r: bool,
        standardized_adv_c: bool,
        device: Device,
    ) -> Self {
        let buffers = (0..num_envs)
            .map(|env_idx| {
                OnPolicyBuffer::new(env_idx, steps_per_env, obs_dim, act_dim, params.clone())
            })
            .collect();
        Self {
            buffers,
            obs_dim,
            act_dim,
            standardized_adv_r,
            standardized_adv_c,
            device,
        }
    }

    pub fn from_config(
        cfgs: &Config,
        steps_per_env: usize,
        obs_dim: usize,
        act_dim: usize,
        device: Device,
    ) -> Result<Self> {
        let algo = &cfgs.algo_cfgs;
        let params = EstimationParams {
            method: algo.adv_estimation_method.parse()?,
            gamma: algo.gamma,
            lam: algo.lam,
            cost_gamma: algo.cost_gamma,
            lam_c: algo.lam_c,
            penalty_coef: algo.penalty_coef,
        };
        Ok(Self::new(
            cfgs.train_cfgs.vector_env_nums,
            steps_per_env,
            obs_dim,
            act_dim,
            params,
            algo.standardized_rew_adv,
            algo.standardized_cost_adv,
            device,
        ))
    }

    pub fn num_envs(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, env_idx: usize) -> &OnPolicyBuffer {
        &self.buffers[env_idx]
    }

    /// Stores one vectorized step. Every slice/tensor has one entry per env.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &mut self,
        obs: &Tensor,
        act: &Tensor,
        reward: &[f32],
        cost: &[f32],
        value_r: &[f32],
        value_c: &[f32],
        logp: &[f32],
    ) -> Result<()> {
        let obs: Vec<Vec<f32>> = obs.to_vec2()?;
        let act: Vec<Vec<f32>> = act.to_vec2()?;
        for (idx, buffer) in self.buffers.iter_mut().enumerate() {
            buffer.store(
                &obs[idx],
                &act[idx],
                reward[idx],
                cost[idx],
                value_r[idx],
                value_c[idx],
                logp[idx],
            )?;
        }
        Ok(())
    }

    pub fn finish_path(&mut self, last_value_r: f32, last_value_c: f32, env_idx: usize) {
        self.buffers[env_idx].finish_path(last_value_r, last_value_c);
    }

    /// Gathers the finished paths of every env and empties the buffers.
    pub fn get(&mut self) -> Result<RolloutData> {
        if let Some(idx) = self.buffers.iter().position(|b| !b.is_finished()) {
            return Err(SafeRlError::InvalidConfig(format!(
                "buffer of env {idx} holds an unfinished path"
            ))
            .into());
        }
        let mut all = PathData::default();
        for buffer in self.buffers.iter_mut() {
            let data = buffer.take();
            all.obs.extend(data.obs);
            all.act.extend(data.act);
            all.logp.extend(data.logp);
            all.adv_r.extend(data.adv_r);
            all.adv_c.extend(data.adv_c);
            all.target_value_r.extend(data.target_value_r);
            all.target_value_c.extend(data.target_value_c);
        }
        if self.standardized_adv_r {
            let (mean, std) = mean_std(&all.adv_r);
            for adv in all.adv_r.iter_mut() {
                *adv = (*adv - mean) / (std + 1e-8);
            }
        }
        if self.standardized_adv_c {
            // cost advantages are only centered
            let (mean, _) = mean_std(&all.adv_c);
            for adv in all.adv_c.iter_mut() {
                *adv -= mean;
            }
        }
        let n = all.logp.len();
        let device = &self.device;
        Ok(RolloutData {
            obs: Tensor::from_vec(all.obs, (n, self.obs_dim), device)?,
            act: Tensor::from_vec(all.act, (n, self.act_dim), device)?,
            logp: Tensor::from_vec(all.logp, n, device)?,
            target_value_r: Tensor::from_vec(all.target_value_r, n, device)?,
            target_value_c: Tensor::from_vec(all.target_value_c, n, device)?,
            adv_r: Tensor::from_vec(all.adv_r, n, device)?,
            adv_c: Tensor::from_vec(all.adv_c, n, device)?,
        })
    }
}

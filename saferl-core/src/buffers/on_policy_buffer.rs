use crate::error::SafeRlError;
use anyhow::Result;
use std::str::FromStr;

/// `y[i] = x[i] + discount * y[i + 1]`
pub fn discount_cumsum(x: &[f32], discount: f32) -> Vec<f32> {
    let mut out = vec![0.; x.len()];
    let mut running = 0.;
    for i in (0..x.len()).rev() {
        running = x[i] + discount * running;
        out[i] = running;
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvEstimation {
    /// Generalized advantage estimation, value targets are `adv + value`.
    Gae,
    /// Generalized advantage estimation with discounted reward-to-go value targets.
    GaeRtg,
    /// Discounted return minus the value baseline.
    Plain,
}

impl FromStr for AdvEstimation {
    type Err = SafeRlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gae" => Ok(Self::Gae),
            "gae-rtg" => Ok(Self::GaeRtg),
            "plain" => Ok(Self::Plain),
            other => Err(SafeRlError::InvalidConfig(format!(
                "unsupported adv_estimation_method `{other}`, expected one of gae, gae-rtg, plain"
            ))),
        }
    }
}

impl AdvEstimation {
    /// `rewards` and `values` carry the bootstrap value as their last element, so both are one
    /// longer than the path. Returns the advantages and value targets of the path.
    pub fn advantages_and_targets(
        &self,
        rewards: &[f32],
        values: &[f32],
        gamma: f32,
        lam: f32,
    ) -> (Vec<f32>, Vec<f32>) {
        let n = rewards.len() - 1;
        match self {
            Self::Gae | Self::GaeRtg => {
                let deltas: Vec<f32> = (0..n)
                    .map(|i| rewards[i] + gamma * values[i + 1] - values[i])
                    .collect();
                let adv = discount_cumsum(&deltas, gamma * lam);
                let targets = if *self == Self::Gae {
                    adv.iter().zip(values).map(|(a, v)| a + v).collect()
                } else {
                    discount_cumsum(rewards, gamma)[..n].to_vec()
                };
                (adv, targets)
            }
            Self::Plain => {
                let targets = discount_cumsum(rewards, gamma)[..n].to_vec();
                let adv = targets.iter().zip(values).map(|(t, v)| t - v).collect();
                (adv, targets)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EstimationParams {
    pub method: AdvEstimation,
    pub gamma: f32,
    pub lam: f32,
    pub cost_gamma: f32,
    pub lam_c: f32,
    pub penalty_coef: f32,
}

/// Finished transitions of one env, flattened row by row.
#[derive(Debug, Default, Clone)]
pub struct PathData {
    pub obs: Vec<f32>,
    pub act: Vec<f32>,
    pub logp: Vec<f32>,
    pub adv_r: Vec<f32>,
    pub adv_c: Vec<f32>,
    pub target_value_r: Vec<f32>,
    pub target_value_c: Vec<f32>,
}

/// Transitions collected by a single env during one epoch.
#[derive(Debug, Clone)]
pub struct OnPolicyBuffer {
    env_idx: usize,
    capacity: usize,
    obs_dim: usize,
    act_dim: usize,
    params: EstimationParams,
    obs: Vec<f32>,
    act: Vec<f32>,
    reward: Vec<f32>,
    cost: Vec<f32>,
    value_r: Vec<f32>,
    value_c: Vec<f32>,
    logp: Vec<f32>,
    adv_r: Vec<f32>,
    adv_c: Vec<f32>,
    target_value_r: Vec<f32>,
    target_value_c: Vec<f32>,
    path_start_idx: usize,
}

impl OnPolicyBuffer {
    pub fn new(
        env_idx: usize,
        capacity: usize,
        obs_dim: usize,
        act_dim: usize,
        params: EstimationParams,
    ) -> Self {
        Self {
            env_idx,
            capacity,
            obs_dim,
            act_dim,
            params,
            obs: Vec::with_capacity(capacity * obs_dim),
            act: Vec::with_capacity(capacity * act_dim),
            reward: Vec::with_capacity(capacity),
            cost: Vec::with_capacity(capacity),
            value_r: Vec::with_capacity(capacity),
            value_c: Vec::with_capacity(capacity),
            logp: Vec::with_capacity(capacity),
            adv_r: Vec::with_capacity(capacity),
            adv_c: Vec::with_capacity(capacity),
            target_value_r: Vec::with_capacity(capacity),
            target_value_c: Vec::with_capacity(capacity),
            path_start_idx: 0,
        }
    }

    /// Number of stored transitions.
    pub fn len(&self) -> usize {
        self.reward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reward.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when every stored transition belongs to a finished path.
    pub fn is_finished(&self) -> bool {
        self.path_start_idx == self.len()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &mut self,
        obs: &[f32],
        act: &[f32],
        reward: f32,
        cost: f32,
        value_r: f32,
        value_c: f32,
        logp: f32,
    ) -> Result<()> {
        if self.len() >= self.capacity {
            return Err(SafeRlError::BufferFull {
                env_idx: self.env_idx,
                capacity: self.capacity,
            }
            .into());
        }
        debug_assert_eq!(obs.len(), self.obs_dim);
        debug_assert_eq!(act.len(), self.act_dim);
        self.obs.extend_from_slice(obs);
        self.act.extend_from_slice(act);
        self.reward.push(reward);
        self.cost.push(cost);
        self.value_r.push(value_r);
        self.value_c.push(value_c);
        self.logp.push(logp);
        Ok(())
    }

    /// Closes the current path, `last_value_r` and `last_value_c` bootstrap the cut trajectory
    /// and must be zero when the episode terminated.
    pub fn finish_path(&mut self, last_value_r: f32, last_value_c: f32) {
        let path = self.path_start_idx..self.len();
        if path.is_empty() {
            return;
        }
        let EstimationParams {
            method,
            gamma,
            lam,
            cost_gamma,
            lam_c,
            penalty_coef,
        } = self.params.clone();

        let mut rewards = self.reward[path.clone()].to_vec();
        if penalty_coef != 0. {
            for (r, c) in rewards.iter_mut().zip(&self.cost[path.clone()]) {
                *r -= penalty_coef * c;
            }
        }
        rewards.push(last_value_r);
        let mut values_r = self.value_r[path.clone()].to_vec();
        values_r.push(last_value_r);
        let (adv_r, target_r) = method.advantages_and_targets(&rewards, &values_r, gamma, lam);

        let mut costs = self.cost[path.clone()].to_vec();
        costs.push(last_value_c);
        let mut values_c = self.value_c[path.clone()].to_vec();
        values_c.push(last_value_c);
        let (adv_c, target_c) =
            method.advantages_and_targets(&costs, &values_c, cost_gamma, lam_c);

        self.adv_r.extend(adv_r);
        self.target_value_r.extend(target_r);
        self.adv_c.extend(adv_c);
        self.target_value_c.extend(target_c);
        self.path_start_idx = path.end;
    }

    /// Moves the finished transitions out and empties the buffer.
    pub fn take(&mut self) -> PathData {
        let data = PathData {
            obs: std::mem::take(&mut self.obs),
            act: std::mem::take(&mut self.act),
            logp: std::mem::take(&mut self.logp),
            adv_r: std::mem::take(&mut self.adv_r),
            adv_c: std::mem::take(&mut self.adv_c),
            target_value_r: std::mem::take(&mut self.target_value_r),
            target_value_c: std::mem::take(&mut self.target_value_c),
        };
        self.reward.clear();
        self.cost.clear();
        self.value_r.clear();
        self.value_c.clear();
        self.path_start_idx = 0;
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(lhs: &[f32], rhs: &[f32]) {
        assert_eq!(lhs.len(), rhs.len());
        for (l, r) in lhs.iter().zip(rhs) {
            assert!((l - r).abs() < 1e-5, "{lhs:?} != {rhs:?}");
        }
    }

    fn params(method: AdvEstimation, penalty_coef: f32) -> EstimationParams {
        EstimationParams {
            method,
            gamma: 0.5,
            lam: 0.5,
            cost_gamma: 1.0,
            lam_c: 1.0,
            penalty_coef,
        }
    }

    #[test]
    fn discounted_sums() {
        assert_close(&discount_cumsum(&[1., 1., 1.], 0.5), &[1.75, 1.5, 1.]);
        assert_close(&discount_cumsum(&[], 0.5), &[]);
    }

    #[test]
    fn gae_by_hand() {
        // deltas: 1 + 0.5*2 - 1 = 1, 1 + 0.5*0 - 2 = -1; gamma*lam = 0.25
        let (adv, targets) =
            AdvEstimation::Gae.advantages_and_targets(&[1., 1., 0.], &[1., 2., 0.], 0.5, 0.5);
        assert_close(&adv, &[0.75, -1.]);
        assert_close(&targets, &[1.75, 1.]);

        let (adv, targets) =
            AdvEstimation::GaeRtg.advantages_and_targets(&[1., 1., 0.], &[1., 2., 0.], 0.5, 0.5);
        assert_close(&adv, &[0.75, -1.]);
        assert_close(&targets, &[1.5, 1.]);

        let (adv, targets) =
            AdvEstimation::Plain.advantages_and_targets(&[1., 1., 0.], &[1., 2., 0.], 0.5, 0.5);
        assert_close(&targets, &[1.5, 1.]);
        assert_close(&adv, &[0.5, -1.]);
    }

    #[test]
    fn finishes_paths_independently() -> Result<()> {
        let mut buffer = OnPolicyBuffer::new(0, 4, 1, 1, params(AdvEstimation::Gae, 0.));
        buffer.store(&[0.], &[0.], 1., 1., 0., 0., 0.)?;
        buffer.store(&[0.], &[0.], 1., 0., 0., 0., 0.)?;
        buffer.finish_path(0., 0.);
        assert!(buffer.is_finished());
        buffer.store(&[0.], &[0.], 1., 1., 0., 0., 0.)?;
        assert!(!buffer.is_finished());
        buffer.finish_path(2., 3.);
        let data = buffer.take();
        // with zero values the advantages are discounted sums with gamma * lam = 0.25
        assert_close(&data.adv_r, &[1.25, 1., 1. + 0.5 * 2.]);
        assert_close(&data.adv_c, &[1., 0., 1. + 3.]);
        assert!(buffer.is_empty());
        Ok(())
    }

    #[test]
    fn penalty_is_subtracted_from_rewards() -> Result<()> {
        let mut buffer = OnPolicyBuffer::new(0, 2, 1, 1, params(AdvEstimation::Plain, 0.5));
        buffer.store(&[0.], &[0.], 1., 1., 0., 0., 0.)?;
        buffer.finish_path(0., 0.);
        assert_close(&buffer.take().target_value_r, &[0.5]);
        Ok(())
    }

    #[test]
    fn refuses_to_overflow() -> Result<()> {
        let mut buffer = OnPolicyBuffer::new(3, 1, 1, 1, params(AdvEstimation::Gae, 0.));
        buffer.store(&[0.], &[0.], 0., 0., 0., 0., 0.)?;
        assert!(buffer.store(&[0.], &[0.], 0., 0., 0., 0., 0.).is_err());
        Ok(())
    }

    #[test]
    fn parses_methods() {
        assert_eq!("gae".parse::<AdvEstimation>().ok(), Some(AdvEstimation::Gae));
        assert_eq!("gae-rtg".parse::<AdvEstimation>().ok(), Some(AdvEstimation::GaeRtg));
        assert!("vtrace".parse::<AdvEstimation>().is_err());
    }
}

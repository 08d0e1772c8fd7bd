use anyhow::Result;
use candle_core::Tensor;

/// Everything the adapter needs from the model for one vectorized step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// `[num_envs, act_dim]`, one-hot rows for discrete action spaces.
    pub action: Tensor,
    /// `[num_envs]`
    pub value_r: Tensor,
    /// `[num_envs]`, zeros when the model carries no cost critic.
    pub value_c: Tensor,
    /// `[num_envs]`
    pub logp: Tensor,
}

/// Actor with a reward critic and an optional cost critic.
pub trait ActorCritic {
    fn step(&self, observations: &Tensor, deterministic: bool) -> Result<StepOutput>;

    /// Reward and cost value estimates of a batch of observations.
    fn values(&self, observations: &Tensor) -> Result<(Tensor, Tensor)> {
        let out = self.step(observations, true)?;
        Ok((out.value_r, out.value_c))
    }
}

pub mod categorical_distribution;
pub mod diagonal_distribution;

use anyhow::{Result, bail};
use candle_core::Tensor;
use categorical_distribution::CategoricalActor;
use diagonal_distribution::GaussianLearningActor;

/// Detached parameters of the action distribution over a batch of observations.
#[derive(Debug, Clone)]
pub enum DistParams {
    Gaussian { mean: Tensor, log_std: Tensor },
    Categorical { log_probs: Tensor },
}

impl DistParams {
    /// `KL(self || other)` summed over the action dimensions and averaged over the batch.
    pub fn kl(&self, other: &DistParams) -> Result<Tensor> {
        match (self, other) {
            (
                Self::Gaussian { mean, log_std },
                Self::Gaussian {
                    mean: other_mean,
                    log_std: other_log_std,
                },
            ) => {
                let log_std = log_std.broadcast_as(mean.shape())?;
                let other_log_std = other_log_std.broadcast_as(mean.shape())?;
                let var = log_std.affine(2., 0.)?.exp()?;
                let other_var = other_log_std.affine(2., 0.)?.exp()?;
                let mean_diff = (mean - other_mean)?.sqr()?;
                let kl = ((&other_log_std - &log_std)?
                    + ((var + mean_diff)? / other_var.affine(2., 0.)?)?)?
                    .affine(1., -0.5)?;
                Ok(kl.sum(1)?.mean_all()?)
            }
            (
                Self::Categorical { log_probs },
                Self::Categorical {
                    log_probs: other_log_probs,
                },
            ) => {
                let kl = log_probs.exp()?.mul(&(log_probs - other_log_probs)?)?;
                Ok(kl.sum(1)?.mean_all()?)
            }
            _ => bail!("cannot compare distributions of different families"),
        }
    }
}

pub trait Actor {
    /// Draws `[batch, act_dim]` actions and their log probabilities. The returned tensors are
    /// detached.
    fn sample(&self, observations: &Tensor, deterministic: bool) -> Result<(Tensor, Tensor)>;

    /// `[batch]` log probabilities of `actions`, differentiable w.r.t. the actor parameters.
    fn log_probs(&self, observations: &Tensor, actions: &Tensor) -> Result<Tensor>;

    /// Mean entropy of the action distribution over the batch.
    fn entropy(&self, observations: &Tensor) -> Result<Tensor>;

    fn dist_params(&self, observations: &Tensor) -> Result<DistParams>;

    /// Standard deviation of the exploration noise, `None` for discrete actors.
    fn std(&self) -> Result<Option<f32>>;

    fn set_std(&self, std: f32) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum ActorKind {
    Gaussian(GaussianLearningActor),
    Categorical(CategoricalActor),
}

impl Actor for ActorKind {
    fn sample(&self, observations: &Tensor, deterministic: bool) -> Result<(Tensor, Tensor)> {
        match self {
            Self::Gaussian(actor) => actor.sample(observations, deterministic),
            Self::Categorical(actor) => actor.sample(observations, deterministic),
        }
    }

    fn log_probs(&self, observations: &Tensor, actions: &Tensor) -> Result<Tensor> {
        match self {
            Self::Gaussian(actor) => actor.log_probs(observations, actions),
            Self::Categorical(actor) => actor.log_probs(observations, actions),
        }
    }

    fn entropy(&self, observations: &Tensor) -> Result<Tensor> {
        match self {
            Self::Gaussian(actor) => actor.entropy(observations),
            Self::Categorical(actor) => actor.entropy(observations),
        }
    }

    fn dist_params(&self, observations: &Tensor) -> Result<DistParams> {
        match self {
            Self::Gaussian(actor) => actor.dist_params(observations),
            Self::Categorical(actor) => actor.dist_params(observations),
        }
    }

    fn std(&self) -> Result<Option<f32>> {
        match self {
            Self::Gaussian(actor) => actor.std(),
            Self::Categorical(actor) => actor.std(),
        }
    }

    fn set_std(&self, std: f32) -> Result<()> {
        match self {
            Self::Gaussian(actor) => actor.set_std(std),
            Self::Categorical(actor) => actor.set_std(std),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn gaussian_kl() -> Result<()> {
        let device = Device::Cpu;
        let p = DistParams::Gaussian {
            mean: Tensor::new(&[[0f32, 0.]], &device)?,
            log_std: Tensor::new(&[0f32, 0.], &device)?,
        };
        let q = DistParams::Gaussian {
            mean: Tensor::new(&[[1f32, 0.]], &device)?,
            log_std: Tensor::new(&[0f32, 2f32.ln()], &device)?,
        };
        assert!(p.kl(&p)?.to_scalar::<f32>()?.abs() < 1e-6);
        // dim 0: (1 + 1) / 2 - 0.5 = 0.5, dim 1: ln 2 + 1 / 8 - 0.5
        let expected = 0.5 + 2f32.ln() + 0.125 - 0.5;
        assert!((p.kl(&q)?.to_scalar::<f32>()? - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn categorical_kl() -> Result<()> {
        let device = Device::Cpu;
        let p = DistParams::Categorical {
            log_probs: Tensor::new(&[[0.5f32.ln(), 0.5f32.ln()]], &device)?,
        };
        let q = DistParams::Categorical {
            log_probs: Tensor::new(&[[0.25f32.ln(), 0.75f32.ln()]], &device)?,
        };
        let expected = 0.5 * (0.5f32 / 0.25).ln() + 0.5 * (0.5f32 / 0.75).ln();
        assert!((p.kl(&q)?.to_scalar::<f32>()? - expected).abs() < 1e-5);
        assert!(p.kl(&DistParams::Gaussian {
            mean: Tensor::new(&[[0f32]], &device)?,
            log_std: Tensor::new(&[0f32], &device)?,
        })
        .is_err());
        Ok(())
    }
}

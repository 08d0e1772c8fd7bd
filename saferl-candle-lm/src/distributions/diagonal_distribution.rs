use super::DistParams;
use crate::thread_safe_sequential::{Activation, ThreadSafeSequential, WeightInit, build_sequential};
use anyhow::{Result, anyhow};
use candle_core::{Module, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use std::f32;

/// Gaussian policy with an MLP mean and a learnable, state independent `log_std`.
#[derive(Debug, Clone)]
pub struct GaussianLearningActor {
    mean_net: ThreadSafeSequential,
    log_std: Var,
}

impl GaussianLearningActor {
    pub fn new(mean_net: ThreadSafeSequential, log_std: Var) -> Self {
        Self { mean_net, log_std }
    }

    /// Builds the actor inside `varmap`, the exploration std starts at 1.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        obs_dim: usize,
        act_dim: usize,
        hidden_sizes: &[usize],
        activation: Activation,
        init: WeightInit,
        varmap: &VarMap,
        vb: &VarBuilder,
        prefix: &str,
    ) -> Result<Self> {
        let mean_net =
            build_sequential(obs_dim, hidden_sizes, act_dim, activation, init, vb, prefix)?;
        let log_std_name = format!("{prefix}_log_std");
        vb.get_with_hints(act_dim, &log_std_name, Init::Const(0.))?;
        let log_std = varmap
            .data()
            .lock()
            .map_err(|err| anyhow!("poisoned varmap: {err}"))?
            .get(&log_std_name)
            .cloned()
            .ok_or_else(|| anyhow!("missing variable {log_std_name}"))?;
        Ok(Self { mean_net, log_std })
    }

    pub fn log_std(&self) -> &Tensor {
        self.log_std.as_tensor()
    }

    fn mean(&self, observations: &Tensor) -> Result<Tensor> {
        Ok(self.mean_net.forward(observations)?)
    }

    fn log_probs_from_mean(&self, mean: &Tensor, actions: &Tensor) -> Result<Tensor> {
        let log_std = self.log_std().broadcast_as(mean.shape())?;
        let var = log_std.exp()?.sqr()?;
        let log_sqrt_2pi = f32::ln(f32::sqrt(2f32 * f32::consts::PI)) as f64;
        let log_probs = ((((actions - mean)?.sqr()? / var.affine(2., 0.)?)?.neg()? - log_std)?
            .affine(1., -log_sqrt_2pi))?;
        Ok(log_probs.sum(1)?)
    }
}

impl super::Actor for GaussianLearningActor {
    fn sample(&self, observations: &Tensor, deterministic: bool) -> Result<(Tensor, Tensor)> {
        let mean = self.mean(observations)?.detach();
        let action = if deterministic {
            mean.clone()
        } else {
            let std = self.log_std().exp()?.broadcast_as(mean.shape())?;
            let noise = Tensor::randn(0f32, 1., mean.shape(), mean.device())?;
            (&mean + std.mul(&noise)?)?.detach()
        };
        let logp = self.log_probs_from_mean(&mean, &action)?.detach();
        Ok((action, logp))
    }

    fn log_probs(&self, observations: &Tensor, actions: &Tensor) -> Result<Tensor> {
        let mean = self.mean(observations)?;
        self.log_probs_from_mean(&mean, actions)
    }

    fn entropy(&self, _observations: &Tensor) -> Result<Tensor> {
        let half_log_2pi_e = 0.5 * ((2. * f32::consts::PI).ln() + 1.) as f64;
        Ok(self.log_std().affine(1., half_log_2pi_e)?.mean_all()?)
    }

    fn dist_params(&self, observations: &Tensor) -> Result<DistParams> {
        Ok(DistParams::Gaussian {
            mean: self.mean(observations)?.detach(),
            log_std: self.log_std().detach(),
        })
    }

    fn std(&self) -> Result<Option<f32>> {
        let std = self.log_std().exp()?.mean_all()?.to_scalar::<f32>()?;
        Ok(Some(std))
    }

    fn set_std(&self, std: f32) -> Result<()> {
        let log_std = Tensor::full(std.ln(), self.log_std.shape(), self.log_std.device())?;
        self.log_std.set(&log_std)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Actor;
    use candle_core::{DType, Device};

    fn actor(varmap: &VarMap) -> Result<GaussianLearningActor> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        GaussianLearningActor::build(
            3,
            2,
            &[16],
            Activation::Tanh,
            WeightInit::KaimingUniform,
            varmap,
            &vb,
            "actor",
        )
    }

    #[test]
    fn samples_and_scores_actions() -> Result<()> {
        let varmap = VarMap::new();
        let actor = actor(&varmap)?;
        let obs = Tensor::randn(0f32, 1., (5, 3), &Device::Cpu)?;
        let (action, logp) = actor.sample(&obs, false)?;
        assert_eq!(action.dims(), &[5, 2]);
        assert_eq!(logp.dims(), &[5]);
        let rescored: Vec<f32> = actor.log_probs(&obs, &action)?.to_vec1()?;
        for (l, r) in logp.to_vec1::<f32>()?.iter().zip(rescored) {
            assert!((l - r).abs() < 1e-5);
        }
        let (mean_action, _) = actor.sample(&obs, true)?;
        let DistParams::Gaussian { mean, .. } = actor.dist_params(&obs)? else {
            panic!("gaussian actor yields gaussian params");
        };
        assert_eq!(mean_action.to_vec2::<f32>()?, mean.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn std_is_adjustable() -> Result<()> {
        let varmap = VarMap::new();
        let actor = actor(&varmap)?;
        assert_eq!(actor.std()?, Some(1.));
        actor.set_std(0.5)?;
        let std = actor.std()?.expect("gaussian std");
        assert!((std - 0.5).abs() < 1e-6);
        // the std lives in the varmap so optimizers and checkpoints see it
        assert_eq!(varmap.all_vars().len(), 5);
        // entropy of a unit gaussian per dimension
        let entropy = actor.entropy(&Tensor::zeros((1, 3), DType::F32, &Device::Cpu)?)?;
        let expected = 0.5 * ((2. * f32::consts::PI).ln() + 1.) + 0.5f32.ln();
        assert!((entropy.to_scalar::<f32>()? - expected).abs() < 1e-5);
        Ok(())
    }
}

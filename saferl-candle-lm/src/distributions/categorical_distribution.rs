use super::DistParams;
use crate::thread_safe_sequential::{Activation, ThreadSafeSequential, WeightInit, build_sequential};
use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;
use candle_nn::ops::{log_softmax, softmax};
use rand::distr::Distribution as RandDistribution;
use rand::distr::weighted::WeightedIndex;
use saferl_core::rng::RNG;

/// Categorical policy over `action_size` actions, actions travel as one-hot rows.
#[derive(Clone, Debug)]
pub struct CategoricalActor {
    action_size: usize,
    logits: ThreadSafeSequential,
}

impl CategoricalActor {
    pub fn new(action_size: usize, logits: ThreadSafeSequential) -> Self {
        Self {
            action_size,
            logits,
        }
    }

    pub fn build(
        obs_dim: usize,
        action_size: usize,
        hidden_sizes: &[usize],
        activation: Activation,
        init: WeightInit,
        vb: &VarBuilder,
        prefix: &str,
    ) -> Result<Self> {
        let logits =
            build_sequential(obs_dim, hidden_sizes, action_size, activation, init, vb, prefix)?;
        Ok(Self {
            action_size,
            logits,
        })
    }

    fn log_softmax(&self, observations: &Tensor) -> Result<Tensor> {
        let logits = self.logits.forward(observations)?;
        Ok(log_softmax(&logits, 1)?)
    }
}

impl super::Actor for CategoricalActor {
    fn sample(&self, observations: &Tensor, deterministic: bool) -> Result<(Tensor, Tensor)> {
        let logits = self.logits.forward(observations)?.detach();
        let action_probs: Vec<Vec<f32>> = softmax(&logits, 1)?.to_vec2()?;
        let mut action_mask = vec![0f32; action_probs.len() * self.action_size];
        for (row, probs) in action_probs.iter().enumerate() {
            let action = if deterministic {
                probs
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |(best_idx, best), (idx, p)| {
                        if *p > best { (idx, *p) } else { (best_idx, best) }
                    })
                    .0
            } else {
                let distribution = WeightedIndex::new(probs)?;
                RNG.with_borrow_mut(|rng| distribution.sample(rng))
            };
            action_mask[row * self.action_size + action] = 1.;
        }
        let action = Tensor::from_vec(
            action_mask,
            (action_probs.len(), self.action_size),
            observations.device(),
        )?;
        let logp = action.mul(&log_softmax(&logits, 1)?)?.sum(1)?;
        Ok((action, logp))
    }

    fn log_probs(&self, observations: &Tensor, actions: &Tensor) -> Result<Tensor> {
        let log_probs = self.log_softmax(observations)?;
        Ok(actions.mul(&log_probs)?.sum(1)?)
    }

    fn entropy(&self, observations: &Tensor) -> Result<Tensor> {
        let log_probs = self.log_softmax(observations)?;
        let entropy = log_probs.exp()?.mul(&log_probs)?.sum(1)?.neg()?;
        Ok(entropy.mean_all()?)
    }

    fn dist_params(&self, observations: &Tensor) -> Result<DistParams> {
        Ok(DistParams::Categorical {
            log_probs: self.log_softmax(observations)?.detach(),
        })
    }

    fn std(&self) -> Result<Option<f32>> {
        Ok(None)
    }

    fn set_std(&self, _std: f32) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Actor;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn one_hot_actions() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let actor = CategoricalActor::build(
            4,
            3,
            &[8],
            Activation::Relu,
            WeightInit::XavierUniform,
            &vb,
            "pi",
        )?;
        let obs = Tensor::randn(0f32, 1., (6, 4), &Device::Cpu)?;
        let (action, logp) = actor.sample(&obs, false)?;
        let rows: Vec<Vec<f32>> = action.to_vec2()?;
        for row in rows.iter() {
            assert_eq!(row.iter().sum::<f32>(), 1.);
        }
        let rescored: Vec<f32> = actor.log_probs(&obs, &action)?.to_vec1()?;
        for (l, r) in logp.to_vec1::<f32>()?.iter().zip(rescored) {
            assert!((l - r).abs() < 1e-5);
            assert!(r <= 0.);
        }
        let entropy = actor.entropy(&obs)?.to_scalar::<f32>()?;
        assert!(entropy > 0. && entropy <= 3f32.ln() + 1e-5);
        assert_eq!(actor.std()?, None);
        Ok(())
    }
}

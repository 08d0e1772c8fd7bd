use anyhow::Result;
use saferl_core::{Algorithm, env::Env};

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSummary {
    pub episode_returns: Vec<f32>,
    pub episode_costs: Vec<f32>,
    pub episode_lengths: Vec<usize>,
}

fn mean(xs: impl ExactSizeIterator<Item = f32>) -> f32 {
    let n = xs.len();
    if n == 0 {
        return 0.;
    }
    xs.sum::<f32>() / n as f32
}

impl EvaluationSummary {
    pub fn mean_return(&self) -> f32 {
        mean(self.episode_returns.iter().copied())
    }

    pub fn mean_cost(&self) -> f32 {
        mean(self.episode_costs.iter().copied())
    }

    pub fn mean_length(&self) -> f32 {
        mean(self.episode_lengths.iter().map(|len| *len as f32))
    }
}

/// Runs whole episodes with a trained policy. Rewards and costs are the raw ones reported by
/// the env, episodes are never cut at the cost limit.
pub struct Evaluator<E: Env> {
    env: E,
    seed: u64,
}

impl<E: Env> Evaluator<E> {
    pub fn new(env: E, seed: u64) -> Self {
        Self { env, seed }
    }

    pub fn evaluate(
        &mut self,
        policy: &dyn Algorithm,
        episodes: usize,
        deterministic: bool,
    ) -> Result<EvaluationSummary> {
        let mut summary = EvaluationSummary {
            episode_returns: Vec::with_capacity(episodes),
            episode_costs: Vec::with_capacity(episodes),
            episode_lengths: Vec::with_capacity(episodes),
        };
        for episode in 0..episodes {
            let mut state = self.env.reset(self.seed.wrapping_add(episode as u64))?;
            let (mut ret, mut cost, mut len) = (0., 0., 0);
            loop {
                let action = policy.act(&state, deterministic)?;
                let snapshot = self.env.step(&action)?;
                ret += snapshot.reward;
                cost += snapshot.cost;
                len += 1;
                if snapshot.done() {
                    break;
                }
                state = snapshot.state;
            }
            log::info!("evaluation episode {episode}: return {ret:.3}, cost {cost:.3}, length {len}");
            summary.episode_returns.push(ret);
            summary.episode_costs.push(cost);
            summary.episode_lengths.push(len);
        }
        Ok(summary)
    }
}

use crate::{
    evaluator::{EvaluationSummary, Evaluator},
    registry::AlgorithmKind,
};
use anyhow::Result;
use saferl_core::{
    Algorithm, TrainingSummary, config::Config, env::EnvBuilderTrait, rng::random_seed,
};
use std::path::Path;

/// Entry point for training and evaluating a registered algorithm on a registered env.
pub struct Agent {
    algo: AlgorithmKind,
    env_id: String,
    cfgs: Config,
    algorithm: Box<dyn Algorithm>,
}

impl Agent {
    /// `custom_cfgs` is merged into the default configuration of `algo`.
    pub fn new(algo: &str, env_id: &str, custom_cfgs: Option<serde_yaml::Value>) -> Result<Self> {
        let algo: AlgorithmKind = algo.parse()?;
        let cfgs = algo.config(custom_cfgs)?;
        Self::with_config(algo, env_id, cfgs)
    }

    pub fn with_config(algo: AlgorithmKind, env_id: &str, cfgs: Config) -> Result<Self> {
        let env_builder = saferl_envs::make(env_id)?;
        let algorithm = algo.build(env_id, &env_builder, cfgs.clone())?;
        Ok(Self {
            algo,
            env_id: env_id.to_owned(),
            cfgs,
            algorithm,
        })
    }

    pub fn algo(&self) -> AlgorithmKind {
        self.algo
    }

    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    pub fn cfgs(&self) -> &Config {
        &self.cfgs
    }

    pub fn learn(&mut self) -> Result<TrainingSummary> {
        self.algorithm.learn()
    }

    pub fn load_checkpoint(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        self.algorithm.load_checkpoint(dir.as_ref())
    }

    /// Plays `episodes` deterministic episodes on a fresh env instance.
    pub fn evaluate(&self, episodes: usize) -> Result<EvaluationSummary> {
        let env = saferl_envs::make(&self.env_id)?.build_env()?;
        let mut evaluator = Evaluator::new(env, random_seed());
        evaluator.evaluate(self.algorithm.as_ref(), episodes, true)
    }
}

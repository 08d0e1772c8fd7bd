use anyhow::Result;
use saferl_agents::{PPO, PPOEarlyTerminated};
use saferl_core::{Algorithm, SafeRlError, adapter::NoHooks, config::Config};
use saferl_envs::EnvBuilder;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    PPO,
    PPOEarlyTerminated,
}

pub const ALGORITHMS: [AlgorithmKind; 2] = [AlgorithmKind::PPO, AlgorithmKind::PPOEarlyTerminated];

impl AlgorithmKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PPO => "PPO",
            Self::PPOEarlyTerminated => "PPOEarlyTerminated",
        }
    }

    /// Default hyper-parameters as YAML.
    pub fn default_config(&self) -> &'static str {
        match self {
            Self::PPO => include_str!("configs/ppo.yaml"),
            Self::PPOEarlyTerminated => include_str!("configs/ppo_early_terminated.yaml"),
        }
    }

    /// Default configuration with `custom_cfgs` merged on top.
    pub fn config(&self, custom_cfgs: Option<serde_yaml::Value>) -> Result<Config> {
        Config::from_yaml_with_overrides(self.default_config(), custom_cfgs)
    }

    pub fn build(
        &self,
        env_id: &str,
        env_builder: &EnvBuilder,
        cfgs: Config,
    ) -> Result<Box<dyn Algorithm>> {
        let algorithm: Box<dyn Algorithm> = match self {
            Self::PPO => Box::new(PPO::<_, NoHooks>::new(env_id, env_builder, cfgs)?),
            Self::PPOEarlyTerminated => {
                Box::new(PPOEarlyTerminated::new(env_id, env_builder, cfgs)?)
            }
        };
        Ok(algorithm)
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AlgorithmKind {
    type Err = SafeRlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALGORITHMS
            .into_iter()
            .find(|algo| algo.name() == s)
            .ok_or_else(|| SafeRlError::UnknownAlgorithm {
                name: s.to_owned(),
                supported: ALGORITHMS.map(|algo| algo.name()).join(", "),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names() -> Result<()> {
        for algo in ALGORITHMS {
            assert_eq!(algo.name().parse::<AlgorithmKind>()?, algo);
        }
        assert!(matches!(
            "CPO".parse::<AlgorithmKind>(),
            Err(SafeRlError::UnknownAlgorithm { .. })
        ));
        Ok(())
    }

    #[test]
    fn default_configs_are_valid() -> Result<()> {
        let ppo = AlgorithmKind::PPO.config(None)?;
        assert_eq!(ppo.algo_cfgs.cost_limit, None);
        let early_terminated = AlgorithmKind::PPOEarlyTerminated.config(None)?;
        assert_eq!(early_terminated.algo_cfgs.cost_limit, Some(25.));
        assert!(early_terminated.algo_cfgs.use_cost);
        assert_eq!(early_terminated.epochs(), 500);
        Ok(())
    }
}

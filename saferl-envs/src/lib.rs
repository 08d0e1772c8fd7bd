pub mod cart_pole;
pub mod point_goal;
#[cfg(feature = "safety-gymnasium")]
pub mod safety_gym;

use anyhow::Result;
use saferl_core::{
    SafeRlError,
    env::{Env, EnvBuilderTrait},
};

pub use cart_pole::SafeCartPole;
pub use point_goal::SafePointGoal;

pub const SAFE_POINT_GOAL: &str = "SafePointGoal-v0";
pub const SAFE_CART_POLE: &str = "SafeCartPole-v0";

/// Ids of the environments shipped with the crate.
pub const ENV_IDS: [&str; 2] = [SAFE_POINT_GOAL, SAFE_CART_POLE];

pub type DynEnv = Box<dyn Env>;

/// Builds fresh instances of a registered environment.
#[derive(Debug, Clone)]
pub struct EnvBuilder {
    env_id: String,
}

impl EnvBuilder {
    pub fn env_id(&self) -> &str {
        &self.env_id
    }
}

impl EnvBuilderTrait for EnvBuilder {
    type Env = DynEnv;

    fn build_env(&self) -> Result<DynEnv> {
        match self.env_id.as_str() {
            SAFE_POINT_GOAL => Ok(Box::new(SafePointGoal::new())),
            SAFE_CART_POLE => Ok(Box::new(SafeCartPole::new())),
            #[cfg(feature = "safety-gymnasium")]
            env_id => Ok(Box::new(safety_gym::SafetyGymEnv::new(env_id)?)),
            #[cfg(not(feature = "safety-gymnasium"))]
            env_id => Err(unknown_env(env_id).into()),
        }
    }
}

fn unknown_env(env_id: &str) -> SafeRlError {
    SafeRlError::UnknownEnv {
        name: env_id.to_owned(),
        supported: ENV_IDS.join(", "),
    }
}

/// Looks up `env_id`. Without the `safety-gymnasium` feature only [`ENV_IDS`] are known,
/// with it every other id is forwarded to `safety_gymnasium.make`.
pub fn make(env_id: &str) -> Result<EnvBuilder> {
    if !ENV_IDS.contains(&env_id) && !cfg!(feature = "safety-gymnasium") {
        return Err(unknown_env(env_id).into());
    }
    Ok(EnvBuilder {
        env_id: env_id.to_owned(),
    })
}

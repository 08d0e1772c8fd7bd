use anyhow::{Result, bail};
use pyo3::{
    PyObject, Python,
    types::{PyAnyMethods, PyDict},
};
use saferl_core::{
    env::{Env, EnvironmentDescription, SnapShot, Space},
    tensor::RawTensor,
};

/// Environment living in the `safety_gymnasium` python package.
pub struct SafetyGymEnv {
    env: PyObject,
    action_space: Space,
    observation_space: Space,
}

impl SafetyGymEnv {
    pub fn new(name: &str) -> Result<Self> {
        Python::with_gil(|py| {
            let safety_gymnasium = py.import("safety_gymnasium")?;
            let env = safety_gymnasium.getattr("make")?.call1((name,))?;
            let spaces = py.import("gymnasium.spaces")?;
            let action_space = env.getattr("action_space")?;
            let action_space = if action_space.is_instance(&spaces.getattr("Discrete")?)? {
                Space::Discrete(action_space.getattr("n")?.extract()?)
            } else if action_space.is_instance(&spaces.getattr("Box")?)? {
                let low: Vec<f32> = action_space.getattr("low")?.extract()?;
                let high: Vec<f32> = action_space.getattr("high")?.extract()?;
                Space::bounded(low, high)
            } else {
                bail!("{name}: only Discrete and Box action spaces are supported");
            };
            let shape: Vec<usize> = env
                .getattr("observation_space")?
                .getattr("shape")?
                .extract()?;
            log::debug!("created {name} with observation shape {shape:?}");
            Ok(Self {
                env: env.into(),
                action_space,
                observation_space: Space::continous_from_dims(shape),
            })
        })
    }
}

impl Env for SafetyGymEnv {
    fn reset(&mut self, seed: u64) -> Result<RawTensor> {
        Python::with_gil(|py| {
            let kwargs = PyDict::new(py);
            kwargs.set_item("seed", seed)?;
            let out = self.env.call_method(py, "reset", (), Some(&kwargs))?;
            let state: Vec<f32> = out.bind(py).get_item(0)?.extract()?;
            Ok(RawTensor::from_vec(state))
        })
    }

    fn step(&mut self, action: &RawTensor) -> Result<SnapShot> {
        Python::with_gil(|py| {
            let out = match &self.action_space {
                Space::Discrete(_) => self
                    .env
                    .call_method1(py, "step", (action.argmax(),))?,
                Space::Continous { .. } => self
                    .env
                    .call_method1(py, "step", (action.data.clone(),))?,
            };
            // (obs, reward, cost, terminated, truncated, info)
            let out = out.bind(py);
            let state: Vec<f32> = out.get_item(0)?.extract()?;
            Ok(SnapShot {
                state: RawTensor::from_vec(state),
                reward: out.get_item(1)?.extract()?,
                cost: out.get_item(2)?.extract()?,
                terminated: out.get_item(3)?.extract()?,
                truncated: out.get_item(4)?.extract()?,
            })
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(self.observation_space.clone(), self.action_space.clone())
    }
}

use anyhow::{Result, bail};
use rand::{Rng, SeedableRng, rngs::StdRng};
use saferl_core::{
    env::{Env, EnvironmentDescription, SnapShot, Space},
    tensor::RawTensor,
};

const GRAVITY: f32 = 9.8;
const MASS_CART: f32 = 1.;
const MASS_POLE: f32 = 0.1;
const HALF_POLE_LENGTH: f32 = 0.5;
const FORCE_MAG: f32 = 10.;
const TAU: f32 = 0.02;
const THETA_THRESHOLD: f32 = 12. * 2. * std::f32::consts::PI / 360.;
const X_THRESHOLD: f32 = 2.4;
/// Carts further than this from the center pay a cost of 1 per step.
pub const SAFE_BAND: f32 = 1.;
pub const HORIZON: usize = 500;

/// Classic cart-pole balancing with a central safe band for the cart.
#[derive(Debug, Clone)]
pub struct SafeCartPole {
    rng: StdRng,
    state: [f32; 4],
    steps: usize,
}

impl Default for SafeCartPole {
    fn default() -> Self {
        Self::new()
    }
}

impl SafeCartPole {
    pub fn new() -> Self {
        Self {
            rng: StdRng::seed_from_u64(0),
            state: [0.; 4],
            steps: 0,
        }
    }

    pub fn with_state(state: [f32; 4]) -> Self {
        Self {
            state,
            ..Self::new()
        }
    }

    fn observation(&self) -> RawTensor {
        RawTensor::from_vec(self.state.to_vec())
    }
}

impl Env for SafeCartPole {
    fn reset(&mut self, seed: u64) -> Result<RawTensor> {
        self.rng = StdRng::seed_from_u64(seed);
        self.steps = 0;
        for value in self.state.iter_mut() {
            *value = self.rng.random_range(-0.05..0.05);
        }
        Ok(self.observation())
    }

    fn step(&mut self, action: &RawTensor) -> Result<SnapShot> {
        if action.len() != 2 {
            bail!("SafeCartPole expects one-hot actions of size 2, got {}", action.len());
        }
        let force = if action.argmax() == 1 {
            FORCE_MAG
        } else {
            -FORCE_MAG
        };
        let [x, x_dot, theta, theta_dot] = self.state;
        let total_mass = MASS_CART + MASS_POLE;
        let pole_mass_length = MASS_POLE * HALF_POLE_LENGTH;
        let (sin, cos) = theta.sin_cos();
        let temp = (force + pole_mass_length * theta_dot.powi(2) * sin) / total_mass;
        let theta_acc = (GRAVITY * sin - cos * temp)
            / (HALF_POLE_LENGTH * (4. / 3. - MASS_POLE * cos.powi(2) / total_mass));
        let x_acc = temp - pole_mass_length * theta_acc * cos / total_mass;
        self.state = [
            x + TAU * x_dot,
            x_dot + TAU * x_acc,
            theta + TAU * theta_dot,
            theta_dot + TAU * theta_acc,
        ];
        self.steps += 1;

        let [x, _, theta, _] = self.state;
        let terminated = x.abs() > X_THRESHOLD || theta.abs() > THETA_THRESHOLD;
        Ok(SnapShot {
            state: self.observation(),
            reward: 1.,
            cost: if x.abs() > SAFE_BAND { 1. } else { 0. },
            terminated,
            truncated: !terminated && self.steps >= HORIZON,
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(Space::continous_from_dims(vec![4]), Space::Discrete(2))
    }
}

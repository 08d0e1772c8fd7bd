use anyhow::{Result, bail};
use rand::{Rng, SeedableRng, rngs::StdRng};
use saferl_core::{
    env::{Env, EnvironmentDescription, SnapShot, Space},
    tensor::RawTensor,
};

const ARENA: f32 = 1.5;
const MAX_SPEED: f32 = 0.05;
const GOAL_RADIUS: f32 = 0.1;
const GOAL_BONUS: f32 = 1.;
const HAZARD_RADIUS: f32 = 0.3;
pub const HORIZON: usize = 250;

/// Point robot on a plane that has to reach a goal while a hazard disc sits in between.
///
/// Observations are `[x, y, goal_dx, goal_dy, hazard_dx, hazard_dy]`, actions are velocities
/// in `[-1, 1]^2` scaled by the maximal speed. The reward is the progress towards the goal
/// plus a bonus on arrival, which terminates the episode. Every step spent inside the hazard
/// costs 1.
#[derive(Debug, Clone)]
pub struct SafePointGoal {
    rng: StdRng,
    position: [f32; 2],
    goal: [f32; 2],
    hazard: [f32; 2],
    steps: usize,
}

fn distance(a: [f32; 2], b: [f32; 2]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

impl Default for SafePointGoal {
    fn default() -> Self {
        Self::new()
    }
}

impl SafePointGoal {
    pub fn new() -> Self {
        Self {
            rng: StdRng::seed_from_u64(0),
            position: [0.; 2],
            goal: [1.; 2],
            hazard: [0.5; 2],
            steps: 0,
        }
    }

    pub fn with_layout(position: [f32; 2], goal: [f32; 2], hazard: [f32; 2]) -> Self {
        Self {
            position,
            goal,
            hazard,
            ..Self::new()
        }
    }

    fn observation(&self) -> RawTensor {
        let [x, y] = self.position;
        RawTensor::from_vec(vec![
            x,
            y,
            self.goal[0] - x,
            self.goal[1] - y,
            self.hazard[0] - x,
            self.hazard[1] - y,
        ])
    }

    fn in_hazard(&self) -> bool {
        distance(self.position, self.hazard) < HAZARD_RADIUS
    }
}

impl Env for SafePointGoal {
    fn reset(&mut self, seed: u64) -> Result<RawTensor> {
        self.rng = StdRng::seed_from_u64(seed);
        self.steps = 0;
        self.position = [
            self.rng.random_range(-ARENA..-0.5),
            self.rng.random_range(-ARENA..-0.5),
        ];
        self.goal = [
            self.rng.random_range(0.5..ARENA),
            self.rng.random_range(0.5..ARENA),
        ];
        // the hazard blocks the straight line between start and goal
        let t = self.rng.random_range(0.3..0.7);
        self.hazard = [
            self.position[0] + t * (self.goal[0] - self.position[0]),
            self.position[1] + t * (self.goal[1] - self.position[1]),
        ];
        Ok(self.observation())
    }

    fn step(&mut self, action: &RawTensor) -> Result<SnapShot> {
        if action.len() != 2 {
            bail!("SafePointGoal expects 2 dimensional actions, got {}", action.len());
        }
        let before = distance(self.position, self.goal);
        for (coord, velocity) in self.position.iter_mut().zip(action.data.iter()) {
            *coord = (*coord + velocity.clamp(-1., 1.) * MAX_SPEED).clamp(-ARENA, ARENA);
        }
        self.steps += 1;
        let after = distance(self.position, self.goal);
        let reached = after < GOAL_RADIUS;
        let reward = before - after + if reached { GOAL_BONUS } else { 0. };
        let cost = if self.in_hazard() { 1. } else { 0. };
        Ok(SnapShot {
            state: self.observation(),
            reward,
            cost,
            terminated: reached,
            truncated: !reached && self.steps >= HORIZON,
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(
            Space::continous_from_dims(vec![6]),
            Space::bounded(vec![-1.; 2], vec![1.; 2]),
        )
    }
}

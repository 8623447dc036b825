//! Key-and-door grid world
//!
//! A sparse-reward navigation task in the spirit of MiniGrid's DoorKey:
//! the grid is split by a vertical wall with a single locked door. The agent
//! starts in the left room, must walk over the key to pick it up, pass
//! through the door and reach the goal in the bottom-right corner.
//!
//! # Observation
//!
//! Five one-hot planes over the full `size x size` grid (agent, key, closed
//! door, goal, wall), flattened, followed by one `has_key` flag.
//!
//! # Reward
//!
//! `1 - 0.9 * steps / max_steps` on reaching the goal, zero otherwise.
//! Episodes are truncated after `10 * size * size` steps.

use anyhow::{Result, bail};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::env::wrappers::GridPosition;
use crate::env::{Environment, SpaceInfo, StepInfo, StepResult};

const NUM_PLANES: usize = 5;
const PLANE_AGENT: usize = 0;
const PLANE_KEY: usize = 1;
const PLANE_DOOR: usize = 2;
const PLANE_GOAL: usize = 3;
const PLANE_WALL: usize = 4;

/// Key-and-door grid world
#[derive(Debug, Clone)]
pub struct KeyDoorGrid {
    size: usize,
    max_steps: usize,
    rng: StdRng,

    agent: (usize, usize),
    key: Option<(usize, usize)>,
    door: (usize, usize),
    door_open: bool,
    goal: (usize, usize),
    has_key: bool,
    steps: usize,
}

impl KeyDoorGrid {
    /// Create a grid of side `size` (at least 5) seeded with `seed`
    pub fn new(size: usize, seed: u64) -> Self {
        let size = size.max(5);
        let wall_col = size / 2;
        let mut env = Self {
            size,
            max_steps: 10 * size * size,
            rng: StdRng::seed_from_u64(seed),
            agent: (1, 1),
            key: None,
            door: (1, wall_col),
            door_open: false,
            goal: (size - 2, size - 2),
            has_key: false,
            steps: 0,
        };
        env.layout();
        env
    }

    /// Override the episode step limit
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Length of the flat observation vector
    pub fn obs_dim(&self) -> usize {
        NUM_PLANES * self.size * self.size + 1
    }

    fn wall_col(&self) -> usize {
        self.size / 2
    }

    fn is_wall(&self, (row, col): (usize, usize)) -> bool {
        row == 0
            || col == 0
            || row == self.size - 1
            || col == self.size - 1
            || (col == self.wall_col() && (row, col) != self.door)
    }

    fn layout(&mut self) {
        let wall_col = self.wall_col();
        let inner = 1..self.size - 1;

        let door_row = self.rng.gen_range(inner.clone());
        self.door = (door_row, wall_col);
        self.door_open = false;
        self.has_key = false;
        self.steps = 0;

        // Agent and key both live in the left room, on different cells
        let left_cols = 1..wall_col;
        self.agent = (self.rng.gen_range(inner.clone()), self.rng.gen_range(left_cols.clone()));
        let mut key = self.agent;
        while key == self.agent {
            key = (self.rng.gen_range(inner.clone()), self.rng.gen_range(left_cols.clone()));
        }
        self.key = Some(key);
    }

    fn observation(&self) -> Vec<f32> {
        let cells = self.size * self.size;
        let mut obs = vec![0.0; self.obs_dim()];
        let index =
            |plane: usize, (row, col): (usize, usize)| plane * cells + row * self.size + col;

        obs[index(PLANE_AGENT, self.agent)] = 1.0;
        if let Some(key) = self.key {
            obs[index(PLANE_KEY, key)] = 1.0;
        }
        if !self.door_open {
            obs[index(PLANE_DOOR, self.door)] = 1.0;
        }
        obs[index(PLANE_GOAL, self.goal)] = 1.0;
        for row in 0..self.size {
            for col in 0..self.size {
                if self.is_wall((row, col)) {
                    obs[index(PLANE_WALL, (row, col))] = 1.0;
                }
            }
        }
        obs[NUM_PLANES * cells] = if self.has_key { 1.0 } else { 0.0 };
        obs
    }
}

impl Environment for KeyDoorGrid {
    fn reset(&mut self) -> Result<Vec<f32>> {
        self.layout();
        Ok(self.observation())
    }

    fn step(&mut self, action: i64) -> Result<StepResult> {
        let (row, col) = self.agent;
        let target = match action {
            0 => (row - 1, col),
            1 => (row + 1, col),
            2 => (row, col - 1),
            3 => (row, col + 1),
            _ => bail!("action {action} out of range for KeyDoorGrid"),
        };

        self.steps += 1;

        if target == self.door && !self.door_open {
            if self.has_key {
                self.door_open = true;
                self.agent = target;
            }
        } else if !self.is_wall(target) {
            self.agent = target;
        }

        if self.key == Some(self.agent) {
            self.key = None;
            self.has_key = true;
        }

        let reached_goal = self.agent == self.goal;
        let reward = if reached_goal {
            1.0 - 0.9 * (self.steps as f32 / self.max_steps as f32)
        } else {
            0.0
        };

        Ok(StepResult {
            observation: self.observation(),
            reward,
            terminated: reached_goal,
            truncated: !reached_goal && self.steps >= self.max_steps,
            info: StepInfo::default(),
        })
    }

    fn observation_space(&self) -> SpaceInfo {
        SpaceInfo::vector(self.obs_dim())
    }

    fn action_space(&self) -> SpaceInfo {
        SpaceInfo::discrete(4)
    }
}

impl GridPosition for KeyDoorGrid {
    fn position(&self) -> (usize, usize) {
        self.agent
    }

    /// Interior cells, counting the whole dividing column since the door
    /// moves between episodes
    fn num_cells(&self) -> usize {
        (self.size - 2) * (self.size - 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_shape() {
        let mut env = KeyDoorGrid::new(6, 0);
        let obs = env.reset().unwrap();
        assert_eq!(obs.len(), 5 * 36 + 1);
        // Agent, key, door, goal and at least the border walls
        assert!(obs.iter().filter(|&&v| v == 1.0).count() > 4 + 4 * 5);
    }

    #[test]
    fn test_walls_block_movement() {
        let mut env = KeyDoorGrid::new(6, 1);
        env.reset().unwrap();
        env.agent = (1, 1);
        env.key = Some((2, 2));

        // Moving up from row 1 hits the border
        env.step(0).unwrap();
        assert_eq!(env.agent, (1, 1));
        env.step(2).unwrap();
        assert_eq!(env.agent, (1, 1));
    }

    #[test]
    fn test_locked_door_needs_key() {
        let mut env = KeyDoorGrid::new(6, 2);
        env.reset().unwrap();
        let door = env.door;
        env.agent = (door.0, door.1 - 1);
        env.key = Some((if door.0 == 1 { 2 } else { 1 }, 1));

        env.step(3).unwrap();
        assert_eq!(env.agent, (door.0, door.1 - 1), "door should stay locked");

        env.has_key = true;
        env.key = None;
        env.step(3).unwrap();
        assert_eq!(env.agent, door);
        assert!(env.door_open);
    }

    #[test]
    fn test_goal_pays_reward() {
        let mut env = KeyDoorGrid::new(6, 3);
        env.reset().unwrap();
        env.door_open = true;
        env.agent = (env.goal.0 - 1, env.goal.1);

        let result = env.step(1).unwrap();
        assert!(result.terminated);
        assert!(result.reward > 0.9);
    }

    #[test]
    fn test_truncation() {
        let mut env = KeyDoorGrid::new(6, 4).with_max_steps(3);
        env.reset().unwrap();
        env.step(0).unwrap();
        env.step(0).unwrap();
        let last = env.step(0).unwrap();
        assert!(last.truncated);
        assert!(!last.terminated);
    }
}

//! Segment collection against a scripted environment pool
//!
//! Two `Countdown` environments: env 0 ends its episode every 4 steps,
//! env 1 every 10. With 4 steps per segment, env 0's episode ends exactly on
//! the last transition of the first segment.

use anyhow::Result;
use disagree_rl::buffer::rollout::{
    ActOutput, SegmentCollector, SegmentPolicy, compute_advantages,
};
use disagree_rl::env::countdown::Countdown;
use disagree_rl::env::pool::EnvPool;

/// Always picks action 1; the value of an observation is `10 * steps_taken`
struct Scripted {
    calls: usize,
}

impl SegmentPolicy for Scripted {
    fn act(&mut self, observations: &[Vec<f32>]) -> Result<ActOutput> {
        self.calls += 1;
        Ok(ActOutput {
            actions: vec![1; observations.len()],
            values: observations.iter().map(|o| 10.0 * o[0]).collect(),
            log_probs: vec![-0.5; observations.len()],
        })
    }

    fn value(&mut self, observations: &[Vec<f32>]) -> Result<Vec<f32>> {
        Ok(observations.iter().map(|o| 10.0 * o[0]).collect())
    }
}

fn collector() -> SegmentCollector<Countdown> {
    let pool =
        EnvPool::new(|i| Ok(Countdown::new(i, if i == 0 { 4 } else { 10 })), 2, 1).unwrap();
    SegmentCollector::new(pool, 4).unwrap()
}

#[test]
fn test_first_segment_layout() {
    let mut collector = collector();
    let mut policy = Scripted { calls: 0 };
    collector.collect_segment(&mut policy).unwrap();

    let buffer = collector.buffer();
    assert_eq!(buffer.len(), 8);
    assert_eq!(buffer.shape(), (4, 2, 2));
    assert_eq!(policy.calls, 4);

    // Step-major, env-minor
    assert_eq!(buffer.observations()[0][0], vec![0.0, 0.0]);
    assert_eq!(buffer.observations()[0][1], vec![0.0, 1.0]);
    assert_eq!(buffer.observations()[3][1], vec![3.0, 1.0]);
    assert!(buffer.actions().iter().flatten().all(|&a| a == 1));
    assert!(buffer.ext_rewards().iter().flatten().all(|&r| r == 1.0));

    // Env 0 finished on its 4th transition, env 1 did not
    let dones: Vec<bool> = buffer.dones().iter().map(|row| row[0]).collect();
    assert_eq!(dones, vec![false, false, false, true]);
    assert!(buffer.dones().iter().all(|row| !row[1]));
    assert_eq!(buffer.num_dones(), 1);

    // The stored successor of the final transition is the terminal
    // observation, not the reset one
    assert_eq!(buffer.next_observations()[3][0], vec![4.0, 0.0]);
    assert_eq!(buffer.next_observations()[3][1], vec![4.0, 1.0]);

    // Env 0 was reset, env 1 carries on
    assert_eq!(collector.current_observations()[0], vec![0.0, 0.0]);
    assert_eq!(collector.current_observations()[1], vec![4.0, 1.0]);
    assert_eq!(collector.buffer().last_values(), &[0.0, 40.0]);

    let stats = collector.stats();
    assert_eq!(stats.tcount, 8);
    assert_eq!(stats.episodes, 1);
    assert_eq!(stats.best_ext_ret, Some(4.0));
    assert_eq!(stats.mean_recent_length(), Some(4.0));
}

#[test]
fn test_next_segment_continues_streams() {
    let mut collector = collector();
    let mut policy = Scripted { calls: 0 };
    collector.collect_segment(&mut policy).unwrap();
    collector.collect_segment(&mut policy).unwrap();

    let buffer = collector.buffer();
    assert_eq!(buffer.observations()[0][0], vec![0.0, 0.0]);
    assert_eq!(buffer.observations()[0][1], vec![4.0, 1.0]);
    assert_eq!(collector.segments(), 2);
    assert_eq!(collector.stats().tcount, 16);
    assert_eq!(collector.stats().episodes, 2);
}

#[test]
fn test_advantages_respect_episode_boundary() {
    let mut collector = collector();
    let mut policy = Scripted { calls: 0 };
    collector.collect_segment(&mut policy).unwrap();

    let rewards = collector.buffer().ext_rewards().to_vec();
    let buffer = collector.buffer_mut();
    compute_advantages(buffer, &rewards, 0.5, 1.0, true);

    // Env 0 at t=3: done, so no bootstrap: A = r - V = 1 - 30
    assert!((buffer.advantages()[3][0] - (1.0 - 30.0)).abs() < 1e-5);
    // Env 1 at t=3: bootstraps from last value 40: A = 1 + 0.5 * 40 - 30
    assert!((buffer.advantages()[3][1] - (1.0 + 20.0 - 30.0)).abs() < 1e-5);
    // Returns are advantages plus values
    assert!((buffer.returns()[3][1] - 1.0 - 20.0).abs() < 1e-5);
}

#[test]
fn test_environment_failure_propagates() {
    let pool = EnvPool::new(|i| Ok(Countdown::new(i, 4).fail_at_step(2)), 2, 1).unwrap();
    let mut collector = SegmentCollector::new(pool, 4).unwrap();
    let err = collector.collect_segment(&mut Scripted { calls: 0 }).unwrap_err();
    assert!(format!("{err:#}").contains("scripted failure"));
}

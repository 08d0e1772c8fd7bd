//! Process topology of a training run.
//!
//! Several processes can train the same experiment side by side, each one
//! collecting a slice of the epoch. The launcher communicates the topology
//! through the `WORLD_SIZE` and `RANK` environment variables, nothing is
//! exchanged between the processes here.

use crate::error::SafeRlError;
use anyhow::Result;

pub const WORLD_SIZE_VAR: &str = "WORLD_SIZE";
pub const RANK_VAR: &str = "RANK";

/// Seed offset between two neighbouring ranks.
pub const RANK_SEED_OFFSET: u64 = 1000;

fn parse_var(var: &'static str, value: Option<&str>, default: usize) -> Result<usize> {
    match value {
        None => Ok(default),
        Some(value) => value.trim().parse::<usize>().map_err(|_| {
            SafeRlError::InvalidDistributed {
                var,
                value: value.to_owned(),
            }
            .into()
        }),
    }
}

pub fn parse_world_size(value: Option<&str>) -> Result<usize> {
    let world_size = parse_var(WORLD_SIZE_VAR, value, 1)?;
    if world_size == 0 {
        return Err(SafeRlError::InvalidDistributed {
            var: WORLD_SIZE_VAR,
            value: "0".to_owned(),
        }
        .into());
    }
    Ok(world_size)
}

pub fn parse_rank(value: Option<&str>, world_size: usize) -> Result<usize> {
    let rank = parse_var(RANK_VAR, value, 0)?;
    if rank >= world_size {
        return Err(SafeRlError::InvalidDistributed {
            var: RANK_VAR,
            value: rank.to_string(),
        }
        .into());
    }
    Ok(rank)
}

/// Number of processes taking part in the run.
pub fn world_size() -> Result<usize> {
    parse_world_size(std::env::var(WORLD_SIZE_VAR).ok().as_deref())
}

/// Index of the current process.
pub fn get_rank() -> Result<usize> {
    let world_size = world_size()?;
    parse_rank(std::env::var(RANK_VAR).ok().as_deref(), world_size)
}

/// Seed used by a given rank, so that processes do not collect the same trajectories.
pub fn rank_seed(seed: u64, rank: usize) -> u64 {
    seed.wrapping_add(RANK_SEED_OFFSET * rank as u64)
}

/// Splits the epoch step budget between processes and vectorized envs.
///
/// Every process steps `vector_env_nums` environments, so each environment
/// contributes `steps_per_epoch / world_size / vector_env_nums` steps. The budget
/// has to split evenly, otherwise buffers of different processes would disagree
/// on the epoch length.
pub fn steps_per_process(
    steps_per_epoch: usize,
    world_size: usize,
    vector_env_nums: usize,
) -> Result<usize> {
    if world_size == 0 || vector_env_nums == 0 {
        return Err(SafeRlError::InvalidConfig(format!(
            "world size ({world_size}) and vector_env_nums ({vector_env_nums}) must be positive"
        ))
        .into());
    }
    if steps_per_epoch % (world_size * vector_env_nums) != 0 {
        return Err(SafeRlError::StepsNotDivisible {
            steps_per_epoch,
            world_size,
            vector_env_nums,
        }
        .into());
    }
    Ok(steps_per_epoch / world_size / vector_env_nums)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_evenly() -> Result<()> {
        assert_eq!(steps_per_process(20000, 1, 1)?, 20000);
        assert_eq!(steps_per_process(20000, 2, 4)?, 2500);
        assert_eq!(steps_per_process(64, 4, 16)?, 1);
        Ok(())
    }

    #[test]
    fn rejects_uneven_split() {
        let err = steps_per_process(1000, 3, 1).unwrap_err();
        match err.downcast_ref::<SafeRlError>() {
            Some(SafeRlError::StepsNotDivisible {
                steps_per_epoch,
                world_size,
                vector_env_nums,
            }) => {
                assert_eq!(*steps_per_epoch, 1000);
                assert_eq!(*world_size, 3);
                assert_eq!(*vector_env_nums, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
        // divisible by each factor but not by their product
        assert!(steps_per_process(20, 4, 10).is_err());
    }

    #[test]
    fn rejects_zero_divisors() {
        assert!(steps_per_process(100, 0, 1).is_err());
        assert!(steps_per_process(100, 1, 0).is_err());
    }

    #[test]
    fn parses_topology() -> Result<()> {
        assert_eq!(parse_world_size(None)?, 1);
        assert_eq!(parse_world_size(Some(" 4 "))?, 4);
        assert!(parse_world_size(Some("0")).is_err());
        assert!(parse_world_size(Some("four")).is_err());
        assert_eq!(parse_rank(None, 4)?, 0);
        assert_eq!(parse_rank(Some("3"), 4)?, 3);
        assert!(parse_rank(Some("4"), 4).is_err());
        Ok(())
    }

    #[test]
    fn seeds_differ_per_rank() {
        assert_eq!(rank_seed(5, 0), 5);
        assert_eq!(rank_seed(5, 2), 2005);
    }
}

use anyhow::Result;
use clap::Parser;
use saferl_api::{Agent, AlgorithmKind};
use saferl_core::config::{Config, recursive_update};
use serde_yaml::{Mapping, Value};

/// Train a safe RL policy on one of the registered environments
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Algorithm name (PPO, PPOEarlyTerminated)
    #[arg(long, default_value = "PPOEarlyTerminated")]
    algo: String,

    /// Environment id (SafePointGoal-v0, SafeCartPole-v0)
    #[arg(long, default_value = "SafePointGoal-v0")]
    env_id: String,

    /// YAML file merged into the default configuration of the algorithm
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    vector_env_nums: Option<usize>,

    #[arg(long)]
    total_steps: Option<usize>,

    #[arg(long)]
    log_dir: Option<String>,

    /// Episodes played with the trained policy
    #[arg(long, default_value_t = 0)]
    eval_episodes: usize,
}

fn set(overrides: &mut Value, group: Option<&str>, key: &str, value: Value) {
    let entry = Value::Mapping(Mapping::from_iter([(Value::from(key), value)]));
    let entry = match group {
        Some(group) => Value::Mapping(Mapping::from_iter([(Value::from(group), entry)])),
        None => entry,
    };
    recursive_update(overrides, entry);
}

fn overrides(args: &Args) -> Result<Value> {
    let mut overrides = match args.config.as_ref() {
        Some(path) => serde_yaml::from_reader(std::fs::File::open(path)?)?,
        None => Value::Mapping(Mapping::new()),
    };
    if let Some(seed) = args.seed {
        set(&mut overrides, None, "seed", Value::from(seed));
    }
    if let Some(vector_env_nums) = args.vector_env_nums {
        let value = Value::from(vector_env_nums as u64);
        set(&mut overrides, Some("train_cfgs"), "vector_env_nums", value);
    }
    if let Some(total_steps) = args.total_steps {
        let value = Value::from(total_steps as u64);
        set(&mut overrides, Some("train_cfgs"), "total_steps", value);
    }
    if let Some(log_dir) = args.log_dir.as_ref() {
        let value = Value::from(log_dir.as_str());
        set(&mut overrides, Some("logger_cfgs"), "log_dir", value);
    }
    Ok(overrides)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let algo: AlgorithmKind = args.algo.parse()?;
    let cfgs: Config = algo.config(Some(overrides(&args)?))?;
    let mut agent = Agent::with_config(algo, &args.env_id, cfgs)?;
    let summary = agent.learn()?;
    log::info!(
        "{} on {}: EpRet {:.3}, EpCost {:.3}, EpLen {:.1} after {} epochs",
        algo,
        args.env_id,
        summary.ep_ret,
        summary.ep_cost,
        summary.ep_len,
        summary.epochs
    );
    if args.eval_episodes > 0 {
        let evaluation = agent.evaluate(args.eval_episodes)?;
        log::info!(
            "evaluation: return {:.3}, cost {:.3}, length {:.1}",
            evaluation.mean_return(),
            evaluation.mean_cost(),
            evaluation.mean_length()
        );
    }
    Ok(())
}

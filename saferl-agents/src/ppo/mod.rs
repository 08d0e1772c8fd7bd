pub mod ppo_early_terminated;

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rayon::ThreadPool;
use saferl_candle_lm::{
    ConstraintActorCritic,
    distributions::Actor,
    tensors::{Logp, LogpDiff, PolicyLoss, ValueLoss},
};
use saferl_core::{
    Algorithm, TrainingSummary,
    actor_critic::ActorCritic,
    adapter::{AdapterHooks, NoHooks, OnPolicyAdapter},
    buffers::{RolloutData, VectorOnPolicyBuffer},
    config::Config,
    distributed,
    env::{Env, EnvBuilderTrait, EnvironmentDescription},
    logger::{EpochLogger, experiment_dir},
    on_policy_algorithm::{DefaultTrainingHooks, HookResult, TrainingHooks},
    process_hook_result,
    rng::{RNG, seed_rng},
    tensor::{RawTensor, stack_raw},
};
use std::{path::Path, time::Instant};

/// What tells the PPO family members apart: the adapter they collect data with (through
/// [`AdapterHooks::init_env`]) and the advantage the actor maximizes.
pub trait PPOVariant: AdapterHooks {
    const NAME: &'static str;

    fn surrogate_advantage(adv_r: &Tensor, _adv_c: &Tensor) -> Result<Tensor> {
        Ok(adv_r.clone())
    }
}

impl PPOVariant for NoHooks {
    const NAME: &'static str = "PPO";
}

/// Windowed episode metrics, every other key only covers the epoch it was stored in.
const EPISODE_KEYS: [&str; 3] = ["Metrics/EpRet", "Metrics/EpCost", "Metrics/EpLen"];

pub struct PPO<E: Env, H: PPOVariant = NoHooks> {
    env_id: String,
    cfgs: Config,
    seed: u64,
    world_size: usize,
    steps_per_epoch: usize,
    env: OnPolicyAdapter<E, H>,
    actor_critic: ConstraintActorCritic,
    buffer: VectorOnPolicyBuffer,
    logger: EpochLogger,
    hooks: Box<dyn TrainingHooks>,
    pool: ThreadPool,
    device: Device,
}

impl<E: Env, H: PPOVariant> PPO<E, H> {
    pub fn new<EB: EnvBuilderTrait<Env = E>>(
        env_id: &str,
        env_builder: &EB,
        cfgs: Config,
    ) -> Result<Self> {
        cfgs.validate()?;
        let world_size = distributed::world_size()?;
        let rank = distributed::get_rank()?;
        let seed = distributed::rank_seed(cfgs.seed, rank);
        seed_rng(seed);
        let device = cfgs.device()?;

        let (env, steps_per_epoch) = Self::init_env(env_builder, &cfgs, seed, world_size)?;
        let actor_critic =
            ConstraintActorCritic::build(env.env_description(), &cfgs, cfgs.epochs(), &device)?;
        let buffer = VectorOnPolicyBuffer::from_config(
            &cfgs,
            steps_per_epoch,
            env.env_description().observation_size(),
            env.env_description().action_size(),
            device.clone(),
        )?;
        let logger = Self::init_log(env_id, &cfgs, seed, rank)?;
        // rollouts sample actions on the pool threads, their rngs follow the process seed
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfgs.train_cfgs.torch_threads)
            .start_handler(move |_| seed_rng(seed))
            .build()?;
        log::info!(
            "{} on {env_id}: {} epochs, {steps_per_epoch} steps per env and epoch, world size {world_size}",
            H::NAME,
            cfgs.epochs()
        );
        Ok(Self {
            env_id: env_id.to_owned(),
            cfgs,
            seed,
            world_size,
            steps_per_epoch,
            env,
            actor_critic,
            buffer,
            logger,
            hooks: Box::new(DefaultTrainingHooks),
            pool,
            device,
        })
    }

    /// Builds the adapter of the variant and splits the epoch between processes and envs.
    /// Fails before anything is trained when the step budget does not split evenly.
    fn init_env<EB: EnvBuilderTrait<Env = E>>(
        env_builder: &EB,
        cfgs: &Config,
        seed: u64,
        world_size: usize,
    ) -> Result<(OnPolicyAdapter<E, H>, usize)> {
        let vector_env_nums = cfgs.train_cfgs.vector_env_nums;
        let env = H::init_env(env_builder, vector_env_nums, seed, cfgs)?;
        let steps_per_epoch = distributed::steps_per_process(
            cfgs.algo_cfgs.steps_per_epoch,
            world_size,
            vector_env_nums,
        )?;
        Ok((env, steps_per_epoch))
    }

    fn init_log(env_id: &str, cfgs: &Config, seed: u64, rank: usize) -> Result<EpochLogger> {
        let log_dir = cfgs.logger_cfgs.log_dir.trim();
        let mut logger = if rank == 0 && !log_dir.is_empty() {
            let dir = experiment_dir(log_dir, H::NAME, env_id, seed);
            let logger = EpochLogger::new(&dir)?;
            cfgs.save(dir.join("config.yaml"))?;
            log::info!("logging to {}", dir.display());
            logger
        } else {
            EpochLogger::in_memory()
        };
        for key in EPISODE_KEYS {
            logger.register_key(key, Some(cfgs.logger_cfgs.window_lens));
        }
        Ok(logger)
    }

    pub fn with_hooks(mut self, hooks: Box<dyn TrainingHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    pub fn cfgs(&self) -> &Config {
        &self.cfgs
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Steps each vectorized env of this process collects per epoch.
    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    pub fn adapter(&self) -> &OnPolicyAdapter<E, H> {
        &self.env
    }

    pub fn actor_critic(&self) -> &ConstraintActorCritic {
        &self.actor_critic
    }

    pub fn logger(&self) -> &EpochLogger {
        &self.logger
    }

    fn update(&mut self) -> Result<()> {
        let data = self.buffer.get()?;
        let algo = self.cfgs.algo_cfgs.clone();
        let old_params = self.actor_critic.actor().dist_params(&data.obs)?;
        let mut update_counts = 0;
        let mut final_kl = 0.;
        for iter in 0..algo.update_iters {
            let mut indices: Vec<u32> = (0..data.len() as u32).collect();
            RNG.with_borrow_mut(|rng| indices.shuffle(rng));
            for chunk in indices.chunks(algo.batch_size) {
                let batch_indices = Tensor::from_slice(chunk, chunk.len(), &self.device)?;
                let batch = data.select(&batch_indices)?;
                self.update_reward_critic(&batch)?;
                if algo.use_cost {
                    self.update_cost_critic(&batch)?;
                }
                self.update_actor(&batch)?;
            }
            let new_params = self.actor_critic.actor().dist_params(&data.obs)?;
            let kl = old_params.kl(&new_params)?.to_scalar::<f32>()?;
            final_kl = kl;
            update_counts += 1;
            if algo.kl_early_stop && kl > algo.target_kl {
                log::info!("early stopping at iter {} due to reaching max kl", iter + 1);
                break;
            }
        }
        let adv_mean = data.adv_r.mean_all()?.to_scalar::<f32>()?;
        self.logger.store("Value/Adv", adv_mean);
        self.logger.store("Train/KL", final_kl);
        self.logger.store("Train/StopIter", update_counts as f32);
        Ok(())
    }

    fn update_reward_critic(&mut self, batch: &RolloutData) -> Result<()> {
        let algo = &self.cfgs.algo_cfgs;
        let critic = self.actor_critic.reward_critic_mut();
        let values = critic.values(&batch.obs)?;
        let mut loss = ValueLoss((&*values - &batch.target_value_r)?.sqr()?.mean_all()?);
        if algo.use_critic_norm {
            let norm = critic.squared_norm()?.affine(algo.critic_norm_coef as f64, 0.)?;
            loss = ValueLoss((&*loss + norm)?);
        }
        critic.optimizer().backward_step(&loss)?;
        self.logger
            .store("Loss/Loss_reward_critic", loss.to_scalar::<f32>()?);
        Ok(())
    }

    fn update_cost_critic(&mut self, batch: &RolloutData) -> Result<()> {
        let algo = &self.cfgs.algo_cfgs;
        let Some(critic) = self.actor_critic.cost_critic_mut() else {
            return Ok(());
        };
        let values = critic.values(&batch.obs)?;
        let mut loss = ValueLoss((&*values - &batch.target_value_c)?.sqr()?.mean_all()?);
        if algo.use_critic_norm {
            let norm = critic.squared_norm()?.affine(algo.critic_norm_coef as f64, 0.)?;
            loss = ValueLoss((&*loss + norm)?);
        }
        critic.optimizer().backward_step(&loss)?;
        self.logger
            .store("Loss/Loss_cost_critic", loss.to_scalar::<f32>()?);
        Ok(())
    }

    fn update_actor(&mut self, batch: &RolloutData) -> Result<()> {
        let clip = self.cfgs.algo_cfgs.clip;
        let entropy_coef = self.cfgs.algo_cfgs.entropy_coef;
        let adv = H::surrogate_advantage(&batch.adv_r, &batch.adv_c)?;
        let actor = self.actor_critic.actor();
        let logp = Logp(actor.log_probs(&batch.obs, &batch.act)?);
        let logp_diff = LogpDiff((&*logp - &batch.logp)?);
        let ratio = logp_diff.exp()?;
        let ratio_clipped = ratio.clamp(1. - clip, 1. + clip)?;
        let surrogate = Tensor::minimum(&(&ratio * &adv)?, &(&ratio_clipped * &adv)?)?;
        let entropy = actor.entropy(&batch.obs)?;
        let loss = PolicyLoss(
            (surrogate.mean_all()?.neg()? - entropy.affine(entropy_coef as f64, 0.)?)?,
        );
        let std = actor.std()?;
        self.actor_critic.actor_optimizer().backward_step(&loss)?;

        self.logger
            .store("Train/Entropy", entropy.to_scalar::<f32>()?);
        self.logger
            .store("Train/PolicyRatio", ratio.mean_all()?.to_scalar::<f32>()?);
        if let Some(std) = std {
            self.logger.store("Train/PolicyStd", std);
        }
        self.logger.store("Loss/Loss_pi", loss.to_scalar::<f32>()?);
        Ok(())
    }

    fn save_checkpoint(&self, epoch: usize) -> Result<()> {
        let Some(log_dir) = self.logger.log_dir() else {
            return Ok(());
        };
        let dir = log_dir.join("torch_save").join(format!("epoch-{epoch}"));
        self.actor_critic.save(&dir)?;
        self.env
            .save_normalizer(dir.join("obs_normalizer.safetensors"))?;
        log::info!("saved checkpoint to {}", dir.display());
        Ok(())
    }

    fn summary(&self, epochs: usize) -> TrainingSummary {
        let mean = |key: &str| {
            self.logger
                .get_stats(key)
                .map(|stats| stats.mean)
                .unwrap_or_default()
        };
        TrainingSummary {
            epochs,
            ep_ret: mean("Metrics/EpRet"),
            ep_cost: mean("Metrics/EpCost"),
            ep_len: mean("Metrics/EpLen"),
        }
    }
}

impl<E: Env, H: PPOVariant> Algorithm for PPO<E, H> {
    fn learn(&mut self) -> Result<TrainingSummary> {
        let epochs = self.cfgs.epochs();
        let save_model_freq = self.cfgs.logger_cfgs.save_model_freq.max(1);
        let global_steps_per_epoch = self.cfgs.algo_cfgs.steps_per_epoch;
        let mut finished_epochs = 0;
        if self.hooks.init_hook(&self.cfgs)? == HookResult::Break {
            return Ok(self.summary(finished_epochs));
        }
        let start = Instant::now();
        for epoch in 0..epochs {
            let epoch_start = Instant::now();
            let steps_per_epoch = self.steps_per_epoch;
            let (env, actor_critic, buffer, logger) = (
                &mut self.env,
                &self.actor_critic,
                &mut self.buffer,
                &mut self.logger,
            );
            self.pool
                .install(|| env.rollout(steps_per_epoch, actor_critic, buffer, logger))?;
            let rollout_time = epoch_start.elapsed().as_secs_f32();
            self.logger.store("Time/Rollout", rollout_time);
            process_hook_result!(self.hooks.post_rollout_hook(epoch, &self.logger));

            let update_start = Instant::now();
            self.update()?;
            self.logger
                .store("Time/Update", update_start.elapsed().as_secs_f32());
            self.logger
                .store("Train/LR", self.actor_critic.actor_learning_rate() as f32);
            self.actor_critic.end_epoch(epoch)?;

            let epoch_time = epoch_start.elapsed().as_secs_f32();
            let total_steps = (epoch + 1) * global_steps_per_epoch;
            self.logger.store("TotalEnvSteps", total_steps as f32);
            self.logger.store("Train/Epoch", epoch as f32);
            self.logger.store("Time/Epoch", epoch_time);
            self.logger
                .store("Time/Total", start.elapsed().as_secs_f32());
            self.logger.store(
                "Time/FPS",
                global_steps_per_epoch as f32 / epoch_time.max(f32::EPSILON),
            );
            self.logger.dump_tabular()?;
            finished_epochs = epoch + 1;

            if finished_epochs % save_model_freq == 0 || finished_epochs == epochs {
                self.save_checkpoint(finished_epochs)?;
            }
            process_hook_result!(self.hooks.post_training_hook(epoch, &self.logger));
        }
        self.hooks.shutdown_hook()?;
        let summary = self.summary(finished_epochs);
        log::info!(
            "finished {} epochs on {} (world size {}): EpRet {:.3}, EpCost {:.3}, EpLen {:.1}",
            summary.epochs,
            self.env_id,
            self.world_size,
            summary.ep_ret,
            summary.ep_cost,
            summary.ep_len
        );
        Ok(summary)
    }

    fn act(&self, observation: &RawTensor, deterministic: bool) -> Result<RawTensor> {
        let obs = stack_raw(std::slice::from_ref(observation), &self.device)?;
        let obs = self.env.normalize_observation(&obs)?;
        let action = self.actor_critic.step(&obs, deterministic)?.action;
        let action = RawTensor::from_candle_tensor(&action.squeeze(0)?)?;
        Ok(self.env.to_env_action(action))
    }

    fn env_description(&self) -> &EnvironmentDescription {
        self.env.env_description()
    }

    fn load_checkpoint(&mut self, dir: &Path) -> Result<()> {
        self.actor_critic.load(dir)?;
        self.env
            .load_normalizer(dir.join("obs_normalizer.safetensors"))?;
        Ok(())
    }
}

//! 训练器
//!
//! 单线程训练循环：前向 → 掩码交叉熵 → 反向 → 梯度裁剪 → Adam 更新。
//! 损失出现 NaN/Inf 时立即停止，本步不更新参数。

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::checkpoint::{CheckpointManager, TrainingHistory};
use crate::error::{ModelError, Result};
use crate::gradient_clip::{clip_grad_norm, compute_grad_norm};
use crate::loss::{token_accuracy, MaskedCrossEntropy};
use crate::optimizer::{Adam, Optimizer};
use crate::tensor::padding_mask;
use crate::tokenizer::PAD_ID;
use crate::transformer::ChatTransformer;

/// 训练样本：(输入序列, 目标序列)，两者长度相同
pub type TrainingPair = (Vec<usize>, Vec<usize>);

/// 训练配置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// 批大小
    pub batch_size: usize,
    /// 训练轮数
    pub epochs: usize,
    /// 学习率
    pub learning_rate: f32,
    /// 梯度裁剪阈值（全局 L2 范数）
    pub grad_clip: Option<f32>,
    /// 每多少个 epoch 保存一次检查点
    pub save_every: usize,
    /// 打乱数据和 dropout 使用的随机种子
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 50,
            learning_rate: 1e-4,
            grad_clip: Some(1.0),
            save_every: 10,
            seed: 42,
        }
    }
}

/// 单步训练统计
#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    pub loss: f32,
    /// 非 PAD 位置的 token 准确率
    pub accuracy: f32,
    /// 裁剪前的梯度范数
    pub grad_norm: f32,
}

/// 把一个 batch 的样本堆叠成 [batch, seq] 的输入和目标
fn stack_batch(batch: &[TrainingPair]) -> Result<(Array2<usize>, Array2<usize>)> {
    let first = batch
        .first()
        .ok_or_else(|| ModelError::InvalidArtifact("empty training batch".to_string()))?;
    let seq = first.0.len();

    for (input, target) in batch {
        if input.len() != seq {
            return Err(ModelError::mismatch("training input length", seq, input.len()));
        }
        if target.len() != seq {
            return Err(ModelError::mismatch("training target length", seq, target.len()));
        }
    }

    let inputs = Array2::from_shape_fn((batch.len(), seq), |(i, t)| batch[i].0[t]);
    let targets = Array2::from_shape_fn((batch.len(), seq), |(i, t)| batch[i].1[t]);
    Ok((inputs, targets))
}

/// 训练器
///
/// 训练期间独占模型；训练结束后用 [`Trainer::into_model`] 交给 [`crate::snapshot::ModelHandle`]。
pub struct Trainer {
    model: ChatTransformer,
    optimizer: Adam,
    loss_fn: MaskedCrossEntropy,
    config: TrainerConfig,
    rng: StdRng,
    checkpoints: Option<CheckpointManager>,
    /// 全局步数
    step: usize,
    /// 当前 epoch（从 1 开始；单独调用 train_step 时为 0）
    epoch: usize,
}

impl Trainer {
    pub fn new(model: ChatTransformer, config: TrainerConfig) -> Self {
        Self {
            model,
            optimizer: Adam::new(config.learning_rate),
            loss_fn: MaskedCrossEntropy::new(PAD_ID),
            config,
            rng: StdRng::seed_from_u64(config.seed),
            checkpoints: None,
            step: 0,
            epoch: 0,
        }
    }

    /// 配置检查点管理器
    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    pub fn model(&self) -> &ChatTransformer {
        &self.model
    }

    /// 交出训练好的模型
    pub fn into_model(self) -> ChatTransformer {
        self.model
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    /// 训练一步，返回损失
    ///
    /// 目标全部为 PAD 时返回 0，参数不变。
    pub fn train_step(&mut self, batch: &[TrainingPair]) -> Result<f32> {
        self.step_with_stats(batch).map(|stats| stats.loss)
    }

    /// 训练一步，返回损失、准确率和梯度范数
    pub fn step_with_stats(&mut self, batch: &[TrainingPair]) -> Result<StepStats> {
        let (inputs, targets) = stack_batch(batch)?;
        if targets.iter().all(|&t| t == PAD_ID) {
            return Ok(StepStats {
                loss: 0.0,
                accuracy: 0.0,
                grad_norm: 0.0,
            });
        }
        self.step += 1;

        // 1. 前向传播（训练模式）
        let mask = padding_mask(&inputs, PAD_ID);
        let (logits, cache) = self
            .model
            .forward_train(&inputs, Some(&mask), &mut self.rng)?;

        // 2. 计算损失
        let (loss, grad_logits) = self.loss_fn.compute(&logits, &targets)?;
        if !loss.is_finite() {
            log::error!(
                "数值不稳定: epoch {}, step {}, loss = {}",
                self.epoch,
                self.step,
                loss
            );
            return Err(ModelError::NumericInstability {
                epoch: self.epoch,
                step: self.step,
                loss,
            });
        }

        // 3. 反向传播 + 梯度裁剪，范数溢出时不更新
        let mut grads = self.model.backward(&grad_logits, &cache);
        let grad_norm = match self.config.grad_clip {
            Some(max_norm) => clip_grad_norm(&mut grads, max_norm),
            None => compute_grad_norm(&grads),
        };
        if !grad_norm.is_finite() {
            log::error!(
                "数值不稳定: epoch {}, step {}, grad_norm = {}",
                self.epoch,
                self.step,
                grad_norm
            );
            return Err(ModelError::NumericInstability {
                epoch: self.epoch,
                step: self.step,
                loss,
            });
        }

        // 4. 参数更新
        self.model.apply_gradients(&grads, &mut self.optimizer);

        let accuracy = token_accuracy(&logits, &targets, PAD_ID);
        log::debug!(
            "step {}: loss = {:.4}, grad_norm = {:.4}, acc = {:.2}%",
            self.step,
            loss,
            grad_norm,
            accuracy * 100.0
        );

        Ok(StepStats {
            loss,
            accuracy,
            grad_norm,
        })
    }

    /// 训练多个 epoch
    ///
    /// 每个 epoch 打乱数据后按 batch_size 分批。遇到第一个数值不稳定错误即停止。
    pub fn fit(&mut self, pairs: &[TrainingPair], epochs: usize) -> Result<TrainingHistory> {
        log::info!(
            "开始训练: {} 个样本, {} 个 epoch, batch_size = {}, lr = {}",
            pairs.len(),
            epochs,
            self.config.batch_size,
            self.optimizer.lr()
        );

        let start_time = Instant::now();
        let mut history = TrainingHistory::new();
        let mut order: Vec<usize> = (0..pairs.len()).collect();
        let batch_size = self.config.batch_size.max(1);

        for epoch in 1..=epochs {
            self.epoch = epoch;
            order.shuffle(&mut self.rng);

            let mut total_loss = 0.0;
            let mut total_acc = 0.0;
            let mut n_batches = 0;

            for chunk in order.chunks(batch_size) {
                let batch: Vec<TrainingPair> = chunk.iter().map(|&i| pairs[i].clone()).collect();
                let stats = self.step_with_stats(&batch)?;
                total_loss += stats.loss;
                total_acc += stats.accuracy;
                n_batches += 1;
            }

            let denom = n_batches.max(1) as f32;
            let (avg_loss, avg_acc) = (total_loss / denom, total_acc / denom);
            history.push(avg_loss, avg_acc, self.optimizer.lr());

            log::info!(
                "Epoch {:3}/{} | Loss: {:.4} | Token Acc: {:.2}%",
                epoch,
                epochs,
                avg_loss,
                avg_acc * 100.0
            );

            if let Some(manager) = &self.checkpoints {
                if manager.should_save(epoch) {
                    manager.save(&self.model, epoch)?;
                }
            }
        }
        self.epoch = 0;

        if let Some(manager) = &self.checkpoints {
            manager.save_history(&history)?;
        }

        log::info!(
            "训练完成: {} 个 epoch, {} 步, 用时 {:.1}s",
            history.epochs(),
            self.step,
            start_time.elapsed().as_secs_f32()
        );
        Ok(history)
    }

    /// 在推理模式下计算平均损失和 token 准确率（不更新参数）
    pub fn evaluate(&self, pairs: &[TrainingPair]) -> Result<(f32, f32)> {
        if pairs.is_empty() {
            return Ok((0.0, 0.0));
        }
        let (inputs, targets) = stack_batch(pairs)?;
        let mask = padding_mask(&inputs, PAD_ID);
        let logits = self.model.forward(&inputs, Some(&mask))?;
        let (loss, _) = self.loss_fn.compute(&logits, &targets)?;
        Ok((loss, token_accuracy(&logits, &targets, PAD_ID)))
    }
}

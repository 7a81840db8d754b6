//! 模型检查点保存和加载
//!
//! 检查点包含结构超参数、词表大小和全部权重，支持 JSON 与 bincode 两种格式。
//! 加载时逐项校验形状，任何不一致都会拒绝加载，不做部分加载。

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::attention::MultiHeadAttention;
use crate::embedding::Embedding;
use crate::error::{ModelError, Result};
use crate::layers::{FeedForward, LayerNorm, Linear};
use crate::tokenizer::MIN_SEQ_LEN;
use crate::transformer::{ChatTransformer, TransformerBlock, TransformerConfig};

/// 模型检查点文件名
pub const MODEL_FILE: &str = "transformer_chatbot.json";
/// 训练历史文件名
pub const HISTORY_FILE: &str = "training_history.json";

/// 可序列化的 Array2 包装器
///
/// ndarray::Array2 的序列化包装器，用于 serde
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableArray {
    /// 数据（行优先）
    pub data: Vec<f32>,
    /// 形状 (rows, cols)
    pub shape: (usize, usize),
}

impl SerializableArray {
    /// 从 Array2 创建
    pub fn from_array(arr: &Array2<f32>) -> Self {
        Self {
            data: arr.iter().copied().collect(),
            shape: arr.dim(),
        }
    }

    /// 转换为 Array2，同时校验形状
    pub fn to_array(&self, what: &str, expected: (usize, usize)) -> Result<Array2<f32>> {
        if self.shape != expected {
            return Err(ModelError::mismatch(what, expected, self.shape));
        }
        Array2::from_shape_vec(self.shape, self.data.clone()).map_err(|e| {
            ModelError::InvalidArtifact(format!(
                "{}: {} values for shape {:?} ({})",
                what,
                self.data.len(),
                self.shape,
                e
            ))
        })
    }
}

/// 结构超参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    pub d_model: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub d_ff: usize,
    pub max_len: usize,
    pub dropout: f32,
}

impl Architecture {
    pub fn from_config(config: &TransformerConfig) -> Self {
        Self {
            d_model: config.d_model,
            num_heads: config.n_heads,
            num_layers: config.n_layers,
            d_ff: config.d_ff,
            max_len: config.max_seq_len,
            dropout: config.dropout,
        }
    }

    pub fn to_config(&self, vocab_size: usize) -> TransformerConfig {
        TransformerConfig {
            vocab_size,
            d_model: self.d_model,
            n_heads: self.num_heads,
            n_layers: self.num_layers,
            d_ff: self.d_ff,
            max_seq_len: self.max_len,
            dropout: self.dropout,
        }
    }
}

/// 线性层权重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearWeights {
    pub weight: SerializableArray,
    pub bias: SerializableArray,
}

impl LinearWeights {
    fn from_linear(linear: &Linear) -> Self {
        Self {
            weight: SerializableArray::from_array(linear.weight()),
            bias: SerializableArray::from_array(linear.bias()),
        }
    }

    fn to_linear(&self, what: &str, in_features: usize, out_features: usize) -> Result<Linear> {
        Ok(Linear::from_parts(
            self.weight
                .to_array(&format!("{}.weight", what), (in_features, out_features))?,
            self.bias.to_array(&format!("{}.bias", what), (1, out_features))?,
        ))
    }
}

/// 注意力权重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttnWeights {
    pub w_q: LinearWeights,
    pub w_k: LinearWeights,
    pub w_v: LinearWeights,
    pub w_o: LinearWeights,
}

/// FFN 权重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FFNWeights {
    pub linear1: LinearWeights,
    pub linear2: LinearWeights,
}

/// 单个 Block 的权重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockWeights {
    pub attn: AttnWeights,
    pub ffn: FFNWeights,
    /// LayerNorm 参数
    pub norm1_gamma: SerializableArray,
    pub norm1_beta: SerializableArray,
    pub norm2_gamma: SerializableArray,
    pub norm2_beta: SerializableArray,
}

impl BlockWeights {
    fn from_block(block: &TransformerBlock) -> Self {
        let (w_q, w_k, w_v, w_o) = block.attention.projections();
        let (g1, b1) = block.norm1.params();
        let (g2, b2) = block.norm2.params();

        Self {
            attn: AttnWeights {
                w_q: LinearWeights::from_linear(w_q),
                w_k: LinearWeights::from_linear(w_k),
                w_v: LinearWeights::from_linear(w_v),
                w_o: LinearWeights::from_linear(w_o),
            },
            ffn: FFNWeights {
                linear1: LinearWeights::from_linear(&block.feed_forward.fc1),
                linear2: LinearWeights::from_linear(&block.feed_forward.fc2),
            },
            norm1_gamma: SerializableArray::from_array(g1),
            norm1_beta: SerializableArray::from_array(b1),
            norm2_gamma: SerializableArray::from_array(g2),
            norm2_beta: SerializableArray::from_array(b2),
        }
    }

    fn to_block(&self, index: usize, arch: &Architecture) -> Result<TransformerBlock> {
        let p = format!("blocks.{}", index);
        let (d, d_ff) = (arch.d_model, arch.d_ff);

        let attention = MultiHeadAttention::from_parts(
            arch.num_heads,
            self.attn.w_q.to_linear(&format!("{}.attn.w_q", p), d, d)?,
            self.attn.w_k.to_linear(&format!("{}.attn.w_k", p), d, d)?,
            self.attn.w_v.to_linear(&format!("{}.attn.w_v", p), d, d)?,
            self.attn.w_o.to_linear(&format!("{}.attn.w_o", p), d, d)?,
            arch.dropout,
        );
        let feed_forward = FeedForward::from_parts(
            self.ffn.linear1.to_linear(&format!("{}.ffn.fc1", p), d, d_ff)?,
            self.ffn.linear2.to_linear(&format!("{}.ffn.fc2", p), d_ff, d)?,
            arch.dropout,
        );
        let norm1 = LayerNorm::from_parts(
            self.norm1_gamma.to_array(&format!("{}.norm1.gamma", p), (1, d))?,
            self.norm1_beta.to_array(&format!("{}.norm1.beta", p), (1, d))?,
        );
        let norm2 = LayerNorm::from_parts(
            self.norm2_gamma.to_array(&format!("{}.norm2.gamma", p), (1, d))?,
            self.norm2_beta.to_array(&format!("{}.norm2.beta", p), (1, d))?,
        );

        Ok(TransformerBlock::from_parts(
            attention,
            feed_forward,
            norm1,
            norm2,
            arch.dropout,
        ))
    }
}

/// 模型权重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    /// 嵌入层权重
    pub embedding: SerializableArray,
    pub blocks: Vec<BlockWeights>,
    pub fc_out_weight: SerializableArray,
    pub fc_out_bias: SerializableArray,
}

/// 模型检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub architecture: Architecture,
    pub vocab_size: usize,
    pub weights: ModelWeights,
}

/// 检查点文件格式（由扩展名决定）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Json,
    Binary,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(Self::Json),
            Some("bin") => Ok(Self::Binary),
            _ => Err(ModelError::InvalidArtifact(format!(
                "unsupported checkpoint extension: {}",
                path.display()
            ))),
        }
    }
}

impl ModelCheckpoint {
    /// 保存为 JSON 格式
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// 从 JSON 格式加载
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let checkpoint = serde_json::from_reader(reader)?;
        Ok(checkpoint)
    }

    /// 保存为二进制格式（更紧凑）
    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    /// 从二进制格式加载
    pub fn load_binary<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let checkpoint = bincode::deserialize_from(reader)?;
        Ok(checkpoint)
    }

    /// 按扩展名选择格式保存
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        match CheckpointFormat::from_path(path)? {
            CheckpointFormat::Json => self.save_json(path),
            CheckpointFormat::Binary => self.save_binary(path),
        }
    }

    /// 按扩展名选择格式加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match CheckpointFormat::from_path(path)? {
            CheckpointFormat::Json => Self::load_json(path),
            CheckpointFormat::Binary => Self::load_binary(path),
        }
    }

    pub fn config(&self) -> TransformerConfig {
        self.architecture.to_config(self.vocab_size)
    }

    /// 检查超参数与期望的结构一致
    fn check_against(&self, expected: &TransformerConfig) -> Result<()> {
        let found = self.config();
        let pairs = [
            ("vocab_size", expected.vocab_size, found.vocab_size),
            ("d_model", expected.d_model, found.d_model),
            ("num_heads", expected.n_heads, found.n_heads),
            ("num_layers", expected.n_layers, found.n_layers),
            ("d_ff", expected.d_ff, found.d_ff),
            ("max_len", expected.max_seq_len, found.max_seq_len),
        ];
        for (what, exp, got) in pairs {
            if exp != got {
                return Err(ModelError::mismatch(what, exp, got));
            }
        }
        Ok(())
    }

    /// 检查点自身的结构是否可以构造出模型
    fn check_self_consistent(&self) -> Result<()> {
        let arch = &self.architecture;
        if arch.num_heads == 0 || arch.d_model % arch.num_heads != 0 {
            return Err(ModelError::mismatch(
                "num_heads (must divide d_model)",
                arch.d_model,
                arch.num_heads,
            ));
        }
        if arch.max_len < MIN_SEQ_LEN {
            return Err(ModelError::InvalidMaxLen(arch.max_len));
        }
        if !(0.0..1.0).contains(&arch.dropout) {
            return Err(ModelError::InvalidArtifact(format!(
                "dropout {} out of range [0, 1)",
                arch.dropout
            )));
        }
        if self.weights.blocks.len() != arch.num_layers {
            return Err(ModelError::mismatch(
                "blocks",
                arch.num_layers,
                self.weights.blocks.len(),
            ));
        }
        Ok(())
    }
}

impl ChatTransformer {
    /// 导出检查点
    pub fn to_checkpoint(&self) -> ModelCheckpoint {
        ModelCheckpoint {
            architecture: Architecture::from_config(&self.config),
            vocab_size: self.config.vocab_size,
            weights: ModelWeights {
                embedding: SerializableArray::from_array(self.embedding.weights()),
                blocks: self.blocks.iter().map(BlockWeights::from_block).collect(),
                fc_out_weight: SerializableArray::from_array(self.fc_out.weight()),
                fc_out_bias: SerializableArray::from_array(self.fc_out.bias()),
            },
        }
    }

    /// 从检查点恢复模型
    ///
    /// `expected` 给出时，先检查存储的超参数与之一致。
    pub fn from_checkpoint(
        checkpoint: &ModelCheckpoint,
        expected: Option<&TransformerConfig>,
    ) -> Result<Self> {
        if let Some(expected) = expected {
            checkpoint.check_against(expected)?;
        }
        checkpoint.check_self_consistent()?;

        let arch = &checkpoint.architecture;
        let vocab = checkpoint.vocab_size;
        let weights = &checkpoint.weights;

        let embedding = Embedding::from_weights(
            weights
                .embedding
                .to_array("embedding.weight", (vocab, arch.d_model))?,
        );
        let blocks = weights
            .blocks
            .iter()
            .enumerate()
            .map(|(i, block)| block.to_block(i, arch))
            .collect::<Result<Vec<_>>>()?;
        let fc_out = Linear::from_parts(
            weights
                .fc_out_weight
                .to_array("fc_out.weight", (arch.d_model, vocab))?,
            weights.fc_out_bias.to_array("fc_out.bias", (1, vocab))?,
        );

        Ok(Self::from_parts(checkpoint.config(), embedding, blocks, fc_out))
    }

    /// 保存检查点（`.json` 或 `.bin`）
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.to_checkpoint().save(path)?;
        log::info!("检查点已保存: {}", path.display());
        Ok(())
    }

    /// 加载检查点（`.json` 或 `.bin`）
    pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let model = Self::from_checkpoint(&ModelCheckpoint::load(path)?, None)?;
        log::info!("检查点已加载: {} ({} 个参数)", path.display(), model.param_count());
        Ok(model)
    }
}

/// 训练历史记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// 每个 epoch 的平均损失
    pub epoch_losses: Vec<f32>,
    /// 每个 epoch 的 token 准确率（非 PAD 位置）
    pub token_accuracies: Vec<f32>,
    /// 学习率历史
    pub learning_rates: Vec<f32>,
}

impl TrainingHistory {
    /// 创建新的训练历史
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加一个 epoch 的记录
    pub fn push(&mut self, loss: f32, accuracy: f32, lr: f32) {
        self.epoch_losses.push(loss);
        self.token_accuracies.push(accuracy);
        self.learning_rates.push(lr);
    }

    pub fn epochs(&self) -> usize {
        self.epoch_losses.len()
    }

    /// 保存训练历史
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// 加载训练历史
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let history = serde_json::from_reader(reader)?;
        Ok(history)
    }

    /// 获取最低损失
    pub fn best_loss(&self) -> Option<f32> {
        self.epoch_losses.iter().cloned().reduce(f32::min)
    }

    /// 获取最佳 epoch（从 0 开始）
    pub fn best_epoch(&self) -> Option<usize> {
        self.epoch_losses
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
    }

    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }

    /// 训练历史摘要
    pub fn summary(&self) -> String {
        format!(
            "Training Summary:\n  Epochs: {}\n  Best Loss: {:.4} (epoch {})\n  Final Loss: {:.4}\n  Final Token Acc: {:.2}%",
            self.epochs(),
            self.best_loss().unwrap_or(0.0),
            self.best_epoch().map_or(0, |e| e + 1),
            self.final_loss().unwrap_or(0.0),
            self.token_accuracies.last().copied().unwrap_or(0.0) * 100.0
        )
    }
}

/// 检查点管理器
///
/// 每 `save_every` 个 epoch 把当前模型写到 `{dir}/transformer_chatbot.json`
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    /// 保存目录
    save_dir: PathBuf,
    save_every: usize,
}

impl CheckpointManager {
    /// 创建新的检查点管理器（会创建保存目录）
    pub fn new<P: AsRef<Path>>(save_dir: P, save_every: usize) -> Result<Self> {
        let save_dir = save_dir.as_ref().to_path_buf();
        fs::create_dir_all(&save_dir)?;

        Ok(Self {
            save_dir,
            save_every,
        })
    }

    /// 该 epoch（从 1 开始）是否需要保存
    pub fn should_save(&self, epoch: usize) -> bool {
        self.save_every > 0 && epoch > 0 && epoch % self.save_every == 0
    }

    pub fn model_path(&self) -> PathBuf {
        self.save_dir.join(MODEL_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.save_dir.join(HISTORY_FILE)
    }

    /// 保存模型
    pub fn save(&self, model: &ChatTransformer, epoch: usize) -> Result<PathBuf> {
        let path = self.model_path();
        model.to_checkpoint().save_json(&path)?;
        log::info!("epoch {} 检查点已保存: {}", epoch, path.display());
        Ok(path)
    }

    /// 加载最近保存的模型
    pub fn load_latest(&self, expected: Option<&TransformerConfig>) -> Result<ChatTransformer> {
        let checkpoint = ModelCheckpoint::load_json(self.model_path())?;
        ChatTransformer::from_checkpoint(&checkpoint, expected)
    }

    /// 保存训练历史
    pub fn save_history(&self, history: &TrainingHistory) -> Result<()> {
        history.save(self.history_path())
    }

    /// 加载训练历史
    pub fn load_history(&self) -> Result<TrainingHistory> {
        TrainingHistory::load(self.history_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_config() -> TransformerConfig {
        TransformerConfig {
            vocab_size: 10,
            d_model: 8,
            n_heads: 2,
            n_layers: 2,
            d_ff: 16,
            max_seq_len: 8,
            dropout: 0.1,
        }
    }

    fn tiny_model() -> ChatTransformer {
        ChatTransformer::with_rng(tiny_config(), &mut StdRng::seed_from_u64(21))
    }

    fn assert_same_outputs(a: &ChatTransformer, b: &ChatTransformer) {
        let ids = arr2(&[[1usize, 4, 7, 2]]);
        let diff = (a.forward(&ids, None).unwrap() - b.forward(&ids, None).unwrap())
            .mapv(f32::abs)
            .sum();
        assert!(diff < 1e-4);
    }

    #[test]
    fn test_serializable_array_shape_check() {
        let arr = SerializableArray::from_array(&arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]));
        assert_eq!(arr.shape, (2, 3));
        assert_eq!(arr.to_array("w", (2, 3)).unwrap()[[1, 0]], 4.0);
        assert!(matches!(
            arr.to_array("w", (3, 2)),
            Err(ModelError::ArchitectureMismatch { .. })
        ));

        let broken = SerializableArray {
            data: vec![1.0; 5],
            shape: (2, 3),
        };
        assert!(matches!(
            broken.to_array("w", (2, 3)),
            Err(ModelError::InvalidArtifact(_))
        ));
    }

    #[test]
    fn test_json_roundtrip_preserves_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let model = tiny_model();

        model.save_checkpoint(&path).unwrap();
        let loaded = ChatTransformer::load_checkpoint(&path).unwrap();

        assert_same_outputs(&model, &loaded);
        assert_eq!(loaded.config(), model.config());
    }

    #[test]
    fn test_binary_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let model = tiny_model();

        model.save_checkpoint(&path).unwrap();
        let checkpoint = ModelCheckpoint::load_binary(&path).unwrap();
        assert_eq!(checkpoint, model.to_checkpoint());
    }

    #[test]
    fn test_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let result = tiny_model().save_checkpoint(dir.path().join("model.txt"));
        assert!(matches!(result, Err(ModelError::InvalidArtifact(_))));
    }

    #[test]
    fn test_expected_architecture_mismatch() {
        let checkpoint = tiny_model().to_checkpoint();
        let expected = TransformerConfig {
            d_model: 16,
            ..tiny_config()
        };

        match ChatTransformer::from_checkpoint(&checkpoint, Some(&expected)) {
            Err(ModelError::ArchitectureMismatch { what, .. }) => assert_eq!(what, "d_model"),
            other => panic!("expected mismatch, got {:?}", other.map(|_| ())),
        }
        assert!(ChatTransformer::from_checkpoint(&checkpoint, Some(&tiny_config())).is_ok());
    }

    #[test]
    fn test_tensor_shape_mismatch() {
        let mut checkpoint = tiny_model().to_checkpoint();
        checkpoint.weights.blocks[1].ffn.linear1.weight = SerializableArray {
            data: vec![0.0; 8 * 12],
            shape: (8, 12),
        };

        match ChatTransformer::from_checkpoint(&checkpoint, None) {
            Err(ModelError::ArchitectureMismatch { what, .. }) => {
                assert_eq!(what, "blocks.1.ffn.fc1.weight")
            }
            other => panic!("expected mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_block_count_mismatch() {
        let mut checkpoint = tiny_model().to_checkpoint();
        checkpoint.weights.blocks.pop();
        assert!(matches!(
            ChatTransformer::from_checkpoint(&checkpoint, None),
            Err(ModelError::ArchitectureMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_too_short_context() {
        let mut checkpoint = tiny_model().to_checkpoint();
        checkpoint.architecture.max_len = 0;
        assert!(matches!(
            ChatTransformer::from_checkpoint(&checkpoint, None),
            Err(ModelError::InvalidMaxLen(0))
        ));

        checkpoint.architecture.max_len = 1;
        assert!(matches!(
            ChatTransformer::from_checkpoint(&checkpoint, None),
            Err(ModelError::InvalidMaxLen(1))
        ));
    }

    #[test]
    fn test_training_history() {
        let mut history = TrainingHistory::new();
        history.push(2.5, 0.1, 1e-4);
        history.push(1.8, 0.3, 1e-4);
        history.push(1.9, 0.35, 1e-4);

        assert_eq!(history.epochs(), 3);
        assert_eq!(history.best_loss(), Some(1.8));
        assert_eq!(history.best_epoch(), Some(1));
        assert!(history.summary().contains("Epochs: 3"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        history.save(&path).unwrap();
        assert_eq!(TrainingHistory::load(&path).unwrap(), history);
    }

    #[test]
    fn test_checkpoint_manager() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("models"), 10).unwrap();

        assert!(!manager.should_save(0));
        assert!(!manager.should_save(9));
        assert!(manager.should_save(10));
        assert!(manager.should_save(20));

        let model = tiny_model();
        let path = manager.save(&model, 10).unwrap();
        assert!(path.ends_with(MODEL_FILE));

        let loaded = manager.load_latest(Some(&tiny_config())).unwrap();
        assert_same_outputs(&model, &loaded);
    }
}

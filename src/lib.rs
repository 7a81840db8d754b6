//! # Chat Transformer
//!
//! 一个从零实现的对话 Transformer：词级词表、多头自注意力、掩码交叉熵训练和 top-k 采样生成，
//! 外加一个在模型不可用时退回关键词回复的对话层。
//!
//! ## 架构概览
//!
//! ```text
//! Input ids → Embedding × √d_model → Positional Encoding → Dropout →
//!     [Transformer Block × N] → Linear → Logits
//!     ├── Multi-Head Self-Attention (padding mask)
//!     ├── Dropout + Add & Norm
//!     ├── Feed Forward Network (GELU)
//!     └── Dropout + Add & Norm
//! ```
//!
//! 训练由 [`Trainer`] 完成，生成由 [`Generator`] 从 [`ModelHandle`] 取快照后进行。

pub mod error;
pub mod tensor;
pub mod tokenizer;
pub mod embedding;
pub mod layers;
pub mod attention;
pub mod transformer;
pub mod gradient_clip;
pub mod loss;
pub mod optimizer;
pub mod sampling;
pub mod snapshot;
pub mod generator;
pub mod checkpoint;
pub mod trainer;
pub mod dataset;
pub mod config;
pub mod fallback;
pub mod chatbot;

pub use error::{ModelError, Result};
pub use tensor::TensorExt;
pub use tokenizer::{build_vocabulary, decode, encode, trim_padding, Tokenizer, Vocabulary};
pub use embedding::{Embedding, PositionalEncoding};
pub use layers::{Dropout, FeedForward, LayerNorm, Linear};
pub use attention::{AttentionParams, MultiHeadAttention};
pub use transformer::{ChatTransformer, TransformerBlock, TransformerConfig};
pub use gradient_clip::{clip_grad_norm, compute_grad_norm, Gradients};
pub use loss::{masked_cross_entropy, token_accuracy, MaskedCrossEntropy};
pub use optimizer::{Adam, Optimizer};
pub use sampling::SamplingConfig;
pub use snapshot::ModelHandle;
pub use generator::Generator;
pub use checkpoint::{CheckpointManager, ModelCheckpoint, TrainingHistory};
pub use trainer::{Trainer, TrainerConfig, TrainingPair};
pub use dataset::TrainingData;
pub use config::{ChatConfig, PathsConfig};
pub use fallback::{FallbackReply, KeywordResponder};
pub use chatbot::{ChatBot, ChatReply};

/// 预设配置
pub mod configs {
    use super::TransformerConfig;

    /// 小型模型（用于快速测试）
    pub fn mini() -> TransformerConfig {
        TransformerConfig {
            vocab_size: 1000,
            d_model: 128,
            n_heads: 4,
            n_layers: 2,
            d_ff: 512,
            max_seq_len: 64,
            dropout: 0.1,
        }
    }

    /// 聊天机器人使用的模型
    pub fn chatbot() -> TransformerConfig {
        TransformerConfig {
            vocab_size: 5000,
            d_model: 256,
            n_heads: 8,
            n_layers: 4,
            d_ff: 1024,
            max_seq_len: 128,
            dropout: 0.1,
        }
    }
}

//! 错误类型
//!
//! 生成与训练层面的问题以类型化错误向上传播；未知词不是错误，直接映射为 `<UNK>`。

use thiserror::Error;

/// crate 统一的 Result 别名
pub type Result<T> = std::result::Result<T, ModelError>;

/// 模型错误
#[derive(Debug, Error)]
pub enum ModelError {
    /// 在词表构建之前调用了 encode/decode
    #[error("vocabulary has not been built")]
    VocabularyNotBuilt,

    /// 序列长度超过模型上下文
    #[error("sequence length {len} exceeds maximum length {max}")]
    SequenceLength {
        /// 实际长度
        len: usize,
        /// 允许的最大长度
        max: usize,
    },

    /// 非法的 max_len（必须能容纳 START 和 END）
    #[error("invalid max_len {0}: must be at least 2")]
    InvalidMaxLen(usize),

    /// 没有加载任何权重
    #[error("model has no loaded weights")]
    ModelNotTrained,

    /// 检查点与期望的模型结构不一致
    #[error("architecture mismatch for {what}: expected {expected}, found {found}")]
    ArchitectureMismatch {
        /// 不匹配的参数或超参数名称
        what: String,
        /// 期望值
        expected: String,
        /// 实际值
        found: String,
    },

    /// 训练损失出现 NaN/Inf
    #[error("numeric instability at epoch {epoch}, step {step}: loss = {loss}")]
    NumericInstability {
        /// 出错时的 epoch（从 1 开始，0 表示单步调用）
        epoch: usize,
        /// 全局步数
        step: usize,
        /// 异常的损失值
        loss: f32,
    },

    /// token id 超出词表范围
    #[error("token id {id} out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange {
        /// 越界的 id
        id: usize,
        /// 词表大小
        vocab_size: usize,
    },

    /// 持久化文件内容不合法
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl ModelError {
    /// 构造结构不匹配错误
    pub fn mismatch(
        what: impl Into<String>,
        expected: impl std::fmt::Debug,
        found: impl std::fmt::Debug,
    ) -> Self {
        Self::ArchitectureMismatch {
            what: what.into(),
            expected: format!("{:?}", expected),
            found: format!("{:?}", found),
        }
    }

    /// 调用方是否应该退回到非生成式回复
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::VocabularyNotBuilt | Self::ModelNotTrained | Self::SequenceLength { .. }
        )
    }
}

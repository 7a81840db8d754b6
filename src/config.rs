//! 应用配置
//!
//! 所有字段都有默认值；JSON 文件中缺失的字段使用默认值补齐。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::sampling::SamplingConfig;
use crate::tokenizer::DEFAULT_MAX_WORDS;
use crate::trainer::TrainerConfig;
use crate::transformer::TransformerConfig;

/// 文件路径配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// 训练数据文件
    pub data: PathBuf,
    /// 模型和词表所在目录
    pub model_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data: PathBuf::from("data/chatbot_training_data.json"),
            model_dir: PathBuf::from("models/"),
        }
    }
}

/// 聊天机器人完整配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// 模型结构（vocab_size 在构建词表后覆盖）
    pub model: TransformerConfig,
    /// 默认生成参数
    pub generation: SamplingConfig,
    /// 对话回复的生成参数
    pub chat: SamplingConfig,
    pub training: TrainerConfig,
    /// 词表容量
    pub max_words: usize,
    pub paths: PathsConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: TransformerConfig::default(),
            generation: SamplingConfig::default(),
            chat: SamplingConfig::chat(),
            training: TrainerConfig::default(),
            max_words: DEFAULT_MAX_WORDS,
            paths: PathsConfig::default(),
        }
    }
}

impl ChatConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.model.d_model, 256);
        assert_eq!(config.model.max_seq_len, 128);
        assert_eq!(config.generation.top_k, 50);
        assert_eq!(config.chat, SamplingConfig::chat());
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.max_words, 5000);
        assert_eq!(config.paths.model_dir, PathBuf::from("models/"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ChatConfig =
            serde_json::from_str(r#"{"model": {"d_model": 64}, "training": {"epochs": 3}}"#)
                .unwrap();

        assert_eq!(config.model.d_model, 64);
        assert_eq!(config.model.n_heads, 8);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.generation, SamplingConfig::default());
        assert_eq!(config.chat, SamplingConfig::chat());
        assert_eq!(config.paths, PathsConfig::default());
    }

    #[test]
    fn test_chat_sampling_from_json() {
        let config: ChatConfig = serde_json::from_str(
            r#"{"chat": {"temperature": 0.2, "top_k": 5, "max_length": 12}}"#,
        )
        .unwrap();

        assert_eq!(config.chat.temperature, 0.2);
        assert_eq!(config.chat.top_k, 5);
        assert_eq!(config.chat.max_length, 12);
        assert_eq!(config.generation, SamplingConfig::default());
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = ChatConfig::default();
        config.training.epochs = 7;
        config.paths.model_dir = PathBuf::from("out");
        config.save(&path).unwrap();

        assert_eq!(ChatConfig::load(&path).unwrap(), config);
    }
}

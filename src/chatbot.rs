//! 对话层
//!
//! 模型已加载时用 Transformer 生成回复，否则（或生成失败、结果为空时）退回关键词回复。

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::checkpoint::MODEL_FILE;
use crate::error::{ModelError, Result};
use crate::fallback::KeywordResponder;
use crate::generator::Generator;
use crate::sampling::SamplingConfig;
use crate::snapshot::ModelHandle;
use crate::tokenizer::{trim_padding, Tokenizer, Vocabulary};
use crate::transformer::ChatTransformer;

/// 词表文件名
pub const VOCAB_FILE: &str = "vocabulary.json";
/// 模型生成回复的置信度
pub const GENERATION_CONFIDENCE: f32 = 0.85;
/// 模型生成回复的意图名
pub const GENERATION_INTENT: &str = "transformer_generation";

/// 一次对话的完整回复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
    pub intent: String,
    pub confidence: f32,
    /// RFC 3339 时间戳
    pub timestamp: String,
    /// "Transformer" 或 "Hybrid"
    pub model: String,
}

/// 聊天机器人
#[derive(Debug, Clone)]
pub struct ChatBot {
    tokenizer: Arc<Tokenizer>,
    generator: Generator,
    fallback: KeywordResponder,
    settings: SamplingConfig,
}

impl ChatBot {
    pub fn new(tokenizer: Tokenizer, handle: Arc<ModelHandle>) -> Self {
        Self {
            tokenizer: Arc::new(tokenizer),
            generator: Generator::new(handle),
            fallback: KeywordResponder::new(),
            settings: SamplingConfig::chat(),
        }
    }

    /// 只有关键词回复的机器人
    pub fn fallback_only() -> Self {
        Self::new(Tokenizer::new(), Arc::new(ModelHandle::new()))
    }

    /// 用训练好的模型创建
    pub fn with_model(tokenizer: Tokenizer, model: ChatTransformer) -> Self {
        Self::new(tokenizer, Arc::new(ModelHandle::with_model(model)))
    }

    /// 设置生成参数
    pub fn with_settings(mut self, settings: SamplingConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &SamplingConfig {
        &self.settings
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn handle(&self) -> &Arc<ModelHandle> {
        self.generator.handle()
    }

    pub fn has_model(&self) -> bool {
        self.handle().is_loaded()
    }

    /// 从模型目录加载词表和模型
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let vocab = Vocabulary::load_json(dir.join(VOCAB_FILE))?;
        let model = ChatTransformer::load_checkpoint(dir.join(MODEL_FILE))?;

        if model.vocab_size() != vocab.vocab_size() {
            return Err(ModelError::mismatch(
                "vocab_size",
                vocab.vocab_size(),
                model.vocab_size(),
            ));
        }

        log::info!("已从 {} 加载模型: {}", dir.display(), model.info());
        Ok(Self::with_model(Tokenizer::from_vocabulary(vocab), model))
    }

    /// 保存词表和当前模型
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let model = self.handle().snapshot()?;
        self.tokenizer.vocabulary()?.save_json(dir.join(VOCAB_FILE))?;
        model.save_checkpoint(dir.join(MODEL_FILE))?;
        log::info!("模型和词表已保存到 {}", dir.display());
        Ok(())
    }

    /// 生成回复，返回 (回复, 置信度)
    pub fn respond<R: Rng + ?Sized>(&self, message: &str, rng: &mut R) -> (String, f32) {
        let reply = self.process_message(message, rng);
        (reply.response, reply.confidence)
    }

    /// 处理一条消息
    pub fn process_message<R: Rng + ?Sized>(&self, message: &str, rng: &mut R) -> ChatReply {
        let loaded = self.has_model();
        let model = if loaded { "Transformer" } else { "Hybrid" };
        let timestamp = chrono::Local::now().to_rfc3339();

        if loaded {
            match self.generate_reply(message, rng) {
                Ok(text) if !text.trim().is_empty() => {
                    return ChatReply {
                        response: text,
                        intent: GENERATION_INTENT.to_string(),
                        confidence: GENERATION_CONFIDENCE,
                        timestamp,
                        model: model.to_string(),
                    };
                }
                Ok(_) => log::warn!("模型生成了空回复，使用关键词回复"),
                Err(e) => log::warn!("模型生成失败 ({})，使用关键词回复", e),
            }
        }

        let fallback = self.fallback.respond(message, rng);
        ChatReply {
            response: fallback.text,
            intent: fallback.intent,
            confidence: fallback.confidence,
            timestamp,
            model: model.to_string(),
        }
    }

    /// 用模型生成回复文本（不含提示部分）
    fn generate_reply<R: Rng + ?Sized>(&self, message: &str, rng: &mut R) -> Result<String> {
        // 编码和生成使用同一份快照
        let model = self.handle().snapshot()?;
        let encoded = self.tokenizer.encode(message, model.max_seq_len())?;
        let prompt = trim_padding(&encoded);

        let output = Generator::generate_on(&model, prompt, &self.settings, rng)?;
        let start = prompt.len().max(1).min(output.len());
        self.tokenizer.decode(&output[start..])
    }
}

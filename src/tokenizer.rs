//! 词级分词器和词表
//!
//! 把原始文本规范化后映射为定长 id 序列，并能还原回文本。
//! 词表按词频降序排列，前四个 id 固定留给特殊标记。

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{ModelError, Result};

/// 填充标记 id（永远是 0）
pub const PAD_ID: usize = 0;
/// 序列开始标记 id
pub const START_ID: usize = 1;
/// 序列结束标记 id
pub const END_ID: usize = 2;
/// 未知词标记 id
pub const UNK_ID: usize = 3;

pub const PAD_TOKEN: &str = "<PAD>";
pub const START_TOKEN: &str = "<SOS>";
pub const END_TOKEN: &str = "<EOS>";
pub const UNK_TOKEN: &str = "<UNK>";

/// 特殊标记数量
pub const NUM_SPECIAL_TOKENS: usize = 4;

/// 默认词表容量（不含特殊标记）
pub const DEFAULT_MAX_WORDS: usize = 5000;

/// 最短序列长度：START 和 END 各占一个位置
pub const MIN_SEQ_LEN: usize = 2;

fn non_letter_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-záéíóúñü\s]").expect("static pattern is valid"))
}

/// 文本规范化：小写，去掉字母（含西语重音字母）和空白以外的字符
pub fn normalize(text: &str) -> String {
    let lower = text.to_lowercase();
    non_letter_regex().replace_all(&lower, "").into_owned()
}

/// 规范化后按空白切分
pub fn split_words(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// 词表
///
/// 序列化字段与持久化格式一一对应：`words`、`word2idx`、`idx2word`、`vocab_size`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    /// 按 id 排列的词（含特殊标记）
    words: Vec<String>,
    /// 词 → id
    word2idx: HashMap<String, usize>,
    /// id → 词
    idx2word: BTreeMap<usize, String>,
    /// 词表大小
    vocab_size: usize,
}

impl Vocabulary {
    /// 从语料构建词表
    ///
    /// # 参数
    /// - `corpus`: 原始文本
    /// - `max_words`: 最多保留的普通词数量
    pub fn build<S: AsRef<str>>(corpus: &[S], max_words: usize) -> Self {
        // 统计词频，同频词保持首次出现的顺序
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        let mut next_order = 0;
        for text in corpus {
            for word in split_words(text.as_ref()) {
                let entry = counts.entry(word).or_insert_with(|| {
                    next_order += 1;
                    (0, next_order)
                });
                entry.0 += 1;
            }
        }

        let mut ranked: Vec<(String, usize, usize)> = counts
            .into_iter()
            .map(|(word, (count, order))| (word, count, order))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        let mut words: Vec<String> = [PAD_TOKEN, START_TOKEN, END_TOKEN, UNK_TOKEN]
            .iter()
            .map(|s| s.to_string())
            .collect();
        words.extend(
            ranked
                .into_iter()
                .filter(|(word, _, _)| !Self::is_special(word))
                .take(max_words)
                .map(|(word, _, _)| word),
        );

        Self::from_words(words)
    }

    fn from_words(words: Vec<String>) -> Self {
        let word2idx = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i))
            .collect();
        let idx2word = words
            .iter()
            .enumerate()
            .map(|(i, w)| (i, w.clone()))
            .collect();
        let vocab_size = words.len();

        Self {
            words,
            word2idx,
            idx2word,
            vocab_size,
        }
    }

    fn is_special(word: &str) -> bool {
        matches!(word, PAD_TOKEN | START_TOKEN | END_TOKEN | UNK_TOKEN)
    }

    /// 将文本转换为定长 token ids
    ///
    /// `[START] + 词 + [END]`，过长时从尾部截断并为 END 保留最后一个位置，不足时用 PAD 补齐。
    pub fn encode(&self, text: &str, max_len: usize) -> Result<Vec<usize>> {
        if max_len < MIN_SEQ_LEN {
            return Err(ModelError::InvalidMaxLen(max_len));
        }

        let mut ids = Vec::with_capacity(max_len);
        ids.push(START_ID);
        ids.extend(
            split_words(text)
                .iter()
                .take(max_len - 2)
                .map(|w| self.token_id(w)),
        );
        ids.push(END_ID);
        ids.resize(max_len, PAD_ID);

        Ok(ids)
    }

    /// 将 token ids 转换回文本
    ///
    /// 遇到第一个 END 停止，跳过 PAD/START，越界 id 还原为 `<UNK>`。
    pub fn decode(&self, ids: &[usize]) -> String {
        let mut words = Vec::new();
        for &id in ids {
            match id {
                END_ID => break,
                PAD_ID | START_ID => continue,
                _ => words.push(self.token(id)),
            }
        }
        words.join(" ")
    }

    /// 查询词的 id，未登录词返回 UNK
    pub fn token_id(&self, word: &str) -> usize {
        self.word2idx.get(word).copied().unwrap_or(UNK_ID)
    }

    /// 查询 id 对应的词
    pub fn token(&self, id: usize) -> &str {
        self.idx2word.get(&id).map(String::as_str).unwrap_or(UNK_TOKEN)
    }

    /// 获取词表大小
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// 按 id 排列的词
    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// 检查各字段是否一致（加载外部文件后调用）
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size != self.words.len() {
            return Err(ModelError::InvalidArtifact(format!(
                "vocab_size {} does not match {} words",
                self.vocab_size,
                self.words.len()
            )));
        }
        if self.vocab_size < NUM_SPECIAL_TOKENS
            || self.words[PAD_ID] != PAD_TOKEN
            || self.words[START_ID] != START_TOKEN
            || self.words[END_ID] != END_TOKEN
            || self.words[UNK_ID] != UNK_TOKEN
        {
            return Err(ModelError::InvalidArtifact(
                "special tokens must occupy ids 0..4".to_string(),
            ));
        }
        for (i, w) in self.words.iter().enumerate() {
            if self.word2idx.get(w) != Some(&i) || self.idx2word.get(&i) != Some(w) {
                return Err(ModelError::InvalidArtifact(format!(
                    "word '{}' is not mapped consistently to id {}",
                    w, i
                )));
            }
        }
        if self.word2idx.len() != self.vocab_size || self.idx2word.len() != self.vocab_size {
            return Err(ModelError::InvalidArtifact(
                "word2idx/idx2word contain extra entries".to_string(),
            ));
        }
        Ok(())
    }

    /// 保存为 JSON 格式
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// 从 JSON 格式加载
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let vocab: Self = serde_json::from_reader(reader)?;
        vocab.validate()?;
        Ok(vocab)
    }
}

/// 构建词表
pub fn build_vocabulary<S: AsRef<str>>(corpus: &[S], max_words: usize) -> Vocabulary {
    Vocabulary::build(corpus, max_words)
}

/// 编码文本
pub fn encode(text: &str, vocab: &Vocabulary, max_len: usize) -> Result<Vec<usize>> {
    vocab.encode(text, max_len)
}

/// 解码 token ids
pub fn decode(ids: &[usize], vocab: &Vocabulary) -> String {
    vocab.decode(ids)
}

/// 分词器
///
/// 持有可选的词表；词表构建前调用 encode/decode 返回 `VocabularyNotBuilt`。
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
    vocab: Option<Vocabulary>,
}

impl Tokenizer {
    /// 创建空的分词器
    pub fn new() -> Self {
        Self { vocab: None }
    }

    /// 用已有词表创建
    pub fn from_vocabulary(vocab: Vocabulary) -> Self {
        Self { vocab: Some(vocab) }
    }

    /// 从语料构建词表
    pub fn build<S: AsRef<str>>(&mut self, corpus: &[S], max_words: usize) -> &Vocabulary {
        let vocab = Vocabulary::build(corpus, max_words);
        log::info!("词表构建完成: {} 个 token", vocab.vocab_size());
        self.vocab.insert(vocab)
    }

    /// 获取词表
    pub fn vocabulary(&self) -> Result<&Vocabulary> {
        self.vocab.as_ref().ok_or(ModelError::VocabularyNotBuilt)
    }

    pub fn is_built(&self) -> bool {
        self.vocab.is_some()
    }

    pub fn encode(&self, text: &str, max_len: usize) -> Result<Vec<usize>> {
        self.vocabulary()?.encode(text, max_len)
    }

    pub fn decode(&self, ids: &[usize]) -> Result<String> {
        Ok(self.vocabulary()?.decode(ids))
    }

    pub fn vocab_size(&self) -> Result<usize> {
        Ok(self.vocabulary()?.vocab_size())
    }
}

/// 去掉序列尾部的 PAD
pub fn trim_padding(ids: &[usize]) -> &[usize] {
    let end = ids
        .iter()
        .rposition(|&id| id != PAD_ID)
        .map_or(0, |i| i + 1);
    &ids[..end]
}

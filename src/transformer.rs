//! 对话 Transformer
//!
//! 组合所有组件，构建用于生成回复的 Transformer 模型。
//!
//! ```text
//! token ids → Embedding·√d_model + PE → Dropout →
//!     [Transformer Block × N] → fc_out → logits
//! ```

use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::attention::{AttentionCache, MultiHeadAttention};
use crate::embedding::{Embedding, PositionalEncoding};
use crate::error::Result;
use crate::gradient_clip::Gradients;
use crate::layers::{Dropout, FeedForward, FeedForwardCache, LayerNorm, LayerNormCache, Linear};
use crate::optimizer::Optimizer;
use crate::tensor::{flatten_batch, unflatten_batch};
use crate::tokenizer::MIN_SEQ_LEN;

/// Transformer 配置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerConfig {
    /// 词表大小（含 4 个特殊 token）
    pub vocab_size: usize,
    /// 模型维度
    pub d_model: usize,
    /// 注意力头数
    pub n_heads: usize,
    /// Transformer Block 层数
    pub n_layers: usize,
    /// FFN 隐藏层维度
    pub d_ff: usize,
    /// 最大序列长度
    pub max_seq_len: usize,
    /// Dropout 比率
    pub dropout: f32,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
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

impl TransformerConfig {
    /// 用实际构建出的词表大小替换配置中的值
    pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self
    }
}

/// 单个 Transformer Block（Post-LN）
///
/// 包含两个子层，每个子层都有残差连接和层归一化：
/// 1. Multi-Head Self-Attention
/// 2. Position-wise Feed-Forward Network
///
/// ```text
/// x → LayerNorm(x + Dropout(Attention(x))) → LayerNorm(x + Dropout(FFN(x))) → output
/// ```
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    pub(crate) attention: MultiHeadAttention,
    pub(crate) feed_forward: FeedForward,
    pub(crate) norm1: LayerNorm,
    pub(crate) norm2: LayerNorm,
    dropout: Dropout,
}

/// Block 训练前向的缓存
#[derive(Debug, Clone)]
pub struct BlockCache {
    attn: AttentionCache,
    attn_drop: Option<Array2<f32>>,
    norm1: LayerNormCache,
    ffn: FeedForwardCache,
    ffn_drop: Option<Array2<f32>>,
    norm2: LayerNormCache,
    batch: usize,
    seq: usize,
}

impl TransformerBlock {
    /// 创建新的 Block
    pub fn new<R: Rng + ?Sized>(
        d_model: usize,
        n_heads: usize,
        d_ff: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            attention: MultiHeadAttention::new(d_model, n_heads, dropout, rng),
            feed_forward: FeedForward::new(d_model, d_ff, dropout, rng),
            norm1: LayerNorm::new(d_model),
            norm2: LayerNorm::new(d_model),
            dropout: Dropout::new(dropout),
        }
    }

    pub fn from_parts(
        attention: MultiHeadAttention,
        feed_forward: FeedForward,
        norm1: LayerNorm,
        norm2: LayerNorm,
        dropout: f32,
    ) -> Self {
        Self {
            attention,
            feed_forward,
            norm1,
            norm2,
            dropout: Dropout::new(dropout),
        }
    }

    /// 前向传播（推理）
    ///
    /// # 参数
    /// - `x`: 输入 [batch, seq, d_model]
    /// - `mask`: 可选的 key 填充掩码 [batch, seq]
    pub fn forward(&self, x: &Array3<f32>, mask: Option<&Array2<f32>>) -> Result<Array3<f32>> {
        let (batch, seq, _) = x.dim();

        // 1. Multi-Head Self-Attention + Residual + Norm
        let (attn_out, _) = self.attention.forward(x, mask)?;
        let h = self
            .norm1
            .forward(&(flatten_batch(x) + &flatten_batch(&attn_out)));

        // 2. Feed-Forward + Residual + Norm
        let ffn_out = self.feed_forward.forward(&h);
        let out = self.norm2.forward(&(&h + &ffn_out));

        Ok(unflatten_batch(&out, batch, seq))
    }

    /// 训练前向
    pub fn forward_train<R: Rng + ?Sized>(
        &self,
        x: &Array3<f32>,
        mask: Option<&Array2<f32>>,
        rng: &mut R,
    ) -> Result<(Array3<f32>, BlockCache)> {
        let (batch, seq, _) = x.dim();

        let (attn_out, attn) = self.attention.forward_train(x, mask, rng)?;
        let (attn_out, attn_drop) = self.dropout.forward_train(&flatten_batch(&attn_out), rng);
        let (h, norm1) = self.norm1.forward_train(&(flatten_batch(x) + &attn_out));

        let (ffn_out, ffn) = self.feed_forward.forward_train(&h, rng);
        let (ffn_out, ffn_drop) = self.dropout.forward_train(&ffn_out, rng);
        let (out, norm2) = self.norm2.forward_train(&(&h + &ffn_out));

        let cache = BlockCache {
            attn,
            attn_drop,
            norm1,
            ffn,
            ffn_drop,
            norm2,
            batch,
            seq,
        };
        Ok((unflatten_batch(&out, batch, seq), cache))
    }

    /// 反向传播
    ///
    /// 每个残差连接把梯度同时传给主干和子层分支。
    pub fn backward(
        &self,
        grad_output: &Array3<f32>,
        cache: &BlockCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Array3<f32> {
        let (batch, seq) = (cache.batch, cache.seq);
        let grad = flatten_batch(grad_output);

        let grad_sum2 =
            self.norm2
                .backward(&grad, &cache.norm2, &format!("{}.norm2", prefix), grads);
        let grad_ffn = Dropout::backward(&grad_sum2, cache.ffn_drop.as_ref());
        let grad_h = &grad_sum2
            + &self.feed_forward.backward(
                &grad_ffn,
                &cache.ffn,
                &format!("{}.ffn", prefix),
                grads,
            );

        let grad_sum1 =
            self.norm1
                .backward(&grad_h, &cache.norm1, &format!("{}.norm1", prefix), grads);
        let grad_attn = Dropout::backward(&grad_sum1, cache.attn_drop.as_ref());
        let grad_x = self.attention.backward(
            &unflatten_batch(&grad_attn, batch, seq),
            &cache.attn,
            &format!("{}.attn", prefix),
            grads,
        );

        grad_x + &unflatten_batch(&grad_sum1, batch, seq)
    }

    pub fn params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Array2<f32>)> {
        let mut params = self.attention.params_mut(&format!("{}.attn", prefix));
        params.extend(self.feed_forward.params_mut(&format!("{}.ffn", prefix)));
        params.extend(self.norm1.params_mut(&format!("{}.norm1", prefix)));
        params.extend(self.norm2.params_mut(&format!("{}.norm2", prefix)));
        params
    }

    /// 获取层的参数数量
    pub fn param_count(&self) -> usize {
        let (g1, b1) = self.norm1.params();
        let (g2, b2) = self.norm2.params();
        self.attention.param_count()
            + self.feed_forward.param_count()
            + g1.len()
            + b1.len()
            + g2.len()
            + b2.len()
    }
}

/// 完整的对话 Transformer
///
/// 输出每个位置在词表上的 logits，不做 softmax。
/// 推理时只读，训练时由 [`crate::trainer::Trainer`] 独占修改。
#[derive(Debug, Clone)]
pub struct ChatTransformer {
    pub(crate) config: TransformerConfig,
    pub(crate) embedding: Embedding,
    pub(crate) positional: PositionalEncoding,
    pub(crate) blocks: Vec<TransformerBlock>,
    pub(crate) fc_out: Linear,
    dropout: Dropout,
}

/// 整个模型训练前向的缓存
#[derive(Debug, Clone)]
pub struct ForwardCache {
    ids: Array2<usize>,
    embed_drop: Option<Array2<f32>>,
    blocks: Vec<BlockCache>,
    /// 最后一个 Block 的输出（fc_out 的输入）
    hidden: Array2<f32>,
}

impl ChatTransformer {
    /// 使用随机种子创建新模型
    pub fn new(config: TransformerConfig) -> Self {
        let mut rng = StdRng::from_entropy();
        Self::with_rng(config, &mut rng)
    }

    /// 使用给定的随机数生成器初始化权重
    ///
    /// # Panics
    /// `d_model` 不能被 `n_heads` 整除，dropout 不在 [0, 1) 范围内，
    /// 或 `max_seq_len` 小于 [`MIN_SEQ_LEN`]。
    pub fn with_rng<R: Rng + ?Sized>(config: TransformerConfig, rng: &mut R) -> Self {
        let embedding = Embedding::new(config.vocab_size, config.d_model, rng);
        let blocks = (0..config.n_layers)
            .map(|_| {
                TransformerBlock::new(
                    config.d_model,
                    config.n_heads,
                    config.d_ff,
                    config.dropout,
                    rng,
                )
            })
            .collect();
        let fc_out = Linear::new(config.d_model, config.vocab_size, rng);

        Self::from_parts(config, embedding, blocks, fc_out)
    }

    /// 由已有的组件组装（用于加载检查点）
    ///
    /// # Panics
    /// `max_seq_len` 小于 [`MIN_SEQ_LEN`]。
    pub fn from_parts(
        config: TransformerConfig,
        embedding: Embedding,
        blocks: Vec<TransformerBlock>,
        fc_out: Linear,
    ) -> Self {
        assert!(
            config.max_seq_len >= MIN_SEQ_LEN,
            "max_seq_len must be at least {}",
            MIN_SEQ_LEN
        );

        Self {
            positional: PositionalEncoding::new(config.max_seq_len, config.d_model),
            dropout: Dropout::new(config.dropout),
            config,
            embedding,
            blocks,
            fc_out,
        }
    }

    fn embed(&self, ids: &Array2<usize>) -> Result<Array3<f32>> {
        let x = self.embedding.forward(ids)?;
        self.positional.forward(&x)
    }

    /// 前向传播（推理模式，dropout 不生效）
    ///
    /// # 参数
    /// - `ids`: token ids [batch, seq]
    /// - `mask`: 可选的 key 填充掩码 [batch, seq]，见 [`crate::tensor::padding_mask`]
    ///
    /// # 返回
    /// - logits [batch, seq, vocab_size]
    pub fn forward(
        &self,
        ids: &Array2<usize>,
        mask: Option<&Array2<f32>>,
    ) -> Result<Array3<f32>> {
        let (batch, seq) = ids.dim();

        // 1. 嵌入 + 位置编码
        let mut x = self.embed(ids)?;

        // 2. 通过所有 Block
        for block in &self.blocks {
            x = block.forward(&x, mask)?;
        }

        // 3. 输出投影
        let logits = self.fc_out.forward(&flatten_batch(&x));
        Ok(unflatten_batch(&logits, batch, seq))
    }

    /// 训练前向：使用调用方的随机数生成器做 dropout
    pub fn forward_train<R: Rng + ?Sized>(
        &self,
        ids: &Array2<usize>,
        mask: Option<&Array2<f32>>,
        rng: &mut R,
    ) -> Result<(Array3<f32>, ForwardCache)> {
        let (batch, seq) = ids.dim();

        let x = self.embed(ids)?;
        let (x, embed_drop) = self.dropout.forward_train(&flatten_batch(&x), rng);
        let mut x = unflatten_batch(&x, batch, seq);

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (y, cache) = block.forward_train(&x, mask, rng)?;
            block_caches.push(cache);
            x = y;
        }

        let hidden = flatten_batch(&x);
        let logits = self.fc_out.forward(&hidden);

        let cache = ForwardCache {
            ids: ids.clone(),
            embed_drop,
            blocks: block_caches,
            hidden,
        };
        Ok((unflatten_batch(&logits, batch, seq), cache))
    }

    /// 反向传播
    ///
    /// # 参数
    /// - `grad_logits`: 损失对 logits 的梯度 [batch, seq, vocab_size]
    ///
    /// 位置编码是固定的，梯度只流到词嵌入。
    pub fn backward(&self, grad_logits: &Array3<f32>, cache: &ForwardCache) -> Gradients {
        let (batch, seq) = cache.ids.dim();
        let mut grads = Gradients::new();

        let grad_hidden = self.fc_out.backward(
            &cache.hidden,
            &flatten_batch(grad_logits),
            "fc_out",
            &mut grads,
        );

        let mut grad = unflatten_batch(&grad_hidden, batch, seq);
        for (i, (block, block_cache)) in self.blocks.iter().zip(&cache.blocks).enumerate().rev() {
            grad = block.backward(&grad, block_cache, &format!("blocks.{}", i), &mut grads);
        }

        let grad = Dropout::backward(&flatten_batch(&grad), cache.embed_drop.as_ref());
        let grad_embedding = self
            .embedding
            .backward(&cache.ids, &unflatten_batch(&grad, batch, seq));
        grads.insert("embedding.weight", grad_embedding);

        grads
    }

    /// 所有可训练参数，名字与 [`Self::backward`] 产生的梯度名一致
    pub fn params_mut(&mut self) -> Vec<(String, &mut Array2<f32>)> {
        let mut params = vec![("embedding.weight".to_string(), &mut self.embedding.weights)];
        for (i, block) in self.blocks.iter_mut().enumerate() {
            params.extend(block.params_mut(&format!("blocks.{}", i)));
        }
        params.extend(self.fc_out.params_mut("fc_out"));
        params
    }

    /// 用优化器更新所有有梯度的参数
    pub fn apply_gradients<O: Optimizer + ?Sized>(&mut self, grads: &Gradients, optimizer: &mut O) {
        for (name, param) in self.params_mut() {
            if let Some(grad) = grads.get(&name) {
                optimizer.step(param, grad, &name);
            }
        }
    }

    /// 获取配置
    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    pub fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    /// 获取总参数数量（位置编码不计入）
    pub fn param_count(&self) -> usize {
        let layer_params = self.blocks.iter().map(|b| b.param_count()).sum::<usize>();

        self.embedding.weights().len() + layer_params + self.fc_out.param_count()
    }

    /// 获取模型信息
    pub fn info(&self) -> String {
        format!(
            "ChatTransformer(
  vocab_size: {},
  d_model: {},
  n_heads: {},
  n_layers: {},
  d_ff: {},
  max_seq_len: {},
  dropout: {:.2},
  total_params: {},
)",
            self.config.vocab_size,
            self.config.d_model,
            self.config.n_heads,
            self.config.n_layers,
            self.config.d_ff,
            self.config.max_seq_len,
            self.config.dropout,
            self.param_count(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::tensor::padding_mask;
    use ndarray::arr2;

    fn tiny_config() -> TransformerConfig {
        TransformerConfig {
            vocab_size: 12,
            d_model: 8,
            n_heads: 2,
            n_layers: 2,
            d_ff: 16,
            max_seq_len: 8,
            dropout: 0.0,
        }
    }

    #[test]
    fn test_config_default() {
        let config = TransformerConfig::default();
        assert_eq!(config.d_model, 256);
        assert_eq!(config.n_heads, 8);
        assert_eq!(config.n_layers, 4);
        assert_eq!(config.d_ff, 1024);
        assert_eq!(config.max_seq_len, 128);
    }

    #[test]
    fn test_config_partial_json() {
        let config: TransformerConfig = serde_json::from_str(r#"{"d_model": 64}"#).unwrap();
        assert_eq!(config.d_model, 64);
        assert_eq!(config.n_heads, 8);
    }

    #[test]
    fn test_block_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let block = TransformerBlock::new(16, 4, 32, 0.1, &mut rng);
        let x = Array3::from_shape_fn((2, 5, 16), |(b, s, d)| ((b + s + d) as f32).sin());

        let y = block.forward(&x, None).unwrap();
        assert_eq!(y.shape(), &[2, 5, 16]);
    }

    #[test]
    fn test_forward_shape_and_finite() {
        let mut rng = StdRng::seed_from_u64(42);
        let model = ChatTransformer::with_rng(tiny_config(), &mut rng);
        let ids = arr2(&[[1usize, 5, 6, 2], [1, 7, 2, 0]]);
        let mask = padding_mask(&ids, 0);

        let logits = model.forward(&ids, Some(&mask)).unwrap();
        assert_eq!(logits.shape(), &[2, 4, 12]);
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_is_deterministic_in_inference() {
        let mut rng = StdRng::seed_from_u64(42);
        let config = TransformerConfig {
            dropout: 0.3,
            ..tiny_config()
        };
        let model = ChatTransformer::with_rng(config, &mut rng);
        let ids = arr2(&[[1usize, 4, 9, 2]]);

        assert_eq!(
            model.forward(&ids, None).unwrap(),
            model.forward(&ids, None).unwrap()
        );
    }

    #[test]
    #[should_panic(expected = "max_seq_len must be at least 2")]
    fn test_zero_context_rejected() {
        let config = TransformerConfig {
            max_seq_len: 0,
            ..tiny_config()
        };
        ChatTransformer::with_rng(config, &mut StdRng::seed_from_u64(0));
    }

    #[test]
    fn test_forward_errors() {
        let mut rng = StdRng::seed_from_u64(1);
        let model = ChatTransformer::with_rng(tiny_config(), &mut rng);

        let too_long = Array2::from_elem((1, 9), 1usize);
        assert!(matches!(
            model.forward(&too_long, None),
            Err(ModelError::SequenceLength { len: 9, max: 8 })
        ));

        let bad_id = arr2(&[[1usize, 12]]);
        assert!(matches!(
            model.forward(&bad_id, None),
            Err(ModelError::TokenOutOfRange { id: 12, .. })
        ));
    }

    #[test]
    fn test_backward_produces_every_gradient() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut model = ChatTransformer::with_rng(tiny_config(), &mut rng);
        let ids = arr2(&[[1usize, 5, 6, 2]]);

        let (logits, cache) = model.forward_train(&ids, None, &mut rng).unwrap();
        let grads = model.backward(&Array3::ones(logits.dim()), &cache);

        let names: Vec<String> = model.params_mut().into_iter().map(|(n, _)| n).collect();
        assert_eq!(grads.len(), names.len());
        for name in &names {
            assert!(grads.get(name).is_some(), "missing gradient for {}", name);
        }
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(9);
        let model = ChatTransformer::with_rng(tiny_config(), &mut rng);
        let ids = arr2(&[[1usize, 4, 6, 2], [1, 3, 2, 0]]);
        let mask = padding_mask(&ids, 0);
        let upstream = Array3::from_shape_fn((2, 4, 12), |(b, s, v)| {
            ((b * 31 + s * 7 + v) as f32 * 0.37).sin()
        });

        let loss = |m: &ChatTransformer| -> f32 {
            (m.forward(&ids, Some(&mask)).unwrap() * &upstream).sum()
        };

        let (_, cache) = model.forward_train(&ids, Some(&mask), &mut rng).unwrap();
        let grads = model.backward(&upstream, &cache);

        let eps = 1e-2;
        let checks: [(&str, (usize, usize)); 4] = [
            ("embedding.weight", (4, 1)),
            ("blocks.0.attn.w_v.weight", (2, 3)),
            ("blocks.1.norm1.gamma", (0, 5)),
            ("fc_out.bias", (0, 7)),
        ];
        for (name, idx) in checks {
            let perturbed = |delta: f32| {
                let mut m = model.clone();
                for (n, p) in m.params_mut() {
                    if n == name {
                        p[idx] += delta;
                    }
                }
                loss(&m)
            };
            let numeric = (perturbed(eps) - perturbed(-eps)) / (2.0 * eps);
            let analytic = grads.get(name).unwrap()[idx];
            assert!(
                (numeric - analytic).abs() < 2e-2,
                "{}: numeric {} vs analytic {}",
                name,
                numeric,
                analytic
            );
        }
    }

    #[test]
    fn test_param_count() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = tiny_config();
        let model = ChatTransformer::with_rng(config, &mut rng);

        // embedding + fc_out(weight + bias)
        let outer = 12 * 8 + 8 * 12 + 12;
        // attn 4×(8×8+8) + ffn (8×16+16 + 16×8+8) + 2 个 LayerNorm
        let block = 4 * (64 + 8) + (128 + 16 + 128 + 8) + 4 * 8;
        assert_eq!(model.param_count(), outer + 2 * block);
    }
}

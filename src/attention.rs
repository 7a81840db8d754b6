//! Multi-Head Self-Attention
//!
//! Transformer 的核心组件：允许模型关注输入序列的不同位置。
//! 输入按 batch 组织为 [batch, seq, d_model]，可选的 key 填充掩码把 PAD 位置屏蔽掉。

use ndarray::{s, Array2, Array3, Array4, Axis};
use rand::Rng;

use crate::error::{ModelError, Result};
use crate::gradient_clip::Gradients;
use crate::layers::{Dropout, Linear};
use crate::tensor::{flatten_batch, unflatten_batch, TensorExt};

/// 被屏蔽位置的分数
const MASK_FILL: f32 = -1e9;

/// Multi-Head Attention 参数
#[derive(Debug, Clone, Copy)]
pub struct AttentionParams {
    /// 模型维度
    pub d_model: usize,
    /// 注意力头数
    pub n_heads: usize,
    /// 每个头的维度
    pub d_k: usize,
}

impl AttentionParams {
    pub fn new(d_model: usize, n_heads: usize) -> Self {
        assert!(
            n_heads > 0 && d_model % n_heads == 0,
            "d_model must be divisible by n_heads"
        );

        Self {
            d_model,
            n_heads,
            d_k: d_model / n_heads,
        }
    }
}

/// Multi-Head Self-Attention 层
///
/// 核心思想：将注意力分成多个"头"，每个头学习不同的表示子空间。
///
/// ```text
/// Input → [Q, K, V] → Split into Heads →
///     [Scaled Dot-Product Attention × N] →
///     Concat Heads → Linear → Output
/// ```
///
/// 没有因果掩码：每个位置都能看到整条序列中未被屏蔽的位置。
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    params: AttentionParams,
    /// Query 投影
    pub(crate) w_q: Linear,
    /// Key 投影
    pub(crate) w_k: Linear,
    /// Value 投影
    pub(crate) w_v: Linear,
    /// 输出投影
    pub(crate) w_o: Linear,
    dropout: Dropout,
}

/// 训练前向保存的中间结果
#[derive(Debug, Clone)]
pub struct AttentionCache {
    /// 展平后的输入 [batch * seq, d_model]
    input: Array2<f32>,
    q: Array2<f32>,
    k: Array2<f32>,
    v: Array2<f32>,
    /// softmax 之后、dropout 之前的权重
    weights: Array4<f32>,
    /// 每个 (batch, head) 的 dropout 掩码
    dropout_masks: Vec<Option<Array2<f32>>>,
    /// 拼接后的各头输出 [batch * seq, d_model]
    context: Array2<f32>,
    batch: usize,
    seq: usize,
}

impl MultiHeadAttention {
    /// 创建新的 Multi-Head Attention 层
    ///
    /// # 参数
    /// - `d_model`: 模型维度
    /// - `n_heads`: 注意力头数
    /// - `dropout`: 注意力权重上的 dropout 概率
    pub fn new<R: Rng + ?Sized>(d_model: usize, n_heads: usize, dropout: f32, rng: &mut R) -> Self {
        let params = AttentionParams::new(d_model, n_heads);

        Self {
            params,
            w_q: Linear::new(d_model, d_model, rng),
            w_k: Linear::new(d_model, d_model, rng),
            w_v: Linear::new(d_model, d_model, rng),
            w_o: Linear::new(d_model, d_model, rng),
            dropout: Dropout::new(dropout),
        }
    }

    /// 由已有的投影层组装（用于加载检查点）
    pub fn from_parts(
        n_heads: usize,
        w_q: Linear,
        w_k: Linear,
        w_v: Linear,
        w_o: Linear,
        dropout: f32,
    ) -> Self {
        Self {
            params: AttentionParams::new(w_q.in_features(), n_heads),
            w_q,
            w_k,
            w_v,
            w_o,
            dropout: Dropout::new(dropout),
        }
    }

    fn check_mask(mask: Option<&Array2<f32>>, batch: usize, seq: usize) -> Result<()> {
        match mask {
            Some(m) if m.dim() != (batch, seq) => {
                Err(ModelError::mismatch("attention mask", (batch, seq), m.dim()))
            }
            _ => Ok(()),
        }
    }

    /// 缩放点积注意力（所有 batch 和头）
    ///
    /// ```text
    /// Attention(Q, K, V) = softmax(QK^T / √d_k) * V
    /// ```
    ///
    /// `sample_dropout` 为每个 (batch, head) 提供注意力权重上的 dropout 掩码。
    fn attend<F>(
        &self,
        q: &Array2<f32>,
        k: &Array2<f32>,
        v: &Array2<f32>,
        batch: usize,
        seq: usize,
        mask: Option<&Array2<f32>>,
        mut sample_dropout: F,
    ) -> (Array2<f32>, Array4<f32>, Vec<Option<Array2<f32>>>)
    where
        F: FnMut((usize, usize)) -> Option<Array2<f32>>,
    {
        let AttentionParams {
            d_model,
            n_heads,
            d_k,
        } = self.params;
        let scale = 1.0 / (d_k as f32).sqrt();

        let mut context = Array2::zeros((batch * seq, d_model));
        let mut weights = Array4::zeros((batch, n_heads, seq, seq));
        let mut dropout_masks = Vec::with_capacity(batch * n_heads);

        for b in 0..batch {
            let (r0, r1) = (b * seq, (b + 1) * seq);
            for h in 0..n_heads {
                let (c0, c1) = (h * d_k, (h + 1) * d_k);
                let q_bh = q.slice(s![r0..r1, c0..c1]);
                let k_bh = k.slice(s![r0..r1, c0..c1]);
                let v_bh = v.slice(s![r0..r1, c0..c1]);

                let mut scores = q_bh.dot(&k_bh.t()) * scale;
                if let Some(mask) = mask {
                    for j in 0..seq {
                        if mask[[b, j]] == 0.0 {
                            scores.column_mut(j).fill(MASK_FILL);
                        }
                    }
                }

                let w = scores.softmax(1);
                let drop_mask = sample_dropout((seq, seq));
                let head_out = match &drop_mask {
                    Some(m) => (&w * m).dot(&v_bh),
                    None => w.dot(&v_bh),
                };

                context.slice_mut(s![r0..r1, c0..c1]).assign(&head_out);
                weights.slice_mut(s![b, h, .., ..]).assign(&w);
                dropout_masks.push(drop_mask);
            }
        }

        (context, weights, dropout_masks)
    }

    /// 前向传播（推理，无 dropout）
    ///
    /// # 参数
    /// - `x`: 输入 [batch, seq, d_model]
    /// - `mask`: 可选的 key 填充掩码 [batch, seq]，1 表示保留，0 表示 PAD
    ///
    /// # 返回
    /// - 输出 [batch, seq, d_model]
    /// - 注意力权重 [batch, n_heads, seq, seq]
    pub fn forward(
        &self,
        x: &Array3<f32>,
        mask: Option<&Array2<f32>>,
    ) -> Result<(Array3<f32>, Array4<f32>)> {
        let (batch, seq, _) = x.dim();
        Self::check_mask(mask, batch, seq)?;

        let input = flatten_batch(x);
        let q = self.w_q.forward(&input);
        let k = self.w_k.forward(&input);
        let v = self.w_v.forward(&input);

        let (context, weights, _) = self.attend(&q, &k, &v, batch, seq, mask, |_| None);
        let output = self.w_o.forward(&context);

        Ok((unflatten_batch(&output, batch, seq), weights))
    }

    /// 训练前向：注意力权重上应用 dropout，并保存反向传播所需的缓存
    pub fn forward_train<R: Rng + ?Sized>(
        &self,
        x: &Array3<f32>,
        mask: Option<&Array2<f32>>,
        rng: &mut R,
    ) -> Result<(Array3<f32>, AttentionCache)> {
        let (batch, seq, _) = x.dim();
        Self::check_mask(mask, batch, seq)?;

        let input = flatten_batch(x);
        let q = self.w_q.forward(&input);
        let k = self.w_k.forward(&input);
        let v = self.w_v.forward(&input);

        let dropout = self.dropout;
        let (context, weights, dropout_masks) =
            self.attend(&q, &k, &v, batch, seq, mask, |shape| {
                dropout.sample_mask(shape, rng)
            });
        let output = self.w_o.forward(&context);

        let cache = AttentionCache {
            input,
            q,
            k,
            v,
            weights,
            dropout_masks,
            context,
            batch,
            seq,
        };
        Ok((unflatten_batch(&output, batch, seq), cache))
    }

    /// 反向传播
    ///
    /// softmax 的梯度：
    /// ```text
    /// dS = W ⊙ (dW - rowsum(dW ⊙ W))
    /// dQ = dS K / √d_k
    /// dK = dSᵀ Q / √d_k
    /// dV = Wᵀ dO
    /// ```
    pub fn backward(
        &self,
        grad_output: &Array3<f32>,
        cache: &AttentionCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Array3<f32> {
        let AttentionParams { n_heads, d_k, .. } = self.params;
        let scale = 1.0 / (d_k as f32).sqrt();
        let seq = cache.seq;

        let grad_out = flatten_batch(grad_output);
        let grad_context =
            self.w_o
                .backward(&cache.context, &grad_out, &format!("{}.w_o", prefix), grads);

        let mut grad_q = Array2::zeros(cache.q.dim());
        let mut grad_k = Array2::zeros(cache.k.dim());
        let mut grad_v = Array2::zeros(cache.v.dim());

        for b in 0..cache.batch {
            let (r0, r1) = (b * seq, (b + 1) * seq);
            for h in 0..n_heads {
                let (c0, c1) = (h * d_k, (h + 1) * d_k);
                let g = grad_context.slice(s![r0..r1, c0..c1]);
                let q_bh = cache.q.slice(s![r0..r1, c0..c1]);
                let k_bh = cache.k.slice(s![r0..r1, c0..c1]);
                let v_bh = cache.v.slice(s![r0..r1, c0..c1]);
                let w = cache.weights.slice(s![b, h, .., ..]);

                let (w_used, grad_w) = match &cache.dropout_masks[b * n_heads + h] {
                    Some(m) => (&w * m, g.dot(&v_bh.t()) * m),
                    None => (w.to_owned(), g.dot(&v_bh.t())),
                };

                grad_v
                    .slice_mut(s![r0..r1, c0..c1])
                    .assign(&w_used.t().dot(&g));

                let row_dot = (&grad_w * &w).sum_axis(Axis(1)).insert_axis(Axis(1));
                let grad_scores = &w * &(grad_w - &row_dot);

                grad_q
                    .slice_mut(s![r0..r1, c0..c1])
                    .assign(&(grad_scores.dot(&k_bh) * scale));
                grad_k
                    .slice_mut(s![r0..r1, c0..c1])
                    .assign(&(grad_scores.t().dot(&q_bh) * scale));
            }
        }

        let mut grad_input =
            self.w_q
                .backward(&cache.input, &grad_q, &format!("{}.w_q", prefix), grads);
        grad_input += &self
            .w_k
            .backward(&cache.input, &grad_k, &format!("{}.w_k", prefix), grads);
        grad_input += &self
            .w_v
            .backward(&cache.input, &grad_v, &format!("{}.w_v", prefix), grads);

        unflatten_batch(&grad_input, cache.batch, cache.seq)
    }

    pub fn params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Array2<f32>)> {
        let mut params = self.w_q.params_mut(&format!("{}.w_q", prefix));
        params.extend(self.w_k.params_mut(&format!("{}.w_k", prefix)));
        params.extend(self.w_v.params_mut(&format!("{}.w_v", prefix)));
        params.extend(self.w_o.params_mut(&format!("{}.w_o", prefix)));
        params
    }

    /// 获取参数
    pub fn params(&self) -> &AttentionParams {
        &self.params
    }

    pub fn dropout_prob(&self) -> f32 {
        self.dropout.prob()
    }

    /// 获取投影层（用于保存模型）
    pub fn projections(&self) -> (&Linear, &Linear, &Linear, &Linear) {
        (&self.w_q, &self.w_k, &self.w_v, &self.w_o)
    }

    pub fn param_count(&self) -> usize {
        self.w_q.param_count()
            + self.w_k.param_count()
            + self.w_v.param_count()
            + self.w_o.param_count()
    }
}

//! 嵌入层和位置编码
//!
//! 将离散的 token ID 转换为连续的向量表示，并添加位置信息。

use ndarray::{s, Array2, Array3};
use rand::Rng;

use crate::error::{ModelError, Result};
use crate::tensor::TensorExt;

/// 词嵌入层
///
/// 将 token ID 映射到 d_model 维向量，并乘以 √d_model
#[derive(Debug, Clone)]
pub struct Embedding {
    /// 权重矩阵: [vocab_size, d_model]
    pub(crate) weights: Array2<f32>,
    vocab_size: usize,
    d_model: usize,
}

impl Embedding {
    /// 创建新的嵌入层
    ///
    /// # 参数
    /// - `vocab_size`: 词表大小
    /// - `d_model`: 嵌入维度
    pub fn new<R: Rng + ?Sized>(vocab_size: usize, d_model: usize, rng: &mut R) -> Self {
        // Xavier 初始化
        let weights = Array2::random_xavier((vocab_size, d_model), rng);

        Self {
            weights,
            vocab_size,
            d_model,
        }
    }

    /// 从已有权重创建
    pub fn from_weights(weights: Array2<f32>) -> Self {
        let (vocab_size, d_model) = weights.dim();
        Self {
            weights,
            vocab_size,
            d_model,
        }
    }

    fn scale(&self) -> f32 {
        (self.d_model as f32).sqrt()
    }

    /// 前向传播
    ///
    /// # 输入
    /// - `ids`: [batch_size, seq_len]
    ///
    /// # 输出
    /// - [batch_size, seq_len, d_model]
    pub fn forward(&self, ids: &Array2<usize>) -> Result<Array3<f32>> {
        let (batch, seq) = ids.dim();
        let scale = self.scale();
        let mut embedded = Array3::zeros((batch, seq, self.d_model));

        for ((b, t), &token_id) in ids.indexed_iter() {
            if token_id >= self.vocab_size {
                return Err(ModelError::TokenOutOfRange {
                    id: token_id,
                    vocab_size: self.vocab_size,
                });
            }
            embedded
                .slice_mut(s![b, t, ..])
                .assign(&self.weights.row(token_id).mapv(|w| w * scale));
        }

        Ok(embedded)
    }

    /// 反向传播：把梯度累加回被查询的行
    ///
    /// # 输入
    /// - `ids`: 前向时的 token ids
    /// - `grad_output`: [batch_size, seq_len, d_model]
    pub fn backward(&self, ids: &Array2<usize>, grad_output: &Array3<f32>) -> Array2<f32> {
        let scale = self.scale();
        let mut grad = Array2::zeros(self.weights.dim());

        for ((b, t), &token_id) in ids.indexed_iter() {
            let mut row = grad.row_mut(token_id);
            row.scaled_add(scale, &grad_output.slice(s![b, t, ..]));
        }

        grad
    }

    /// 获取嵌入维度
    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// 获取权重（用于保存）
    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }
}

/// 位置编码
///
/// 为输入序列添加位置信息，使用正弦和余弦函数。
///
/// 位置编码公式：
/// ```text
/// PE(pos, 2i)   = sin(pos / 10000^(2i/d_model))
/// PE(pos, 2i+1) = cos(pos / 10000^(2i/d_model))
/// ```
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    /// 预计算的位置编码: [max_seq_len, d_model]
    pe: Array2<f32>,
    max_seq_len: usize,
}

impl PositionalEncoding {
    /// 创建新的位置编码
    ///
    /// # 参数
    /// - `max_seq_len`: 最大序列长度
    /// - `d_model`: 嵌入维度
    pub fn new(max_seq_len: usize, d_model: usize) -> Self {
        let mut pe = Array2::zeros((max_seq_len, d_model));
        let ln_base = 10000f32.ln();

        for pos in 0..max_seq_len {
            for i in (0..d_model).step_by(2) {
                // 1 / 10000^(2i/d_model)，这里的 i 已经是偶数列下标
                let div_term = (-(i as f32) * ln_base / d_model as f32).exp();
                let angle = pos as f32 * div_term;

                pe[[pos, i]] = angle.sin();
                if i + 1 < d_model {
                    pe[[pos, i + 1]] = angle.cos();
                }
            }
        }

        Self { pe, max_seq_len }
    }

    /// 前向传播：将位置编码添加到输入嵌入
    ///
    /// # 输入
    /// - `x`: [batch_size, seq_len, d_model]
    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let seq_len = x.dim().1;

        if seq_len > self.max_seq_len {
            return Err(ModelError::SequenceLength {
                len: seq_len,
                max: self.max_seq_len,
            });
        }

        let pe_slice = self.pe.slice(s![..seq_len, ..]);
        Ok(x + &pe_slice)
    }

    /// 获取位置编码（用于可视化）
    pub fn encoding(&self) -> &Array2<f32> {
        &self.pe
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_embedding_scaled_lookup() {
        let mut rng = StdRng::seed_from_u64(0);
        let embedding = Embedding::new(10, 4, &mut rng);
        let ids = arr2(&[[0usize, 5, 9]]);
        let output = embedding.forward(&ids).unwrap();

        assert_eq!(output.shape(), &[1, 3, 4]);
        for k in 0..4 {
            let expected = embedding.weights()[[5, k]] * 2.0;
            assert!((output[[0, 1, k]] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_embedding_rejects_out_of_range() {
        let mut rng = StdRng::seed_from_u64(0);
        let embedding = Embedding::new(10, 4, &mut rng);
        let ids = arr2(&[[1usize, 10]]);
        assert!(matches!(
            embedding.forward(&ids),
            Err(ModelError::TokenOutOfRange { id: 10, vocab_size: 10 })
        ));
    }

    #[test]
    fn test_embedding_backward_accumulates() {
        let mut rng = StdRng::seed_from_u64(0);
        let embedding = Embedding::new(6, 4, &mut rng);
        let ids = arr2(&[[2usize, 2, 3]]);
        let grad_out = Array3::from_elem((1, 3, 4), 1.0);
        let grad = embedding.backward(&ids, &grad_out);

        // token 2 出现两次，梯度为 2 * √4
        assert!((grad[[2, 0]] - 4.0).abs() < 1e-6);
        assert!((grad[[3, 0]] - 2.0).abs() < 1e-6);
        assert_eq!(grad[[0, 0]], 0.0);
    }

    #[test]
    fn test_positional_encoding() {
        let pe = PositionalEncoding::new(10, 4);
        let encoding = pe.encoding();
        assert_eq!(encoding.shape(), &[10, 4]);

        // 第一个位置应该是 [0, 1, 0, 1]，因为 sin(0)=0, cos(0)=1
        let first_pos = encoding.row(0);
        assert!(first_pos[0].abs() < 1e-6);
        assert!((first_pos[1] - 1.0).abs() < 1e-6);
        assert!(first_pos[2].abs() < 1e-6);
        assert!((first_pos[3] - 1.0).abs() < 1e-6);

        // 第 2 列的频率是 1/10000^(2/4) = 0.01
        assert!((encoding[[3, 2]] - (3.0f32 * 0.01).sin()).abs() < 1e-5);
        assert!((encoding[[3, 3]] - (3.0f32 * 0.01).cos()).abs() < 1e-5);
    }

    #[test]
    fn test_positions_are_unique() {
        let pe = PositionalEncoding::new(32, 8);
        let enc = pe.encoding();
        for a in 0..32 {
            for b in (a + 1)..32 {
                let diff: f32 = (&enc.row(a) - &enc.row(b)).mapv(f32::abs).sum();
                assert!(diff > 1e-4, "positions {} and {} collide", a, b);
            }
        }
    }

    #[test]
    fn test_positional_encoding_too_long() {
        let pe = PositionalEncoding::new(4, 8);
        let x = Array3::zeros((1, 5, 8));
        assert!(matches!(
            pe.forward(&x),
            Err(ModelError::SequenceLength { len: 5, max: 4 })
        ));
    }
}

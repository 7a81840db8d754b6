//! 损失函数
//!
//! 带掩码的交叉熵：目标为 PAD 的位置不计入损失，也不产生梯度。

use ndarray::{s, Array2, Array3};

use crate::error::{ModelError, Result};
use crate::tokenizer::PAD_ID;

/// 带忽略下标的交叉熵损失（直接作用在 logits 上）
///
/// ```text
/// L = -(1/n) Σ_{t ≠ ignore} log softmax(z_t)[y_t]
/// ∂L/∂z_t = (softmax(z_t) - onehot(y_t)) / n
/// ```
///
/// n 是非忽略位置的个数。
#[derive(Debug, Clone, Copy)]
pub struct MaskedCrossEntropy {
    /// 被忽略的目标 id
    pub ignore_index: usize,
}

impl Default for MaskedCrossEntropy {
    fn default() -> Self {
        Self {
            ignore_index: PAD_ID,
        }
    }
}

impl MaskedCrossEntropy {
    pub fn new(ignore_index: usize) -> Self {
        Self { ignore_index }
    }

    /// 计算损失值和关于 logits 的梯度
    ///
    /// # 参数
    /// - `logits`: [batch, seq, vocab]
    /// - `targets`: [batch, seq]
    ///
    /// 所有目标都被忽略时返回 0 和全零梯度。
    pub fn compute(
        &self,
        logits: &Array3<f32>,
        targets: &Array2<usize>,
    ) -> Result<(f32, Array3<f32>)> {
        let (batch, seq, vocab) = logits.dim();
        if targets.dim() != (batch, seq) {
            return Err(ModelError::mismatch("loss targets", (batch, seq), targets.dim()));
        }

        let mut grad = Array3::zeros(logits.dim());
        let n = targets.iter().filter(|&&t| t != self.ignore_index).count();
        if n == 0 {
            return Ok((0.0, grad));
        }

        let mut total = 0.0;
        for ((b, t), &target) in targets.indexed_iter() {
            if target == self.ignore_index {
                continue;
            }
            if target >= vocab {
                return Err(ModelError::TokenOutOfRange {
                    id: target,
                    vocab_size: vocab,
                });
            }

            let row = logits.slice(s![b, t, ..]);
            // log-sum-exp 减去最大值以提高数值稳定性
            let max = row.fold(f32::NEG_INFINITY, |m, &z| m.max(z));
            let exp = row.mapv(|z| (z - max).exp());
            let sum = exp.sum();
            total += sum.ln() + max - row[target];

            let mut g = grad.slice_mut(s![b, t, ..]);
            g.assign(&(exp / sum));
            g[target] -= 1.0;
        }

        let scale = 1.0 / n as f32;
        grad.mapv_inplace(|g| g * scale);
        Ok((total * scale, grad))
    }
}

/// 便捷函数：忽略 PAD 的交叉熵
pub fn masked_cross_entropy(
    logits: &Array3<f32>,
    targets: &Array2<usize>,
) -> Result<(f32, Array3<f32>)> {
    MaskedCrossEntropy::default().compute(logits, targets)
}

/// 非 PAD 位置上 argmax 预测正确的比例
pub fn token_accuracy(logits: &Array3<f32>, targets: &Array2<usize>, ignore_index: usize) -> f32 {
    let mut correct = 0usize;
    let mut total = 0usize;

    for ((b, t), &target) in targets.indexed_iter() {
        if target == ignore_index {
            continue;
        }
        let row = logits.slice(s![b, t, ..]);
        let mut best = 0;
        for (i, &z) in row.iter().enumerate() {
            if z > row[best] {
                best = i;
            }
        }
        total += 1;
        if best == target {
            correct += 1;
        }
    }

    if total == 0 {
        0.0
    } else {
        correct as f32 / total as f32
    }
}

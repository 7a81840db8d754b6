//! 张量操作扩展和工具函数
//!
//! 基于 ndarray 实现 Transformer 所需的张量操作。
//! 模型内部把 (batch, seq, d) 展平成 (batch * seq, d) 的二维矩阵计算，
//! 只有注意力需要按 batch/head 切分。

use ndarray::{Array2, Array3, Axis};
use rand::Rng;

/// 张量扩展 trait
pub trait TensorExt {
    /// 创建随机张量（Xavier 均匀初始化）
    fn random_xavier<R: Rng + ?Sized>(shape: (usize, usize), rng: &mut R) -> Array2<f32>;

    /// 矩阵乘法
    fn matmul(&self, other: &Array2<f32>) -> Array2<f32>;

    /// 沿指定维度应用 softmax
    fn softmax(&self, axis: usize) -> Array2<f32>;

    /// GELU 激活函数
    fn gelu(&self) -> Array2<f32>;

    /// GELU 的导数（逐元素）
    fn gelu_grad(&self) -> Array2<f32>;

    /// 残差连接
    fn residual_add(&self, other: &Array2<f32>) -> Array2<f32>;

    /// 所有元素都是有限值
    fn all_finite(&self) -> bool;
}

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEF: f32 = 0.044715;

impl TensorExt for Array2<f32> {
    fn random_xavier<R: Rng + ?Sized>(shape: (usize, usize), rng: &mut R) -> Array2<f32> {
        let limit = (6.0 / (shape.0 + shape.1) as f32).sqrt();

        Array2::from_shape_fn(shape, |_| rng.gen_range(-limit..limit))
    }

    fn matmul(&self, other: &Array2<f32>) -> Array2<f32> {
        self.dot(other)
    }

    fn softmax(&self, axis: usize) -> Array2<f32> {
        // 减去最大值以提高数值稳定性
        let max = self.fold_axis(Axis(axis), f32::NEG_INFINITY, |a, &b| a.max(b));
        let max_view = max.insert_axis(Axis(axis));

        let exp = (self - &max_view).mapv(|x: f32| x.exp());
        let sum = exp.sum_axis(Axis(axis));
        let sum_view = sum.insert_axis(Axis(axis));

        exp / sum_view
    }

    fn gelu(&self) -> Array2<f32> {
        // GELU(x) ≈ 0.5 * x * (1 + tanh(√(2/π) * (x + 0.044715 * x³)))
        self.mapv(|x: f32| {
            let cube = x * x * x;
            0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + GELU_COEF * cube)).tanh())
        })
    }

    fn gelu_grad(&self) -> Array2<f32> {
        self.mapv(|x: f32| {
            let inner = SQRT_2_OVER_PI * (x + GELU_COEF * x * x * x);
            let t = inner.tanh();
            let sech_sq = 1.0 - t * t;
            0.5 * (1.0 + t) + 0.5 * x * sech_sq * SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEF * x * x)
        })
    }

    fn residual_add(&self, other: &Array2<f32>) -> Array2<f32> {
        self + other
    }

    fn all_finite(&self) -> bool {
        self.iter().all(|v| v.is_finite())
    }
}

/// (batch, seq, d) → (batch * seq, d)
pub fn flatten_batch(x: &Array3<f32>) -> Array2<f32> {
    let (batch, seq, d) = x.dim();
    Array2::from_shape_fn((batch * seq, d), |(r, c)| x[[r / seq, r % seq, c]])
}

/// (batch * seq, d) → (batch, seq, d)
pub fn unflatten_batch(x: &Array2<f32>, batch: usize, seq: usize) -> Array3<f32> {
    let d = x.ncols();
    Array3::from_shape_fn((batch, seq, d), |(b, s, c)| x[[b * seq + s, c]])
}

/// 辅助函数：填充掩码
///
/// 输入 token ids [batch, seq]，输出 [batch, seq]：非 PAD 位置为 1，PAD 位置为 0。
/// 注意力把它作为 key 方向的掩码使用。
pub fn padding_mask(ids: &Array2<usize>, pad_id: usize) -> Array2<f32> {
    ids.mapv(|id| if id == pad_id { 0.0 } else { 1.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_matmul() {
        let a = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Array2::from_shape_vec((3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let c = a.matmul(&b);

        assert_eq!(c.shape(), &[2, 2]);
        assert!((c[[0, 0]] - 22.0).abs() < 1e-6);
    }

    #[test]
    fn test_softmax() {
        let x = arr2(&[[1.0, 2.0, 3.0], [-1e9, 0.0, 0.0]]);
        let s = x.softmax(1);

        for row in s.rows() {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        // 被 -1e9 屏蔽的位置概率为 0
        assert!(s[[1, 0]] < 1e-12);
    }

    #[test]
    fn test_xavier_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let w = Array2::random_xavier((16, 48), &mut rng);
        let limit = (6.0f32 / 64.0).sqrt();
        assert!(w.iter().all(|&v| v.abs() <= limit));

        // 同一种子得到同样的权重
        let mut rng2 = StdRng::seed_from_u64(7);
        assert_eq!(w, Array2::random_xavier((16, 48), &mut rng2));
    }

    #[test]
    fn test_gelu_grad_matches_finite_difference() {
        let x = arr2(&[[-2.0, -0.5, 0.0, 0.7, 1.5]]);
        let grad = x.gelu_grad();
        let eps = 1e-3;
        for j in 0..x.ncols() {
            let plus = arr2(&[[x[[0, j]] + eps]]).gelu()[[0, 0]];
            let minus = arr2(&[[x[[0, j]] - eps]]).gelu()[[0, 0]];
            let numeric = (plus - minus) / (2.0 * eps);
            assert!((numeric - grad[[0, j]]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_flatten_roundtrip() {
        let x = Array3::from_shape_fn((2, 3, 4), |(b, s, d)| (b * 100 + s * 10 + d) as f32);
        let flat = flatten_batch(&x);
        assert_eq!(flat.shape(), &[6, 4]);
        assert_eq!(flat[[4, 2]], 112.0);
        assert_eq!(unflatten_batch(&flat, 2, 3), x);
    }

    #[test]
    fn test_padding_mask() {
        let ids = arr2(&[[1usize, 5, 2, 0], [1, 2, 0, 0]]);
        let mask = padding_mask(&ids, 0);
        assert_eq!(mask, arr2(&[[1.0, 1.0, 1.0, 0.0], [1.0, 1.0, 0.0, 0.0]]));
    }
}

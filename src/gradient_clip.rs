//! 梯度容器与梯度裁剪
//!
//! 反向传播把每个参数的梯度按名字（如 `blocks.0.attn.w_q.weight`）放进 [`Gradients`]，
//! 训练器先做全局范数裁剪，再交给优化器。
//!
//! ```text
//! norm = √(Σ g²)            // 所有参数的全局 L2 范数
//! if norm > max_norm:
//!     g *= max_norm / norm  // 所有梯度按同一比例缩放
//! ```

use ndarray::Array2;
use std::collections::BTreeMap;

/// 按参数名索引的梯度集合
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    grads: BTreeMap<String, Array2<f32>>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一个参数的梯度；同名梯度会累加
    pub fn insert(&mut self, name: impl Into<String>, grad: Array2<f32>) {
        let name = name.into();
        match self.grads.get_mut(&name) {
            Some(existing) => *existing += &grad,
            None => {
                self.grads.insert(name, grad);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Array2<f32>> {
        self.grads.get(name)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Array2<f32>)> {
        self.grads.iter()
    }

    /// 所有梯度乘以同一个系数
    pub fn scale(&mut self, factor: f32) {
        for grad in self.grads.values_mut() {
            grad.mapv_inplace(|g| g * factor);
        }
    }
}

/// 计算全局梯度范数
///
/// ||g|| = sqrt(Σ_params Σ g_ij²)
pub fn compute_grad_norm(grads: &Gradients) -> f32 {
    let mut sum_squared = 0.0;

    for (_, grad) in grads.iter() {
        for &val in grad.iter() {
            sum_squared += val * val;
        }
    }

    sum_squared.sqrt()
}

/// 全局范数裁剪（原地）
///
/// 返回裁剪前的范数，便于记录日志。
pub fn clip_grad_norm(grads: &mut Gradients, max_norm: f32) -> f32 {
    let norm = compute_grad_norm(grads);

    if norm > max_norm && norm.is_finite() {
        grads.scale(max_norm / norm);
    }

    norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_compute_grad_norm() {
        let mut grads = Gradients::new();
        grads.insert("a", arr2(&[[3.0, 0.0]]));
        grads.insert("b", arr2(&[[0.0], [4.0]]));
        // sqrt(3^2 + 4^2) = 5.0
        assert!((compute_grad_norm(&grads) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_scales_every_parameter() {
        let mut grads = Gradients::new();
        grads.insert("a", arr2(&[[3.0, 0.0]]));
        grads.insert("b", arr2(&[[0.0, 4.0]]));

        let before = clip_grad_norm(&mut grads, 1.0);
        assert!((before - 5.0).abs() < 1e-6);
        assert!((compute_grad_norm(&grads) - 1.0).abs() < 1e-5);

        // 方向保持不变
        assert!((grads.get("a").unwrap()[[0, 0]] - 0.6).abs() < 1e-6);
        assert!((grads.get("b").unwrap()[[0, 1]] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_clip_no_op_below_threshold() {
        let mut grads = Gradients::new();
        grads.insert("a", arr2(&[[0.3, 0.4]]));
        clip_grad_norm(&mut grads, 1.0);
        assert_eq!(grads.get("a").unwrap(), &arr2(&[[0.3, 0.4]]));
    }

    #[test]
    fn test_insert_accumulates() {
        let mut grads = Gradients::new();
        grads.insert("w", arr2(&[[1.0, 2.0]]));
        grads.insert("w", arr2(&[[0.5, 0.5]]));
        assert_eq!(grads.len(), 1);
        assert_eq!(grads.get("w").unwrap(), &arr2(&[[1.5, 2.5]]));
    }
}

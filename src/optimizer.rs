//! 优化器
//!
//! 训练使用 Adam。每个参数按名字保存自己的矩估计和时间步。

use ndarray::Array2;
use std::collections::HashMap;

/// 优化器 trait
pub trait Optimizer {
    /// 更新参数
    fn step(&mut self, param: &mut Array2<f32>, grad: &Array2<f32>, param_name: &str);

    /// 获取当前学习率
    fn lr(&self) -> f32;

    /// 设置学习率
    fn set_lr(&mut self, lr: f32);

    /// 优化器名称
    fn name(&self) -> &str;
}

/// 单个参数的 Adam 状态
#[derive(Debug, Clone)]
struct AdamState {
    /// 一阶矩估计
    m: Array2<f32>,
    /// 二阶矩估计
    v: Array2<f32>,
    /// 该参数已经更新的次数
    t: i32,
}

/// Adam 优化器
///
/// ```text
/// m = β1 * m + (1 - β1) * grad
/// v = β2 * v + (1 - β2) * grad²
/// m_hat = m / (1 - β1^t)
/// v_hat = v / (1 - β2^t)
/// param = param - lr * m_hat / (√v_hat + ε)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    /// 学习率
    lr: f32,
    /// β1：一阶矩估计的指数衰减率
    beta1: f32,
    /// β2：二阶矩估计的指数衰减率
    beta2: f32,
    /// ε：数值稳定性常数
    eps: f32,
    state: HashMap<String, AdamState>,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            state: HashMap::new(),
        }
    }

    /// 某个参数已经执行的步数
    pub fn steps_for(&self, param_name: &str) -> usize {
        self.state.get(param_name).map_or(0, |s| s.t as usize)
    }
}

impl Optimizer for Adam {
    fn step(&mut self, param: &mut Array2<f32>, grad: &Array2<f32>, param_name: &str) {
        let (beta1, beta2, eps, lr) = (self.beta1, self.beta2, self.eps, self.lr);

        let state = self
            .state
            .entry(param_name.to_string())
            .or_insert_with(|| AdamState {
                m: Array2::zeros(param.dim()),
                v: Array2::zeros(param.dim()),
                t: 0,
            });
        state.t += 1;

        // 更新一阶和二阶矩估计
        state.m.zip_mut_with(grad, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
        state.v.zip_mut_with(grad, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        // 偏差修正
        let bias1 = 1.0 - beta1.powi(state.t);
        let bias2 = 1.0 - beta2.powi(state.t);

        // 参数更新
        ndarray::Zip::from(param)
            .and(&state.m)
            .and(&state.v)
            .for_each(|p, &m, &v| {
                let m_hat = m / bias1;
                let v_hat = v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn name(&self) -> &str {
        "Adam"
    }
}

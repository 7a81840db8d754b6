//! Transformer 的基础层
//!
//! 包含带偏置的线性层、Layer Normalization、Dropout 和 Feed-Forward Network。
//! 每一层都提供无缓存的推理前向，以及带缓存的训练前向和对应的反向传播。

use ndarray::{Array1, Array2, Axis};
use rand::Rng;

use crate::gradient_clip::Gradients;
use crate::tensor::TensorExt;

/// 线性层
///
/// ```text
/// y = x W + b
/// ```
#[derive(Debug, Clone)]
pub struct Linear {
    /// 权重: [in_features, out_features]
    pub(crate) weight: Array2<f32>,
    /// 偏置: [1, out_features]
    pub(crate) bias: Array2<f32>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Self {
            weight: Array2::random_xavier((in_features, out_features), rng),
            bias: Array2::zeros((1, out_features)),
        }
    }

    pub fn from_parts(weight: Array2<f32>, bias: Array2<f32>) -> Self {
        Self { weight, bias }
    }

    /// 前向传播
    ///
    /// 输入: [rows, in_features]
    /// 输出: [rows, out_features]
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.matmul(&self.weight) + &self.bias
    }

    /// 反向传播
    ///
    /// - `input`: 前向时的输入
    /// - `grad_output`: [rows, out_features]
    ///
    /// 参数梯度写入 `grads`，返回关于输入的梯度。
    pub fn backward(
        &self,
        input: &Array2<f32>,
        grad_output: &Array2<f32>,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Array2<f32> {
        // d_weight = input^T * grad_output
        grads.insert(format!("{}.weight", prefix), input.t().dot(grad_output));
        // d_bias = sum(grad_output, axis=0)
        grads.insert(
            format!("{}.bias", prefix),
            grad_output.sum_axis(Axis(0)).insert_axis(Axis(0)),
        );
        // grad_input = grad_output * weight^T
        grad_output.dot(&self.weight.t())
    }

    /// 可训练参数（名字与反向传播中的梯度名一致）
    pub fn params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Array2<f32>)> {
        vec![
            (format!("{}.weight", prefix), &mut self.weight),
            (format!("{}.bias", prefix), &mut self.bias),
        ]
    }

    pub fn in_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> &Array2<f32> {
        &self.bias
    }

    /// 获取参数数量
    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// Layer Normalization
///
/// 对每个位置的所有特征进行归一化，使均值为 0，方差为 1。
///
/// ```text
/// y = γ * ((x - μ) / √(σ² + ε)) + β
/// ```
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// 缩放参数 [1, d_model]
    pub(crate) gamma: Array2<f32>,
    /// 平移参数 [1, d_model]
    pub(crate) beta: Array2<f32>,
    /// 防止除零的小常数
    eps: f32,
}

/// LayerNorm 反向传播所需的中间值
#[derive(Debug, Clone)]
pub struct LayerNormCache {
    x_norm: Array2<f32>,
    /// 每行的 √(σ² + ε): [rows]
    std: Array1<f32>,
}

impl LayerNorm {
    /// 创建新的 Layer Norm 层，γ 初始化为 1，β 初始化为 0
    pub fn new(d_model: usize) -> Self {
        Self {
            gamma: Array2::ones((1, d_model)),
            beta: Array2::zeros((1, d_model)),
            eps: 1e-5,
        }
    }

    pub fn from_parts(gamma: Array2<f32>, beta: Array2<f32>) -> Self {
        Self {
            gamma,
            beta,
            eps: 1e-5,
        }
    }

    fn normalize(&self, x: &Array2<f32>) -> (Array2<f32>, Array1<f32>) {
        let d = x.ncols() as f32;
        let mean = x.sum_axis(Axis(1)) / d;
        let centered = x - &mean.view().insert_axis(Axis(1));
        let var = centered.mapv(|v| v * v).sum_axis(Axis(1)) / d;
        let std = var.mapv(|v| (v + self.eps).sqrt());
        let x_norm = &centered / &std.view().insert_axis(Axis(1));
        (x_norm, std)
    }

    /// 前向传播
    ///
    /// # 输入
    /// - `x`: [rows, d_model]
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let (x_norm, _) = self.normalize(x);
        &x_norm * &self.gamma + &self.beta
    }

    /// 训练前向：额外返回缓存
    pub fn forward_train(&self, x: &Array2<f32>) -> (Array2<f32>, LayerNormCache) {
        let (x_norm, std) = self.normalize(x);
        let y = &x_norm * &self.gamma + &self.beta;
        (y, LayerNormCache { x_norm, std })
    }

    /// 反向传播
    ///
    /// ```text
    /// grad_γ = Σ grad_y * x_norm
    /// grad_β = Σ grad_y
    /// grad_x = (g - mean(g) - x_norm * mean(g * x_norm)) / std,  g = grad_y * γ
    /// ```
    pub fn backward(
        &self,
        grad_output: &Array2<f32>,
        cache: &LayerNormCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Array2<f32> {
        let d = grad_output.ncols() as f32;

        grads.insert(
            format!("{}.gamma", prefix),
            (grad_output * &cache.x_norm).sum_axis(Axis(0)).insert_axis(Axis(0)),
        );
        grads.insert(
            format!("{}.beta", prefix),
            grad_output.sum_axis(Axis(0)).insert_axis(Axis(0)),
        );

        let g = grad_output * &self.gamma;
        let mean_g = (g.sum_axis(Axis(1)) / d).insert_axis(Axis(1));
        let mean_gx = ((&g * &cache.x_norm).sum_axis(Axis(1)) / d).insert_axis(Axis(1));
        let std = cache.std.view().insert_axis(Axis(1));

        (&g - &mean_g - &cache.x_norm * &mean_gx) / &std
    }

    pub fn params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Array2<f32>)> {
        vec![
            (format!("{}.gamma", prefix), &mut self.gamma),
            (format!("{}.beta", prefix), &mut self.beta),
        ]
    }

    /// 获取参数（用于保存）
    pub fn params(&self) -> (&Array2<f32>, &Array2<f32>) {
        (&self.gamma, &self.beta)
    }
}

/// Dropout 层
///
/// 训练时随机将一部分输出置零并按 1/(1-p) 缩放，推理时不做任何操作。
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    dropout_prob: f32,
}

impl Dropout {
    pub fn new(dropout_prob: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&dropout_prob),
            "dropout probability must be in [0, 1)"
        );
        Self { dropout_prob }
    }

    pub fn prob(&self) -> f32 {
        self.dropout_prob
    }

    /// 生成缩放掩码：保留的位置为 1/(1-p)，丢弃的位置为 0。
    /// p = 0 时返回 None。
    pub fn sample_mask<R: Rng + ?Sized>(
        &self,
        shape: (usize, usize),
        rng: &mut R,
    ) -> Option<Array2<f32>> {
        if self.dropout_prob == 0.0 {
            return None;
        }
        let keep_scale = 1.0 / (1.0 - self.dropout_prob);
        Some(Array2::from_shape_fn(shape, |_| {
            if rng.gen::<f32>() < self.dropout_prob {
                0.0
            } else {
                keep_scale
            }
        }))
    }

    /// 训练前向：返回输出和掩码
    pub fn forward_train<R: Rng + ?Sized>(
        &self,
        x: &Array2<f32>,
        rng: &mut R,
    ) -> (Array2<f32>, Option<Array2<f32>>) {
        match self.sample_mask(x.dim(), rng) {
            Some(mask) => (x * &mask, Some(mask)),
            None => (x.clone(), None),
        }
    }

    /// 反向传播：对梯度应用同一个掩码
    pub fn backward(grad_output: &Array2<f32>, mask: Option<&Array2<f32>>) -> Array2<f32> {
        match mask {
            Some(m) => grad_output * m,
            None => grad_output.clone(),
        }
    }
}

/// Feed-Forward Network
///
/// 两层全连接网络，中间使用 GELU 激活函数和 Dropout。
///
/// ```text
/// FFN(x) = Dropout(GELU(x W1 + b1)) W2 + b2
/// ```
///
/// 每个位置独立计算，位置之间没有交互。
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// 第一层: [d_model, d_ff]
    pub(crate) fc1: Linear,
    /// 第二层: [d_ff, d_model]
    pub(crate) fc2: Linear,
    dropout: Dropout,
}

/// FFN 反向传播所需的中间值
#[derive(Debug, Clone)]
pub struct FeedForwardCache {
    input: Array2<f32>,
    hidden: Array2<f32>,
    activated: Array2<f32>,
    dropout_mask: Option<Array2<f32>>,
}

impl FeedForward {
    /// 创建新的 Feed-Forward Network
    ///
    /// # 参数
    /// - `d_model`: 输入/输出维度
    /// - `d_ff`: 隐藏层维度（通常为 d_model 的 4 倍）
    pub fn new<R: Rng + ?Sized>(d_model: usize, d_ff: usize, dropout: f32, rng: &mut R) -> Self {
        Self {
            fc1: Linear::new(d_model, d_ff, rng),
            fc2: Linear::new(d_ff, d_model, rng),
            dropout: Dropout::new(dropout),
        }
    }

    pub fn from_parts(fc1: Linear, fc2: Linear, dropout: f32) -> Self {
        Self {
            fc1,
            fc2,
            dropout: Dropout::new(dropout),
        }
    }

    /// 前向传播（推理）
    ///
    /// # 输入
    /// - `x`: [rows, d_model]
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let hidden = self.fc1.forward(x);
        self.fc2.forward(&hidden.gelu())
    }

    /// 训练前向
    pub fn forward_train<R: Rng + ?Sized>(
        &self,
        x: &Array2<f32>,
        rng: &mut R,
    ) -> (Array2<f32>, FeedForwardCache) {
        let hidden = self.fc1.forward(x);
        let activated = hidden.gelu();
        let (dropped, dropout_mask) = self.dropout.forward_train(&activated, rng);
        let output = self.fc2.forward(&dropped);

        let cache = FeedForwardCache {
            input: x.clone(),
            hidden,
            activated: dropped,
            dropout_mask,
        };
        (output, cache)
    }

    /// 反向传播
    pub fn backward(
        &self,
        grad_output: &Array2<f32>,
        cache: &FeedForwardCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Array2<f32> {
        let grad_dropped =
            self.fc2
                .backward(&cache.activated, grad_output, &format!("{}.fc2", prefix), grads);
        let grad_activated = Dropout::backward(&grad_dropped, cache.dropout_mask.as_ref());
        let grad_hidden = grad_activated * &cache.hidden.gelu_grad();
        self.fc1
            .backward(&cache.input, &grad_hidden, &format!("{}.fc1", prefix), grads)
    }

    pub fn params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Array2<f32>)> {
        let mut params = self.fc1.params_mut(&format!("{}.fc1", prefix));
        params.extend(self.fc2.params_mut(&format!("{}.fc2", prefix)));
        params
    }

    /// 获取维度
    pub fn dimensions(&self) -> (usize, usize) {
        (self.fc1.in_features(), self.fc1.out_features())
    }

    pub fn param_count(&self) -> usize {
        self.fc1.param_count() + self.fc2.param_count()
    }
}

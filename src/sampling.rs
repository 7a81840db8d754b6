//! 文本生成采样策略
//!
//! 温度缩放 + Top-k 过滤 + 分类采样。随机数生成器由调用方提供。

use rand::Rng;
use serde::{Deserialize, Serialize};

/// 温度不超过该值时退化为贪婪解码
pub const GREEDY_TEMPERATURE: f32 = 1e-6;

/// 采样配置
///
/// 控制文本生成的各种参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// 温度参数（控制随机性）
    /// - 1.0: 标准分布
    /// - < 1.0: 更保守（更集中）
    /// - > 1.0: 更随机（更均匀）
    pub temperature: f32,
    /// Top-k 采样（0 = 不使用）
    pub top_k: usize,
    /// 最多生成的新 token 数
    pub max_length: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 50,
            max_length: 100,
        }
    }
}

impl SamplingConfig {
    /// 对话回复使用的配置
    pub fn chat() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            max_length: 80,
        }
    }

    /// 创建贪婪解码配置
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 1,
            max_length: 100,
        }
    }

    /// 设置温度
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// 设置 Top-k
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// 设置最大生成长度
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= GREEDY_TEMPERATURE
    }
}

/// Argmax：返回最大值的索引（并列时取第一个）
pub fn argmax(values: &[f32]) -> usize {
    let mut max_idx = 0;
    let mut max_val = f32::NEG_INFINITY;

    for (i, &val) in values.iter().enumerate() {
        if val > max_val {
            max_val = val;
            max_idx = i;
        }
    }

    max_idx
}

/// Softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut exp_sum = 0.0;
    let mut exps = Vec::with_capacity(logits.len());

    for &logit in logits {
        let exp = (logit - max_logit).exp();
        exps.push(exp);
        exp_sum += exp;
    }

    exps.iter().map(|&e| e / exp_sum).collect()
}

/// 温度缩放
pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    if temperature != 1.0 {
        for logit in logits.iter_mut() {
            *logit /= temperature;
        }
    }
}

/// 应用 Top-K 过滤
///
/// 小于第 k 大的值的 logit 设为负无穷。与第 k 大的值相等的 logit 全部保留，
/// 所以并列时保留的个数可能超过 k。`k == 0` 表示不过滤。
pub fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }

    // 找到第 k 大的值（使用 k-1 作为索引）
    let mut sorted = logits.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];

    // 将小于阈值的值设为负无穷
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// 分类采样（根据概率分布采样）
///
/// 浮点累加误差导致 r 落在累积和之外时，返回最后一个概率非零的下标，
/// 保证不会选中被过滤掉的 token。
pub fn sample_categorical<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> usize {
    let r = rng.gen::<f32>();

    let mut cumsum = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if p > 0.0 && r < cumsum {
            return i;
        }
    }

    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or_else(|| argmax(probs))
}

/// 从最后一个位置的 logits 选出下一个 token
///
/// 温度 ≤ 1e-6 时直接取 argmax；否则依次做温度缩放、Top-k 过滤、softmax 和采样。
pub fn sample_next<R: Rng + ?Sized>(
    logits: &[f32],
    temperature: f32,
    top_k: usize,
    rng: &mut R,
) -> usize {
    if temperature <= GREEDY_TEMPERATURE {
        return argmax(logits);
    }

    let mut processed = logits.to_vec();
    apply_temperature(&mut processed, temperature);
    apply_top_k(&mut processed, top_k);

    let probs = softmax(&processed);
    sample_categorical(&probs, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_argmax() {
        let values = vec![0.1, 0.5, 0.3, 0.9, 0.2];
        assert_eq!(argmax(&values), 3); // 0.9 是最大的

        // 并列时取第一个
        assert_eq!(argmax(&[0.2, 0.7, 0.7]), 1);
    }

    #[test]
    fn test_softmax() {
        let values = vec![1.0, 2.0, 3.0];
        let probs = softmax(&values);

        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1]); // 3.0 的概率最大

        let masked = softmax(&[f32::NEG_INFINITY, 0.0]);
        assert_eq!(masked[0], 0.0);
    }

    #[test]
    fn test_apply_top_k() {
        let mut logits = vec![0.1, 0.5, 0.3, 0.9, 0.2];
        apply_top_k(&mut logits, 3);

        // 应该保留前 3 个最大的值
        let kept: Vec<usize> = (0..5).filter(|&i| logits[i].is_finite()).collect();
        assert_eq!(kept, vec![1, 2, 3]);
    }

    #[test]
    fn test_apply_top_k_keeps_ties() {
        let mut logits = vec![1.0, 2.0, 2.0, 0.0];
        apply_top_k(&mut logits, 1);
        assert_eq!(logits, vec![f32::NEG_INFINITY, 2.0, 2.0, f32::NEG_INFINITY]);

        let mut untouched = vec![1.0, 2.0];
        apply_top_k(&mut untouched, 0);
        assert_eq!(untouched, vec![1.0, 2.0]);
    }

    #[test]
    fn test_top_k_sampling_has_no_mass_outside() {
        let mut rng = StdRng::seed_from_u64(17);
        let logits = [0.1, 0.5, 0.3, 0.9, 0.2];
        for _ in 0..500 {
            let token = sample_next(&logits, 1.5, 2, &mut rng);
            assert!(token == 1 || token == 3);
        }
    }

    #[test]
    fn test_greedy_temperature() {
        let mut rng = StdRng::seed_from_u64(0);
        let logits = [0.4, 2.5, 1.0];
        for _ in 0..20 {
            assert_eq!(sample_next(&logits, 0.0, 0, &mut rng), 1);
            assert_eq!(sample_next(&logits, 1e-7, 5, &mut rng), 1);
        }
    }

    #[test]
    fn test_sample_categorical_skips_zero_probability() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..1000 {
            let i = sample_categorical(&[0.5, 0.5, 0.0], &mut rng);
            assert!(i < 2);
            assert_eq!(sample_categorical(&[0.0, 1.0], &mut rng), 1);
        }
    }

    #[test]
    fn test_sampling_is_reproducible() {
        let logits = [0.3, 0.1, 0.8, 0.5, -0.2];
        let draw = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..32)
                .map(|_| sample_next(&logits, 0.9, 4, &mut rng))
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(5), draw(5));
    }

    #[test]
    fn test_sampling_config_presets() {
        let config = SamplingConfig::default();
        assert_eq!(config.temperature, 0.8);
        assert_eq!(config.top_k, 50);
        assert_eq!(config.max_length, 100);

        let chat = SamplingConfig::chat();
        assert_eq!((chat.temperature, chat.top_k, chat.max_length), (0.7, 40, 80));

        assert!(SamplingConfig::greedy().is_greedy());
        assert!(!config.with_temperature(0.5).is_greedy());
    }
}

//! 自回归生成
//!
//! 每一步对整条序列做一次完整的前向传播（没有 KV 缓存），取最后一个位置的 logits 采样下一个 token。
//!
//! ```text
//! tokens = prompt
//! loop:
//!     logits = model(tokens)[-1]
//!     next = sample(logits / T, top_k)
//!     tokens.push(next)
//!     if next == END or 生成数 == max_length or len == max_seq_len: break
//! ```

use std::sync::Arc;
use std::time::Instant;

use ndarray::{s, Array2};
use rand::Rng;

use crate::error::{ModelError, Result};
use crate::sampling::{sample_next, SamplingConfig};
use crate::snapshot::ModelHandle;
use crate::tokenizer::{END_ID, START_ID};
use crate::transformer::ChatTransformer;

/// 自回归生成器
///
/// 每次生成开始时从 [`ModelHandle`] 取一份快照，生成过程中模型被替换不会影响本次结果。
#[derive(Debug, Clone)]
pub struct Generator {
    handle: Arc<ModelHandle>,
}

impl Generator {
    pub fn new(handle: Arc<ModelHandle>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Arc<ModelHandle> {
        &self.handle
    }

    /// 生成序列
    ///
    /// # 参数
    /// - `prompt`: 提示 token ids（不含尾部 PAD）；为空时从 START 开始
    /// - `max_length`: 最多生成的新 token 数
    /// - `temperature`: 温度，≤ 1e-6 时为贪婪解码
    /// - `top_k`: Top-k 过滤（0 = 不使用）
    ///
    /// # 返回
    /// 包含提示在内的完整序列
    pub fn generate<R: Rng + ?Sized>(
        &self,
        prompt: &[usize],
        max_length: usize,
        temperature: f32,
        top_k: usize,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        self.run(prompt, max_length, temperature, top_k, rng, None)
    }

    /// 使用 [`SamplingConfig`] 生成
    pub fn generate_with<R: Rng + ?Sized>(
        &self,
        prompt: &[usize],
        config: &SamplingConfig,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        self.run(
            prompt,
            config.max_length,
            config.temperature,
            config.top_k,
            rng,
            None,
        )
    }

    /// 带截止时间的生成：超时后返回已经生成的部分
    pub fn generate_until<R: Rng + ?Sized>(
        &self,
        prompt: &[usize],
        max_length: usize,
        temperature: f32,
        top_k: usize,
        rng: &mut R,
        deadline: Instant,
    ) -> Result<Vec<usize>> {
        self.run(prompt, max_length, temperature, top_k, rng, Some(deadline))
    }

    /// 在调用方已经持有的快照上生成
    ///
    /// 需要先从同一个模型读取上下文长度（例如编码提示）时使用，
    /// 保证编码和生成看到的是同一个模型。
    pub fn generate_on<R: Rng + ?Sized>(
        model: &ChatTransformer,
        prompt: &[usize],
        config: &SamplingConfig,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        run_on(
            model,
            prompt,
            config.max_length,
            config.temperature,
            config.top_k,
            rng,
            None,
        )
    }

    fn run<R: Rng + ?Sized>(
        &self,
        prompt: &[usize],
        max_length: usize,
        temperature: f32,
        top_k: usize,
        rng: &mut R,
        deadline: Option<Instant>,
    ) -> Result<Vec<usize>> {
        let model = self.handle.snapshot()?;
        run_on(&model, prompt, max_length, temperature, top_k, rng, deadline)
    }
}

fn run_on<R: Rng + ?Sized>(
    model: &ChatTransformer,
    prompt: &[usize],
    max_length: usize,
    temperature: f32,
    top_k: usize,
    rng: &mut R,
    deadline: Option<Instant>,
) -> Result<Vec<usize>> {
    let context = model.max_seq_len();
    let start_len = prompt.len().max(1);

    // 预分配：提示 + 新 token，新 token 数不超过剩余上下文
    let budget = max_length.min(context.saturating_sub(start_len));
    let mut tokens = Vec::with_capacity(start_len + budget);
    if prompt.is_empty() {
        tokens.push(START_ID);
    } else {
        tokens.extend_from_slice(prompt);
    }

    if tokens.len() > context {
        return Err(ModelError::SequenceLength {
            len: tokens.len(),
            max: context,
        });
    }

    for _ in 0..max_length {
        if tokens.len() >= context {
            log::debug!("生成达到上下文上限 {}", context);
            break;
        }
        if deadline.map_or(false, |d| Instant::now() >= d) {
            log::warn!("生成超时，返回 {} 个 token", tokens.len());
            break;
        }

        // 1. 前向传播
        let seq_len = tokens.len();
        let ids = Array2::from_shape_fn((1, seq_len), |(_, t)| tokens[t]);
        let logits = model.forward(&ids, None)?;

        // 2. 获取最后一个位置的 logits 并采样
        let last = logits.slice(s![0, seq_len - 1, ..]).to_vec();
        let next_token = sample_next(&last, temperature, top_k, rng);

        // 3. 添加到生成序列
        tokens.push(next_token);
        if next_token == END_ID {
            break;
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::argmax;
    use crate::transformer::{ChatTransformer, TransformerConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    fn model(vocab_size: usize, max_seq_len: usize, seed: u64) -> ChatTransformer {
        let config = TransformerConfig {
            vocab_size,
            d_model: 8,
            n_heads: 2,
            n_layers: 2,
            d_ff: 16,
            max_seq_len,
            dropout: 0.1,
        };
        ChatTransformer::with_rng(config, &mut StdRng::seed_from_u64(seed))
    }

    fn generator(model: ChatTransformer) -> Generator {
        Generator::new(Arc::new(ModelHandle::with_model(model)))
    }

    #[test]
    fn test_model_not_trained() {
        let generator = Generator::new(Arc::new(ModelHandle::new()));
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            generator.generate(&[1, 4], 5, 0.8, 10, &mut rng),
            Err(ModelError::ModelNotTrained)
        ));
    }

    #[test]
    fn test_top_k_one_matches_argmax_decoder() {
        // 只有两个 token 的词表
        let m = model(2, 16, 3);
        let g = generator(m.clone());
        let mut rng = StdRng::seed_from_u64(99);

        let generated = g.generate(&[1], 3, 1.0, 1, &mut rng).unwrap();

        let mut expected = vec![1usize];
        for _ in 0..3 {
            let ids = Array2::from_shape_fn((1, expected.len()), |(_, t)| expected[t]);
            let logits = m.forward(&ids, None).unwrap();
            let last = logits.slice(s![0, expected.len() - 1, ..]).to_vec();
            expected.push(argmax(&last));
        }

        assert_eq!(generated, expected);
    }

    #[test]
    fn test_greedy_is_deterministic() {
        let g = generator(model(10, 32, 5));
        let a = g
            .generate(&[1, 4, 5, 2], 8, 1e-7, 1, &mut StdRng::seed_from_u64(1))
            .unwrap();
        let b = g
            .generate(&[1, 4, 5, 2], 8, 1e-7, 1, &mut StdRng::seed_from_u64(2))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let g = generator(model(10, 32, 6));
        let run = |seed| {
            g.generate(&[1, 4], 10, 1.0, 0, &mut StdRng::seed_from_u64(seed))
                .unwrap()
        };
        assert_eq!(run(11), run(11));
    }

    #[test]
    fn test_terminates_within_max_length() {
        let mut m = model(10, 64, 7);
        // END 永远不会被选中
        m.fc_out.bias[[0, END_ID]] = -1e4;
        let g = generator(m);
        let mut rng = StdRng::seed_from_u64(0);

        let out = g.generate(&[1, 4, 2], 5, 0.9, 0, &mut rng).unwrap();
        assert_eq!(out.len(), 3 + 5);
        assert_eq!(&out[..3], &[1, 4, 2]);
    }

    #[test]
    fn test_stops_on_end() {
        let mut m = model(10, 64, 8);
        m.fc_out.bias[[0, END_ID]] = 1e4;
        let g = generator(m);
        let mut rng = StdRng::seed_from_u64(0);

        let out = g.generate(&[1, 4], 20, 0.7, 40, &mut rng).unwrap();
        assert_eq!(out, vec![1, 4, END_ID]);
    }

    #[test]
    fn test_stops_at_context_limit() {
        let mut m = model(10, 6, 9);
        m.fc_out.bias[[0, END_ID]] = -1e4;
        let g = generator(m);
        let mut rng = StdRng::seed_from_u64(0);

        let out = g.generate(&[1, 4, 5, 2], 50, 1.0, 0, &mut rng).unwrap();
        assert_eq!(out.len(), 6);

        assert!(matches!(
            g.generate(&[1; 7], 5, 1.0, 0, &mut rng),
            Err(ModelError::SequenceLength { len: 7, max: 6 })
        ));
    }

    #[test]
    fn test_unbounded_max_length_stops_at_context() {
        let mut m = model(10, 8, 13);
        m.fc_out.bias[[0, END_ID]] = -1e4;
        let g = generator(m);
        let mut rng = StdRng::seed_from_u64(0);

        let out = g.generate(&[1, 4, 2], usize::MAX, 1.0, 0, &mut rng).unwrap();
        assert_eq!(out.len(), 8);
        assert_eq!(&out[..3], &[1, 4, 2]);

        let out = g.generate(&[1, 4, 2], 1 << 40, 1.0, 0, &mut rng).unwrap();
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn test_generate_on_snapshot_matches_handle() {
        let g = generator(model(10, 32, 14));
        let snapshot = g.handle().snapshot().unwrap();
        let config = SamplingConfig::greedy().with_max_length(5);
        let mut rng = StdRng::seed_from_u64(0);

        let on_snapshot = Generator::generate_on(&snapshot, &[1, 6], &config, &mut rng).unwrap();
        let via_handle = g.generate_with(&[1, 6], &config, &mut rng).unwrap();
        assert_eq!(on_snapshot, via_handle);
    }

    #[test]
    fn test_empty_prompt_starts_with_start() {
        let g = generator(model(10, 16, 10));
        let mut rng = StdRng::seed_from_u64(0);
        let out = g.generate(&[], 3, 0.0, 0, &mut rng).unwrap();
        assert_eq!(out[0], START_ID);
        assert!(out.len() <= 4);
    }

    #[test]
    fn test_deadline_returns_partial() {
        let g = generator(model(10, 16, 11));
        let mut rng = StdRng::seed_from_u64(0);
        let past = Instant::now() - Duration::from_millis(1);

        let out = g
            .generate_until(&[1, 4, 2], 10, 0.8, 5, &mut rng, past)
            .unwrap();
        assert_eq!(out, vec![1, 4, 2]);
    }

    #[test]
    fn test_generate_with_config() {
        let g = generator(model(10, 32, 12));
        let config = SamplingConfig::greedy().with_max_length(4);
        let mut rng = StdRng::seed_from_u64(0);

        let out = g.generate_with(&[1, 5], &config, &mut rng).unwrap();
        let direct = g.generate(&[1, 5], 4, 0.0, 1, &mut rng).unwrap();
        assert_eq!(out, direct);
        assert!(out.len() <= 6);
    }

    #[test]
    fn test_generator_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Generator>();
    }
}

//! 模型快照
//!
//! 推理读取不可变的 `Arc<ChatTransformer>`；训练结束或重新加载时整体替换。
//! 正在进行的生成继续使用它拿到的那份快照。

use std::sync::{Arc, RwLock};

use crate::error::{ModelError, Result};
use crate::transformer::ChatTransformer;

/// 可原子替换的模型句柄
#[derive(Debug, Default)]
pub struct ModelHandle {
    current: RwLock<Option<Arc<ChatTransformer>>>,
}

impl ModelHandle {
    /// 创建空句柄（尚未加载模型）
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建已加载模型的句柄
    pub fn with_model(model: ChatTransformer) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(model))),
        }
    }

    /// 获取当前模型的快照
    pub fn snapshot(&self) -> Result<Arc<ChatTransformer>> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        (*guard).clone().ok_or(ModelError::ModelNotTrained)
    }

    /// 替换模型，返回旧模型
    pub fn swap(&self, model: ChatTransformer) -> Option<Arc<ChatTransformer>> {
        let new = Arc::new(model);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        log::info!("模型已替换: {} 个参数", new.param_count());
        guard.replace(new)
    }

    /// 卸载模型
    pub fn clear(&self) -> Option<Arc<ChatTransformer>> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        guard.take()
    }

    pub fn is_loaded(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::TransformerConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_model(seed: u64) -> ChatTransformer {
        let config = TransformerConfig {
            vocab_size: 8,
            d_model: 4,
            n_heads: 2,
            n_layers: 1,
            d_ff: 8,
            max_seq_len: 6,
            dropout: 0.0,
        };
        ChatTransformer::with_rng(config, &mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_empty_handle() {
        let handle = ModelHandle::new();
        assert!(!handle.is_loaded());
        assert!(matches!(handle.snapshot(), Err(ModelError::ModelNotTrained)));
    }

    #[test]
    fn test_swap_keeps_old_snapshot_alive() {
        let handle = ModelHandle::with_model(tiny_model(1));
        let before = handle.snapshot().unwrap();

        let old = handle.swap(tiny_model(2)).unwrap();
        let after = handle.snapshot().unwrap();

        assert!(Arc::ptr_eq(&before, &old));
        assert!(!Arc::ptr_eq(&before, &after));
        // 旧快照仍然可以使用
        assert_eq!(before.vocab_size(), 8);
    }

    #[test]
    fn test_clear() {
        let handle = ModelHandle::with_model(tiny_model(3));
        assert!(handle.clear().is_some());
        assert!(!handle.is_loaded());
        assert!(handle.clear().is_none());
    }

    #[test]
    fn test_shared_across_threads() {
        let handle = Arc::new(ModelHandle::with_model(tiny_model(4)));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let handle = Arc::clone(&handle);
                std::thread::spawn(move || handle.snapshot().map(|m| m.vocab_size()))
            })
            .collect();
        handle.swap(tiny_model(5));

        for reader in readers {
            assert_eq!(reader.join().unwrap().unwrap(), 8);
        }
    }
}

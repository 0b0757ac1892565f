//! 缓冲区状态标志
//!
//! 每个标志位独立迁移；大多数位的组合语义见 [`BufFlags`] 文档。

use bitflags::bitflags;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// 缓冲区标志
    ///
    /// Mapped/Uptodate 的四种组合均合法：
    ///
    /// | Mapped | Uptodate | 含义 |
    /// |--------|----------|------|
    /// | 否     | 否       | 未知——需要解析块号 |
    /// | 否     | 是       | 洞——内容为显式零填充 |
    /// | 是     | 否       | 已分配但尚未读入 |
    /// | 是     | 是       | 已分配且内存内容有效 |
    ///
    /// Dirty 只允许出现在最后一种组合上。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufFlags: u32 {
        /// 内存内容有效（等于磁盘数据或显式零填充）
        const UPTODATE    = 1 << 0;
        /// 内容比磁盘新，需要回写
        const DIRTY       = 1 << 1;
        /// 有 I/O 独占本缓冲区
        const LOCKED      = 1 << 2;
        /// 已指定设备块号
        const MAPPED      = 1 << 3;
        /// 刚分配的块，内容未定义
        const NEW         = 1 << 4;
        /// 异步读完成记账进行中
        const ASYNC_READ  = 1 << 5;
        /// 异步写完成记账进行中
        const ASYNC_WRITE = 1 << 6;
        /// 至少提交过一次 I/O
        const REQ         = 1 << 7;
        /// 最近一次 I/O 以失败告终
        const IO_ERROR    = 1 << 8;
    }
}

/// 标志位的原子容器
///
/// 全部读改写用 SeqCst：解锁路径上"清位即屏障"的约定由此保证，
/// 观察到解锁的线程必然看到最终的 Uptodate/错误状态。
pub(crate) struct AtomicFlags<F> {
    bits: AtomicU32,
    _marker: PhantomData<F>,
}

impl<F: bitflags::Flags<Bits = u32> + Copy> AtomicFlags<F> {
    pub(crate) fn new(initial: F) -> Self {
        Self {
            bits: AtomicU32::new(initial.bits()),
            _marker: PhantomData,
        }
    }

    pub(crate) fn load(&self) -> F {
        F::from_bits_retain(self.bits.load(Ordering::SeqCst))
    }

    pub(crate) fn contains(&self, f: F) -> bool {
        self.load().contains(f)
    }

    pub(crate) fn insert(&self, f: F) {
        self.bits.fetch_or(f.bits(), Ordering::SeqCst);
    }

    pub(crate) fn remove(&self, f: F) {
        self.bits.fetch_and(!f.bits(), Ordering::SeqCst);
    }

    /// 置位并返回旧值是否已含全部给定位
    pub(crate) fn test_and_set(&self, f: F) -> bool {
        let old = self.bits.fetch_or(f.bits(), Ordering::SeqCst);
        old & f.bits() == f.bits()
    }

    /// 清位并返回旧值是否含全部给定位
    pub(crate) fn test_and_clear(&self, f: F) -> bool {
        let old = self.bits.fetch_and(!f.bits(), Ordering::SeqCst);
        old & f.bits() == f.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_contains() {
        let flags = AtomicFlags::new(BufFlags::empty());
        assert!(!flags.contains(BufFlags::DIRTY));

        flags.insert(BufFlags::UPTODATE | BufFlags::DIRTY);
        assert!(flags.contains(BufFlags::UPTODATE));
        assert!(flags.contains(BufFlags::DIRTY));

        flags.remove(BufFlags::DIRTY);
        assert!(!flags.contains(BufFlags::DIRTY));
        assert!(flags.contains(BufFlags::UPTODATE));
    }

    #[test]
    fn test_test_and_set() {
        let flags = AtomicFlags::new(BufFlags::empty());
        assert!(!flags.test_and_set(BufFlags::LOCKED));
        assert!(flags.test_and_set(BufFlags::LOCKED));
        assert!(flags.contains(BufFlags::LOCKED));
    }

    #[test]
    fn test_test_and_clear() {
        let flags = AtomicFlags::new(BufFlags::DIRTY | BufFlags::UPTODATE);
        assert!(flags.test_and_clear(BufFlags::DIRTY));
        assert!(!flags.test_and_clear(BufFlags::DIRTY));
        assert!(flags.contains(BufFlags::UPTODATE));
    }
}

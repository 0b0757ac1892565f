//! 页：缓冲区的物理承载单元
//!
//! 一个页拥有覆盖其字节范围的全部缓冲区，以定长序列的形式持有
//! （集合大小在创建时由 `页大小/块大小` 定死，之后不变）。页级的
//! "有缓冲区 / 脏 / 最新"聚合位只是由逐缓冲状态推导出的提示，
//! 不要求与精确状态时刻相等。
//!
//! 三把锁各司其职：
//! - 附着锁（缓冲区序列的互斥量）：创建、拆除、扫描缓冲区集合；
//! - 页锁（`LOCKED` 标志 + 等待表）：读路径的页级互斥；
//! - 完成扫描自旋锁：异步完成的"扫描并可能收尾"临界区，与
//!   缓冲区自身的锁彼此独立。

use bitflags::bitflags;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer::{AtomicFlags, Buffer};
use crate::consts::PAGE_SIZE;
use crate::diag;
use crate::error::{Error, ErrorKind, Result};
use crate::wait::WaitTable;

bitflags! {
    /// 页标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// 页被锁定（读路径互斥）
        const LOCKED    = 1 << 0;
        /// 页内容整体有效
        const UPTODATE  = 1 << 1;
        /// 含脏数据的提示位
        const DIRTY     = 1 << 2;
        /// 某次页级 I/O 出过错
        const ERROR     = 1 << 3;
        /// 回写进行中
        const WRITEBACK = 1 << 4;
    }
}

/// 页
pub struct Page {
    id: u64,
    index: u64,
    flags: AtomicFlags<PageFlags>,
    buffers: Mutex<Vec<Arc<Buffer>>>,
    demux: spin::Mutex<()>,
    wait: Arc<WaitTable>,
}

impl Page {
    pub(crate) fn new(id: u64, index: u64, wait: Arc<WaitTable>) -> Arc<Self> {
        Arc::new(Self {
            id,
            index,
            flags: AtomicFlags::new(PageFlags::empty()),
            buffers: Mutex::new(Vec::new()),
            demux: spin::Mutex::new(()),
            wait,
        })
    }

    /// 页索引（在所属存储内）
    pub fn index(&self) -> u64 {
        self.index
    }

    /// 当前标志位快照
    pub fn flags(&self) -> PageFlags {
        self.flags.load()
    }

    /// 页内容是否整体有效
    pub fn is_uptodate(&self) -> bool {
        self.flags.contains(PageFlags::UPTODATE)
    }

    /// 是否带脏提示
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }

    /// 是否记录过页级错误
    pub fn has_error(&self) -> bool {
        self.flags.contains(PageFlags::ERROR)
    }

    /// 是否处于回写中
    pub fn is_writeback(&self) -> bool {
        self.flags.contains(PageFlags::WRITEBACK)
    }

    /// 是否被锁定
    pub fn is_locked(&self) -> bool {
        self.flags.contains(PageFlags::LOCKED)
    }

    /// 是否挂有缓冲区
    pub fn has_buffers(&self) -> bool {
        !self.buffers.lock().unwrap().is_empty()
    }

    pub(crate) fn set_uptodate(&self) {
        self.flags.insert(PageFlags::UPTODATE);
    }

    pub(crate) fn clear_uptodate(&self) {
        self.flags.remove(PageFlags::UPTODATE);
    }

    pub(crate) fn set_error(&self) {
        self.flags.insert(PageFlags::ERROR);
    }

    /// 缓冲区置脏时的页级传播
    pub(crate) fn set_dirty_hint(&self) {
        self.flags.insert(PageFlags::DIRTY);
    }

    pub(crate) fn clear_dirty_hint(&self) {
        self.flags.remove(PageFlags::DIRTY);
    }

    // ===== 页锁与回写状态 =====

    /// 阻塞式锁页
    pub(crate) fn lock(&self) {
        while self.flags.test_and_set(PageFlags::LOCKED) {
            self.wait
                .wait_until(self.id, || !self.flags.contains(PageFlags::LOCKED));
        }
    }

    /// 解锁并唤醒
    pub(crate) fn unlock(&self) {
        if !self.flags.test_and_clear(PageFlags::LOCKED) {
            diag::consistency_error("unlock of an unlocked page");
            return;
        }
        self.wait.wake_all(self.id);
    }

    /// 进入回写状态
    pub(crate) fn set_writeback(&self) {
        if self.flags.test_and_set(PageFlags::WRITEBACK) {
            diag::consistency_error("page already under writeback");
        }
    }

    /// 结束回写并唤醒等待者
    pub(crate) fn end_writeback(&self) {
        self.flags.remove(PageFlags::WRITEBACK);
        self.wait.wake_all(self.id);
    }

    /// 等待上一轮回写结束
    pub(crate) fn wait_writeback(&self) {
        self.wait
            .wait_until(self.id, || !self.flags.contains(PageFlags::WRITEBACK));
    }

    // ===== 缓冲区集合 =====

    /// 附着锁：持有期间集合不会被创建/拆除
    pub(crate) fn buffers_guard(&self) -> MutexGuard<'_, Vec<Arc<Buffer>>> {
        self.buffers.lock().unwrap()
    }

    /// 集合快照（短暂持有附着锁）
    pub(crate) fn buffers_snapshot(&self) -> Vec<Arc<Buffer>> {
        self.buffers.lock().unwrap().clone()
    }

    /// 完成扫描临界区
    pub(crate) fn demux_lock(&self) -> spin::MutexGuard<'_, ()> {
        self.demux.lock()
    }

    /// 尝试整页回收缓冲区
    ///
    /// 要求页上每个缓冲区同时满足：无人持有、未锁定、非脏；
    /// 一个忙缓冲区阻止整个集合的回收——全有或全无，并发查找
    /// 观察不到半拆的中间态。成功时若页还挂着历史遗留的脏提示
    /// （缓冲区实际都净），顺带清除，防止将来的错误传播。
    pub(crate) fn try_reclaim(&self) -> bool {
        if self.is_writeback() {
            return false;
        }
        let mut bufs = self.buffers.lock().unwrap();
        if bufs.iter().any(|b| b.is_busy()) {
            return false;
        }
        for b in bufs.iter() {
            b.detach_assoc();
        }
        bufs.clear();
        self.clear_dirty_hint();
        true
    }

    // ===== 跨缓冲区的字节访问 =====

    /// 读出页内字节范围
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.for_byte_range(offset, out.len(), |buf, buf_off, dst_off, n| {
            buf.with_data(|d| out[dst_off..dst_off + n].copy_from_slice(&d[buf_off..buf_off + n]));
        })
    }

    /// 写入页内字节范围（不改动任何状态位；置脏由提交路径负责）
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.for_byte_range(offset, data.len(), |buf, buf_off, src_off, n| {
            buf.with_data_mut(|d| d[buf_off..buf_off + n].copy_from_slice(&data[src_off..src_off + n]));
        })
    }

    /// 清零页内字节范围
    pub(crate) fn zero_range(&self, offset: usize, len: usize) -> Result<()> {
        self.for_byte_range(offset, len, |buf, buf_off, _pos, n| {
            buf.zero_bytes(buf_off..buf_off + n);
        })
    }

    fn for_byte_range(
        &self,
        offset: usize,
        len: usize,
        mut f: impl FnMut(&Arc<Buffer>, usize, usize, usize),
    ) -> Result<()> {
        if offset + len > PAGE_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "byte range exceeds page size",
            ));
        }
        let bufs = self.buffers.lock().unwrap();
        if bufs.is_empty() {
            return Err(Error::new(ErrorKind::InvalidState, "page has no buffers"));
        }
        let bs = bufs[0].size();
        let mut pos = 0usize;
        while pos < len {
            let abs = offset + pos;
            let i = abs / bs;
            let buf_off = abs % bs;
            let n = (bs - buf_off).min(len - pos);
            f(&bufs[i], buf_off, pos, n);
            pos += n;
        }
        Ok(())
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("flags", &self.flags.load())
            .field("buffers", &self.buffers.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::pool::BufferPool;
    use crate::buffer::BufFlags;

    fn mk_page(nbufs: usize, size: usize) -> (Arc<Page>, Arc<BufferPool>) {
        let wait = Arc::new(WaitTable::new(8));
        let pool = BufferPool::new(0, 0, 1);
        let page = Page::new(1, 0, wait.clone());
        {
            let mut bufs = page.buffers_guard();
            for i in 0..nbufs {
                let permit = pool.try_reserve().unwrap();
                bufs.push(Arc::new(Buffer::new(
                    10 + i as u64,
                    1,
                    size,
                    i as u64,
                    BufFlags::MAPPED,
                    Arc::downgrade(&page),
                    wait.clone(),
                    permit,
                )));
            }
        }
        (page, pool)
    }

    #[test]
    fn test_dirty_propagates_to_page() {
        let (page, _pool) = mk_page(4, 1024);
        assert!(!page.is_dirty());
        let buf = page.buffers_snapshot()[2].clone();
        buf.set_uptodate();
        buf.mark_dirty();
        assert!(page.is_dirty());
    }

    #[test]
    fn test_reclaim_all_or_nothing() {
        let (page, pool) = mk_page(4, 1024);
        let before = pool.live();

        // 一个忙缓冲区挡住整页回收
        let busy = page.buffers_snapshot()[0].clone();
        busy.get();
        assert!(!page.try_reclaim());
        assert_eq!(page.buffers_snapshot().len(), 4);
        assert_eq!(pool.live(), before);

        busy.put();
        drop(busy);
        assert!(page.try_reclaim());
        assert!(!page.has_buffers());
    }

    #[test]
    fn test_reclaim_refuses_dirty_and_locked() {
        let (page, _pool) = mk_page(2, 2048);
        let bufs = page.buffers_snapshot();

        bufs[0].set_uptodate();
        bufs[0].mark_dirty();
        assert!(!page.try_reclaim());
        bufs[0].raw_flags().remove(BufFlags::DIRTY);

        bufs[1].lock();
        assert!(!page.try_reclaim());
        bufs[1].unlock();

        drop(bufs);
        assert!(page.try_reclaim());
    }

    #[test]
    fn test_reclaim_clears_stale_dirty_hint() {
        let (page, _pool) = mk_page(2, 2048);
        // 页被标脏，但其缓冲区最终都净
        page.set_dirty_hint();
        assert!(page.try_reclaim());
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_byte_access_spans_buffers() {
        let (page, _pool) = mk_page(4, 1024);
        let data: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();
        // 跨越第 0..=2 个缓冲区
        page.write_bytes(512, &data).unwrap();

        let mut out = vec![0u8; 2048];
        page.read_bytes(512, &mut out).unwrap();
        assert_eq!(out, data);

        page.zero_range(1024, 1024).unwrap();
        page.read_bytes(1024, &mut out[..1024]).unwrap();
        assert!(out[..1024].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_byte_access_bounds() {
        let (page, _pool) = mk_page(4, 1024);
        let err = page.write_bytes(4000, &[0u8; 200]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_writeback_state() {
        let (page, _pool) = mk_page(1, 4096);
        assert!(!page.is_writeback());
        page.set_writeback();
        assert!(page.is_writeback());

        let t = {
            let page = page.clone();
            std::thread::spawn(move || page.wait_writeback())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(!t.is_finished());
        page.end_writeback();
        t.join().unwrap();
    }
}

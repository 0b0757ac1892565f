//! 缓冲区描述符与引用句柄
//!
//! [`Buffer`] 是块级缓存 I/O 的基本单元：身份为（设备、块号、尺寸）
//! 三元组，内容字节随描述符存放，生命周期锚定在承载它的页上。
//!
//! 外部持有方只通过 [`BufferRef`] 访问缓冲区：克隆即增加持有计数，
//! 落出作用域即释放。持有计数与 `Arc` 的内存计数是两回事——前者
//! 决定回收资格（计数为零、未锁定、非脏的缓冲区才可被整页回收），
//! 后者只管内存何时归还。

mod flags;
pub mod pool;

pub use flags::BufFlags;
pub(crate) use flags::AtomicFlags;

use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::device::Device;
use crate::diag;
use crate::io::EndIo;
use crate::page::Page;
use crate::wait::WaitTable;

use pool::PoolPermit;

/// 关联表成员记录：缓冲区挂在哪个 owner 的表上，以及表锁属于哪个设备
#[derive(Clone)]
pub(crate) struct AssocEntry {
    pub(crate) dev: Weak<Device>,
    pub(crate) owner: u64,
}

/// 缓存缓冲区
///
/// 字段的并发约定：
/// - 标志位经由原子容器迁移；
/// - 内容字节只由锁持有者（I/O 期间）或确认过"未锁定且无异步
///   记账在途"的内容所有者改写，短临界区由内部互斥量保证；
/// - 块号只在持锁状态下改写。
pub struct Buffer {
    id: u64,
    dev_id: u64,
    size: usize,
    block: AtomicU64,
    flags: AtomicFlags<BufFlags>,
    holders: AtomicU32,
    data: Mutex<Box<[u8]>>,
    page: Weak<Page>,
    end_io: Mutex<Option<EndIo>>,
    assoc: Mutex<Option<AssocEntry>>,
    wait: Arc<WaitTable>,
    _permit: PoolPermit,
}

impl Buffer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        dev_id: u64,
        size: usize,
        block: u64,
        initial: BufFlags,
        page: Weak<Page>,
        wait: Arc<WaitTable>,
        permit: PoolPermit,
    ) -> Self {
        Self {
            id,
            dev_id,
            size,
            block: AtomicU64::new(block),
            flags: AtomicFlags::new(initial),
            holders: AtomicU32::new(0),
            data: Mutex::new(vec![0u8; size].into_boxed_slice()),
            page,
            end_io: Mutex::new(None),
            assoc: Mutex::new(None),
            wait,
            _permit: permit,
        }
    }

    /// 所属设备 id
    pub fn dev_id(&self) -> u64 {
        self.dev_id
    }

    /// 映射的设备块号（仅在 Mapped 时有意义）
    pub fn block(&self) -> u64 {
        self.block.load(Ordering::SeqCst)
    }

    /// 缓冲区尺寸（字节）
    pub fn size(&self) -> usize {
        self.size
    }

    /// 当前标志位快照
    pub fn flags(&self) -> BufFlags {
        self.flags.load()
    }

    pub(crate) fn raw_flags(&self) -> &AtomicFlags<BufFlags> {
        &self.flags
    }

    pub(crate) fn page(&self) -> Option<Arc<Page>> {
        self.page.upgrade()
    }

    // ===== 状态查询 =====

    /// 内容是否有效
    pub fn is_uptodate(&self) -> bool {
        self.flags.contains(BufFlags::UPTODATE)
    }

    /// 是否待回写
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(BufFlags::DIRTY)
    }

    /// 是否有 I/O 独占中
    pub fn is_locked(&self) -> bool {
        self.flags.contains(BufFlags::LOCKED)
    }

    /// 是否已指定设备块号
    pub fn is_mapped(&self) -> bool {
        self.flags.contains(BufFlags::MAPPED)
    }

    /// 是否为刚分配的新块
    pub fn is_new(&self) -> bool {
        self.flags.contains(BufFlags::NEW)
    }

    /// 最近一次 I/O 是否失败
    pub fn io_failed(&self) -> bool {
        self.flags.contains(BufFlags::IO_ERROR)
    }

    pub(crate) fn set_uptodate(&self) {
        self.flags.insert(BufFlags::UPTODATE);
    }

    pub(crate) fn clear_uptodate(&self) {
        self.flags.remove(BufFlags::UPTODATE);
    }

    /// 回收资格判定：被引用、被锁或为脏的缓冲区都算忙
    pub(crate) fn is_busy(&self) -> bool {
        self.holders.load(Ordering::SeqCst) > 0
            || self
                .flags
                .load()
                .intersects(BufFlags::LOCKED | BufFlags::DIRTY)
    }

    /// 指定设备块号并置 Mapped
    pub(crate) fn map_to(&self, block: u64) {
        self.block.store(block, Ordering::SeqCst);
        self.flags.insert(BufFlags::MAPPED);
    }

    // ===== 锁与等待 =====

    /// 阻塞式拿锁
    ///
    /// 与等待表协作；同一线程重复拿同一把锁会死锁，调用方自负。
    pub fn lock(&self) {
        while self.flags.test_and_set(BufFlags::LOCKED) {
            self.wait
                .wait_until(self.id, || !self.flags.contains(BufFlags::LOCKED));
        }
    }

    /// 非阻塞拿锁
    pub fn try_lock(&self) -> bool {
        !self.flags.test_and_set(BufFlags::LOCKED)
    }

    /// 解锁并唤醒等待者
    ///
    /// 清位本身即内存屏障：观察到解锁的线程必然看到最终的
    /// Uptodate/错误状态。
    pub fn unlock(&self) {
        if !self.flags.test_and_clear(BufFlags::LOCKED) {
            diag::consistency_error("unlock of an unlocked buffer");
            return;
        }
        self.wait.wake_all(self.id);
    }

    /// 等待缓冲区解锁
    ///
    /// 不阻止它随后再次被锁；需要保全状态的调用方应自己拿锁。
    pub fn wait_on(&self) {
        self.wait
            .wait_until(self.id, || !self.flags.contains(BufFlags::LOCKED));
    }

    /// 限时等待解锁；返回到期时是否已解锁
    pub(crate) fn wait_on_timeout(&self, timeout: Duration) -> bool {
        self.wait
            .wait_timeout_until(self.id, timeout, || !self.flags.contains(BufFlags::LOCKED))
    }

    // ===== 脏位 =====

    /// 标记为脏并把脏意传播到所属页
    ///
    /// 前置条件：内容必须已有效。对无效内容置脏会被拒绝——
    /// "需要回写的未知内容"不是合法状态。
    pub fn mark_dirty(&self) {
        if !self.is_uptodate() {
            diag::consistency_error("mark_dirty on a buffer that is not uptodate");
            return;
        }
        if !self.flags.test_and_set(BufFlags::DIRTY) {
            if let Some(page) = self.page.upgrade() {
                page.set_dirty_hint();
            }
        }
    }

    // ===== 持有计数 =====

    pub(crate) fn get(&self) {
        self.holders.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn put(&self) {
        let mut cur = self.holders.load(Ordering::SeqCst);
        loop {
            if cur == 0 {
                diag::consistency_error("releasing an unreferenced buffer");
                return;
            }
            match self.holders.compare_exchange(
                cur,
                cur - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    /// 当前持有计数
    pub fn holders(&self) -> u32 {
        self.holders.load(Ordering::SeqCst)
    }

    // ===== 内容访问 =====

    /// 只读访问内容字节
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.data.lock().unwrap();
        f(&guard)
    }

    /// 可写访问内容字节
    ///
    /// 内容所有者应先确认缓冲区未被 I/O 锁定。
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.data.lock().unwrap();
        f(&mut guard)
    }

    /// 整块清零
    pub(crate) fn zero_fill(&self) {
        self.data.lock().unwrap().fill(0);
    }

    /// 清零块内子范围
    pub(crate) fn zero_bytes(&self, range: Range<usize>) {
        let mut guard = self.data.lock().unwrap();
        let end = range.end.min(guard.len());
        if range.start < end {
            guard[range.start..end].fill(0);
        }
    }

    // ===== 完成回调与关联表 =====

    pub(crate) fn end_io_slot(&self) -> &Mutex<Option<EndIo>> {
        &self.end_io
    }

    pub(crate) fn assoc_slot(&self) -> &Mutex<Option<AssocEntry>> {
        &self.assoc
    }

    /// 从关联表脱离（若在表上）
    ///
    /// 锁序：先窥视自己的成员记录，再在设备表锁之下复查并摘除，
    /// 避免与 track 的"表锁→成员记录"顺序成环。
    pub(crate) fn detach_assoc(&self) {
        let peeked = self.assoc.lock().unwrap().clone();
        let Some(entry) = peeked else { return };
        let Some(dev) = entry.dev.upgrade() else {
            *self.assoc.lock().unwrap() = None;
            return;
        };
        dev.with_assoc(|lists| {
            let mut slot = self.assoc.lock().unwrap();
            let still_there = matches!(slot.as_ref(), Some(e) if e.owner == entry.owner);
            if still_there {
                if let Some(list) = lists.get_mut(&entry.owner) {
                    list.retain(|b| b.id != self.id);
                }
                *slot = None;
            }
        });
    }
}

impl core::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Buffer")
            .field("dev", &self.dev_id)
            .field("block", &self.block())
            .field("size", &self.size)
            .field("flags", &self.flags.load())
            .field("holders", &self.holders())
            .finish()
    }
}

/// 缓冲区引用句柄
///
/// 克隆增加持有计数，析构释放。需要故意丢弃脏内容时用
/// [`BufferRef::forget`] 代替普通释放。
pub struct BufferRef {
    buf: Arc<Buffer>,
}

impl BufferRef {
    /// 接管一个已计入持有计数的缓冲区
    pub(crate) fn adopt(buf: Arc<Buffer>) -> Self {
        Self { buf }
    }

    pub(crate) fn arc(&self) -> &Arc<Buffer> {
        &self.buf
    }

    /// 两个句柄是否指向同一个缓冲区
    pub fn ptr_eq(a: &BufferRef, b: &BufferRef) -> bool {
        Arc::ptr_eq(&a.buf, &b.buf)
    }

    /// 丢弃句柄并放弃其中的缓冲数据
    ///
    /// 无条件清除脏位与有效位、从关联表脱离，然后释放引用。
    /// 用于调用方确知内容已过期的场合（例如块在盘上已被删除），
    /// 此后对同一块的读取会重新从设备取数而不是返回被丢弃的
    /// 内存内容。不排任何写，也不等待在飞的 I/O。
    pub fn forget(self) {
        self.buf
            .raw_flags()
            .remove(BufFlags::DIRTY | BufFlags::UPTODATE);
        self.buf.detach_assoc();
        // drop 负责释放持有计数
    }
}

impl Clone for BufferRef {
    fn clone(&self) -> Self {
        self.buf.get();
        Self {
            buf: self.buf.clone(),
        }
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        self.buf.put();
    }
}

impl std::ops::Deref for BufferRef {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buf
    }
}

impl core::fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.buf.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::pool::BufferPool;
    use super::*;

    fn mk_buffer(initial: BufFlags) -> Arc<Buffer> {
        let pool = BufferPool::new(0, 0, 1);
        let permit = pool.try_reserve().unwrap();
        let wait = Arc::new(WaitTable::new(8));
        Arc::new(Buffer::new(1, 1, 512, 10, initial, Weak::new(), wait, permit))
    }

    #[test]
    fn test_lock_unlock() {
        let buf = mk_buffer(BufFlags::empty());
        assert!(!buf.is_locked());
        buf.lock();
        assert!(buf.is_locked());
        assert!(!buf.try_lock());
        buf.unlock();
        assert!(!buf.is_locked());
        assert!(buf.try_lock());
        buf.unlock();
    }

    #[test]
    fn test_lock_contention_across_threads() {
        let buf = mk_buffer(BufFlags::empty());
        buf.lock();

        let t = {
            let buf = buf.clone();
            std::thread::spawn(move || {
                buf.lock();
                buf.unlock();
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!t.is_finished());
        buf.unlock();
        t.join().unwrap();
    }

    #[test]
    fn test_mark_dirty_requires_uptodate() {
        let buf = mk_buffer(BufFlags::empty());
        buf.mark_dirty();
        assert!(!buf.is_dirty());

        buf.set_uptodate();
        buf.mark_dirty();
        assert!(buf.is_dirty());
    }

    #[test]
    fn test_holder_counting() {
        let buf = mk_buffer(BufFlags::empty());
        buf.get();
        let a = BufferRef::adopt(buf.clone());
        assert_eq!(a.holders(), 1);
        let b = a.clone();
        assert_eq!(a.holders(), 2);
        assert!(BufferRef::ptr_eq(&a, &b));
        drop(b);
        assert_eq!(a.holders(), 1);
        drop(a);
        assert_eq!(buf.holders(), 0);
    }

    #[test]
    fn test_forget_clears_dirty() {
        let buf = mk_buffer(BufFlags::UPTODATE);
        buf.get();
        let handle = BufferRef::adopt(buf.clone());
        handle.mark_dirty();
        assert!(buf.is_dirty());
        handle.forget();
        assert!(!buf.is_dirty());
        assert!(!buf.is_uptodate());
        assert_eq!(buf.holders(), 0);
    }

    #[test]
    fn test_busy_conditions() {
        let buf = mk_buffer(BufFlags::UPTODATE);
        assert!(!buf.is_busy());

        buf.get();
        assert!(buf.is_busy());
        buf.put();

        buf.lock();
        assert!(buf.is_busy());
        buf.unlock();

        buf.mark_dirty();
        assert!(buf.is_busy());
    }

    #[test]
    fn test_data_access_and_zeroing() {
        let buf = mk_buffer(BufFlags::empty());
        buf.with_data_mut(|d| d.fill(0xAA));
        buf.zero_bytes(0..256);
        buf.with_data(|d| {
            assert!(d[..256].iter().all(|&b| b == 0));
            assert!(d[256..].iter().all(|&b| b == 0xAA));
        });
        buf.zero_fill();
        buf.with_data(|d| assert!(d.iter().all(|&b| b == 0)));
    }

    #[test]
    fn test_wait_on_follows_unlock() {
        let buf = mk_buffer(BufFlags::empty());
        buf.lock();

        let t = {
            let buf = buf.clone();
            std::thread::spawn(move || {
                buf.wait_on();
                assert!(buf.is_uptodate());
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        // 解锁前写入最终状态；等待者醒来时必须看到
        buf.set_uptodate();
        buf.unlock();
        t.join().unwrap();
    }
}

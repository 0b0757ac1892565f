//! 缓冲区缓存上下文
//!
//! 源设计里的进程级全局状态（描述符池、分片查找数组、散列等待表、
//! 设备登记）在这里收拢为一个显式的 [`BufCache`] 上下文：由宿主
//! 构造一次、传给每个缓存操作，多个互不相干的实例可以共存（测试
//! 依赖这一点）。
//!
//! # 主要组件
//!
//! - [`BufCache`] - 上下文与对文件系统暴露的操作面
//! - [`CacheConfig`] - 池容量、软上限、分片数、重试预算
//! - `lru` 子模块 - 查找前端
//!
//! # 查找路径
//!
//! `get_buffer` 先查线程亲和分片（一把自旋锁的代价），未命中再走
//! 慢路径：按尺寸算出覆盖该块的页索引，在设备页存储里找到或建出
//! 该页并线性扫描其缓冲区集合；页还没有缓冲区就按 `页大小/块大小`
//! 一次性配齐并原子挂接。增长失败（描述符池耗尽、旧集合忙）触发
//! 一轮内存压力缓解后退避重试，预算用完以 `NoSpace` 报错——
//! 源设计在此处无限重试，换来的是坏块号会永远转圈，这里改为
//! 有界重试以便测试与排障。

pub(crate) mod lru;

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::buffer::pool::BufferPool;
use crate::buffer::{BufFlags, Buffer, BufferRef};
use crate::consts::{
    DEFAULT_POOL_CAPACITY, DEFAULT_RETRY_LIMIT, MIN_BLOCK_SIZE, PAGE_SIZE,
    RELIEF_WRITEBACK_BATCH, RETRY_BACKOFF_BASE_US, RETRY_BACKOFF_MAX_SHIFT, WAIT_TABLE_BUCKETS,
};
use crate::device::{Device, DiskDriver, IoDir, Mapping};
use crate::diag;
use crate::error::{Error, ErrorKind, Result};
use crate::io::{self, EndIo};
use crate::page::Page;
use crate::wait::WaitTable;

use lru::{BufKey, LookupCache};

/// 上下文配置
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// 描述符池容量（会被抬到保底值之上）
    pub pool_capacity: usize,
    /// 描述符软上限（供回写策略参考的标志阈值）
    pub pool_soft_limit: usize,
    /// 查找前端分片数
    pub shards: usize,
    /// `get_buffer` 的重试预算
    pub retry_limit: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8);
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            pool_soft_limit: DEFAULT_POOL_CAPACITY * 9 / 10,
            shards,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }
}

/// 缓冲区缓存
pub struct BufCache {
    pool: Arc<BufferPool>,
    lookup: LookupCache,
    wait: Arc<WaitTable>,
    devices: Mutex<Vec<Weak<Device>>>,
    ids: Arc<AtomicU64>,
    retry_limit: u32,
}

impl Default for BufCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl BufCache {
    /// 创建缓存上下文
    pub fn new(config: CacheConfig) -> Self {
        Self {
            pool: BufferPool::new(config.pool_capacity, config.pool_soft_limit, config.shards),
            lookup: LookupCache::new(config.shards),
            wait: Arc::new(WaitTable::new(WAIT_TABLE_BUCKETS)),
            devices: Mutex::new(Vec::new()),
            ids: Arc::new(AtomicU64::new(1)),
            retry_limit: config.retry_limit,
        }
    }

    /// 登记块设备
    pub fn register_device(&self, name: &str, driver: Box<dyn DiskDriver>) -> Result<Arc<Device>> {
        let dev = Device::new(name, driver, self.wait.clone(), self.ids.clone())?;
        let mut devices = self.devices.lock().unwrap();
        devices.retain(|d| d.strong_count() > 0);
        devices.push(Arc::downgrade(&dev));
        log::debug!("[BCACHE] registered device {} id={}", name, dev.id());
        Ok(dev)
    }

    /// 创建上层映射对象
    pub fn new_mapping(&self, dev: &Arc<Device>, block_size: usize) -> Result<Arc<Mapping>> {
        Self::check_size(dev, block_size)?;
        Ok(Mapping::new(dev.clone(), block_size))
    }

    /// 活跃描述符是否超过软上限
    pub fn over_soft_limit(&self) -> bool {
        self.pool.over_soft_limit()
    }

    /// 描述符池（观测接口：活跃数、容量、软上限标志）
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    fn check_size(dev: &Device, size: usize) -> Result<()> {
        if !size.is_power_of_two() || !(MIN_BLOCK_SIZE..=PAGE_SIZE).contains(&size) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "block size must be a power of two between 512 bytes and a page",
            ));
        }
        if size % dev.sector_size() as usize != 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "block size must be a multiple of the hardware sector size",
            ));
        }
        Ok(())
    }

    // ===== 查找与增长 =====

    /// 查找缓存的缓冲区，不触发创建
    ///
    /// 命中（前端或慢路径）即带回一个新引用；慢路径命中顺带装入
    /// 查找前端。
    pub fn find_buffer(&self, dev: &Arc<Device>, block: u64, size: usize) -> Option<BufferRef> {
        let key = BufKey {
            dev: dev.id(),
            block,
            size,
        };
        if let Some(buf) = self.lookup.lookup(&key) {
            log::trace!("[LRU] hit dev={} block={:#x}", dev.id(), block);
            return Some(BufferRef::adopt(buf));
        }
        let buf = self.find_get_slow(dev, block, size)?;
        self.lookup.install(&buf);
        Some(BufferRef::adopt(buf))
    }

    /// 权威慢路径：扫描覆盖该块的页
    fn find_get_slow(&self, dev: &Arc<Device>, block: u64, size: usize) -> Option<Arc<Buffer>> {
        let blocks_per_page = (PAGE_SIZE / size) as u64;
        let index = block / blocks_per_page;
        let page = dev.find_page(index)?;
        let bufs = page.buffers_guard();
        if bufs.is_empty() {
            return None;
        }
        for b in bufs.iter() {
            if b.block() == block && b.size() == size {
                b.get();
                return Some(b.clone());
            }
        }
        // 页上挂着缓冲区却没有要找的块：这是调用方用错了块号或
        // 尺寸，不是普通未命中
        diag::consistency_error("page holds buffers but none matches the requested block");
        None
    }

    /// 为块配齐页与缓冲区
    fn grow(&self, dev: &Arc<Device>, block: u64, size: usize) -> Result<()> {
        let blocks_per_page = (PAGE_SIZE / size) as u64;
        let index = block / blocks_per_page;
        let base = index * blocks_per_page;

        let page = dev.find_or_create_page(index);
        let mut bufs = page.buffers_guard();
        if !bufs.is_empty() {
            if bufs[0].size() == size {
                return Ok(());
            }
            // 尺寸变更：旧集合必须整体空闲才能拆除
            if page.is_writeback() || bufs.iter().any(|b| b.is_busy()) {
                return Err(Error::new(
                    ErrorKind::Busy,
                    "page still holds busy buffers of a different size",
                ));
            }
            log::debug!(
                "[BCACHE] resizing page {} of dev {} from {} to {}",
                index,
                dev.id(),
                bufs[0].size(),
                size
            );
            for b in bufs.iter() {
                b.detach_assoc();
            }
            bufs.clear();
            page.clear_dirty_hint();
        }

        let inherited = if page.is_uptodate() {
            BufFlags::MAPPED | BufFlags::UPTODATE
        } else {
            BufFlags::MAPPED
        };
        let mut created = Vec::with_capacity(blocks_per_page as usize);
        for i in 0..blocks_per_page {
            let permit = self.pool.try_reserve()?;
            created.push(Arc::new(Buffer::new(
                dev.next_id(),
                dev.id(),
                size,
                base + i,
                inherited,
                Arc::downgrade(&page),
                self.wait.clone(),
                permit,
            )));
        }
        *bufs = created;
        Ok(())
    }

    /// 取得覆盖指定块的缓冲区，必要时创建
    ///
    /// 尺寸非法立即拒绝；资源紧张时触发压力缓解并指数退避重试，
    /// 预算耗尽后以 `NoSpace` 报错。
    pub fn get_buffer(&self, dev: &Arc<Device>, block: u64, size: usize) -> Result<BufferRef> {
        Self::check_size(dev, size)?;
        let mut tries = 0u32;
        let mut grown = 0u32;
        loop {
            if let Some(buf) = self.find_buffer(dev, block, size) {
                return Ok(buf);
            }
            match self.grow(dev, block, size) {
                Ok(()) => {
                    // 增长成功后查找仍未命中只可能是并发拆除或块号
                    // 记账坏掉；有限让步，不无限转圈
                    grown += 1;
                    if grown > 8 {
                        diag::consistency_error("lookup keeps missing after successful growth");
                        return Err(Error::new(
                            ErrorKind::InvalidState,
                            "grown buffers never became findable",
                        ));
                    }
                    continue;
                }
                Err(e) if e.is_transient() => {
                    tries += 1;
                    if tries > self.retry_limit {
                        log::warn!(
                            "[BCACHE] giving up on dev={} block={:#x} after {} attempts",
                            dev.id(),
                            block,
                            tries
                        );
                        return Err(Error::new(
                            ErrorKind::NoSpace,
                            "buffer allocation kept failing after repeated reclaim",
                        ));
                    }
                    self.relieve_pressure();
                    let backoff = RETRY_BACKOFF_BASE_US << tries.min(RETRY_BACKOFF_MAX_SHIFT);
                    std::thread::sleep(Duration::from_micros(backoff));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 取得缓冲区并保证发起过读取
    ///
    /// 返回的缓冲区未必有效：I/O 失败时同样带回句柄，调用方检查
    /// `is_uptodate()` 判定结果。
    pub fn read_buffer(&self, dev: &Arc<Device>, block: u64, size: usize) -> Result<BufferRef> {
        let buf = self.get_buffer(dev, block, size)?;
        if buf.is_uptodate() {
            return Ok(buf);
        }
        buf.lock();
        if buf.is_uptodate() {
            // 别的读者抢先带到了最新
            buf.unlock();
            return Ok(buf);
        }
        if buf.is_dirty() {
            diag::consistency_error("re-reading a dirty buffer from disk");
        }
        if let Err(e) = io::submit_with(IoDir::Read, dev, buf.arc().clone(), EndIo::Sync) {
            buf.unlock();
            return Err(e);
        }
        buf.wait_on();
        Ok(buf)
    }

    // ===== 回写与整设备操作 =====

    /// 同步写回单个缓冲区（脏则写并等待，净则什么也不做）
    pub fn sync_buffer(&self, dev: &Arc<Device>, buf: &BufferRef) -> Result<()> {
        buf.lock();
        if !buf.is_dirty() {
            buf.unlock();
            return Ok(());
        }
        if let Err(e) = io::submit_with(IoDir::Write, dev, buf.arc().clone(), EndIo::Sync) {
            buf.unlock();
            return Err(e);
        }
        buf.wait_on();
        if !buf.is_uptodate() || buf.io_failed() {
            return Err(Error::new(ErrorKind::Io, "buffer writeback failed"));
        }
        Ok(())
    }

    /// 写回并等待设备存储里的全部脏数据
    ///
    /// 不取任何上层文件系统锁。聚合首个错误，但所有发起的写都会
    /// 被等到。
    pub fn sync_device(&self, dev: &Arc<Device>) -> Result<()> {
        let mut first_err: Option<Error> = None;
        let mut waitlist: Vec<Arc<Buffer>> = Vec::new();

        for (_, page) in dev.pages_snapshot() {
            for b in page.buffers_snapshot() {
                if !b.is_dirty() {
                    continue;
                }
                if !b.try_lock() {
                    // 已有人在写，等它
                    waitlist.push(b);
                    continue;
                }
                if !b.is_dirty() {
                    b.unlock();
                    continue;
                }
                match io::submit_with(IoDir::Write, dev, b.clone(), EndIo::Sync) {
                    Ok(()) => waitlist.push(b),
                    Err(e) => {
                        b.unlock();
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        for b in &waitlist {
            b.wait_on();
            if !b.is_uptodate() {
                first_err.get_or_insert(Error::new(ErrorKind::Io, "device writeback failed"));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 丢弃设备的全部缓存页与缓冲区
    ///
    /// 先清扫查找前端（调用方保证此后不再有对该设备的新访问），
    /// 再逐页回收。非破坏模式拒绝丢弃脏数据：含脏缓冲区的页整页
    /// 幸存，内容与脏位原样保留。破坏模式先抹掉脏位再回收。忙
    /// （被引用/被锁）的缓冲区在两种模式下都让所在页幸存。
    /// 返回丢掉的页数。
    pub fn invalidate_device(&self, dev: &Arc<Device>, destructive: bool) -> usize {
        let swept = self.lookup.sweep_device(dev.id());
        log::debug!(
            "[BCACHE] invalidate dev={} destructive={} swept {} lookup entries",
            dev.id(),
            destructive,
            swept
        );

        let mut dropped = 0;
        for (index, page) in dev.pages_snapshot() {
            let bufs = page.buffers_snapshot();
            if !destructive && bufs.iter().any(|b| b.is_dirty()) {
                continue;
            }
            if destructive {
                for b in &bufs {
                    if !b.is_locked() {
                        b.raw_flags().remove(BufFlags::DIRTY);
                    }
                }
            }
            if page.try_reclaim() {
                dev.remove_page(index);
                dropped += 1;
            }
        }
        dropped
    }

    /// 一轮内存压力缓解：每个设备回写一小批脏缓冲区，然后回收
    /// 完全空闲的页，把描述符还给池
    pub fn relieve_pressure(&self) {
        let devices: Vec<Arc<Device>> = {
            let list = self.devices.lock().unwrap();
            list.iter().filter_map(|d| d.upgrade()).collect()
        };
        for dev in devices {
            let mut written = 0usize;
            'pages: for (_, page) in dev.pages_snapshot() {
                for b in page.buffers_snapshot() {
                    if written >= RELIEF_WRITEBACK_BATCH {
                        break 'pages;
                    }
                    if !b.is_dirty() || !b.try_lock() {
                        continue;
                    }
                    if !b.is_dirty() {
                        b.unlock();
                        continue;
                    }
                    if io::submit_with(IoDir::Write, &dev, b.clone(), EndIo::Sync).is_ok() {
                        b.wait_on();
                        written += 1;
                    } else {
                        b.unlock();
                    }
                }
            }
            let mut reclaimed = 0usize;
            for (index, page) in dev.pages_snapshot() {
                if page.try_reclaim() {
                    dev.remove_page(index);
                    reclaimed += 1;
                }
            }
            if written > 0 || reclaimed > 0 {
                log::debug!(
                    "[BCACHE] pressure relief dev={}: wrote {}, reclaimed {} pages",
                    dev.id(),
                    written,
                    reclaimed
                );
            }
        }
    }

    /// 丢弃一个块的陈旧缓存别名
    ///
    /// 解析回调刚为新数据分配的块可能还留着旧身份的缓存内容；
    /// 抹掉脏位、等掉在飞的 I/O 并清除提交痕迹，免得旧内容稍后
    /// 盖到新数据上。
    pub(crate) fn discard_alias(&self, dev: &Arc<Device>, block: u64, size: usize) {
        if let Some(b) = self.find_buffer(dev, block, size) {
            b.raw_flags().remove(BufFlags::DIRTY);
            b.wait_on();
            b.raw_flags().remove(BufFlags::REQ);
        }
    }

    /// 给页配上空缓冲区（未映射），继承页级状态位
    ///
    /// 走不许失败的池分配模式：阻塞并配合压力缓解直到配齐。
    pub(crate) fn create_empty_buffers(
        &self,
        dev: &Arc<Device>,
        page: &Arc<Page>,
        size: usize,
        extra: BufFlags,
    ) {
        let blocks_per_page = PAGE_SIZE / size;
        let mut created = Vec::with_capacity(blocks_per_page);
        for _ in 0..blocks_per_page {
            let permit = self.pool.reserve_blocking(&|| self.relieve_pressure());
            created.push(Arc::new(Buffer::new(
                dev.next_id(),
                dev.id(),
                size,
                0,
                extra,
                Arc::downgrade(page),
                self.wait.clone(),
                permit,
            )));
        }

        let mut inherited = BufFlags::empty();
        if page.is_uptodate() {
            inherited |= BufFlags::UPTODATE;
            if page.is_dirty() {
                inherited |= BufFlags::DIRTY;
            }
        }
        let mut bufs = page.buffers_guard();
        if !bufs.is_empty() {
            diag::consistency_error("attaching buffers to a page that already has them");
            return;
        }
        if !inherited.is_empty() {
            for b in &created {
                b.raw_flags().insert(inherited);
            }
        }
        *bufs = created;
    }
}

impl core::fmt::Debug for BufCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufCache")
            .field("pool_live", &self.pool.live())
            .field("pool_capacity", &self.pool.capacity())
            .field("devices", &self.devices.lock().unwrap().len())
            .finish()
    }
}

//! 块设备与上层映射对象
//!
//! [`DiskDriver`] 是设备驱动要实现的窄接口：提交单段请求，之后
//! 恰好调用一次完成回调。[`Device`] 在其上挂接本缓存的页存储
//! （块设备自身的身份映射）与关联表锁。[`Mapping`] 代表依赖这些
//! 块的上层对象（文件/inode 的类似物），有自己的页存储、块大小
//! 与逻辑长度，并作为 fsync 跟踪的 owner。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::consts::PAGE_SIZE;
use crate::error::{Error, ErrorKind, Result};
use crate::page::Page;
use crate::wait::WaitTable;

/// I/O 方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    /// 从设备读
    Read,
    /// 写入设备
    Write,
}

/// I/O 完成回调
///
/// 驱动对每个已提交的请求恰好调用一次：读成功传回数据，
/// 写成功传回空向量，失败传回错误。
pub type IoComplete = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;

/// 块设备驱动接口
///
/// 实现者负责真正的数据搬运；回调可以在提交线程内同步调用，
/// 也可以稍后从任意线程调用，但必须恰好一次。
pub trait DiskDriver: Send + Sync {
    /// 硬件扇区大小（字节）
    fn sector_size(&self) -> u32 {
        512
    }

    /// 设备总扇区数
    fn total_sectors(&self) -> u64;

    /// 是否只读
    fn is_read_only(&self) -> bool {
        false
    }

    /// 提交一个单段请求
    ///
    /// # 参数
    ///
    /// * `dir` - 方向
    /// * `sector` - 起始扇区号
    /// * `len` - 字节数（扇区对齐）
    /// * `data` - 写请求的内容快照；读请求为 None
    /// * `done` - 完成回调
    fn submit(&self, dir: IoDir, sector: u64, len: usize, data: Option<Vec<u8>>, done: IoComplete);
}

/// 已注册的块设备
pub struct Device {
    id: u64,
    name: String,
    driver: Box<dyn DiskDriver>,
    sector_size: u32,
    read_only: bool,
    /// 块设备自身的页存储（块号与页索引恒等映射）
    pages: Mutex<BTreeMap<u64, Arc<Page>>>,
    /// 关联表锁：凡由本设备承载数据的 owner 表都在这把锁下变更
    assoc: Mutex<BTreeMap<u64, Vec<Arc<Buffer>>>>,
    wait: Arc<WaitTable>,
    ids: Arc<AtomicU64>,
}

impl Device {
    pub(crate) fn new(
        name: &str,
        driver: Box<dyn DiskDriver>,
        wait: Arc<WaitTable>,
        ids: Arc<AtomicU64>,
    ) -> Result<Arc<Self>> {
        let sector_size = driver.sector_size();
        if sector_size == 0
            || !sector_size.is_power_of_two()
            || sector_size as usize > PAGE_SIZE
        {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "hardware sector size must be a power of two no larger than a page",
            ));
        }
        let read_only = driver.is_read_only();
        let id = ids.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(Self {
            id,
            name: name.to_owned(),
            driver,
            sector_size,
            read_only,
            pages: Mutex::new(BTreeMap::new()),
            assoc: Mutex::new(BTreeMap::new()),
            wait,
            ids,
        }))
    }

    /// 设备 id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 设备名（日志用）
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 硬件扇区大小
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// 是否只读
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn driver(&self) -> &dyn DiskDriver {
        self.driver.as_ref()
    }

    pub(crate) fn wait_handle(&self) -> Arc<WaitTable> {
        self.wait.clone()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    // ===== 页存储 =====

    /// 查找已有页
    pub fn find_page(&self, index: u64) -> Option<Arc<Page>> {
        self.pages.lock().unwrap().get(&index).cloned()
    }

    /// 查找或创建页
    pub(crate) fn find_or_create_page(&self, index: u64) -> Arc<Page> {
        let mut pages = self.pages.lock().unwrap();
        pages
            .entry(index)
            .or_insert_with(|| Page::new(self.ids.fetch_add(1, Ordering::Relaxed), index, self.wait.clone()))
            .clone()
    }

    /// 当前页集合快照
    pub(crate) fn pages_snapshot(&self) -> Vec<(u64, Arc<Page>)> {
        self.pages
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// 从存储中摘除一个页（调用方已确认其缓冲区集合为空）
    pub(crate) fn remove_page(&self, index: u64) {
        self.pages.lock().unwrap().remove(&index);
    }

    // ===== 关联表 =====

    /// 在设备关联表锁之下执行 `f`
    pub(crate) fn with_assoc<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<u64, Vec<Arc<Buffer>>>) -> R,
    ) -> R {
        let mut lists = self.assoc.lock().unwrap();
        f(&mut lists)
    }

    pub(crate) fn assoc_lists(&self) -> &Mutex<BTreeMap<u64, Vec<Arc<Buffer>>>> {
        &self.assoc
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("sector_size", &self.sector_size)
            .field("read_only", &self.read_only)
            .field("pages", &self.pages.lock().unwrap().len())
            .finish()
    }
}

/// 上层映射对象（文件/inode 的类似物）
///
/// 页索引以文件内偏移计；缓冲区的设备块号由块解析回调指定，
/// 与页索引无关。作为 fsync 跟踪的 owner 时，其关联表由
/// *承载数据的设备* 的表锁保护，而不是自己的锁——缓冲区物理上
/// 属于设备的页缓存。
pub struct Mapping {
    id: u64,
    dev: Arc<Device>,
    block_size: usize,
    size: AtomicU64,
    pages: Mutex<BTreeMap<u64, Arc<Page>>>,
}

impl Mapping {
    pub(crate) fn new(dev: Arc<Device>, block_size: usize) -> Arc<Self> {
        let id = dev.next_id();
        Arc::new(Self {
            id,
            dev,
            block_size,
            size: AtomicU64::new(0),
            pages: Mutex::new(BTreeMap::new()),
        })
    }

    pub(crate) fn owner_id(&self) -> u64 {
        self.id
    }

    /// 背后的块设备
    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    /// 本映射的块大小
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// 每页承载的块数
    pub fn blocks_per_page(&self) -> u64 {
        (PAGE_SIZE / self.block_size) as u64
    }

    /// 逻辑长度（字节）
    pub fn len(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 设定逻辑长度（字节），决定洞判定与越界零填充
    pub fn set_len(&self, bytes: u64) {
        self.size.store(bytes, Ordering::SeqCst);
    }

    /// 查找或创建文件内指定索引的页
    pub fn page(&self, index: u64) -> Arc<Page> {
        let mut pages = self.pages.lock().unwrap();
        pages
            .entry(index)
            .or_insert_with(|| Page::new(self.dev.next_id(), index, self.dev.wait_handle()))
            .clone()
    }

    /// 查找已有页
    pub fn find_page(&self, index: u64) -> Option<Arc<Page>> {
        self.pages.lock().unwrap().get(&index).cloned()
    }
}

impl core::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mapping")
            .field("owner", &self.id)
            .field("dev", &self.dev.id())
            .field("block_size", &self.block_size)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDisk {
        sector: u32,
    }

    impl DiskDriver for NullDisk {
        fn sector_size(&self) -> u32 {
            self.sector
        }

        fn total_sectors(&self) -> u64 {
            1024
        }

        fn submit(
            &self,
            _dir: IoDir,
            _sector: u64,
            _len: usize,
            _data: Option<Vec<u8>>,
            done: IoComplete,
        ) {
            done(Ok(Vec::new()));
        }
    }

    fn mk_device(sector: u32) -> Result<Arc<Device>> {
        Device::new(
            "null0",
            Box::new(NullDisk { sector }),
            Arc::new(WaitTable::new(8)),
            Arc::new(AtomicU64::new(1)),
        )
    }

    #[test]
    fn test_sector_size_validation() {
        assert!(mk_device(512).is_ok());
        assert!(mk_device(4096).is_ok());
        assert_eq!(
            mk_device(0).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            mk_device(768).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            mk_device(8192).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_find_or_create_page_identity() {
        let dev = mk_device(512).unwrap();
        let a = dev.find_or_create_page(5);
        let b = dev.find_or_create_page(5);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(dev.find_page(6).is_none());

        dev.remove_page(5);
        assert!(dev.find_page(5).is_none());
    }

    #[test]
    fn test_mapping_pages_are_separate_from_device_store() {
        let dev = mk_device(512).unwrap();
        let map = Mapping::new(dev.clone(), 1024);
        let p = map.page(0);
        assert!(Arc::ptr_eq(&p, &map.page(0)));
        assert!(dev.find_page(0).is_none());

        map.set_len(3000);
        assert_eq!(map.len(), 3000);
        assert_eq!(map.blocks_per_page(), 4);
    }
}

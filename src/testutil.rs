//! 测试用内存盘驱动
//!
//! 默认在提交线程内同步完成；`deferred` 模式把完成回调排进队列，
//! 由测试代码决定何时、以何种顺序触发，用来制造异步完成交错。
//! 支持按扇区注入故障。

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::{DiskDriver, IoComplete, IoDir};
use crate::error::{Error, ErrorKind, Result};

struct Pending {
    dir: IoDir,
    sector: u64,
    len: usize,
    data: Option<Vec<u8>>,
    done: IoComplete,
}

struct Inner {
    sector_size: u32,
    storage: Mutex<Vec<u8>>,
    fail_sectors: Mutex<HashSet<u64>>,
    deferred: bool,
    pending: Mutex<VecDeque<Pending>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

/// 内存盘；克隆共享同一份存储
#[derive(Clone)]
pub(crate) struct MemDisk {
    inner: Arc<Inner>,
}

impl MemDisk {
    pub(crate) fn new(total_sectors: u64) -> Self {
        Self::build(total_sectors, 512, false)
    }

    pub(crate) fn with_sector_size(total_sectors: u64, sector_size: u32) -> Self {
        Self::build(total_sectors, sector_size, false)
    }

    pub(crate) fn deferred(total_sectors: u64) -> Self {
        Self::build(total_sectors, 512, true)
    }

    fn build(total_sectors: u64, sector_size: u32, deferred: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                sector_size,
                storage: Mutex::new(vec![0u8; (total_sectors * sector_size as u64) as usize]),
                fail_sectors: Mutex::new(HashSet::new()),
                deferred,
                pending: Mutex::new(VecDeque::new()),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    /// 绕过缓存直接写存储
    pub(crate) fn write_direct(&self, sector: u64, bytes: &[u8]) {
        let off = (sector * self.inner.sector_size as u64) as usize;
        self.inner.storage.lock().unwrap()[off..off + bytes.len()].copy_from_slice(bytes);
    }

    /// 绕过缓存直接读存储
    pub(crate) fn read_direct(&self, sector: u64, len: usize) -> Vec<u8> {
        let off = (sector * self.inner.sector_size as u64) as usize;
        self.inner.storage.lock().unwrap()[off..off + len].to_vec()
    }

    /// 注入故障：之后触及该扇区的请求以 Io 错误完成
    pub(crate) fn fail_sector(&self, sector: u64) {
        self.inner.fail_sectors.lock().unwrap().insert(sector);
    }

    /// 物理读次数
    pub(crate) fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// 物理写次数
    pub(crate) fn writes(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// 待完成请求数（deferred 模式）
    pub(crate) fn pending(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// 触发最早一个排队的完成；无排队时返回 false
    pub(crate) fn complete_next(&self) -> bool {
        let next = self.inner.pending.lock().unwrap().pop_front();
        match next {
            Some(p) => {
                let result = self.perform(p.dir, p.sector, p.len, p.data);
                (p.done)(result);
                true
            }
            None => false,
        }
    }

    /// 触发全部排队的完成
    pub(crate) fn complete_all(&self) {
        while self.complete_next() {}
    }

    fn perform(&self, dir: IoDir, sector: u64, len: usize, data: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let nsectors = (len as u64).div_ceil(self.inner.sector_size as u64);
        {
            let failed = self.inner.fail_sectors.lock().unwrap();
            for s in sector..sector + nsectors {
                if failed.contains(&s) {
                    return Err(Error::new(ErrorKind::Io, "injected sector failure"));
                }
            }
        }
        let off = (sector * self.inner.sector_size as u64) as usize;
        match dir {
            IoDir::Read => {
                self.inner.reads.fetch_add(1, Ordering::SeqCst);
                Ok(self.inner.storage.lock().unwrap()[off..off + len].to_vec())
            }
            IoDir::Write => {
                self.inner.writes.fetch_add(1, Ordering::SeqCst);
                let src = data.expect("write request without data");
                self.inner.storage.lock().unwrap()[off..off + len].copy_from_slice(&src[..len]);
                Ok(Vec::new())
            }
        }
    }
}

impl DiskDriver for MemDisk {
    fn sector_size(&self) -> u32 {
        self.inner.sector_size
    }

    fn total_sectors(&self) -> u64 {
        (self.inner.storage.lock().unwrap().len() / self.inner.sector_size as usize) as u64
    }

    fn submit(&self, dir: IoDir, sector: u64, len: usize, data: Option<Vec<u8>>, done: IoComplete) {
        if self.inner.deferred {
            self.inner.pending.lock().unwrap().push_back(Pending {
                dir,
                sector,
                len,
                data,
                done,
            });
        } else {
            let result = self.perform(dir, sector, len, data);
            done(result);
        }
    }
}

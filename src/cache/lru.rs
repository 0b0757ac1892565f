//! 查找前端：分片的近期缓冲区数组
//!
//! 把最近用过的（设备、块号、尺寸）→ 缓冲区映射缓存在一组
//! 浅的分片数组里（每片 8 项，最近使用在前），让大多数查找
//! 只付出线程亲和分片上一把自旋锁的代价。
//!
//! 同一个缓冲区可以同时驻留在多个分片里——这是刻意的：身份
//! 字段的一致性由缓冲区自身保证，这一层不追求跨分片一致。
//! 每个驻留条目额外持有一个引用计数，驱逐即释放。

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::buffer::pool::current_shard;
use crate::buffer::Buffer;
use crate::consts::LOOKUP_DEPTH;

/// 查找键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BufKey {
    pub(crate) dev: u64,
    pub(crate) block: u64,
    pub(crate) size: usize,
}

impl BufKey {
    pub(crate) fn of(buf: &Buffer) -> Self {
        Self {
            dev: buf.dev_id(),
            block: buf.block(),
            size: buf.size(),
        }
    }
}

/// 分片查找缓存
pub(crate) struct LookupCache {
    shards: Box<[spin::Mutex<LruCache<BufKey, Arc<Buffer>>>]>,
}

impl LookupCache {
    pub(crate) fn new(nshards: usize) -> Self {
        let depth = NonZeroUsize::new(LOOKUP_DEPTH).unwrap();
        let shards = (0..nshards.max(1))
            .map(|_| spin::Mutex::new(LruCache::new(depth)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard(&self) -> &spin::Mutex<LruCache<BufKey, Arc<Buffer>>> {
        &self.shards[current_shard(self.shards.len())]
    }

    /// 在当前线程的分片里查找；命中则提升到队首并带回新引用
    pub(crate) fn lookup(&self, key: &BufKey) -> Option<Arc<Buffer>> {
        let mut lru = self.shard().lock();
        lru.get(key).map(|b| {
            b.get();
            b.clone()
        })
    }

    /// 插入当前线程的分片队首
    ///
    /// 数组满时驱逐最久未用的条目并释放其驻留引用；同一缓冲区
    /// 重复插入不会累积引用。
    pub(crate) fn install(&self, buf: &Arc<Buffer>) {
        let key = BufKey::of(buf);
        buf.get();
        let evicted = {
            let mut lru = self.shard().lock();
            lru.push(key, buf.clone())
        };
        if let Some((_, old)) = evicted {
            // 同键替换或容量驱逐：两种情况都要归还旧条目的驻留引用
            old.put();
        }
    }

    /// 卸载清扫：释放所有分片里属于该设备的驻留引用
    ///
    /// 只保证返回时目标设备的既有条目全部出清；"不再出现新条目"
    /// 由调用方负责（停用该设备后再清扫）。
    pub(crate) fn sweep_device(&self, dev: u64) -> usize {
        let mut swept = 0;
        for shard in self.shards.iter() {
            let victims: Vec<Arc<Buffer>> = {
                let mut lru = shard.lock();
                let keys: Vec<BufKey> = lru
                    .iter()
                    .filter(|(k, _)| k.dev == dev)
                    .map(|(k, _)| *k)
                    .collect();
                keys.iter().filter_map(|k| lru.pop(k)).collect()
            };
            swept += victims.len();
            for b in victims {
                b.put();
            }
        }
        swept
    }
}

//! 关联缓冲区跟踪（fsync 支持）
//!
//! 上层对象（[`Mapping`]）把自己的持久性所依赖的缓冲区记在一张
//! 关联表上。表锁属于 *承载数据的设备*，而不是 owner 自己——
//! 缓冲区物理上住在设备的页缓存里，回收路径按设备摘除成员；
//! 要是按 owner 加锁，"锁缓冲区再摘表"与"锁表再碰缓冲区"就会
//! 形成锁序环。
//!
//! 刷新是两阶段的：先把脏或在飞的成员搬到私有临时表并排出写
//! （逐笔在表锁之外提交），再逐个等待。第一个错误被记下，但
//! 所有等待都会做完——一个慢的或失败的缓冲区不会遮蔽其它的。
//! 最后对等待期间被并发写者重新入表的成员做一次限时的收尾等待，
//! 不再重新排队：fsync 的耗时因此有界，不与持续写入者互相追逐。

use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{AssocEntry, Buffer, BufferRef};
use crate::consts::RECONCILE_WAIT_MS;
use crate::device::{IoDir, Mapping};
use crate::diag;
use crate::error::{Error, ErrorKind, Result};
use crate::io::{self, EndIo};

impl Mapping {
    /// 把缓冲区记入本对象的关联表
    ///
    /// 置脏（内容必须已有效），首次调用建立缓冲区与表的归属；
    /// 已在本表上的成员不会重复插入。跨设备跟踪（缓冲区不由本
    /// 映射的设备承载）是调用方的一致性错误，直接拒绝。
    pub fn track(&self, buf: &BufferRef) {
        if buf.dev_id() != self.device().id() {
            diag::consistency_error("buffer tracked against a mapping on a different device");
            return;
        }
        buf.mark_dirty();
        let owner = self.owner_id();
        self.device().with_assoc(|lists| {
            let mut slot = buf.assoc_slot().lock().unwrap();
            match slot.as_ref() {
                Some(entry) if entry.owner == owner => {}
                Some(_) => {
                    diag::consistency_error("buffer already tracked by a different owner");
                }
                None => {
                    *slot = Some(AssocEntry {
                        dev: Arc::downgrade(self.device()),
                        owner,
                    });
                    lists.entry(owner).or_default().push(buf.arc().clone());
                }
            }
        });
    }

    /// 本对象是否还有被跟踪的缓冲区
    pub fn has_tracked(&self) -> bool {
        let owner = self.owner_id();
        self.device()
            .with_assoc(|lists| lists.get(&owner).is_some_and(|l| !l.is_empty()))
    }

    /// 丢弃关联表而不做任何 I/O
    ///
    /// 卸载前明知数据已同步（或决意放弃）时使用。
    pub fn invalidate_tracked(&self) {
        let owner = self.owner_id();
        self.device().with_assoc(|lists| {
            let Some(list) = lists.remove(&owner) else {
                return;
            };
            for b in list {
                let mut slot = b.assoc_slot().lock().unwrap();
                if matches!(slot.as_ref(), Some(e) if e.owner == owner) {
                    *slot = None;
                }
            }
        });
    }

    /// 写回并等待本对象的全部关联缓冲区
    ///
    /// 聚合首个错误码；所有被搬到临时表的成员都会被等到。
    pub fn flush_and_wait(&self) -> Result<()> {
        let dev = self.device().clone();
        let owner = self.owner_id();
        let mut first_err: Option<Error> = None;
        let mut pending: Vec<Arc<Buffer>> = Vec::new();

        // 第一阶段：逐个摘下成员；脏或被锁的进临时表，脏的排写。
        // 表锁绝不横跨提交。
        loop {
            let next = {
                let mut lists = dev.assoc_lists().lock().unwrap();
                match lists.get_mut(&owner) {
                    None => None,
                    Some(list) if list.is_empty() => {
                        lists.remove(&owner);
                        None
                    }
                    Some(list) => {
                        let b = list.remove(0);
                        let mut slot = b.assoc_slot().lock().unwrap();
                        if matches!(slot.as_ref(), Some(e) if e.owner == owner) {
                            *slot = None;
                        }
                        drop(slot);
                        Some(b)
                    }
                }
            };
            let Some(b) = next else { break };
            if !b.is_dirty() && !b.is_locked() {
                continue;
            }
            pending.push(b.clone());
            if b.is_dirty() && b.try_lock() {
                if b.is_dirty() {
                    if io::submit_with(IoDir::Write, &dev, b.clone(), EndIo::Sync).is_err() {
                        b.unlock();
                    }
                } else {
                    // 锁下复查：别人已经写完了
                    b.unlock();
                }
            }
        }

        log::debug!(
            "[FSYNC] owner {} waiting on {} buffers",
            owner,
            pending.len()
        );

        // 第二阶段：逐个等待；首个错误记下，其余照等不误
        for b in &pending {
            b.wait_on();
            if !b.is_uptodate() {
                first_err.get_or_insert(Error::new(
                    ErrorKind::Io,
                    "tracked buffer came back not uptodate",
                ));
            }
        }

        // 收尾：第二阶段里被重新入表的迟到者，限时等一遍即可
        let late: Vec<Arc<Buffer>> = {
            let lists = dev.assoc_lists().lock().unwrap();
            lists.get(&owner).cloned().unwrap_or_default()
        };
        for b in late {
            if !b.is_locked() {
                continue;
            }
            let settled = b.wait_on_timeout(Duration::from_millis(RECONCILE_WAIT_MS));
            if settled && !b.is_uptodate() {
                first_err.get_or_insert(Error::new(
                    ErrorKind::Io,
                    "late tracked buffer came back not uptodate",
                ));
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BufCache, CacheConfig};
    use crate::testutil::MemDisk;

    fn mk_cache() -> BufCache {
        BufCache::new(CacheConfig {
            pool_capacity: 0,
            pool_soft_limit: 0,
            shards: 1,
            retry_limit: 3,
        })
    }

    struct Env {
        cache: BufCache,
        disk: MemDisk,
        dev: Arc<crate::device::Device>,
        map: Arc<Mapping>,
    }

    fn mk_env() -> Env {
        let cache = mk_cache();
        let disk = MemDisk::new(1024);
        let dev = cache.register_device("mem0", Box::new(disk.clone())).unwrap();
        let map = cache.new_mapping(&dev, 512).unwrap();
        Env {
            cache,
            disk,
            dev,
            map,
        }
    }

    fn dirty_buffer(env: &Env, block: u64, fill: u8) -> BufferRef {
        let buf = env.cache.read_buffer(&env.dev, block, 512).unwrap();
        buf.with_data_mut(|d| d.fill(fill));
        buf
    }

    #[test]
    fn test_track_inserts_once() {
        let env = mk_env();
        let buf = dirty_buffer(&env, 3, 0x33);

        assert!(!env.map.has_tracked());
        env.map.track(&buf);
        assert!(env.map.has_tracked());
        assert!(buf.is_dirty());

        // 重复跟踪不重复入表
        env.map.track(&buf);
        env.dev
            .with_assoc(|lists| assert_eq!(lists.get(&env.map.owner_id()).unwrap().len(), 1));
    }

    #[test]
    fn test_track_refuses_foreign_device() {
        let env = mk_env();
        let other_disk = MemDisk::new(64);
        let other_dev = env
            .cache
            .register_device("mem1", Box::new(other_disk.clone()))
            .unwrap();
        let foreign = env.cache.read_buffer(&other_dev, 0, 512).unwrap();
        foreign.with_data_mut(|d| d.fill(1));

        env.map.track(&foreign);
        assert!(!env.map.has_tracked());
    }

    #[test]
    fn test_track_refuses_second_owner() {
        let env = mk_env();
        let other_map = env.cache.new_mapping(&env.dev, 512).unwrap();
        let buf = dirty_buffer(&env, 5, 0x55);

        env.map.track(&buf);
        other_map.track(&buf);

        assert!(env.map.has_tracked());
        assert!(!other_map.has_tracked());
    }

    #[test]
    fn test_flush_issues_one_write_per_dirty_buffer() {
        let env = mk_env();
        let bufs: Vec<BufferRef> = (0..3).map(|i| dirty_buffer(&env, i, i as u8 + 1)).collect();
        for b in &bufs {
            env.map.track(b);
        }
        // 一个净成员混进表里：不产生写
        let clean = env.cache.read_buffer(&env.dev, 10, 512).unwrap();
        env.map.track(&clean);
        let clean_writes = env.disk.writes();
        clean.raw_flags().remove(crate::buffer::BufFlags::DIRTY);

        env.map.flush_and_wait().unwrap();

        assert_eq!(env.disk.writes() - clean_writes, 3);
        for (i, b) in bufs.iter().enumerate() {
            assert!(!b.is_dirty());
            assert!(b.is_uptodate());
            assert_eq!(env.disk.read_direct(i as u64, 512), vec![i as u8 + 1; 512]);
        }
        assert!(!env.map.has_tracked());
    }

    #[test]
    fn test_flush_error_does_not_mask_other_buffers() {
        let env = mk_env();
        let good = dirty_buffer(&env, 0, 0xAA);
        let bad = dirty_buffer(&env, 1, 0xBB);
        env.map.track(&good);
        env.map.track(&bad);
        env.disk.fail_sector(1);

        let err = env.map.flush_and_wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        // 失败的那一个不遮蔽成功的那一个：两个都被等到
        assert!(good.is_uptodate());
        assert!(!good.is_dirty());
        assert!(!bad.is_uptodate());
        assert!(bad.io_failed());
    }

    #[test]
    fn test_forget_detaches_from_tracking() {
        let env = mk_env();
        let buf = dirty_buffer(&env, 2, 0x22);
        env.map.track(&buf);
        assert!(env.map.has_tracked());

        buf.forget();
        assert!(!env.map.has_tracked());
    }

    #[test]
    fn test_invalidate_tracked_drops_without_io() {
        let env = mk_env();
        let buf = dirty_buffer(&env, 4, 0x44);
        env.map.track(&buf);
        let writes = env.disk.writes();

        env.map.invalidate_tracked();
        assert!(!env.map.has_tracked());
        assert_eq!(env.disk.writes(), writes);
        // 缓冲区本身还是脏的；只是不再被本 owner 跟踪
        assert!(buf.is_dirty());
    }

    #[test]
    fn test_flush_empty_owner_is_noop() {
        let env = mk_env();
        env.map.flush_and_wait().unwrap();
    }

    #[test]
    fn test_reclaim_detaches_tracked_members() {
        let env = mk_env();
        {
            let buf = dirty_buffer(&env, 6, 0x66);
            env.map.track(&buf);
            // 净但仍挂在表上
            buf.raw_flags().remove(crate::buffer::BufFlags::DIRTY);
        }
        assert!(env.map.has_tracked());

        // 整页回收把成员从关联表上摘下来，不留悬挂项
        env.cache.invalidate_device(&env.dev, false);
        assert!(!env.map.has_tracked());
    }
}

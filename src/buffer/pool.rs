//! 缓冲区描述符池
//!
//! 有界的描述符配额管理，区分两种分配模式：
//!
//! - **前台**：可以失败，返回 [`ErrorKind::NoSpace`](crate::ErrorKind::NoSpace)
//!   表示"释放内存后重试"；
//! - **关键**（换页/回写路径，不允许失败）：阻塞到成功为止，每轮等待
//!   之前先触发一次调用方注入的回收动作。
//!
//! 容量之外另有一个软上限：活跃描述符的分片计数按节流间隔汇总，
//! 超出软上限时置起全局标志，供上层回写策略参考。分片计数允许
//! 跨线程漂移（在 A 线程分配、在 B 线程释放），汇总值因此只是
//! 近似——这正是它的设计目标，精确计数由容量门用的原子值负责。

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::consts::{ACCOUNT_RECALC_INTERVAL, POOL_RESERVED, POOL_SLACK};
use crate::error::{Error, ErrorKind, Result};

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_SEQ: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
}

/// 当前线程的亲和分片下标
pub(crate) fn current_shard(nshards: usize) -> usize {
    SHARD_SEQ.with(|s| *s % nshards.max(1))
}

struct Shard {
    nr: AtomicI64,
    ratelimit: AtomicU32,
}

/// 描述符池
pub struct BufferPool {
    capacity: usize,
    soft_limit: usize,
    /// 精确活跃计数，容量门使用
    live: AtomicUsize,
    /// 近似分片计数，软上限标志使用
    shards: Box<[Shard]>,
    over_limit: AtomicBool,
    slot: Mutex<()>,
    freed: Condvar,
}

/// 池配额的 RAII 凭证；随描述符一起存活，释放即归还
pub(crate) struct PoolPermit {
    pool: Arc<BufferPool>,
}

impl std::fmt::Debug for PoolPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolPermit").finish_non_exhaustive()
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.pool.release_one();
    }
}

impl BufferPool {
    /// 创建描述符池
    ///
    /// `capacity` 会被抬高到保底容量（保证异步路径的前向推进），
    /// `soft_limit` 超过容量时取容量。
    pub fn new(capacity: usize, soft_limit: usize, nshards: usize) -> Arc<Self> {
        let capacity = capacity.max(POOL_RESERVED + POOL_SLACK);
        let soft_limit = soft_limit.min(capacity);
        let shards = (0..nshards.max(1))
            .map(|_| Shard {
                nr: AtomicI64::new(0),
                ratelimit: AtomicU32::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            capacity,
            soft_limit,
            live: AtomicUsize::new(0),
            shards,
            over_limit: AtomicBool::new(false),
            slot: Mutex::new(()),
            freed: Condvar::new(),
        })
    }

    /// 前台分配：容量耗尽时立即失败
    pub(crate) fn try_reserve(self: &Arc<Self>) -> Result<PoolPermit> {
        if self.grab() {
            return Ok(PoolPermit { pool: self.clone() });
        }
        log::debug!(
            "[POOL] descriptor pool exhausted ({}/{})",
            self.live.load(Ordering::SeqCst),
            self.capacity
        );
        Err(Error::new(
            ErrorKind::NoSpace,
            "descriptor pool exhausted, retry after freeing memory",
        ))
    }

    /// 关键路径分配：不失败，阻塞并配合回收直到拿到配额
    pub(crate) fn reserve_blocking(self: &Arc<Self>, relief: &dyn Fn()) -> PoolPermit {
        loop {
            if self.grab() {
                return PoolPermit { pool: self.clone() };
            }
            relief();
            let guard = self.slot.lock().unwrap();
            if self.live.load(Ordering::SeqCst) < self.capacity {
                continue;
            }
            let _ = self
                .freed
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap();
        }
    }

    fn grab(&self) -> bool {
        loop {
            let cur = self.live.load(Ordering::SeqCst);
            if cur >= self.capacity {
                return false;
            }
            if self
                .live
                .compare_exchange(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.account(1);
                return true;
            }
        }
    }

    fn release_one(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.account(-1);
        // 先取锁再广播，避免与等待方的复查丢失交错
        let _guard = self.slot.lock().unwrap();
        self.freed.notify_all();
    }

    fn account(&self, delta: i64) {
        let shard = &self.shards[current_shard(self.shards.len())];
        shard.nr.fetch_add(delta, Ordering::Relaxed);
        if shard.ratelimit.fetch_add(1, Ordering::Relaxed) + 1 < ACCOUNT_RECALC_INTERVAL {
            return;
        }
        shard.ratelimit.store(0, Ordering::Relaxed);
        let total: i64 = self.shards.iter().map(|s| s.nr.load(Ordering::Relaxed)).sum();
        self.over_limit
            .store(total > self.soft_limit as i64, Ordering::Relaxed);
    }

    /// 活跃描述符是否超过软上限（近似、滞后，供回写策略参考）
    pub fn over_soft_limit(&self) -> bool {
        self.over_limit.load(Ordering::Relaxed)
    }

    /// 当前活跃描述符数（精确值）
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// 池容量
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_floor() {
        let pool = BufferPool::new(1, 1, 1);
        assert!(pool.capacity() >= POOL_RESERVED + POOL_SLACK);
    }

    #[test]
    fn test_foreground_exhaustion() {
        let pool = BufferPool::new(0, 0, 1);
        let mut permits = Vec::new();
        for _ in 0..pool.capacity() {
            permits.push(pool.try_reserve().unwrap());
        }
        let err = pool.try_reserve().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);

        // 释放一个后恢复
        permits.pop();
        assert!(pool.try_reserve().is_ok());
    }

    #[test]
    fn test_blocking_reserve_waits_for_release() {
        let pool = BufferPool::new(0, 0, 1);
        let mut permits = Vec::new();
        for _ in 0..pool.capacity() {
            permits.push(pool.try_reserve().unwrap());
        }

        let t = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let _permit = pool.reserve_blocking(&|| {});
            })
        };

        std::thread::sleep(Duration::from_millis(30));
        assert!(!t.is_finished());
        permits.pop();
        t.join().unwrap();
    }

    #[test]
    fn test_soft_limit_flag_recomputed() {
        let pool = BufferPool::new(4096, 16, 1);
        assert!(!pool.over_soft_limit());

        let mut permits = Vec::new();
        // 超过软上限并跨过节流间隔，标志应被置起
        for _ in 0..(16 + ACCOUNT_RECALC_INTERVAL as usize * 2) {
            permits.push(pool.try_reserve().unwrap());
        }
        assert!(pool.over_soft_limit());

        drop(permits);
        // 低占用下往复分配，跨过节流间隔后标志应被清除
        for _ in 0..(ACCOUNT_RECALC_INTERVAL as usize * 2) {
            let permit = pool.try_reserve().unwrap();
            drop(permit);
        }
        assert!(!pool.over_soft_limit());
    }

    #[test]
    fn test_live_tracks_permits() {
        let pool = BufferPool::new(0, 0, 2);
        assert_eq!(pool.live(), 0);
        let a = pool.try_reserve().unwrap();
        let b = pool.try_reserve().unwrap();
        assert_eq!(pool.live(), 2);
        drop(a);
        assert_eq!(pool.live(), 1);
        drop(b);
        assert_eq!(pool.live(), 0);
    }
}

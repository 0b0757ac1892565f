//! 散列等待表
//!
//! 缓冲区和页的阻塞等待不各自持有等待队列，而是按身份散列到
//! 一张固定大小的桶表上。不相关对象共享同一个桶，由此带来的
//! 虚假唤醒只是性能损耗，正确性不受影响：每次唤醒后重查条件。
//!
//! 每个桶由一个世代计数器（互斥量保护）加一个条件变量组成。
//! 唤醒方先递增世代再广播，等待方以"世代变化"判定收到过唤醒，
//! 这样标志位的清除（在桶锁之外以原子方式完成）不会丢失唤醒。

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Bucket {
    generation: Mutex<u64>,
    cond: Condvar,
}

/// 固定桶数的等待表
pub(crate) struct WaitTable {
    buckets: Box<[Bucket]>,
}

impl WaitTable {
    /// 创建等待表；`nbuckets` 会向上取整到 2 的幂
    pub(crate) fn new(nbuckets: usize) -> Self {
        let n = nbuckets.next_power_of_two().max(1);
        let buckets = (0..n)
            .map(|_| Bucket {
                generation: Mutex::new(0),
                cond: Condvar::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { buckets }
    }

    fn bucket(&self, key: u64) -> &Bucket {
        let h = crc32fast::hash(&key.to_le_bytes()) as usize;
        &self.buckets[h & (self.buckets.len() - 1)]
    }

    /// 阻塞直到 `done()` 为真
    ///
    /// 条件必须由其它线程在调用 [`WaitTable::wake_all`] 之前置好。
    pub(crate) fn wait_until<F: Fn() -> bool>(&self, key: u64, done: F) {
        let b = self.bucket(key);
        loop {
            if done() {
                return;
            }
            let mut gen = b.generation.lock().unwrap();
            if done() {
                return;
            }
            let seen = *gen;
            while *gen == seen {
                gen = b.cond.wait(gen).unwrap();
            }
        }
    }

    /// 限时等待；到期时返回最后一次条件检查的结果
    pub(crate) fn wait_timeout_until<F: Fn() -> bool>(
        &self,
        key: u64,
        timeout: Duration,
        done: F,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let b = self.bucket(key);
        loop {
            if done() {
                return true;
            }
            let mut gen = b.generation.lock().unwrap();
            if done() {
                return true;
            }
            let seen = *gen;
            while *gen == seen {
                let now = Instant::now();
                if now >= deadline {
                    return done();
                }
                let (next, result) = b.cond.wait_timeout(gen, deadline - now).unwrap();
                gen = next;
                if result.timed_out() {
                    return done();
                }
            }
        }
    }

    /// 唤醒 `key` 所在桶上的全部等待者
    pub(crate) fn wake_all(&self, key: u64) {
        let b = self.bucket(key);
        let mut gen = b.generation.lock().unwrap();
        *gen = gen.wrapping_add(1);
        b.cond.notify_all();
    }
}

//! 缓存子系统常量定义
//!
//! 包括页与块的尺寸边界、查找前端与等待表的形状、
//! 描述符池的预留容量以及各种节流阈值。

//=============================================================================
// 页与块尺寸
//=============================================================================

/// 页大小（字节）——缓冲区内容的物理承载单元
pub const PAGE_SIZE: usize = 4096;

/// 最小块大小（字节）
pub const MIN_BLOCK_SIZE: usize = 512;

/// 单页最多承载的缓冲区数量
pub const MAX_BUF_PER_PAGE: usize = PAGE_SIZE / MIN_BLOCK_SIZE;

//=============================================================================
// 查找前端与等待表
//=============================================================================

/// 每个查找分片缓存的缓冲区引用数（最近使用在前）
pub const LOOKUP_DEPTH: usize = 8;

/// 等待表桶数（2 的幂；不相关缓冲区共享桶，虚假唤醒无害）
pub const WAIT_TABLE_BUCKETS: usize = 128;

//=============================================================================
// 描述符池
//=============================================================================

/// 池的保底容量：保证异步路径最少可同时在飞的请求数
pub const POOL_RESERVED: usize = 10 * MAX_BUF_PER_PAGE;

/// 保底之上的松弛量
pub const POOL_SLACK: usize = 20;

/// 默认池容量（描述符个数）
pub const DEFAULT_POOL_CAPACITY: usize = 4096;

/// 每个分片累积多少次分配/释放后重算一次全局软上限标志
pub const ACCOUNT_RECALC_INTERVAL: u32 = 64;

//=============================================================================
// 重试与回收
//=============================================================================

/// `get_buffer` 在放弃之前的重试预算（每次重试之间触发一轮回收）
pub const DEFAULT_RETRY_LIMIT: u32 = 32;

/// 重试退避的起始值（微秒，指数增长）
pub const RETRY_BACKOFF_BASE_US: u64 = 100;

/// 退避指数的封顶移位（100us << 8 ≈ 25ms）
pub const RETRY_BACKOFF_MAX_SHIFT: u32 = 8;

/// 一轮内存压力缓解中每个设备最多回写的脏缓冲区数
pub const RELIEF_WRITEBACK_BATCH: usize = 16;

/// fsync 收尾阶段对单个迟到缓冲区的限时等待（毫秒）
pub const RECONCILE_WAIT_MS: u64 = 500;

//! bufcache_core: 页承载的块缓冲区缓存
//!
//! 这是文件系统与块设备之间所有块粒度 I/O 的中介层，提供：
//! - **并发、引用计数**的定长缓冲区缓存，键为（设备、块号、尺寸）
//! - **异步 I/O** 的提交与按页分流的完成处理，顺序与部分失败语义明确
//! - 文件系统赖以生存的原语：取块/读块/写回、脏跟踪、页与缓冲区的
//!   挂接、线程亲和的查找前端、fsync 的关联缓冲区跟踪
//!
//! 没有进程级全局状态：描述符池、查找分片、等待表都住在显式的
//! [`BufCache`] 上下文里，由宿主构造一次、传给每个操作，多实例
//! 可以共存。
//!
//! # 示例
//!
//! ```rust,ignore
//! use bufcache_core::{BufCache, CacheConfig, DiskDriver, Result};
//!
//! fn main() -> Result<()> {
//!     let cache = BufCache::new(CacheConfig::default());
//!     let dev = cache.register_device("vda", Box::new(MyDriver::new()))?;
//!
//!     // 读一个块
//!     let buf = cache.read_buffer(&dev, 10, 1024)?;
//!     assert!(buf.is_uptodate());
//!
//!     // 改写并回写
//!     buf.with_data_mut(|d| d[0] = 42);
//!     buf.mark_dirty();
//!     cache.sync_device(&dev)?;
//!     Ok(())
//! }
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`consts`] - 常量定义
//! - [`buffer`] - 缓冲区描述符、标志位与描述符池
//! - [`page`] - 页与整页回收
//! - [`device`] - 设备驱动接口、设备与上层映射对象
//! - [`cache`] - 缓存上下文、查找与增长
//! - [`io`] - 异步 I/O 提交与完成分流
//! - [`pageio`] - 整页读写与部分页写入助手

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 常量定义
pub mod consts;

/// 缓冲区描述符与描述符池
pub mod buffer;

/// 页
pub mod page;

/// 设备与映射对象
pub mod device;

/// 缓存上下文
pub mod cache;

/// I/O 提交与完成
pub mod io;

/// 页级读写助手
pub mod pageio;

// 内部支撑
mod assoc;
mod diag;
mod wait;

#[cfg(test)]
pub(crate) mod testutil;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 上下文
pub use cache::{BufCache, CacheConfig};

// 设备
pub use device::{Device, DiskDriver, IoComplete, IoDir, Mapping};

// 缓冲区
pub use buffer::pool::BufferPool;
pub use buffer::{BufFlags, Buffer, BufferRef};

// 页
pub use page::{Page, PageFlags};

// I/O
pub use io::{submit, submit_batch};

// 页级助手
pub use pageio::{BlockMapping, BlockResolver};

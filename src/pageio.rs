//! 页级读写助手
//!
//! 在缓冲区原语之上实现通用的整页读、整页回写与"拷贝-修改-写"
//! 的部分页写入。文件系统只需提供一个块解析回调：给出文件内
//! 块号，回答该块落在设备的哪个块上（或者是洞，或者出错）。
//!
//! 整页 I/O 都是先把涉及的缓冲区全部锁定并标上异步记号、再统一
//! 提交——提交后页随时可能被跑得快的完成路径收尾，提交循环
//! 自身必须容忍这一点，所以只操作本地清单，绝不回头再碰页。

use std::sync::Arc;

use crate::buffer::{BufFlags, Buffer};
use crate::cache::BufCache;
use crate::consts::PAGE_SIZE;
use crate::device::{Device, IoDir, Mapping};
use crate::diag;
use crate::error::{Error, ErrorKind, Result};
use crate::io::{self, EndIo};
use crate::page::Page;

/// 块解析结果：设备块号与"是否新分配"
#[derive(Debug, Clone, Copy)]
pub struct BlockMapping {
    /// 设备块号
    pub block: u64,
    /// 该块是否刚刚分配（内容未定义，需要防别名与清零处理）
    pub new: bool,
}

/// 块解析回调
///
/// `index` 为文件内块号。返回 `Ok(None)` 表示洞（按约定零填充）；
/// `create` 为真时允许分配新块。回调内部可以自行做同步的元数据
/// I/O。
pub trait BlockResolver {
    /// 解析一个文件内块号
    fn resolve(&self, index: u64, create: bool) -> Result<Option<BlockMapping>>;
}

impl<F> BlockResolver for F
where
    F: Fn(u64, bool) -> Result<Option<BlockMapping>>,
{
    fn resolve(&self, index: u64, create: bool) -> Result<Option<BlockMapping>> {
        self(index, create)
    }
}

impl BufCache {
    /// 整页读
    ///
    /// 没有缓冲区就先建一组未映射的空缓冲区；逐块走解析回调，
    /// 洞与越过文件尾的块零填充后即视为有效；其余未生效的块
    /// 锁定、标记异步读、统一提交。一个都不用读时页立刻置为
    /// 最新。页由本调用锁定，由最后一个完成的读（或快速路径）
    /// 解锁。
    pub fn read_full_page(
        &self,
        map: &Mapping,
        page: &Arc<Page>,
        resolver: &dyn BlockResolver,
    ) -> Result<()> {
        let dev = map.device();
        let bs = map.block_size();
        let blocks_per_page = map.blocks_per_page();

        page.lock();
        if page.is_uptodate() {
            diag::consistency_error("read_full_page on a page that is already uptodate");
        }
        if !page.has_buffers() {
            self.create_empty_buffers(dev, page, bs, BufFlags::empty());
        }
        let bufs = page.buffers_snapshot();
        let first = page.index() * blocks_per_page;
        // 文件末块之后的块一律按洞处理
        let block_limit = (map.len() + bs as u64 - 1) / bs as u64;

        let mut pending: Vec<Arc<Buffer>> = Vec::new();
        for (i, b) in bufs.iter().enumerate() {
            if b.is_uptodate() {
                continue;
            }
            let fblock = first + i as u64;
            if !b.is_mapped() {
                if fblock < block_limit {
                    match resolver.resolve(fblock, false) {
                        Ok(Some(m)) => b.map_to(m.block),
                        Ok(None) => {}
                        Err(_) => page.set_error(),
                    }
                }
                if !b.is_mapped() {
                    // 洞：显式零填充就是有效内容
                    b.zero_fill();
                    b.set_uptodate();
                    continue;
                }
                if b.is_uptodate() {
                    // 解析回调可能顺带做了同步读
                    continue;
                }
            }
            pending.push(b.clone());
        }

        if pending.is_empty() {
            if !page.has_error() {
                page.set_uptodate();
            }
            page.unlock();
            return Ok(());
        }

        // 先全部锁定并标记，再统一提交
        for b in &pending {
            b.lock();
            b.raw_flags().insert(BufFlags::ASYNC_READ);
        }
        for b in &pending {
            if b.is_uptodate() {
                // 锁内复查：别的读者已把它带到最新
                io::end_async_read(b, true);
            } else if io::submit_with(IoDir::Read, dev, b.clone(), EndIo::AsyncRead).is_err() {
                io::end_async_read(b, false);
            }
        }
        Ok(())
    }

    /// 整页回写
    ///
    /// 脏而未映射的缓冲区先走解析回调拿设备块号；解析失败进入
    /// 恢复路径：已映射的脏块照常提交（不让写静默丢失），页记错
    /// 并把错误上抛。然后锁定并提交每个已映射的脏块，维持在途
    /// 计数，使页即便在提交循环尚未结束时被快速完成解锁也能正确
    /// 收尾。
    pub fn write_full_page(
        &self,
        map: &Mapping,
        page: &Arc<Page>,
        resolver: &dyn BlockResolver,
    ) -> Result<()> {
        let dev = map.device();
        let bs = map.block_size();
        let blocks_per_page = map.blocks_per_page();

        page.lock();
        page.wait_writeback();

        let len = map.len();
        let last_block = len.checked_sub(1).map(|v| v / bs as u64);

        if !page.has_buffers() {
            if !page.is_uptodate() {
                diag::consistency_error("writeback of a page with neither buffers nor content");
            }
            self.create_empty_buffers(dev, page, bs, BufFlags::DIRTY | BufFlags::UPTODATE);
        }

        // 页跨过文件尾：每次回写都重零尾部。并发写者场景下这有些
        // 多余（候选的脏范围优化点），但正确性优先。
        let tail = (len % PAGE_SIZE as u64) as usize;
        if page.index() == len / PAGE_SIZE as u64 && tail != 0 {
            let _ = page.zero_range(tail, PAGE_SIZE - tail);
        }

        let bufs = page.buffers_snapshot();
        let first = page.index() * blocks_per_page;
        let mut resolver_err: Option<Error> = None;

        for (i, b) in bufs.iter().enumerate() {
            let fblock = first + i as u64;
            let beyond = last_block.map_or(true, |lb| fblock > lb);
            if beyond {
                // 整页置脏或截断竞争留下的越界块：洗净、清零即可
                b.raw_flags().remove(BufFlags::DIRTY);
                b.zero_fill();
                b.set_uptodate();
                continue;
            }
            if !b.is_mapped() && b.is_dirty() {
                if b.is_new() {
                    diag::consistency_error("dirty new buffer reached writeback");
                }
                match resolver.resolve(fblock, true) {
                    Ok(Some(m)) => {
                        b.map_to(m.block);
                        if m.new {
                            self.discard_alias(dev, m.block, bs);
                        }
                    }
                    Ok(None) => {
                        resolver_err.get_or_insert(Error::new(
                            ErrorKind::NoSpace,
                            "resolver left a dirty buffer unmapped",
                        ));
                    }
                    Err(e) => {
                        resolver_err.get_or_insert(e);
                    }
                }
                if resolver_err.is_some() {
                    break;
                }
            }
        }

        if let Some(err) = resolver_err {
            return self.write_page_recover(dev, page, &bufs, err);
        }

        let mut submitlist: Vec<Arc<Buffer>> = Vec::new();
        for b in bufs.iter() {
            if b.is_mapped() && b.is_dirty() {
                b.lock();
                if b.raw_flags().test_and_clear(BufFlags::DIRTY) {
                    b.raw_flags().insert(BufFlags::ASYNC_WRITE);
                    submitlist.push(b.clone());
                } else {
                    b.unlock();
                }
            }
        }

        page.set_writeback();
        page.clear_dirty_hint();
        page.unlock();

        // 从第一笔提交起，页随时可能被完成路径结束回写；此后只碰
        // 本地清单
        for b in &submitlist {
            if io::submit_with(IoDir::Write, dev, b.clone(), EndIo::AsyncWrite).is_err() {
                io::end_async_write(b, false);
            }
        }
        if submitlist.is_empty() {
            // 页被标脏但缓冲区都净：有人已用底层提交手工写回过
            if bufs.iter().all(|b| b.is_uptodate()) {
                page.set_uptodate();
            }
            page.end_writeback();
        }
        Ok(())
    }

    fn write_page_recover(
        &self,
        dev: &Arc<Device>,
        page: &Arc<Page>,
        bufs: &[Arc<Buffer>],
        err: Error,
    ) -> Result<()> {
        log::warn!(
            "[BCACHE] block resolution failed during writeback of page {}: {err}",
            page.index()
        );
        page.clear_uptodate();
        page.set_error();

        let mut submitlist: Vec<Arc<Buffer>> = Vec::new();
        for b in bufs {
            if b.is_mapped() && b.is_dirty() {
                b.lock();
                if b.raw_flags().test_and_clear(BufFlags::DIRTY) {
                    b.raw_flags().insert(BufFlags::ASYNC_WRITE);
                    submitlist.push(b.clone());
                } else {
                    b.unlock();
                }
            } else {
                // 挂接到脏页时顺带标脏、却始终没拿到块号的缓冲区
                b.raw_flags().remove(BufFlags::DIRTY);
            }
        }
        page.set_writeback();
        page.clear_dirty_hint();
        page.unlock();

        for b in &submitlist {
            if io::submit_with(IoDir::Write, dev, b.clone(), EndIo::AsyncWrite).is_err() {
                io::end_async_write(b, false);
            }
        }
        if submitlist.is_empty() {
            page.end_writeback();
        }
        Err(err)
    }

    /// 部分页写入的准备阶段
    ///
    /// 解析并建好覆盖 `[from, to)` 的缓冲区；与范围部分重叠而内容
    /// 过期的既有块先同步读入并等待，新分配的块把拷贝范围之外的
    /// 部分清零。成功返回时页保持锁定，调用方拷入数据后必须以
    /// [`BufCache::commit_write`] 收尾；失败路径自行解锁。
    pub fn prepare_write(
        &self,
        map: &Mapping,
        page: &Arc<Page>,
        from: usize,
        to: usize,
        resolver: &dyn BlockResolver,
    ) -> Result<()> {
        if from > to || to > PAGE_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "byte range does not fit the page",
            ));
        }
        let dev = map.device();
        let bs = map.block_size();
        let blocks_per_page = map.blocks_per_page();

        page.lock();
        if !page.has_buffers() {
            self.create_empty_buffers(dev, page, bs, BufFlags::empty());
        }
        let bufs = page.buffers_snapshot();
        let first = page.index() * blocks_per_page;

        let mut waiters: Vec<Arc<Buffer>> = Vec::new();
        let mut fresh: Vec<Arc<Buffer>> = Vec::new();
        let mut failed: Option<Error> = None;

        for (i, b) in bufs.iter().enumerate() {
            let start = i * bs;
            let end = start + bs;
            if end <= from || start >= to {
                if page.is_uptodate() && !b.is_uptodate() {
                    b.set_uptodate();
                }
                continue;
            }
            b.raw_flags().remove(BufFlags::NEW);
            if !b.is_mapped() {
                match resolver.resolve(first + i as u64, true) {
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                    Ok(Some(m)) => {
                        b.map_to(m.block);
                        if m.new {
                            b.raw_flags().insert(BufFlags::NEW);
                            fresh.push(b.clone());
                            self.discard_alias(dev, m.block, bs);
                            if page.is_uptodate() {
                                b.raw_flags().remove(BufFlags::NEW);
                                b.set_uptodate();
                                continue;
                            }
                            // 新块：拷贝范围之外的部分清零，范围内等拷入
                            if end > to {
                                b.zero_bytes((to - start)..bs);
                            }
                            if start < from {
                                b.zero_bytes(0..(from - start));
                            }
                            b.raw_flags().remove(BufFlags::NEW);
                            continue;
                        }
                    }
                    Ok(None) => {
                        // 洞上的写：整块清零即为有效内容；回写时再分配
                        b.zero_fill();
                        b.set_uptodate();
                        continue;
                    }
                }
            }
            if page.is_uptodate() {
                if !b.is_uptodate() {
                    b.set_uptodate();
                }
                continue;
            }
            if !b.is_uptodate() && (start < from || end > to) {
                // 部分覆盖且内容过期：同步读入后才允许拷入
                b.lock();
                if b.is_uptodate() {
                    b.unlock();
                } else if io::submit_with(IoDir::Read, dev, b.clone(), EndIo::Sync).is_ok() {
                    waiters.push(b.clone());
                } else {
                    b.unlock();
                }
            }
        }

        if let Some(e) = failed {
            // 本次调用里新分配的块清零补位，避免把陈旧数据暴露出去
            for b in fresh {
                b.raw_flags().remove(BufFlags::NEW);
                b.zero_fill();
                b.set_uptodate();
                b.mark_dirty();
            }
            page.unlock();
            return Err(e);
        }

        for b in &waiters {
            b.wait_on();
            if !b.is_uptodate() {
                page.unlock();
                return Err(Error::new(
                    ErrorKind::Io,
                    "read for a partial write failed",
                ));
            }
        }
        Ok(())
    }

    /// 部分页写入的提交阶段
    ///
    /// 恰好把被触及的缓冲区标为有效且脏；页级有效位只有在页上
    /// 全部缓冲区都有效时才置起——部分页经多次写入凑成整页时
    /// 在此被发现，省掉一次多余的整页读。最后解锁页。
    pub fn commit_write(&self, map: &Mapping, page: &Arc<Page>, from: usize, to: usize) -> Result<()> {
        let bs = map.block_size();
        let bufs = page.buffers_snapshot();
        let mut partial = false;

        for (i, b) in bufs.iter().enumerate() {
            let start = i * bs;
            let end = start + bs;
            if end <= from || start >= to {
                if !b.is_uptodate() {
                    partial = true;
                }
            } else {
                b.set_uptodate();
                b.mark_dirty();
            }
        }
        if !partial {
            page.set_uptodate();
        }
        page.unlock();
        Ok(())
    }
}

//! 异步 I/O 提交与完成
//!
//! 提交路径把缓冲区请求翻译成设备层的单段请求（扇区地址 =
//! 块号 × 每块扇区数），立即返回；设备驱动稍后恰好调用一次完成
//! 回调。完成行为是一个封闭集合（[`EndIo`]）：同步路径只做
//! "置状态、解锁、唤醒"；异步路径还要做页级的扫描分流——一页
//! 可能有多个缓冲区各自在飞，最后完成的那个负责收尾整页。
//!
//! 扫描分流对完成顺序不作任何假设，两个缓冲区几乎同时完成的
//! 竞争由页的专用自旋锁裁决，该锁只在扫描期间持有。

use std::sync::Arc;

use crate::buffer::{BufFlags, Buffer, BufferRef};
use crate::device::{Device, IoDir};
use crate::diag;
use crate::error::{Error, ErrorKind, Result};

/// 完成行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndIo {
    /// 置状态并解锁（同步读写、批量遗留路径）
    Sync,
    /// 整页读的分流收尾
    AsyncRead,
    /// 整页回写的分流收尾
    AsyncWrite,
}

/// 提交单个缓冲区的 I/O（同步完成行为）
///
/// 前置条件：调用方已锁定缓冲区且其已映射。读要求内容尚非最新，
/// 写要求内容必须最新——违反者按内部一致性错误拒绝，不做任何
/// 状态变更。对已锁定缓冲区的第二次提交不可能发生在此接口上
/// （锁持有者唯一），同一缓冲区任一时刻至多一个在飞请求。
pub fn submit(dir: IoDir, dev: &Device, buf: &BufferRef) -> Result<()> {
    submit_with(dir, dev, buf.arc().clone(), EndIo::Sync)
}

pub(crate) fn submit_with(dir: IoDir, dev: &Device, buf: Arc<Buffer>, end: EndIo) -> Result<()> {
    if !buf.is_locked() {
        diag::consistency_error("submit on an unlocked buffer");
        return Err(Error::new(
            ErrorKind::InvalidState,
            "buffer must be locked for submission",
        ));
    }
    if !buf.is_mapped() {
        diag::consistency_error("submit on an unmapped buffer");
        return Err(Error::new(
            ErrorKind::InvalidState,
            "buffer must be mapped for submission",
        ));
    }
    if buf.size() % dev.sector_size() as usize != 0 {
        diag::consistency_error("buffer size is not sector aligned");
        return Err(Error::new(
            ErrorKind::InvalidState,
            "buffer size must be a multiple of the hardware sector size",
        ));
    }
    match dir {
        IoDir::Read => {
            if buf.is_uptodate() {
                diag::consistency_error("read submission for an uptodate buffer");
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    "reading already-current data",
                ));
            }
            if buf.is_dirty() {
                diag::consistency_error("read submission for a dirty buffer");
            }
        }
        IoDir::Write => {
            if !buf.is_uptodate() {
                diag::consistency_error("write submission for a non-uptodate buffer");
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    "writing unknown content",
                ));
            }
            if dev.is_read_only() {
                return Err(Error::new(
                    ErrorKind::PermissionDenied,
                    "device is read-only",
                ));
            }
        }
    }

    buf.raw_flags().insert(BufFlags::REQ);
    buf.raw_flags().remove(BufFlags::IO_ERROR);
    if dir == IoDir::Write {
        buf.raw_flags().test_and_clear(BufFlags::DIRTY);
    }
    *buf.end_io_slot().lock().unwrap() = Some(end);

    let sectors_per_buf = (buf.size() / dev.sector_size() as usize) as u64;
    let sector = buf.block() * sectors_per_buf;
    let len = buf.size();
    let data = match dir {
        IoDir::Write => Some(buf.with_data(|d| d.to_vec())),
        IoDir::Read => None,
    };

    log::trace!(
        "[IO] submit {dir:?} dev={} block={:#x} sector={sector} len={len}",
        dev.id(),
        buf.block()
    );

    let completer = buf.clone();
    dev.driver().submit(
        dir,
        sector,
        len,
        data,
        Box::new(move |result| complete(completer, dir, result)),
    );
    Ok(())
}

/// 批量提交（遗留兼容路径）
///
/// 整批前置校验：所有缓冲区必须属于同一设备且尺寸为其硬件扇区
/// 大小的整数倍，否则整批拒绝、不产生任何副作用。写批次中
/// 实际不脏的缓冲区与读批次中已最新的缓冲区被跳过；已被他人
/// 锁定的缓冲区静默跳过而不是等待。被跳过者不计入提交数，也
/// 不会收到本次调用的任何回调。返回实际提交的数量。
pub fn submit_batch(dir: IoDir, dev: &Device, bufs: &[BufferRef]) -> Result<usize> {
    if bufs.is_empty() {
        return Ok(0);
    }
    let sector_size = dev.sector_size() as usize;
    for b in bufs {
        if b.dev_id() != dev.id() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "batch spans more than one device",
            ));
        }
        if b.size() % sector_size != 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "buffer size is not a multiple of the device sector size",
            ));
        }
    }
    if dir == IoDir::Write && dev.is_read_only() {
        // 清掉脏位，免得调用方对只读设备无限重试
        for b in bufs {
            b.raw_flags().remove(BufFlags::DIRTY);
        }
        return Err(Error::new(
            ErrorKind::PermissionDenied,
            "device is read-only",
        ));
    }

    let mut submitted = 0;
    for b in bufs {
        // 只有一个线程能真正提交这个缓冲区
        if !b.try_lock() {
            continue;
        }
        let skip = match dir {
            IoDir::Write => !b.is_dirty(),
            IoDir::Read => b.is_uptodate(),
        };
        if skip {
            b.unlock();
            continue;
        }
        match submit_with(dir, dev, b.arc().clone(), EndIo::Sync) {
            Ok(()) => submitted += 1,
            Err(_) => b.unlock(),
        }
    }
    Ok(submitted)
}

/// 完成入口：更新缓冲区状态后按记录的行为分发
fn complete(buf: Arc<Buffer>, dir: IoDir, result: Result<Vec<u8>>) {
    let ok = match result {
        Ok(data) => {
            if dir == IoDir::Read {
                if data.len() == buf.size() {
                    buf.with_data_mut(|d| d.copy_from_slice(&data));
                    true
                } else {
                    diag::consistency_error("driver returned short read");
                    false
                }
            } else {
                true
            }
        }
        Err(_) => {
            diag::io_error(buf.dev_id(), buf.block());
            false
        }
    };

    if ok {
        buf.set_uptodate();
    } else {
        buf.clear_uptodate();
        buf.raw_flags().insert(BufFlags::IO_ERROR);
    }

    let end = buf.end_io_slot().lock().unwrap().take();
    match end {
        Some(EndIo::Sync) => buf.unlock(),
        Some(EndIo::AsyncRead) => end_async_read(&buf, ok),
        Some(EndIo::AsyncWrite) => end_async_write(&buf, ok),
        None => {
            diag::consistency_error("completion arrived with no recorded behavior");
            buf.unlock();
        }
    }
}

/// 整页读的完成分流
///
/// 清掉本缓冲区的异步标记并解锁之后扫描整页：还有缓冲区在
/// 异步读中就到此为止；全部完成且无错误则把页置为最新并解锁。
/// 扫描与"另一个缓冲区几乎同时完成"的竞争由页的分流自旋锁排除。
pub(crate) fn end_async_read(buf: &Arc<Buffer>, ok: bool) {
    let Some(page) = buf.page() else {
        diag::consistency_error("async read completion for a pageless buffer");
        buf.raw_flags().remove(BufFlags::ASYNC_READ);
        buf.unlock();
        return;
    };
    if !ok {
        page.set_error();
    }

    let mut page_uptodate = true;
    {
        let _demux = page.demux_lock();
        if !buf.raw_flags().test_and_clear(BufFlags::ASYNC_READ) {
            diag::consistency_error("async read completion without the async flag");
        }
        buf.unlock();
        let bufs = page.buffers_guard();
        for b in bufs.iter() {
            if !b.is_uptodate() {
                page_uptodate = false;
            }
            if b.flags().contains(BufFlags::ASYNC_READ) {
                // 本页还有读在飞，留给最后一个完成者收尾
                return;
            }
        }
    }

    if page_uptodate && !page.has_error() {
        page.set_uptodate();
    }
    page.unlock();
}

/// 整页回写的完成分流
pub(crate) fn end_async_write(buf: &Arc<Buffer>, ok: bool) {
    let Some(page) = buf.page() else {
        diag::consistency_error("async write completion for a pageless buffer");
        buf.raw_flags().remove(BufFlags::ASYNC_WRITE);
        buf.unlock();
        return;
    };
    if !ok {
        page.set_error();
    }

    {
        let _demux = page.demux_lock();
        if !buf.raw_flags().test_and_clear(BufFlags::ASYNC_WRITE) {
            diag::consistency_error("async write completion without the async flag");
        }
        buf.unlock();
        let bufs = page.buffers_guard();
        for b in bufs.iter() {
            if b.flags().contains(BufFlags::ASYNC_WRITE) {
                return;
            }
        }
    }

    page.end_writeback();
}

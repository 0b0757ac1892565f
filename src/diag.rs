//! 诊断支持
//!
//! 内部一致性错误是调用方的编程错误而不是运行时状况：
//! 记录一条带调用栈的诊断后继续以降级模式运行，绝不让整个
//! 进程为一条缓存断言陪葬。报告有全局突发上限，之后静默。

use core::sync::atomic::{AtomicU32, Ordering};

/// 突发计数器：预算耗尽后返回 false
pub(crate) struct RateLimit {
    budget: AtomicU32,
}

impl RateLimit {
    pub(crate) const fn new(burst: u32) -> Self {
        Self {
            budget: AtomicU32::new(burst),
        }
    }

    /// 申请一次配额
    pub(crate) fn allow(&self) -> bool {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

/// 一致性错误报告的全局预算
static CONSISTENCY_BUDGET: RateLimit = RateLimit::new(10);

/// I/O 错误诊断的全局预算
static IO_ERROR_BUDGET: RateLimit = RateLimit::new(32);

/// 报告一次内部一致性错误（限量，附调用栈）
pub(crate) fn consistency_error(what: &str) {
    if !CONSISTENCY_BUDGET.allow() {
        return;
    }
    log::error!("[BCACHE] consistency error: {what}");
    log::error!("[BCACHE] {}", std::backtrace::Backtrace::capture());
}

/// 报告一次缓冲区 I/O 错误（限量）
pub(crate) fn io_error(dev: u64, block: u64) {
    if !IO_ERROR_BUDGET.allow() {
        return;
    }
    log::error!("[IO] buffer I/O error on device {dev}, logical block {block}");
}

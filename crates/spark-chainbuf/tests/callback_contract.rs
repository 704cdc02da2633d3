//! 长度变化回调与推迟投递契约测试。
//!
//! # 测试目标（Why）
//! - 免推迟回调在修改返回前同步得到通知，普通回调则等到事件循环执行推迟任务时才得到通知；
//! - 推迟任务执行前禁用的回调不得被调用；
//! - 回调可以再次修改同一缓冲，且推迟模式下不会在同一调用栈内递归。
//!
//! # 结构安排（How）
//! - 以 [`QueueScheduler`] 充当事件循环，测试显式调用 `run_pending` 推进一轮；
//! - `Recorder` 把每次回调收到的 [`CallbackInfo`] 记录下来供断言。

use std::sync::Arc;

use parking_lot::Mutex;
use spark_chainbuf::{BufferError, CallbackInfo, ChainBuffer, QueueScheduler};

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<CallbackInfo>>>,
}

impl Recorder {
    fn attach(&self, buffer: &ChainBuffer) -> spark_chainbuf::CallbackHandle {
        let seen = Arc::clone(&self.seen);
        buffer.add_cb(move |_, info| seen.lock().push(*info))
    }

    fn calls(&self) -> Vec<CallbackInfo> {
        self.seen.lock().clone()
    }
}

/// 免推迟回调立即看到变化，推迟回调在调度器执行后才看到。
///
/// # 测试意图（Why）
/// - 水位监控需要同步得知长度变化，而业务回调希望在事件循环里统一处理。
///
/// # 步骤说明（How）
/// 1. 注册两个回调，第一个标记为免推迟；
/// 2. 启用推迟投递后追加 100 字节；
/// 3. 检查两个回调的调用记录，再执行一轮调度并复查。
///
/// # 契约校验（What）
/// - 追加返回时免推迟回调已收到 `n_added = 100`，推迟回调尚未被调用；
/// - 调度器执行后推迟回调收到同样的变化。
#[test]
fn exempt_callback_runs_before_deferred_one() {
    let scheduler = QueueScheduler::new();
    let buffer = ChainBuffer::new();
    buffer.defer_callbacks(scheduler.clone());

    let exempt = Recorder::default();
    exempt.attach(&buffer).set_no_defer(true);
    let deferred = Recorder::default();
    deferred.attach(&buffer);

    buffer.add(&[7u8; 100]).expect("追加 100 字节");
    assert_eq!(exempt.calls().len(), 1);
    assert_eq!(exempt.calls()[0].n_added, 100);
    assert!(deferred.calls().is_empty(), "推迟回调尚未执行");
    assert!(buffer.deferred_pending());
    assert_eq!(scheduler.pending(), 1);

    assert_eq!(scheduler.run_pending(), 1);
    let calls = deferred.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0],
        CallbackInfo {
            orig_size: 0,
            new_size: 100,
            n_added: 100,
            n_deleted: 0,
        }
    );
    assert!(!buffer.deferred_pending());
}

/// 推迟期间的多次修改合并为一次遍历，计数为累计值。
#[test]
fn deferred_pass_reports_cumulative_counts() {
    let scheduler = QueueScheduler::new();
    let buffer = ChainBuffer::builder()
        .with_scheduler(scheduler.clone())
        .build()
        .expect("构建");
    buffer.add(b"seed").expect("初始数据");
    let recorder = Recorder::default();
    recorder.attach(&buffer);
    scheduler.run_pending();
    assert!(recorder.calls().is_empty(), "注册前的变化已在无回调时清零");

    buffer.add(&[1u8; 10]).expect("追加");
    buffer.add(&[2u8; 20]).expect("追加");
    buffer.drain(5).expect("抽干");
    assert_eq!(scheduler.pending(), 1, "同一缓冲只调度一次");
    scheduler.run_pending();

    assert_eq!(
        recorder.calls(),
        vec![CallbackInfo {
            orig_size: 4,
            new_size: 29,
            n_added: 30,
            n_deleted: 5,
        }]
    );
}

/// 推迟任务执行前禁用的回调不会被调用，重新启用后参与下一次遍历。
#[test]
fn disabled_before_run_is_skipped() {
    let scheduler = QueueScheduler::new();
    let buffer = ChainBuffer::new();
    buffer.defer_callbacks(scheduler.clone());
    let recorder = Recorder::default();
    let handle = recorder.attach(&buffer);

    buffer.add(b"abc").expect("追加");
    handle.disable();
    scheduler.run_pending();
    assert!(recorder.calls().is_empty());

    handle.enable();
    buffer.add(b"d").expect("追加");
    scheduler.run_pending();
    let calls = recorder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].n_added, 1, "禁用期间的遍历已清零计数");
}

/// 关闭推迟投递后排队中的任务空转，之后的回调恢复同步执行。
#[test]
fn disabling_deferral_cancels_queued_task() {
    let scheduler = QueueScheduler::new();
    let buffer = ChainBuffer::new();
    buffer.defer_callbacks(scheduler.clone());
    let recorder = Recorder::default();
    recorder.attach(&buffer);

    buffer.add(b"queued").expect("追加");
    buffer.disable_deferred();
    assert_eq!(scheduler.run_pending(), 1);
    assert!(recorder.calls().is_empty(), "取消的任务不执行遍历");

    buffer.add(b"!").expect("追加");
    let calls = recorder.calls();
    assert_eq!(calls.len(), 1, "恢复同步执行");
    assert_eq!(calls[0].n_added, 7, "取消前累计的计数并入本次遍历");
}

/// 推迟回调修改同一缓冲时，新的变化调度到下一轮而不是递归执行。
#[test]
fn reentrant_deferred_callback_schedules_next_round() {
    let scheduler = QueueScheduler::new();
    let buffer = ChainBuffer::new();
    buffer.defer_callbacks(scheduler.clone());
    let rounds = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&rounds);
    buffer.add_cb(move |buffer, info| {
        log.lock().push(*info);
        if info.n_added > 0 {
            buffer.drain(2).expect("回调内抽干");
        }
    });

    buffer.add(b"abcdef").expect("追加");
    assert_eq!(scheduler.run_pending(), 1);
    assert_eq!(rounds.lock().len(), 1);
    assert_eq!(scheduler.pending(), 1, "回调内的修改调度了下一轮");
    assert_eq!(scheduler.run_pending(), 1);
    let rounds = rounds.lock();
    assert_eq!(rounds.len(), 2);
    assert_eq!(rounds[1].n_deleted, 2);
    assert_eq!(rounds[1].n_added, 0);
    assert_eq!(buffer.len(), 4);
}

/// 移除回调后不再收到通知，重复移除返回错误。
#[test]
fn removed_callback_is_silent() {
    let buffer = ChainBuffer::new();
    let recorder = Recorder::default();
    let handle = recorder.attach(&buffer);
    buffer.add(b"1").expect("追加");
    buffer.remove_cb(&handle).expect("移除");
    assert!(handle.is_removed());
    buffer.add(b"2").expect("追加");
    assert_eq!(recorder.calls().len(), 1);
    let err = buffer.remove_cb(&handle).expect_err("重复移除");
    assert!(matches!(err, BufferError::CallbackNotFound));
    assert_eq!(buffer.stats().callbacks, 0);
}

/// 双缓冲搬移分别通知两个缓冲。
#[test]
fn move_notifies_both_sides() {
    let src = ChainBuffer::new();
    let dst = ChainBuffer::new();
    src.add(b"payload").expect("追加");
    let src_seen = Recorder::default();
    src_seen.attach(&src);
    let dst_seen = Recorder::default();
    dst_seen.attach(&dst);

    dst.add_buffer(&src).expect("搬移");
    assert_eq!(src_seen.calls()[0].n_deleted, 7);
    assert_eq!(dst_seen.calls()[0].n_added, 7);
}

/// 调度推迟遍历时输出调试日志，便于排查回调“丢失”。
#[tracing_test::traced_test]
#[test]
fn scheduling_is_traced() {
    let scheduler = QueueScheduler::new();
    let buffer = ChainBuffer::new();
    buffer.defer_callbacks(scheduler.clone());
    Recorder::default().attach(&buffer);
    buffer.add(b"x").expect("追加");
    assert!(logs_contain("调度推迟回调遍历"));
    buffer.disable_deferred();
    scheduler.run_pending();
    assert!(logs_contain("推迟投递已取消"));
}

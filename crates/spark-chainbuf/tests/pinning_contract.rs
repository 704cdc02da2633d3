//! 钉住令牌与缓冲寿命的契约测试。
//!
//! # 测试目标（Why）
//! - 重叠 I/O 期间链内存必须地址稳定，即使缓冲在此期间被销毁；
//! - 令牌结束后被钉住的链恰好回收一次，不泄漏也不重复释放。
//!
//! # 结构安排（How）
//! - 以带清理计数的外部引用链观测“回收”这一时刻；
//! - 缓冲存活时以 `stats().dangling` 复核没有滞留的待销毁链。

use std::{
    io::{self, Read as _},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use spark_chainbuf::{BufferEnd, BufferError, ChainBuffer, ChainFlags, ChainKind};

fn counted_reference(buffer: &ChainBuffer, payload: &'static [u8]) -> Arc<AtomicUsize> {
    let cleaned = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&cleaned);
    buffer
        .add_reference(payload, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("挂入外部引用");
    cleaned
}

/// 读钉住期间销毁缓冲，钉住的内存在提交前保持可写。
///
/// # 测试意图（Why）
/// - 完成端口式接口可能在连接关闭之后才交付读入结果，此时写入的内存不能已被释放。
///
/// # 步骤说明（How）
/// 1. 钉住 64 字节尾部空闲区；
/// 2. 丢弃唯一的缓冲句柄，缓冲进入销毁状态；
/// 3. 通过令牌写入钉住区间，再提交。
///
/// # 契约校验（What）
/// - 弱句柄在销毁后无法升级；
/// - 提交返回 [`BufferError::Destroyed`]，写入的字节被丢弃。
#[test]
fn read_pin_outlives_buffer() {
    let buffer = ChainBuffer::new();
    let weak = buffer.downgrade();
    let mut pending = buffer.launch_read(64, 1).expect("钉住读入");
    assert!(pending.len() >= 64);
    drop(buffer);
    assert!(weak.upgrade().is_none(), "最后一个句柄释放后缓冲已销毁");

    {
        let mut slices = pending.io_slices_mut();
        let mut source: &[u8] = b"late completion";
        let read = source.read(&mut slices[0]).expect("写入钉住内存");
        assert_eq!(read, 15);
    }
    let err = pending.commit(15).expect_err("缓冲已销毁");
    assert!(matches!(err, BufferError::Destroyed));
}

/// 写钉住的外部引用链在销毁后延迟回收，令牌结束时恰好清理一次。
#[test]
fn write_pin_defers_reclaim_until_commit() {
    let buffer = ChainBuffer::new();
    let cleaned = counted_reference(&buffer, b"outbound frame");
    let pending = buffer.launch_write(usize::MAX, 4).expect("钉住写出");
    drop(buffer);
    assert_eq!(cleaned.load(Ordering::SeqCst), 0, "钉住期间不得回收");

    let slices = pending.io_slices();
    assert_eq!(&*slices[0], b"outbound frame", "销毁后钉住内存仍可读");
    drop(slices);

    let err = pending.commit(14).expect_err("缓冲已销毁");
    assert!(matches!(err, BufferError::Destroyed));
    assert_eq!(cleaned.load(Ordering::SeqCst), 1, "令牌结束后回收一次");
}

/// 未提交就丢弃的令牌同样会回收销毁期间滞留的链。
#[test]
fn dropping_token_after_destroy_reclaims_once() {
    let buffer = ChainBuffer::new();
    let cleaned = counted_reference(&buffer, b"abandoned");
    let pending = buffer.launch_write(4, 1).expect("钉住写出");
    drop(buffer);
    drop(pending);
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
}

/// 写钉住只冻结头部，尾部仍可追加；提交后只抽干写出的字节。
#[test]
fn write_pin_freezes_head_only() {
    let buffer = ChainBuffer::new();
    buffer.add(b"0123456789").expect("追加");
    let pending = buffer.launch_write(6, 2).expect("钉住写出");
    assert_eq!(pending.len(), 6);
    assert!(buffer.is_frozen(BufferEnd::Head));

    let err = buffer.drain(1).expect_err("头部冻结");
    assert!(matches!(err, BufferError::Frozen { end: BufferEnd::Head }));
    buffer.add(b"ab").expect("尾部照常追加");

    let mut sink = Vec::new();
    let written = pending.write_to(&mut sink).expect("写出");
    assert_eq!(written, 6);
    assert_eq!(pending.commit(4).expect("部分提交"), 4);
    assert!(!buffer.is_frozen(BufferEnd::Head));
    assert_eq!(buffer.remove_bytes(usize::MAX).expect("读出"), &b"456789ab"[..]);
    buffer.check_invariants().expect("不变式");
}

/// 读钉住期间抽干全部数据，钉住链留在序列中，提交后读入的字节按原位置计入。
#[test]
fn drain_during_read_pin_keeps_pinned_chain() {
    let buffer = ChainBuffer::new();
    buffer.add(b"prefix").expect("追加");
    let mut pending = buffer.launch_read(32, 1).expect("钉住读入");
    assert_eq!(buffer.drain(usize::MAX).expect("抽干"), 6);
    assert!(buffer.is_empty());
    assert!(
        buffer
            .chain_info()
            .iter()
            .any(|info| info.flags.contains(ChainFlags::PINNED_R)),
        "钉住链不随抽干释放"
    );

    {
        let mut slices = pending.io_slices_mut();
        slices[0][..4].copy_from_slice(b"next");
    }
    assert_eq!(pending.commit(4).expect("提交"), 4);
    assert_eq!(buffer.remove_bytes(usize::MAX).expect("读出"), &b"next"[..]);
    buffer.check_invariants().expect("不变式");
}

/// 提交量超过钉住区间时拒绝计入。
#[test]
fn oversized_commit_is_rejected() {
    let buffer = ChainBuffer::new();
    let pending = buffer.launch_read(8, 1).expect("钉住读入");
    let reserved = pending.len();
    let err = pending.commit(reserved + 1).expect_err("超过钉住量");
    assert!(matches!(err, BufferError::InvalidArgument { .. }));
    assert!(buffer.is_empty());
    assert!(!buffer.is_frozen(BufferEnd::Tail), "失败的提交同样解除冻结");
}

/// 以读入适配器驱动多轮读取，模拟事件循环的可读事件。
#[test]
fn read_from_loops_until_eof() {
    let buffer = ChainBuffer::new();
    buffer.set_max_read(7).expect("设置单次上限");
    let payload: Vec<u8> = (0..100u8).collect();
    let mut source = io::Cursor::new(payload.clone());
    let mut rounds = 0;
    loop {
        let read = buffer.read_from(&mut source, usize::MAX).expect("读入");
        if read == 0 {
            break;
        }
        assert!(read <= 7);
        rounds += 1;
    }
    assert!(rounds >= 15);
    assert!(
        buffer.chain_info().iter().all(|info| {
            info.kind == ChainKind::Owned
                && !info.flags.contains(ChainFlags::PINNED_R)
                && !info.flags.contains(ChainFlags::PINNED_W)
        }),
        "读入结束后不应残留钉住标志"
    );
    assert_eq!(buffer.remove_bytes(usize::MAX).expect("读出"), payload);
    assert_eq!(buffer.stats().dangling, 0);
}

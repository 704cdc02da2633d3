//! 链式缓冲基础契约测试。
//!
//! # 测试目标（Why）
//! - 验证追加、抽干、预留、前插这些最常用的单缓冲操作在跨链边界时依旧保持字节顺序与长度计数；
//! - 验证查找与按行读取在数据分散于多条链时的结果与连续数组一致。
//!
//! # 结构安排（How）
//! - 每个测试只通过公开 API 构造场景，最后统一调用 `check_invariants` 复核内部不变式；
//! - `contents` 辅助函数复制出全部字节，用于与期望值逐字节比较。

use bytes::Bytes;
use spark_chainbuf::{BufferConfig, BufferError, ChainBuffer, ChainKind, EolStyle, ErrorKind};

fn contents(buffer: &ChainBuffer) -> Vec<u8> {
    let mut out = vec![0; buffer.len()];
    let copied = buffer.copy_out(&mut out).expect("复制全部字节");
    assert_eq!(copied, out.len());
    out
}

/// 预留后追加再抽干，长度计数全程准确。
///
/// # 测试意图（Why）
/// - 预留空间不计入长度，是连接层“先扩容再读入”模式的前提。
///
/// # 步骤说明（How）
/// 1. 新建空缓冲并预留 2000 字节；
/// 2. 追加 1500 字节，长度应为 1500；
/// 3. 抽干 1500 字节，长度归零。
///
/// # 契约校验（What）
/// - 追加的数据落在预留空间内，不再额外分配链。
#[test]
fn reserve_add_drain_keeps_length_exact() {
    let buffer = ChainBuffer::new();
    buffer.expand(2000).expect("预留 2000 字节");
    assert_eq!(buffer.len(), 0, "预留不计入长度");
    let allocated = buffer.stats().chains_allocated;

    buffer.add(&[0x5a; 1500]).expect("追加 1500 字节");
    assert_eq!(buffer.len(), 1500);
    assert_eq!(
        buffer.stats().chains_allocated,
        allocated,
        "预留空间足够时追加不应分配新链"
    );

    assert_eq!(buffer.drain(1500).expect("抽干"), 1500);
    assert_eq!(buffer.len(), 0);
    buffer.check_invariants().expect("不变式");
}

/// 大量追加后分批取出，字节顺序与写入一致。
#[test]
fn bytes_come_out_in_order_across_chains() {
    let buffer = ChainBuffer::new();
    let mut expected = Vec::new();
    for round in 0..64u32 {
        let piece: Vec<u8> = (0..(round * 37 % 700 + 1))
            .map(|index| (index as u8).wrapping_add(round as u8))
            .collect();
        buffer.add(&piece).expect("追加");
        expected.extend_from_slice(&piece);
    }
    assert!(buffer.stats().chains > 1, "数据应分布在多条链上");
    assert_eq!(contents(&buffer), expected);

    let mut collected = Vec::new();
    let mut chunk = [0u8; 333];
    loop {
        let read = buffer.remove(&mut chunk).expect("取出");
        if read == 0 {
            break;
        }
        collected.extend_from_slice(&chunk[..read]);
    }
    assert_eq!(collected, expected);
    assert!(buffer.is_empty());
    buffer.check_invariants().expect("不变式");
}

/// 前插的数据排在已有数据之前，且可以利用抽干留下的头部空隙。
#[test]
fn prepend_reuses_head_room() {
    let buffer = ChainBuffer::new();
    buffer.add(b"--header--body").expect("追加");
    buffer.drain(10).expect("抽掉头部");
    let allocated = buffer.stats().chains_allocated;

    buffer.prepend(b"HEAD:").expect("前插");
    assert_eq!(contents(&buffer), b"HEAD:body");
    assert_eq!(
        buffer.stats().chains_allocated,
        allocated,
        "头部空隙足够时前插不分配"
    );
    buffer.check_invariants().expect("不变式");
}

/// 外部引用与字节对象以零拷贝方式挂入，清理回调在链释放后恰好执行一次。
#[test]
fn reference_cleanup_runs_once_after_drain() {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    let cleaned = Arc::new(AtomicUsize::new(0));
    let buffer = ChainBuffer::new();
    let counter = Arc::clone(&cleaned);
    buffer
        .add_reference(b"static payload".to_vec(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("挂入外部引用");
    buffer
        .add_bytes(Bytes::from_static(b" + bytes"))
        .expect("挂入字节对象");

    let kinds: Vec<_> = buffer.chain_info().iter().map(|info| info.kind).collect();
    assert_eq!(kinds, vec![ChainKind::Reference, ChainKind::Reference]);
    assert_eq!(buffer.stats().owned_bytes, 0, "外部引用不计入自有内存");
    assert_eq!(contents(&buffer), b"static payload + bytes");

    buffer.drain(5).expect("部分抽干");
    assert_eq!(cleaned.load(Ordering::SeqCst), 0, "链未被完整消费前不清理");
    buffer.drain(usize::MAX).expect("全部抽干");
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    drop(buffer);
    assert_eq!(cleaned.load(Ordering::SeqCst), 1, "销毁缓冲不会重复清理");
}

/// 向外部引用链之后追加时不写入只读内存。
#[test]
fn add_after_reference_allocates_new_chain() {
    let buffer = ChainBuffer::new();
    buffer.add_bytes(Bytes::from_static(b"ro")).expect("挂入");
    buffer.add(b"rw").expect("追加");
    let info = buffer.chain_info();
    assert_eq!(info.len(), 2);
    assert_eq!(info[1].kind, ChainKind::Owned);
    assert_eq!(contents(&buffer), b"rorw");
    buffer.check_invariants().expect("不变式");
}

/// 查找跨越链边界，区间查找只接受完整落在区间内的匹配。
#[test]
fn search_matches_contiguous_reference() {
    let buffer = ChainBuffer::new();
    for part in [&b"GET /ind"[..], b"ex.html HT", b"TP/1.1\r", b"\nHost: a\r\n\r\n"] {
        buffer
            .add_bytes(Bytes::copy_from_slice(part))
            .expect("分段挂入");
    }
    let flat = contents(&buffer);
    let expected = flat.windows(4).position(|window| window == b"HTTP");

    assert_eq!(buffer.search(b"HTTP", 0).expect("查找"), expected);
    assert_eq!(buffer.search(b"HTTP", 20).expect("越过匹配后查找"), None);
    assert_eq!(
        buffer.search_range(b"HTTP", 0, 20).expect("区间恰好容纳"),
        expected
    );
    assert_eq!(buffer.search(b"", 7).expect("空模式"), Some(7));
    assert_eq!(
        buffer.search_range(b"HTTP", 0, 19).expect("区间过短"),
        None,
        "匹配必须完整落在区间内"
    );
    let err = buffer
        .search(b"x", flat.len() + 1)
        .expect_err("起点越界");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

/// 按行读取：没有完整行时缓冲不变，行尾随行一起抽干。
#[test]
fn readln_walks_request_lines() {
    let buffer = ChainBuffer::new();
    buffer.add(b"GET / HTTP/1.1\r").expect("追加");
    assert_eq!(
        buffer.readln(EolStyle::CrlfStrict).expect("查找行"),
        None,
        "只有 \\r 时不是完整行"
    );
    assert_eq!(buffer.len(), 15);

    buffer.add(b"\nHost: example\nAccept: */*\r\n\r\n").expect("追加");
    let first = buffer.readln(EolStyle::Crlf).expect("第一行");
    assert_eq!(first.as_deref(), Some(&b"GET / HTTP/1.1"[..]));
    let second = buffer.readln(EolStyle::Crlf).expect("第二行");
    assert_eq!(second.as_deref(), Some(&b"Host: example"[..]));
    let third = buffer.readln(EolStyle::Crlf).expect("第三行");
    assert_eq!(third.as_deref(), Some(&b"Accept: */*"[..]));
    let blank = buffer.readln(EolStyle::Crlf).expect("空行");
    assert_eq!(blank.as_deref(), Some(&b""[..]));
    assert!(buffer.is_empty());
    buffer.check_invariants().expect("不变式");
}

/// `Any` 风格把连续的 `\r`/`\n` 视为一个行尾。
#[test]
fn readln_any_collapses_terminator_runs() {
    let buffer = ChainBuffer::new();
    buffer.add(b"one\r\n\n\rtwo\n").expect("追加");
    assert_eq!(
        buffer.search_eol(0, EolStyle::Any).expect("查找行尾"),
        Some((3, 4))
    );
    let line = buffer.readln(EolStyle::Any).expect("读行");
    assert_eq!(line.as_deref(), Some(&b"one"[..]));
    assert_eq!(contents(&buffer), b"two\n");
}

/// 冻结一端后对应方向的修改被拒绝且缓冲不变。
#[test]
fn frozen_ends_reject_mutation() {
    use spark_chainbuf::BufferEnd;

    let buffer = ChainBuffer::new();
    buffer.add(b"abc").expect("追加");
    buffer.freeze(BufferEnd::Head);
    let err = buffer.drain(1).expect_err("头部冻结");
    assert!(matches!(err, BufferError::Frozen { end: BufferEnd::Head }));
    assert!(buffer.prepend(b"x").is_err());
    buffer.add(b"d").expect("尾部不受影响");
    buffer.unfreeze(BufferEnd::Head);

    buffer.freeze(BufferEnd::Tail);
    let err = buffer.add(b"e").expect_err("尾部冻结");
    assert_eq!(err.code(), spark_chainbuf::codes::FROZEN);
    assert_eq!(buffer.drain(1).expect("头部不受影响"), 1);
    buffer.unfreeze(BufferEnd::Tail);
    assert_eq!(contents(&buffer), b"bcd");
}

/// 线性化把跨链的头部数据放进一段连续内存。
#[test]
fn pullup_linearizes_head() {
    let buffer = ChainBuffer::new();
    buffer.add_bytes(Bytes::from_static(b"ab")).expect("挂入");
    buffer.add_bytes(Bytes::from_static(b"cd")).expect("挂入");
    buffer.add(b"ef").expect("追加");
    let head = buffer
        .pullup_with(5, |slice| slice.to_vec())
        .expect("线性化");
    assert_eq!(head, b"abcde");
    assert!(buffer.contiguous_space() >= 5);
    assert_eq!(contents(&buffer), b"abcdef");
    buffer.check_invariants().expect("不变式");
}

/// 自定义配置从 TOML 读入后作用于新链的分配粒度。
#[test]
fn builder_applies_custom_config() {
    let config: BufferConfig =
        toml::from_str("min_chunk = 4096\nmax_read = 1024\n").expect("解析配置");
    let buffer = ChainBuffer::builder()
        .with_config(config)
        .build()
        .expect("构建");
    assert_eq!(buffer.max_read(), 1024);
    buffer.add(b"x").expect("追加");
    let info = buffer.chain_info();
    assert!(
        info[0].capacity >= 2048,
        "首链容量应由 min_chunk 决定，实际 {}",
        info[0].capacity
    );
}

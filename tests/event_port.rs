//! Event port integration tests.
//!
//! Drives [`EventPort`] over the deterministic [`LabKernel`] through the
//! fire-once races: events queued but not drained while the caller
//! dissociates, re-associates, or reuses the same token value.
//!
//! Run with: `cargo test --test event_port`

use eventport::{
    Error, EventMask, EventPort, LabKernel, PortConfig, PortSnapshot, SourceKind,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod common {
    pub fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_test_writer()
            .try_init();
    }
}

/// Phase tracking macro for structured test logging.
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Assertion with logging for better test output.
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

fn init_test(name: &str) {
    common::init_test_logging();
    test_phase!(name);
}

type LabPort<T> = EventPort<LabKernel, T>;

fn lab_port<T>() -> (LabPort<T>, LabKernel) {
    let port: LabPort<T> = EventPort::open().expect("open port");
    let lab = port.kernel().clone();
    (port, lab)
}

/// Checks registry/jar counts and the kernel queue length in one go.
fn check_internals<T>(port: &LabPort<T>, fds: usize, paths: usize, cookies: usize, queued: usize) {
    let snap = port.snapshot();
    let pending = port.pending().expect("pending");
    let got = (snap.fds, snap.paths, snap.cookies, pending);
    assert_with_log!(
        got == (fds, paths, cookies, queued),
        "internal state (fds, paths, cookies, queued)",
        (fds, paths, cookies, queued),
        got
    );
    assert_with_log!(
        snap.cookies == snap.active + snap.pending,
        "cookies == active + pending",
        snap.active + snap.pending,
        snap.cookies
    );
    assert_with_log!(
        snap.active == snap.fds + snap.paths,
        "active == registry size",
        snap.fds + snap.paths,
        snap.active
    );
}

fn poll<T>(port: &LabPort<T>) -> eventport::PortEvent<T> {
    port.get_one(Some(Duration::ZERO)).expect("queued event")
}

#[test]
fn dissociate_after_fire_is_not_associated() {
    init_test("dissociate_after_fire_is_not_associated");
    let (port, lab) = lab_port();
    let p = Path::new("/watched/p");

    port.associate_path(p, EventMask::FILE_MODIFIED, "c1")
        .expect("associate");
    assert!(lab.fire_path(p, EventMask::FILE_MODIFIED));

    let err = port.dissociate_path(p).unwrap_err();
    assert_with_log!(err.is_not_associated(), "dissociate", "NotAssociated", err);
    assert_with_log!(
        !port.is_watched_path(p),
        "unwatched after race",
        false,
        port.is_watched_path(p)
    );

    let event = poll(&port);
    assert_with_log!(event.token == "c1", "token", "c1", event.token);
    assert_with_log!(
        event.source() == SourceKind::File,
        "source",
        SourceKind::File,
        event.source()
    );
    check_internals(&port, 0, 0, 0, 0);
}

#[test]
fn duplicate_tokens_resolve_to_distinct_entries() {
    init_test("duplicate_tokens_resolve_to_distinct_entries");
    let (port, lab) = lab_port();
    let p = Path::new("/watched/dup");

    port.associate_path(p, EventMask::FILE_MODIFIED, "c1")
        .expect("first associate");
    lab.remove_path(p);
    lab.create_path(p);
    let err = port.dissociate_path(p).unwrap_err();
    assert!(err.is_not_associated());
    port.associate_path(p, EventMask::FILE_MODIFIED, "c1")
        .expect("second associate");
    lab.fire_path(p, EventMask::FILE_MODIFIED);
    check_internals(&port, 0, 1, 2, 2);

    let first = poll(&port);
    let second = poll(&port);
    assert_with_log!(first.token == "c1", "first token", "c1", first.token);
    assert_with_log!(second.token == "c1", "second token", "c1", second.token);
    assert_with_log!(
        first.events.contains(EventMask::FILE_DELETE),
        "first fired event is the delete",
        EventMask::FILE_DELETE,
        first.events
    );
    assert_with_log!(
        second.events == EventMask::FILE_MODIFIED,
        "second fired event is the modify",
        EventMask::FILE_MODIFIED,
        second.events
    );
    check_internals(&port, 0, 0, 0, 0);
}

/// Linear worst case: events fire and are not consumed while the same path
/// is dissociated and re-associated, including with a repeated token.
#[test]
fn dissociate_already_gone_worst_case() {
    init_test("dissociate_already_gone_worst_case");
    let (port, lab) = lab_port::<String>();
    let path = PathBuf::from("/watched/eventport");

    port.associate_path(&path, EventMask::FILE_MODIFIED, "cookie1".into())
        .expect("associate");
    check_internals(&port, 0, 1, 1, 0);

    lab.remove_path(&path);
    // Fired, but not yet observed: still reads as watched.
    assert!(port.is_watched_path(&path));
    let err = port.dissociate_path(&path).unwrap_err();
    assert!(err.is_not_associated());
    assert!(!port.is_watched_path(&path));
    check_internals(&port, 0, 0, 1, 1);

    lab.create_path(&path);
    port.associate_path(&path, EventMask::FILE_MODIFIED, "cookie2".into())
        .expect("associate");
    check_internals(&port, 0, 1, 2, 1);

    lab.remove_path(&path);
    check_internals(&port, 0, 1, 2, 2);
    let err = port.dissociate_path(&path).unwrap_err();
    assert!(err.is_not_associated());
    check_internals(&port, 0, 0, 2, 2);

    lab.create_path(&path);
    port.associate_path(&path, EventMask::FILE_MODIFIED, "cookie2".into())
        .expect("associate with repeated token");
    check_internals(&port, 0, 1, 3, 2);

    let event = poll(&port);
    assert_eq!(event.token, "cookie1");
    check_internals(&port, 0, 1, 2, 1);

    let event = poll(&port);
    assert_eq!(event.token, "cookie2");
    // The repeated token must not evict the live association.
    check_internals(&port, 0, 1, 1, 0);

    lab.remove_path(&path);
    check_internals(&port, 0, 1, 1, 1);
    let event = poll(&port);
    assert_eq!(event.token, "cookie2");
    assert_eq!(event.path(), Some(path.as_path()));
    check_internals(&port, 0, 0, 0, 0);
}

#[test]
fn associating_active_fd_twice_is_rejected() {
    init_test("associating_active_fd_twice_is_rejected");
    let (port, lab) = lab_port();

    port.associate_fd(5, EventMask::POLLIN, 1u32).expect("associate");
    let before = port.snapshot();
    let err = port.associate_fd(5, EventMask::POLLOUT, 2).unwrap_err();
    assert_with_log!(
        matches!(err, Error::AlreadyAssociated { .. }),
        "second associate",
        "AlreadyAssociated",
        err
    );
    assert_with_log!(port.snapshot() == before, "jar untouched", before, port.snapshot());
    assert_eq!(lab.association_count(), 1);
    let mask = lab.association_mask(&eventport::WatchedObject::Fd(5));
    assert_with_log!(
        mask == Some(EventMask::POLLIN),
        "kernel untouched",
        Some(EventMask::POLLIN),
        mask
    );

    lab.fire_fd(5, EventMask::POLLIN);
    let event = poll(&port);
    assert_eq!(event.token, 1);
    assert_eq!(event.fd(), Some(5));
}

#[test]
fn zero_timeout_on_empty_port_does_not_block() {
    init_test("zero_timeout_on_empty_port_does_not_block");
    let (port, _lab) = lab_port::<()>();
    let start = Instant::now();
    let err = port.get_one(Some(Duration::ZERO)).unwrap_err();
    let elapsed = start.elapsed();
    assert_with_log!(err.is_timed_out(), "timed out", "TimedOut", err);
    assert_with_log!(
        elapsed < Duration::from_millis(500),
        "returned promptly",
        "< 500ms",
        elapsed
    );
}

#[test]
fn short_timeout_expires() {
    init_test("short_timeout_expires");
    let (port, _lab) = lab_port::<()>();
    let start = Instant::now();
    let err = port.get_one(Some(Duration::from_millis(20))).unwrap_err();
    assert!(err.is_timed_out());
    assert!(start.elapsed() >= Duration::from_millis(15));
}

#[test]
fn kernel_rejection_creates_no_state() {
    init_test("kernel_rejection_creates_no_state");
    let (port, lab) = lab_port();
    lab.remove_path("/missing");
    let err = port
        .associate_path("/missing", EventMask::FILE_MODIFIED, "c")
        .unwrap_err();
    assert_with_log!(
        err.raw_os_error() == Some(libc::ENOENT),
        "errno propagated verbatim",
        Some(libc::ENOENT),
        err.raw_os_error()
    );
    assert_eq!(err.kind(), eventport::ErrorKind::KernelRejected);

    lab.close_fd(8);
    let err = port.associate_fd(8, EventMask::POLLIN, "c").unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    check_internals(&port, 0, 0, 0, 0);
    assert_eq!(lab.association_count(), 0);
}

#[test]
fn dissociating_unknown_objects_is_not_associated() {
    init_test("dissociating_unknown_objects_is_not_associated");
    let (port, _lab) = lab_port::<()>();
    assert!(port.dissociate_path("/never").unwrap_err().is_not_associated());
    assert!(port.dissociate_fd(0).unwrap_err().is_not_associated());
}

#[test]
fn explicit_dissociate_then_drain_reclaims() {
    init_test("explicit_dissociate_then_drain_reclaims");
    let (port, lab) = lab_port();
    port.associate_fd(3, EventMask::POLLIN, "a").expect("associate");
    port.associate_path("/f", EventMask::FILE_MODIFIED, "b")
        .expect("associate");

    port.dissociate_fd(3).expect("dissociate");
    lab.fire_path("/f", EventMask::FILE_MODIFIED);
    let snap = port.snapshot();
    assert_with_log!(
        snap == PortSnapshot {
            fds: 0,
            paths: 1,
            cookies: 2,
            active: 1,
            pending: 1
        },
        "dissociated entry pending",
        "1 active, 1 pending",
        snap
    );

    // Queue not empty: nothing reclaimed yet.
    assert_eq!(port.flush().expect("flush"), 0);

    let drained = port.drain().expect("drain");
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].token, "b");
    check_internals(&port, 0, 0, 0, 0);
}

#[test]
fn drain_without_reclaim_keeps_dissociated_entries() {
    init_test("drain_without_reclaim_keeps_dissociated_entries");
    let config = PortConfig::default().with_reclaim_on_drain(false);
    let port: LabPort<&str> = EventPort::open_with_config(config).expect("open");
    port.associate_fd(3, EventMask::POLLIN, "a").expect("associate");
    port.dissociate_fd(3).expect("dissociate");

    assert!(port.drain().expect("drain").is_empty());
    assert_eq!(port.snapshot().pending, 1);
    assert_eq!(port.flush().expect("flush"), 1);
    assert!(port.snapshot().is_empty());
}

#[test]
fn get_many_returns_batches_in_fire_order() {
    init_test("get_many_returns_batches_in_fire_order");
    let (port, lab) = lab_port();
    for fd in 10..15 {
        port.associate_fd(fd, EventMask::POLLIN, fd).expect("associate");
    }
    for fd in [12, 10, 14] {
        lab.fire_fd(fd, EventMask::POLLIN);
    }
    assert_eq!(port.pending().expect("pending"), 3);

    let batch = port
        .get_many(2, 1, Some(Duration::ZERO))
        .expect("first batch");
    let tokens: Vec<_> = batch.iter().map(|e| e.token).collect();
    assert_with_log!(tokens == vec![12, 10], "first batch", vec![12, 10], tokens);

    // Fewer than min arrived before the timeout: partial batch.
    let batch = port
        .get_many(8, 4, Some(Duration::from_millis(10)))
        .expect("partial batch");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].token, 14);

    let err = port.get_many(8, 1, Some(Duration::ZERO)).unwrap_err();
    assert!(err.is_timed_out());
    check_internals(&port, 2, 0, 2, 0);
}

#[test]
fn exception_events_fire_regardless_of_mask() {
    init_test("exception_events_fire_regardless_of_mask");
    let (port, lab) = lab_port();
    port.associate_fd(6, EventMask::POLLIN, "fd").expect("associate");
    port.associate_path("/m", EventMask::FILE_ATTRIB, "path")
        .expect("associate");

    assert!(!lab.fire_fd(6, EventMask::POLLOUT));
    assert!(lab.fire_fd(6, EventMask::POLLHUP));
    assert!(lab.fire_path("/m", EventMask::UNMOUNTED));

    let hup = poll(&port);
    assert!(hup.events.is_poll_exception());
    let unmount = poll(&port);
    assert!(unmount.events.is_file_exception());
    check_internals(&port, 0, 0, 0, 0);
}

#[test]
fn close_wakes_blocked_retrieval() {
    init_test("close_wakes_blocked_retrieval");
    let (port, _lab) = lab_port::<u8>();
    let port = Arc::new(port);
    port.associate_fd(2, EventMask::POLLIN, 9).expect("associate");

    let waiter = {
        let port = Arc::clone(&port);
        std::thread::spawn(move || port.get_one(None))
    };
    std::thread::sleep(Duration::from_millis(30));
    port.close().expect("close");

    let result = waiter.join().expect("waiter thread");
    assert_with_log!(
        matches!(result, Err(Error::Closed)),
        "blocked retrieval",
        "Err(Closed)",
        result
    );
    assert!(port.snapshot().is_empty());
    assert!(matches!(port.pending(), Err(Error::Closed)));
    assert!(matches!(port.dissociate_fd(2), Err(Error::Closed)));
}

#[test]
fn close_wakes_every_blocked_retrieval() {
    init_test("close_wakes_every_blocked_retrieval");
    const WAITERS: usize = 4;
    let (port, _lab) = lab_port::<u8>();
    let port = Arc::new(port);
    let (tx, rx) = std::sync::mpsc::channel();

    for i in 0..WAITERS {
        let port = Arc::clone(&port);
        let tx = tx.clone();
        std::thread::spawn(move || {
            // Mix single and batch retrieval; both must observe the close.
            let closed = if i % 2 == 0 {
                matches!(port.get_one(None), Err(Error::Closed))
            } else {
                matches!(port.get_many(4, 1, None), Err(Error::Closed))
            };
            let _ = tx.send(closed);
        });
    }
    drop(tx);
    std::thread::sleep(Duration::from_millis(50));
    port.close().expect("close");

    let mut returned = 0;
    for _ in 0..WAITERS {
        match rx.recv_timeout(Duration::from_secs(2)) {
            Ok(closed) => {
                assert_with_log!(closed, "waiter result", "Err(Closed)", closed);
                returned += 1;
            }
            Err(_) => break,
        }
    }
    assert_with_log!(
        returned == WAITERS,
        "waiters returned after close",
        WAITERS,
        returned
    );
}

#[test]
fn retrieval_runs_concurrently_with_association() {
    init_test("retrieval_runs_concurrently_with_association");
    const COUNT: i32 = 64;
    let (port, lab) = lab_port::<i32>();
    let port = Arc::new(port);

    let consumer = {
        let port = Arc::clone(&port);
        std::thread::spawn(move || {
            let mut tokens = Vec::new();
            while tokens.len() < COUNT as usize {
                let event = port
                    .get_one(Some(Duration::from_secs(5)))
                    .expect("event within deadline");
                assert_eq!(event.fd(), Some(event.token));
                tokens.push(event.token);
            }
            tokens
        })
    };

    for fd in 0..COUNT {
        port.associate_fd(fd, EventMask::POLLIN, fd).expect("associate");
        lab.fire_fd(fd, EventMask::POLLIN);
    }

    let tokens = consumer.join().expect("consumer thread");
    assert_eq!(tokens, (0..COUNT).collect::<Vec<_>>());
    check_internals(&port, 0, 0, 0, 0);
}

// ============================================================================
// Property tests
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    AssociatePath(u8, u8),
    AssociateFd(u8, u8),
    DissociatePath(u8),
    DissociateFd(u8),
    FirePath(u8),
    FireFd(u8),
    Retrieve,
    Flush,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4, 0u8..3).prop_map(|(p, t)| Op::AssociatePath(p, t)),
        (0u8..4, 0u8..3).prop_map(|(f, t)| Op::AssociateFd(f, t)),
        (0u8..4).prop_map(Op::DissociatePath),
        (0u8..4).prop_map(Op::DissociateFd),
        (0u8..4).prop_map(Op::FirePath),
        (0u8..4).prop_map(Op::FireFd),
        Just(Op::Retrieve),
        Just(Op::Flush),
    ]
}

fn path_of(p: u8) -> PathBuf {
    PathBuf::from(format!("/prop/{p}"))
}

fn assert_invariants(port: &LabPort<u8>) -> Result<(), TestCaseError> {
    let snap = port.snapshot();
    prop_assert_eq!(snap.cookies, snap.active + snap.pending);
    prop_assert_eq!(snap.active, snap.fds + snap.paths);
    Ok(())
}

proptest! {
    #[test]
    fn registry_tracks_distinct_associations(ops in prop::collection::vec((0i32..16, any::<bool>()), 0..64)) {
        let (port, _lab) = lab_port::<i32>();
        let mut model: HashMap<i32, bool> = HashMap::new();
        for (fd, associate) in ops {
            let watched = model.get(&fd).copied().unwrap_or(false);
            if associate {
                let result = port.associate_fd(fd, EventMask::POLLIN, fd);
                prop_assert_eq!(result.is_ok(), !watched);
                model.insert(fd, true);
            } else {
                let result = port.dissociate_fd(fd);
                prop_assert_eq!(result.is_ok(), watched);
                model.insert(fd, false);
            }
            let active = model.values().filter(|w| **w).count();
            prop_assert_eq!(port.snapshot().fds, active);
            prop_assert_eq!(port.is_watched_fd(fd), model[&fd]);
        }
    }

    #[test]
    fn bookkeeping_invariants_hold(ops in prop::collection::vec(arb_op(), 0..96)) {
        let (port, lab) = lab_port::<u8>();
        for op in ops {
            match op {
                Op::AssociatePath(p, t) => {
                    let watched = port.is_watched_path(path_of(p));
                    let result = port.associate_path(path_of(p), EventMask::FILE_MODIFIED, t);
                    prop_assert_eq!(result.is_ok(), !watched);
                    prop_assert!(port.is_watched_path(path_of(p)));
                }
                Op::AssociateFd(f, t) => {
                    let watched = port.is_watched_fd(i32::from(f));
                    let result = port.associate_fd(i32::from(f), EventMask::POLLIN, t);
                    prop_assert_eq!(result.is_ok(), !watched);
                    prop_assert!(port.is_watched_fd(i32::from(f)));
                }
                Op::DissociatePath(p) => {
                    match port.dissociate_path(path_of(p)) {
                        Ok(()) | Err(Error::NotAssociated { .. }) => {}
                        Err(err) => prop_assert!(false, "unexpected error {err}"),
                    }
                    prop_assert!(!port.is_watched_path(path_of(p)));
                }
                Op::DissociateFd(f) => {
                    match port.dissociate_fd(i32::from(f)) {
                        Ok(()) | Err(Error::NotAssociated { .. }) => {}
                        Err(err) => prop_assert!(false, "unexpected error {err}"),
                    }
                    prop_assert!(!port.is_watched_fd(i32::from(f)));
                }
                Op::FirePath(p) => {
                    lab.fire_path(path_of(p), EventMask::FILE_MODIFIED);
                }
                Op::FireFd(f) => {
                    lab.fire_fd(i32::from(f), EventMask::POLLIN);
                }
                Op::Retrieve => match port.get_one(Some(Duration::ZERO)) {
                    Ok(_) | Err(Error::TimedOut) => {}
                    Err(err) => prop_assert!(false, "unexpected error {err}"),
                },
                Op::Flush => {
                    port.flush().expect("flush");
                }
            }
            assert_invariants(&port)?;
        }

        // Tear down: every remaining association and event must resolve.
        for i in 0u8..4 {
            let _ = port.dissociate_path(path_of(i));
            let _ = port.dissociate_fd(i32::from(i));
        }
        port.drain().expect("drain");
        prop_assert!(port.snapshot().is_empty(), "leftover state {:?}", port.snapshot());
        prop_assert_eq!(port.pending().expect("pending"), 0);
        prop_assert_eq!(lab.association_count(), 0);
    }

    #[test]
    fn repeated_tokens_drain_in_fire_order(rounds in 1usize..8) {
        let (port, lab) = lab_port::<(&str, usize)>();
        let p = Path::new("/prop/repeat");
        for round in 0..rounds {
            port.associate_path(p, EventMask::FILE_MODIFIED, ("same", round)).expect("associate");
            lab.fire_path(p, EventMask::FILE_MODIFIED);
            prop_assert!(port.dissociate_path(p).unwrap_err().is_not_associated());
        }
        for round in 0..rounds {
            let event = poll(&port);
            prop_assert_eq!(event.token, ("same", round));
        }
        prop_assert!(port.snapshot().is_empty());
    }
}

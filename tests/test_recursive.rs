mod common;

use common::runtime;
use mir::{Context, PolicyKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

fn fib_seq(n: u64) -> u64 {
    if n < 2 { n } else { fib_seq(n - 1) + fib_seq(n - 2) }
}

fn fib(ctx: &Context, n: u64, cutoff: u64, result: Arc<AtomicU64>) {
    if n <= cutoff {
        result.fetch_add(fib_seq(n), Ordering::Relaxed);
        return;
    }
    let left = result.clone();
    ctx.spawn(move |ctx| fib(ctx, n - 1, cutoff, left));
    ctx.spawn(move |ctx| fib(ctx, n - 2, cutoff, result));
    ctx.wait();
}

#[test]
fn test_fib_30_work_stealing_deque() {
    let rt = runtime(4, PolicyKind::WsDe).build().unwrap();
    let result = Arc::new(AtomicU64::new(0));
    let sum = result.clone();
    rt.spawn(move |ctx| fib(ctx, 30, 15, sum));
    rt.wait();
    assert_eq!(result.load(Ordering::Relaxed), 832_040);
    rt.destroy().unwrap();
}

#[test]
fn test_fib_every_policy() {
    for policy in PolicyKind::ALL {
        let rt = runtime(4, policy).build().unwrap();
        let result = Arc::new(AtomicU64::new(0));
        let sum = result.clone();
        rt.spawn(move |ctx| fib(ctx, 22, 8, sum));
        rt.wait();
        assert_eq!(result.load(Ordering::Relaxed), 17_711, "policy {policy}");
        rt.destroy().unwrap();
    }
}

#[test]
fn test_fib_with_handles() {
    // Each level waits for its two children by handle instead of `wait`.
    fn fib_handles(ctx: &Context, n: u64) -> u64 {
        if n < 2 {
            return n;
        }
        let left = Arc::new(AtomicU64::new(0));
        let slot = left.clone();
        let handle = ctx
            .task(move |ctx| slot.store(fib_handles(ctx, n - 1), Ordering::Relaxed))
            .spawn_handle()
            .unwrap();
        let right = fib_handles(ctx, n - 2);
        ctx.wait_for(&handle);
        left.load(Ordering::Relaxed) + right
    }

    let rt = runtime(4, PolicyKind::Ws).build().unwrap();
    let result = Arc::new(AtomicU64::new(0));
    let slot = result.clone();
    rt.spawn(move |ctx| slot.store(fib_handles(ctx, 18), Ordering::Relaxed));
    rt.wait();
    assert_eq!(result.load(Ordering::Relaxed), 2_584);
    rt.destroy().unwrap();
}

#[test]
fn test_fib_on_single_worker() {
    let rt = runtime(1, PolicyKind::CentralStack).build().unwrap();
    let result = Arc::new(AtomicU64::new(0));
    let sum = result.clone();
    rt.spawn(move |ctx| fib(ctx, 20, 5, sum));
    rt.wait();
    assert_eq!(result.load(Ordering::Relaxed), 6_765);
    rt.destroy().unwrap();
}

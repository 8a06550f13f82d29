use mir::{Context, Runtime};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const FIB_N: u64 = 30;
const FIB_CUTOFF: u64 = 15;
const SORT_LEN: usize = 1 << 20;
const SORT_CUTOFF: usize = 4096;

fn fib_seq(n: u64) -> u64 {
    if n < 2 { n } else { fib_seq(n - 1) + fib_seq(n - 2) }
}

fn fib(ctx: &Context, n: u64, result: Arc<AtomicU64>) {
    if n <= FIB_CUTOFF {
        result.fetch_add(fib_seq(n), Ordering::Relaxed);
        return;
    }
    let left = result.clone();
    ctx.spawn(move |ctx| fib(ctx, n - 1, left));
    let right = result;
    ctx.spawn(move |ctx| fib(ctx, n - 2, right));
    ctx.wait();
}

/// Sorts `data[lo..hi]` in place, splitting into tasks above the cutoff.
fn sort(ctx: &Context, data: SharedSlice, lo: usize, hi: usize) {
    if hi - lo <= SORT_CUTOFF {
        // SAFETY: sibling tasks own disjoint ranges.
        unsafe { data.range(lo, hi) }.sort_unstable();
        return;
    }
    let mid = lo + (hi - lo) / 2;
    ctx.spawn(move |ctx| sort(ctx, data, lo, mid));
    ctx.spawn(move |ctx| sort(ctx, data, mid, hi));
    ctx.wait();

    // SAFETY: both halves are sorted and no other task touches this range.
    let merged = {
        let slice = unsafe { data.range(lo, hi) };
        let (left, right) = slice.split_at(mid - lo);
        let mut merged = Vec::with_capacity(hi - lo);
        let (mut i, mut j) = (0, 0);
        while i < left.len() && j < right.len() {
            if left[i] <= right[j] {
                merged.push(left[i]);
                i += 1;
            } else {
                merged.push(right[j]);
                j += 1;
            }
        }
        merged.extend_from_slice(&left[i..]);
        merged.extend_from_slice(&right[j..]);
        merged
    };
    // SAFETY: as above; the borrow used for merging has ended.
    unsafe { data.range(lo, hi) }.copy_from_slice(&merged);
}

/// A slice whose disjoint ranges are handed to different tasks.
#[derive(Clone, Copy)]
struct SharedSlice {
    ptr: *mut u32,
    len: usize,
}

// SAFETY: tasks only ever access disjoint ranges, joined by `wait`.
unsafe impl Send for SharedSlice {}

impl SharedSlice {
    /// # Safety
    ///
    /// No other live reference may overlap `lo..hi`.
    unsafe fn range<'a>(self, lo: usize, hi: usize) -> &'a mut [u32] {
        assert!(lo <= hi && hi <= self.len);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(lo), hi - lo) }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let rt = match Runtime::from_env() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("MIR_ERR: {err}");
            return ExitCode::FAILURE;
        }
    };
    println!(
        "MIR runtime on {} with {} workers, policy {}\n",
        rt.arch().name(),
        rt.num_workers(),
        rt.policy_name()
    );

    println!("fib({FIB_N}) with cutoff {FIB_CUTOFF}");
    let start = Instant::now();
    let result = Arc::new(AtomicU64::new(0));
    let sum = result.clone();
    rt.task(move |ctx| fib(ctx, FIB_N, sum))
        .name("fib")
        .spawn()
        .expect("valid task name");
    rt.wait();
    let value = result.load(Ordering::Relaxed);
    println!("  result {value} in {:?}", start.elapsed());
    let fib_ok = value == fib_seq(FIB_N);

    println!("sort of {SORT_LEN} reverse-ordered values");
    let mut data: Vec<u32> = (0..SORT_LEN as u32).rev().collect();
    let shared = SharedSlice {
        ptr: data.as_mut_ptr(),
        len: data.len(),
    };
    let start = Instant::now();
    rt.spawn(move |ctx| sort(ctx, shared, 0, shared.len));
    rt.wait();
    let sort_ok = data.windows(2).all(|w| w[0] <= w[1]);
    println!("  sorted {} in {:?}\n", sort_ok, start.elapsed());

    let config = rt.config().clone();
    match rt.destroy() {
        Ok(report) => {
            if let Err(err) = report.write_enabled(&config, ".") {
                eprintln!("cannot write report: {err}");
            }
            println!("{} tasks panicked", report.panicked_tasks);
        }
        Err(err) => {
            eprintln!("shutdown error: {err}");
            return ExitCode::FAILURE;
        }
    }

    if fib_ok && sort_ok {
        println!("Success!");
        ExitCode::SUCCESS
    } else {
        println!("Failure!");
        ExitCode::FAILURE
    }
}

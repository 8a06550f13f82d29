mod common;

use common::{assert_aborts, in_child, runtime};
use mir::PolicyKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[test]
fn test_destroy_without_wait() {
    let rt = runtime(4, PolicyKind::Ws).build().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let count = count.clone();
        rt.spawn(move |_| {
            thread::sleep(Duration::from_micros(100));
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    rt.destroy().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 100);
}

#[test]
fn test_destroy_waits_for_detached_grandchildren() {
    // Children are never waited on by their parents.
    let rt = runtime(3, PolicyKind::WsDe).build().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = count.clone();
    rt.spawn(move |ctx| {
        for _ in 0..10 {
            let count = count_clone.clone();
            ctx.spawn(move |ctx| {
                let count = count.clone();
                ctx.spawn(move |_| {
                    thread::sleep(Duration::from_millis(1));
                    count.fetch_add(1, Ordering::SeqCst);
                });
            });
        }
    });
    rt.destroy().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 10);
}

#[test]
fn test_idle_shutdown() {
    for policy in PolicyKind::ALL {
        let rt = runtime(4, policy).build().unwrap();
        let report = rt.destroy().unwrap();
        assert_eq!(report.tasks_executed(), 0);
        assert_eq!(report.workers.len(), 4);
    }
}

#[test]
fn test_drop_without_destroy() {
    let count = Arc::new(AtomicUsize::new(0));
    {
        let rt = runtime(2, PolicyKind::Central).build().unwrap();
        for _ in 0..10 {
            let count = count.clone();
            rt.spawn(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
    }
    assert_eq!(count.load(Ordering::SeqCst), 10);
}

#[test]
fn test_sequential_runtimes_on_one_thread() {
    for round in 0..5 {
        let rt = runtime(2, PolicyKind::Ws).build().unwrap();
        assert_eq!(mir::with_current(|ctx| ctx.worker_id()), Some(0), "round {round}");
        rt.spawn(|_| {});
        rt.destroy().unwrap();
        assert!(mir::with_current(|ctx| ctx.worker_id()).is_none());
    }
}

#[test]
fn test_runtime_inside_task_is_refused() {
    let rt = runtime(2, PolicyKind::Ws).build().unwrap();
    let refused = Arc::new(AtomicUsize::new(0));
    let refused_clone = refused.clone();
    rt.spawn(move |_| {
        if let Err(mir::Error::RuntimeActive) = runtime(1, PolicyKind::Central).build() {
            refused_clone.fetch_add(1, Ordering::SeqCst);
        }
    });
    rt.wait();
    rt.destroy().unwrap();
    assert_eq!(refused.load(Ordering::SeqCst), 1);
    assert!(mir::with_current(|_| ()).is_none());
}

#[test]
fn test_queue_full_without_inlining_aborts() {
    if in_child() {
        let rt = runtime(1, PolicyKind::Central)
            .queue_capacity(2)
            .inline_when_full(false)
            .build()
            .unwrap();
        for _ in 0..3 {
            rt.spawn(|_| {});
        }
        return;
    }
    assert_aborts(
        "test_queue_full_without_inlining_aborts",
        "queue capacity 2 reached",
    );
}

#[test]
fn test_queue_full_inside_task_aborts() {
    if in_child() {
        let rt = runtime(1, PolicyKind::Central)
            .queue_capacity(2)
            .inline_when_full(false)
            .build()
            .unwrap();
        // The overflow happens in a task body, where panics are caught.
        rt.spawn(|ctx| {
            for _ in 0..3 {
                ctx.spawn(|_| {});
            }
            ctx.wait();
        });
        rt.wait();
        rt.destroy().unwrap();
        return;
    }
    assert_aborts("test_queue_full_inside_task_aborts", "queue capacity 2 reached");
}

#[test]
fn test_private_queue_full_aborts() {
    if in_child() {
        // Inlining only absorbs policy overflow, never a private queue.
        let rt = runtime(1, PolicyKind::Ws).queue_capacity(2).build().unwrap();
        rt.spawn(|ctx| {
            for _ in 0..3 {
                ctx.task(|_| {}).on_worker(0).spawn().unwrap();
            }
            ctx.wait();
        });
        rt.wait();
        rt.destroy().unwrap();
        return;
    }
    assert_aborts("test_private_queue_full_aborts", "queue capacity 2 reached");
}

#[test]
fn test_stats_files_written() {
    let dir = std::env::temp_dir().join(format!("mir-stats-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let rt = runtime(2, PolicyKind::Ws)
        .worker_stats(true)
        .task_stats(true)
        .recorder(true)
        .build()
        .unwrap();
    let config = rt.config().clone();
    for _ in 0..10 {
        rt.spawn(|_| {});
    }
    rt.wait();
    let report = rt.destroy().unwrap();
    report.write_enabled(&config, &dir).unwrap();

    let workers = std::fs::read_to_string(dir.join(mir::stats::WORKER_STATS_FILE)).unwrap();
    assert_eq!(workers.lines().count(), 3);
    let tasks = std::fs::read_to_string(dir.join(mir::stats::TASK_STATS_FILE)).unwrap();
    assert_eq!(tasks.lines().count(), 11);
    let trace = std::fs::read_to_string(dir.join(mir::recorder::TRACE_FILE)).unwrap();
    assert!(trace.contains("\"name\":\"task\""));

    std::fs::remove_dir_all(&dir).unwrap();
}

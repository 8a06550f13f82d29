mod common;

use common::runtime;
use mir::{Context, PolicyKind};
use std::sync::{Arc, Mutex};

const LEN: usize = 1 << 16;
const CUTOFF: usize = 512;

/// Sorts `data` with a task per half above the cutoff. Each task owns its
/// half and hands it back through a slot, so the test needs no unsafe code.
fn mergesort(ctx: &Context, data: Vec<i64>) -> Vec<i64> {
    if data.len() <= CUTOFF {
        let mut data = data;
        data.sort_unstable();
        return data;
    }
    let mut left = data;
    let right = left.split_off(left.len() / 2);

    let left_slot = Arc::new(Mutex::new(Vec::new()));
    let right_slot = Arc::new(Mutex::new(Vec::new()));
    let (ls, rs) = (left_slot.clone(), right_slot.clone());
    ctx.spawn(move |ctx| *ls.lock().unwrap() = mergesort(ctx, left));
    ctx.spawn(move |ctx| *rs.lock().unwrap() = mergesort(ctx, right));
    ctx.wait();

    let left = std::mem::take(&mut *left_slot.lock().unwrap());
    let right = std::mem::take(&mut *right_slot.lock().unwrap());
    merge(&left, &right)
}

fn merge(left: &[i64], right: &[i64]) -> Vec<i64> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if left[i] <= right[j] {
            out.push(left[i]);
            i += 1;
        } else {
            out.push(right[j]);
            j += 1;
        }
    }
    out.extend_from_slice(&left[i..]);
    out.extend_from_slice(&right[j..]);
    out
}

/// Reverse-sorted, half of it negative.
fn reversed_input() -> Vec<i64> {
    let half = (LEN / 2) as i64;
    (-half..half).rev().collect()
}

fn sort_with(policy: PolicyKind, input: Vec<i64>) -> Vec<i64> {
    let rt = runtime(4, policy).build().unwrap();
    let output = Arc::new(Mutex::new(Vec::new()));
    let slot = output.clone();
    rt.spawn(move |ctx| *slot.lock().unwrap() = mergesort(ctx, input));
    rt.wait();
    rt.destroy().unwrap();
    std::mem::take(&mut *output.lock().unwrap())
}

fn check_policy(policy: PolicyKind) {
    let input = reversed_input();
    let mut expected = input.clone();
    expected.sort();
    let output = sort_with(policy, input);
    assert_eq!(output.len(), LEN, "policy {policy}");
    assert!(output == expected, "policy {policy} sorted differently");
}

#[test]
fn test_sort_central() {
    check_policy(PolicyKind::Central);
}

#[test]
fn test_sort_central_stack() {
    check_policy(PolicyKind::CentralStack);
}

#[test]
fn test_sort_work_stealing() {
    check_policy(PolicyKind::Ws);
}

#[test]
fn test_sort_work_stealing_by_node() {
    check_policy(PolicyKind::WsDeNode);
}

#[test]
fn test_every_policy_sorts_alike() {
    let input = reversed_input();
    assert_eq!(input.first(), Some(&((LEN / 2) as i64 - 1)));
    assert_eq!(input.last(), Some(&-((LEN / 2) as i64)));

    let reference = sort_with(PolicyKind::Central, input.clone());
    for policy in PolicyKind::ALL {
        assert!(sort_with(policy, input.clone()) == reference, "policy {policy}");
    }
}

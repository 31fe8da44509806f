#![allow(dead_code)]
use vec_scatter::algs::communicator::{Communicator, ThreadComm};
use vec_scatter::data::layout::ArrayLayout;

/// Run `f` once per rank of an `n`-rank thread group and collect the
/// results in rank order.
pub fn run_ranks<R, F>(n: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(ThreadComm) -> R + Sync,
{
    let comms = ThreadComm::group(n);
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = &f;
                s.spawn(move || f(comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// Local part of the global array `0, 1, 2, ...` (as f64) under `layout`.
pub fn iota_part(layout: &ArrayLayout) -> Vec<f64> {
    layout.ownership_range().map(|g| g as f64).collect()
}

/// Even split of `n` elements over the group of `comm`.
pub fn split<C: Communicator>(comm: &C, n: usize) -> ArrayLayout {
    ArrayLayout::split(comm, n)
}

/// Concatenate per-rank pieces into the global array.
pub fn concat<T: Clone>(parts: &[Vec<T>]) -> Vec<T> {
    parts.iter().flat_map(|p| p.iter().cloned()).collect()
}

mod util;

use util::{concat, iota_part, run_ranks, split};
use vec_scatter::prelude::*;

fn go<C: Communicator>(
    plan: &mut VecScatter<f64, C>,
    x: &[f64],
    y: &mut [f64],
    mode: CombineMode,
    dir: Direction,
) {
    plan.begin(x, y, mode, dir).unwrap();
    plan.end(x, y, mode, dir).unwrap();
}

#[test]
fn owned_ranges_become_local_extraction() {
    let out = run_ranks(2, |comm| {
        let from = split(&comm, 6);
        let owned = from.ownership_range();
        let ix = IndexSet::range(owned.start, owned.len());
        let mut plan = VecScatter::<f64, _>::new(
            &comm,
            &from,
            Some(&ix),
            &ArrayLayout::sequential(3),
            Some(&IndexSet::range(0, 3)),
        )
        .unwrap();
        let x = iota_part(&from);
        let mut y = vec![0.0; 3];
        go(&mut plan, &x, &mut y, CombineMode::Insert, Direction::Forward);
        (plan.specialization(), y)
    });
    assert_eq!(out[0], (Specialization::LocalExtraction, vec![0.0, 1.0, 2.0]));
    assert_eq!(out[1], (Specialization::LocalExtraction, vec![3.0, 4.0, 5.0]));
}

#[test]
fn full_requests_broadcast_to_all() {
    let out = run_ranks(3, |comm| {
        let from = split(&comm, 7);
        let to = ArrayLayout::sequential(7);
        let mut plan = VecScatter::<f64, _>::new(&comm, &from, None, &to, None).unwrap();
        let x = iota_part(&from);
        let mut y = vec![0.0; 7];
        go(&mut plan, &x, &mut y, CombineMode::Insert, Direction::Forward);

        let mut back = vec![0.0; x.len()];
        let doubled: Vec<f64> = y.iter().map(|v| v * 2.0).collect();
        go(&mut plan, &doubled, &mut back, CombineMode::Insert, Direction::Reverse);
        (plan.specialization(), y, back)
    });
    let expected: Vec<f64> = (0..7).map(f64::from).collect();
    for (label, y, _) in &out {
        assert_eq!(*label, Specialization::ToAll);
        assert_eq!(y, &expected);
    }
    let backs: Vec<Vec<f64>> = out.into_iter().map(|(_, _, b)| b).collect();
    let doubled: Vec<f64> = expected.iter().map(|v| v * 2.0).collect();
    assert_eq!(concat(&backs), doubled);
}

#[test]
fn reverse_to_all_reduces_every_rank() {
    let out = run_ranks(3, |comm| {
        let from = split(&comm, 5);
        let to = ArrayLayout::sequential(5);
        let mut plan = VecScatter::<f64, _>::new(&comm, &from, None, &to, None).unwrap();
        let full = vec![(comm.rank() + 1) as f64; 5];
        let mut y = vec![0.5; from.local_len()];
        go(&mut plan, &full, &mut y, CombineMode::Add, Direction::Reverse);
        let mut m = vec![0.0; from.local_len()];
        go(&mut plan, &full, &mut m, CombineMode::Max, Direction::Reverse);
        (y, m)
    });
    for (y, m) in out {
        assert!(y.iter().all(|&v| v == 6.5));
        assert!(m.iter().all(|&v| v == 3.0));
    }
}

#[test]
fn gather_to_one_and_back() {
    let n = 7;
    let out = run_ranks(3, |comm| {
        let from = split(&comm, n);
        let root = comm.rank() == 0;
        let len = if root { n } else { 0 };
        let to = ArrayLayout::sequential(len);
        let set = IndexSet::range(0, len);
        let mut plan = VecScatter::<f64, _>::new(&comm, &from, Some(&set), &to, Some(&set)).unwrap();
        let x = iota_part(&from);
        let mut y = vec![0.0; len];
        go(&mut plan, &x, &mut y, CombineMode::Insert, Direction::Forward);

        let scaled: Vec<f64> = y.iter().map(|v| v * 10.0).collect();
        let mut back = vec![1.0; from.local_len()];
        go(&mut plan, &scaled, &mut back, CombineMode::Add, Direction::Reverse);
        (plan.specialization(), y, back)
    });
    let expected: Vec<f64> = (0..n).map(|v| v as f64).collect();
    assert_eq!(out[0].1, expected);
    assert!(out[1].1.is_empty() && out[2].1.is_empty());
    for (label, _, _) in &out {
        assert_eq!(*label, Specialization::ToOne);
    }
    let backs: Vec<Vec<f64>> = out.into_iter().map(|(_, _, b)| b).collect();
    let want: Vec<f64> = expected.iter().map(|v| v * 10.0 + 1.0).collect();
    assert_eq!(concat(&backs), want);
}

#[test]
fn blocked_plan_matches_general_plan() {
    let out = run_ranks(2, |comm| {
        let from = ArrayLayout::from_local_sizes(&[4, 4], comm.rank()).unwrap();
        let to = ArrayLayout::sequential(4);
        let iy = IndexSet::range(0, 4);
        let x = iota_part(&from);

        let blocks = IndexSet::block(2, vec![3, 0]).unwrap();
        let mut blocked = VecScatter::<f64, _>::new(&comm, &from, Some(&blocks), &to, Some(&iy)).unwrap();
        let mut a = vec![0.0; 4];
        go(&mut blocked, &x, &mut a, CombineMode::Insert, Direction::Forward);

        let general = IndexSet::general(vec![6, 7, 0, 1]);
        let mut plain = VecScatter::<f64, _>::new(&comm, &from, Some(&general), &to, Some(&iy)).unwrap();
        let mut b = vec![0.0; 4];
        go(&mut plain, &x, &mut b, CombineMode::Insert, Direction::Forward);
        (blocked.specialization(), plain.specialization(), a, b)
    });
    for (blocked, plain, a, b) in out {
        assert_eq!(blocked, Specialization::Blocked { bs: 2 });
        assert_eq!(plain, Specialization::General);
        assert_eq!(a, vec![6.0, 7.0, 0.0, 1.0]);
        assert_eq!(a, b);
    }
}

#[test]
fn general_distributed_to_sequential() {
    let out = run_ranks(3, |comm| {
        let r = comm.rank();
        let from = split(&comm, 7);
        let ix = IndexSet::general(vec![6 - r, r, 3]);
        let to = ArrayLayout::sequential(3);
        let mut plan = VecScatter::<f64, _>::new(&comm, &from, Some(&ix), &to, None).unwrap();
        let x = iota_part(&from);
        let mut y = vec![0.0; 3];
        go(&mut plan, &x, &mut y, CombineMode::Insert, Direction::Forward);
        (plan.specialization(), y)
    });
    for (r, (label, y)) in out.into_iter().enumerate() {
        assert_eq!(label, Specialization::General);
        assert_eq!(y, vec![(6 - r) as f64, r as f64, 3.0]);
    }
}

#[test]
fn general_sequential_to_distributed() {
    let out = run_ranks(2, |comm| {
        let r = comm.rank();
        let from = ArrayLayout::sequential(2);
        let to = split(&comm, 4);
        let iy = if r == 0 {
            IndexSet::general(vec![3, 0])
        } else {
            IndexSet::general(vec![1, 2])
        };
        let mut plan = VecScatter::<f64, _>::new(&comm, &from, None, &to, Some(&iy)).unwrap();
        let base = 10.0 * (r + 1) as f64;
        let x = vec![base, base + 1.0];
        let mut y = vec![0.0; to.local_len()];
        go(&mut plan, &x, &mut y, CombineMode::Insert, Direction::Forward);
        (plan.specialization(), y)
    });
    assert!(out.iter().all(|(label, _)| *label == Specialization::General));
    let parts: Vec<Vec<f64>> = out.into_iter().map(|(_, y)| y).collect();
    assert_eq!(concat(&parts), vec![11.0, 20.0, 21.0, 10.0]);
}

#[test]
fn redistribution_round_trips() {
    let out = run_ranks(3, |comm| {
        let from = split(&comm, 9);
        let to = ArrayLayout::from_local_sizes(&[2, 3, 4], comm.rank()).unwrap();
        let owned = from.ownership_range();
        let set = IndexSet::range(owned.start, owned.len());
        let mut plan = VecScatter::<f64, _>::new(&comm, &from, Some(&set), &to, Some(&set)).unwrap();
        let x = iota_part(&from);
        let mut y = vec![0.0; to.local_len()];
        go(&mut plan, &x, &mut y, CombineMode::Insert, Direction::Forward);
        let mut back = vec![0.0; x.len()];
        go(&mut plan, &y, &mut back, CombineMode::Insert, Direction::Reverse);
        (plan.specialization(), x, y, back)
    });
    let ys: Vec<Vec<f64>> = out.iter().map(|o| o.2.clone()).collect();
    assert_eq!(ys[0].len(), 2);
    assert_eq!(concat(&ys), (0..9).map(f64::from).collect::<Vec<_>>());
    for (label, x, _, back) in out {
        assert_eq!(label, Specialization::General);
        assert_eq!(back, x);
    }
}

#[test]
fn default_sets_copy_owned_parts_between_matching_layouts() {
    let out = run_ranks(2, |comm| {
        let layout = split(&comm, 5);
        let mut plan = VecScatter::<f64, _>::new(&comm, &layout, None, &layout, None).unwrap();
        let x = iota_part(&layout);
        let mut y = vec![0.0; x.len()];
        go(&mut plan, &x, &mut y, CombineMode::Insert, Direction::Forward);
        (x, y)
    });
    for (x, y) in out {
        assert_eq!(x, y);
    }
}

#[test]
fn shared_destination_combines_in_any_order() {
    let out = run_ranks(3, |comm| {
        let r = comm.rank();
        let from = ArrayLayout::sequential(1);
        let to = split(&comm, 3);
        let iy = IndexSet::general(vec![0]);
        let mut plan = VecScatter::<f64, _>::new(&comm, &from, None, &to, Some(&iy)).unwrap();
        let x = vec![(r + 1) as f64];
        let mut sum = vec![0.5; 1];
        go(&mut plan, &x, &mut sum, CombineMode::Add, Direction::Forward);
        let mut max = vec![0.5; 1];
        go(&mut plan, &x, &mut max, CombineMode::Max, Direction::Forward);
        (sum, max)
    });
    assert_eq!(out[0], (vec![6.5], vec![3.0]));
    assert_eq!(out[1], (vec![0.5], vec![0.5]));
    assert_eq!(out[2], (vec![0.5], vec![0.5]));
}

#[test]
fn one_dissenting_rank_forces_the_general_plan() {
    let out = run_ranks(2, |comm| {
        let from = split(&comm, 6);
        let owned = from.ownership_range();
        let ix = if comm.rank() == 0 {
            IndexSet::range(owned.start, owned.len())
        } else {
            IndexSet::general(owned.clone().collect::<Vec<_>>())
        };
        let to = ArrayLayout::sequential(3);
        let mut plan = VecScatter::<f64, _>::new(&comm, &from, Some(&ix), &to, None).unwrap();
        let x = iota_part(&from);
        let mut y = vec![0.0; 3];
        go(&mut plan, &x, &mut y, CombineMode::Insert, Direction::Forward);
        (plan.specialization(), y)
    });
    assert_eq!(out[0], (Specialization::General, vec![0.0, 1.0, 2.0]));
    assert_eq!(out[1], (Specialization::General, vec![3.0, 4.0, 5.0]));
}

#[test]
fn split_phase_guards_hold_on_every_rank() {
    let out = run_ranks(2, |comm| {
        let r = comm.rank();
        let from = split(&comm, 4);
        let ix = IndexSet::general(vec![3 - 2 * r, 2 - 2 * r]);
        let to = ArrayLayout::sequential(2);
        let mut plan = VecScatter::<f64, _>::new(&comm, &from, Some(&ix), &to, None).unwrap();
        let x = iota_part(&from);
        let mut y = vec![0.0; 2];

        plan.begin(&x, &mut y, CombineMode::Insert, Direction::Forward).unwrap();
        let twice = plan.begin(&x, &mut y, CombineMode::Insert, Direction::Forward);
        let mismatch = plan.end(&x, &mut y, CombineMode::Add, Direction::Forward);
        let idle = !plan.is_in_use();

        let mut z = vec![0.0; 2];
        go(&mut plan, &x, &mut z, CombineMode::Insert, Direction::Forward);
        (
            matches!(twice, Err(ScatterError::WrongState(_))),
            matches!(mismatch, Err(ScatterError::WrongState(_))),
            idle,
            z,
        )
    });
    assert_eq!(out[0], (true, true, true, vec![3.0, 2.0]));
    assert_eq!(out[1], (true, true, true, vec![1.0, 0.0]));
}

#[test]
fn identity_remap_on_a_peer_plan() {
    let out = run_ranks(2, |comm| {
        let r = comm.rank();
        let from = split(&comm, 6);
        let ix = IndexSet::general(vec![5 - r, r, 3]);
        let to = ArrayLayout::sequential(3);
        let x = iota_part(&from);

        let mut plain = VecScatter::<f64, _>::new(&comm, &from, Some(&ix), &to, None).unwrap();
        let mut remapped = plain.copy().unwrap();
        let identity: Vec<usize> = (0..x.len()).collect();
        remapped.remap(Some(&identity), None).unwrap();

        let (mut a, mut b) = (vec![0.0; 3], vec![0.0; 3]);
        go(&mut plain, &x, &mut a, CombineMode::Insert, Direction::Forward);
        go(&mut remapped, &x, &mut b, CombineMode::Insert, Direction::Forward);
        (remapped.recorded_lens(), a, b)
    });
    for (lens, a, b) in out {
        assert_eq!(lens, None);
        assert_eq!(a, b);
    }
}

#[test]
fn collective_plans_refuse_remap() {
    let out = run_ranks(2, |comm| {
        let from = split(&comm, 4);
        let to = ArrayLayout::sequential(4);
        let mut plan = VecScatter::<f64, _>::new(&comm, &from, None, &to, None).unwrap();
        let identity: Vec<usize> = (0..from.local_len()).collect();
        matches!(
            plan.remap(Some(&identity), None),
            Err(ScatterError::UnsupportedOperation(_))
        )
    });
    assert_eq!(out, vec![true, true]);
}

#[test]
fn peer_plan_views_list_neighbours() {
    let out = run_ranks(2, |comm| {
        let r = comm.rank();
        let from = split(&comm, 4);
        let ix = IndexSet::general(vec![3 - 2 * r]);
        let to = ArrayLayout::sequential(1);
        let plan = VecScatter::<f64, _>::new(&comm, &from, Some(&ix), &to, None).unwrap();
        let json: serde_json::Value = serde_json::from_str(&plan.view_json().unwrap()).unwrap();
        (json["detail"]["kind"].clone(), json["detail"]["sends"][0]["rank"].clone())
    });
    assert_eq!(out[0].0, "peer");
    assert_eq!(out[0].1, 1);
    assert_eq!(out[1].1, 0);
}

#[test]
fn sequential_into_owned_range_is_local_extraction() {
    let out = run_ranks(2, |comm| {
        let to = split(&comm, 6);
        let owned = to.ownership_range();
        let from = ArrayLayout::sequential(4);
        let ix = IndexSet::range(1, 3);
        let iy = IndexSet::range(owned.start, owned.len());
        let mut plan = VecScatter::<f64, _>::new(&comm, &from, Some(&ix), &to, Some(&iy)).unwrap();
        let base = 6.0 * comm.rank() as f64;
        let x: Vec<f64> = (0..4).map(|v| base + 6.0 + v as f64).collect();
        let mut y = vec![0.0; to.local_len()];
        go(&mut plan, &x, &mut y, CombineMode::Insert, Direction::Forward);
        (plan.specialization(), y)
    });
    assert_eq!(out[0], (Specialization::LocalExtraction, vec![7.0, 8.0, 9.0]));
    assert_eq!(out[1], (Specialization::LocalExtraction, vec![13.0, 14.0, 15.0]));
}

#[test]
fn sequential_to_distributed_blocks_match_general() {
    let out = run_ranks(2, |comm| {
        let r = comm.rank();
        let from = ArrayLayout::sequential(4);
        let to = ArrayLayout::from_local_sizes(&[4, 4], r).unwrap();
        let x: Vec<f64> = (0..4).map(|v| (10 * (r + 1) + v) as f64).collect();
        // rank 0 fills blocks 3 and 1, rank 1 fills blocks 0 and 2
        let blocks = if r == 0 { vec![3, 1] } else { vec![0, 2] };
        let elements: Vec<usize> = blocks.iter().flat_map(|b| [2 * b, 2 * b + 1]).collect();

        let iy = IndexSet::block(2, blocks).unwrap();
        let mut blocked = VecScatter::<f64, _>::new(&comm, &from, None, &to, Some(&iy)).unwrap();
        let mut a = vec![1.0; 4];
        go(&mut blocked, &x, &mut a, CombineMode::Add, Direction::Forward);

        let iy = IndexSet::general(elements);
        let mut plain = VecScatter::<f64, _>::new(&comm, &from, None, &to, Some(&iy)).unwrap();
        let mut b = vec![1.0; 4];
        go(&mut plain, &x, &mut b, CombineMode::Add, Direction::Forward);

        let doubled: Vec<f64> = a.iter().map(|v| (v - 1.0) * 2.0).collect();
        let mut back = vec![0.0; 4];
        go(&mut blocked, &doubled, &mut back, CombineMode::Insert, Direction::Reverse);
        (blocked.specialization(), plain.specialization(), a, b, x, back)
    });
    let a_parts: Vec<Vec<f64>> = out.iter().map(|o| o.2.clone()).collect();
    assert_eq!(
        concat(&a_parts),
        vec![21.0, 22.0, 13.0, 14.0, 23.0, 24.0, 11.0, 12.0]
    );
    for (blocked, plain, a, b, x, back) in out {
        assert_eq!(blocked, Specialization::Blocked { bs: 2 });
        assert_eq!(plain, Specialization::General);
        assert_eq!(a, b);
        let want: Vec<f64> = x.iter().map(|v| v * 2.0).collect();
        assert_eq!(back, want);
    }
}

#[test]
fn to_all_matches_the_general_plan() {
    let n = 7;
    let out = run_ranks(3, |comm| {
        let from = split(&comm, n);
        let to = ArrayLayout::sequential(n);
        let x = iota_part(&from);
        let mut fast = VecScatter::<f64, _>::new(&comm, &from, None, &to, None).unwrap();
        let table = IndexSet::general((0..n).collect::<Vec<_>>());
        let mut slow =
            VecScatter::<f64, _>::new(&comm, &from, Some(&table), &to, Some(&table)).unwrap();

        let (mut a, mut b) = (vec![1.0; n], vec![1.0; n]);
        go(&mut fast, &x, &mut a, CombineMode::Add, Direction::Forward);
        go(&mut slow, &x, &mut b, CombineMode::Add, Direction::Forward);

        let full = vec![(comm.rank() + 1) as f64; n];
        let (mut c, mut d) = (vec![0.5; x.len()], vec![0.5; x.len()]);
        go(&mut fast, &full, &mut c, CombineMode::Add, Direction::Reverse);
        go(&mut slow, &full, &mut d, CombineMode::Add, Direction::Reverse);
        (fast.specialization(), slow.specialization(), a, b, c, d)
    });
    for (fast, slow, a, b, c, d) in out {
        assert_eq!(fast, Specialization::ToAll);
        assert_eq!(slow, Specialization::General);
        assert_eq!(a, b);
        assert_eq!(c, d);
        assert!(c.iter().all(|&v| v == 6.5));
    }
}

#[test]
fn to_one_matches_the_general_plan() {
    let n = 5;
    let out = run_ranks(2, |comm| {
        let root = comm.rank() == 0;
        let len = if root { n } else { 0 };
        let from = split(&comm, n);
        let to = ArrayLayout::sequential(len);
        let x = iota_part(&from);
        let set = IndexSet::range(0, len);
        let mut fast = VecScatter::<f64, _>::new(&comm, &from, Some(&set), &to, Some(&set)).unwrap();
        let table = IndexSet::general((0..len).collect::<Vec<_>>());
        let mut slow =
            VecScatter::<f64, _>::new(&comm, &from, Some(&table), &to, Some(&table)).unwrap();

        let (mut a, mut b) = (vec![2.0; len], vec![2.0; len]);
        go(&mut fast, &x, &mut a, CombineMode::Max, Direction::Forward);
        go(&mut slow, &x, &mut b, CombineMode::Max, Direction::Forward);

        let (mut c, mut d) = (vec![1.0; x.len()], vec![1.0; x.len()]);
        go(&mut fast, &a, &mut c, CombineMode::Add, Direction::Reverse);
        go(&mut slow, &b, &mut d, CombineMode::Add, Direction::Reverse);
        (fast.specialization(), slow.specialization(), a, b, c, d)
    });
    assert_eq!(out[0].2, vec![2.0, 2.0, 2.0, 3.0, 4.0]);
    for (fast, slow, a, b, c, d) in out {
        assert_eq!(fast, Specialization::ToOne);
        assert_eq!(slow, Specialization::General);
        assert_eq!(a, b);
        assert_eq!(c, d);
    }
}

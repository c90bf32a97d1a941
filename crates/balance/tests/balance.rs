use pfcp_lb_balance::{Balancer, ScaleState, SessionEntry, UpfRecord};
use rand::Rng;

fn upf(n: usize) -> UpfRecord {
    UpfRecord::new(
        format!("upf-{n}"),
        format!("upf-{n}"),
        format!("10.1.0.{}:8805", n + 1).parse().unwrap(),
    )
}

/// The session map and the per-UPF lists must describe the same set of
/// sessions after any interleaving of establish/delete/rebind.
#[test]
fn binding_invariant_under_random_churn() {
    let mut rng = rand::rng();
    let lb = Balancer::default();
    for n in 0..4 {
        lb.register(upf(n));
    }

    let mut live: Vec<u64> = Vec::new();
    let mut next_seid = 1u64;

    for _ in 0..2000 {
        match rng.random_range(0..3) {
            0 => {
                let idx = lb.pick().unwrap();
                let seid = next_seid;
                next_seid += 1;
                lb.insert(SessionEntry::new(seid, seid, seid + 0x10_000, 0, idx))
                    .unwrap();
                live.push(seid);
            }
            1 if !live.is_empty() => {
                let pos = rng.random_range(0..live.len());
                let seid = live.swap_remove(pos);
                assert!(lb.remove(seid).is_some());
            }
            2 if !live.is_empty() => {
                let pos = rng.random_range(0..live.len());
                let seid = live[pos];
                let dst = rng.random_range(0..4);
                lb.rebind(seid, dst, seid + 0x20_000, seid + 0x30_000)
                    .unwrap();
            }
            _ => {}
        }

        let total: usize = (0..lb.upf_count()).map(|i| lb.session_count_of(i)).sum();
        assert_eq!(lb.session_count(), total);
        assert_eq!(lb.session_count(), live.len());
    }

    for seid in &live {
        assert!(lb.route(*seid).is_some(), "live session lost: {seid:#x}");
    }
}

/// Selection keeps the pool balanced: after N establishments over k
/// active UPFs the per-UPF counts differ by at most one.
#[test]
fn selection_spreads_evenly() {
    let lb = Balancer::default();
    for n in 0..3 {
        lb.register(upf(n));
    }

    for seid in 1..=91u64 {
        let idx = lb.pick().unwrap();
        lb.insert(SessionEntry::new(seid, seid, seid, 0, idx)).unwrap();
    }

    let counts: Vec<usize> = (0..3).map(|i| lb.session_count_of(i)).collect();
    let min = counts.iter().min().unwrap();
    let max = counts.iter().max().unwrap();
    assert!(max - min <= 1, "unbalanced counts: {counts:?}");
}

/// A draining UPF keeps its existing sessions but receives no new ones.
#[test]
fn draining_receives_no_new_sessions() {
    let lb = Balancer::default();
    let a = lb.register(upf(0));
    let b = lb.register(upf(1));
    lb.insert(SessionEntry::new(1, 1, 1, 0, a)).unwrap();
    lb.mark_draining(a).unwrap();

    for seid in 2..=5u64 {
        let idx = lb.pick().unwrap();
        assert_eq!(idx, b);
        lb.insert(SessionEntry::new(seid, seid, seid, 0, idx)).unwrap();
    }

    assert_eq!(lb.state_of(a), Some(ScaleState::Draining));
    assert_eq!(lb.sessions_of(a), vec![1]);
}

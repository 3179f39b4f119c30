// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Properties that must hold under any interleaving: pipelines preserve
//! order, groups whose members all finish always join, and turns come back
//! to the first side after an even number of handoffs.

use std::convert::Infallible;
use std::time::Duration;

use proptest::prelude::*;
use rand::Rng;

use tandem_rt::{
    buffered, Alternator, Flow, Group, Handoff, Runtime, RuntimeConfig, Side, Stage,
};

fn rt(procs: usize) -> Runtime {
    Runtime::new(RuntimeConfig::default().with_procs(procs))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn pipeline_output_is_map_of_input(
        input in prop::collection::vec(any::<i32>(), 0..64),
        cap_in in 1usize..8,
        cap_out in 1usize..8,
        procs in 1usize..4,
    ) {
        let rt = rt(procs);
        let expected: Vec<i64> = input.iter().map(|&x| i64::from(x) * 3 - 1).collect();
        let (tx, rx) = buffered::<i32>(cap_in).split();
        let (tx2, rx2) = buffered::<i64>(cap_out).split();
        let src = Stage::new(&rt).source(input, tx);
        let map = Stage::new(&rt)
            .transform(rx, tx2, |x| Ok::<_, Infallible>(i64::from(x) * 3 - 1));
        let out = Stage::new(&rt).collect(rx2);

        prop_assert_eq!(out.join().unwrap(), expected);
        src.join().unwrap();
        map.join().unwrap().unwrap();
    }

    #[test]
    fn turn_returns_to_a_after_even_handoffs(
        k in 0u64..40,
        slot in any::<bool>(),
    ) {
        let rt = rt(2);
        let handoff = if slot { Handoff::Slot } else { Handoff::Rendezvous };
        let alt = Alternator::new(&rt, handoff).start(
            Side::A,
            move |turn| if turn == k { Flow::Stop } else { Flow::Pass },
            |_| Flow::Pass,
        );
        prop_assert!(alt.join_timeout(Duration::from_secs(10)));
        prop_assert_eq!(alt.handoffs(), 2 * k);
        prop_assert_eq!(alt.holder(), Side::A);
        prop_assert_eq!(alt.stopped_by(), Some(Side::A));
    }
}

#[test]
fn groups_always_join_when_every_member_finishes() {
    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let n = rng.gen_range(1..16);
        let procs = rng.gen_range(1..4);
        let max_delay = rng.gen_range(0..3u64);
        let rt = rt(procs);
        let group = Group::new(&rt);
        group.launch(n, move |i, done| {
            let delay = (i as u64 * 7919) % (max_delay + 1);
            if delay > 0 {
                tandem_rt::time::sleep(Duration::from_millis(delay));
            } else {
                std::thread::yield_now();
            }
            done.mark_done();
        });
        assert!(
            group.join_timeout(Duration::from_secs(10)),
            "group of {} on {} procs did not join",
            n,
            procs
        );
        assert_eq!(group.outstanding(), 0);
    }
}

#[test]
fn group_join_from_root_never_reports_deadlock() {
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let n = rng.gen_range(1..12);
        let rt = rt(rng.gen_range(1..3));
        let joined = rt.block_on(|| {
            let group = Group::new(&rt);
            let (tx, rx) = buffered::<usize>(n).split();
            group.launch(n, move |i, done| {
                tx.send(i);
                done.mark_done();
            });
            group.join();
            (0..n).filter_map(|_| rx.recv()).count()
        });
        assert_eq!(joined.unwrap(), n);
    }
}

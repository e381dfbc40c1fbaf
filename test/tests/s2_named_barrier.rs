//! Spec §8 S2 — named barrier: 4 ranks, each posts 3 sends to its
//! successor then calls `barrier`; all 12 handler invocations must
//! complete before any rank observes its barrier as released.

use std::cell::RefCell;
use std::rc::Rc;

use amt_core::HandlerKind;
use amt_test::{build_ranks, drain_until};
use amt_transport::RankId;

#[test]
fn all_sends_land_before_any_rank_returns_from_barrier() {
    const WORLD: u32 = 4;
    let ranks = build_ranks(WORLD);

    let counts: Vec<Rc<RefCell<u32>>> = (0..WORLD).map(|_| Rc::new(RefCell::new(0))).collect();
    let mut pings = Vec::new();
    for (r, runtime) in ranks.iter().enumerate() {
        let counter = counts[r].clone();
        let id = runtime
            .messenger()
            .register_collective(HandlerKind::FreeFunction, move |_msg| {
                *counter.borrow_mut() += 1;
            })
            .unwrap();
        pings.push(id);
    }
    // Every rank's collective registration must agree (P8).
    assert!(pings.windows(2).all(|w| w[0] == w[1]));
    let ping = pings[0];

    for (r, runtime) in ranks.iter().enumerate() {
        let successor = RankId::new(((r as u32) + 1) % WORLD);
        for _ in 0..3 {
            runtime.messenger().send(successor, ping, b"ping", None).unwrap();
        }
    }

    let barrier_ids: Vec<_> = ranks.iter().map(|r| r.barrier()).collect();
    let released = drain_until(&ranks, 64, || {
        ranks
            .iter()
            .zip(&barrier_ids)
            .all(|(r, id)| r.barrier_is_released(*id))
    });
    assert!(released, "every rank's barrier must release (P4)");

    for counter in &counts {
        assert_eq!(*counter.borrow(), 3, "each rank must have received exactly 3 pings before release");
    }
}

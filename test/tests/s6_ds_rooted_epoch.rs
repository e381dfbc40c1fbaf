//! Spec §8 S6 — Dijkstra-Scholten rooted epoch: rank 0 opens a rooted
//! epoch and sends one message to rank 1, whose handler (running inside
//! that epoch, since the messenger pushes it onto the stack on entry)
//! sends two more to rank 2. Rank 2 sends nothing. The epoch must still
//! terminate, purely from parental-responsibility acks rippling back to
//! the root.

use std::cell::Cell;
use std::rc::Rc;

use amt_core::HandlerKind;
use amt_test::{build_ranks, drain_until};
use amt_transport::RankId;

#[test]
fn rooted_epoch_terminates_after_the_dag_of_sends_quiesces() {
    let ranks = build_ranks(3);
    let r2_hits = Rc::new(Cell::new(0u32));

    let r2_hits_cb = r2_hits.clone();
    let leaf = ranks[2]
        .messenger()
        .register_handler(HandlerKind::FreeFunction, move |_msg| {
            r2_hits_cb.set(r2_hits_cb.get() + 1);
        }, None);

    // Registered on rank 1, closing over rank 2's id and its own
    // messenger so its handler can fan further sends out when invoked.
    let r1_messenger = ranks[1].messenger();
    let relay = ranks[1].messenger().register_handler(
        HandlerKind::FreeFunction,
        move |_msg| {
            let _ = r1_messenger.send(RankId::new(2), leaf, b"leaf-a", None);
            let _ = r1_messenger.send(RankId::new(2), leaf, b"leaf-b", None);
        },
        None,
    );

    let epoch = ranks[0].open_rooted_epoch();
    ranks[0].termination().enter(epoch);
    let _ = ranks[0].messenger().send(RankId::new(1), relay, b"root", None);
    ranks[0].termination().exit(epoch);

    let terminated = drain_until(&ranks, 64, || ranks[0].termination().is_terminated(epoch));
    assert!(terminated, "rooted epoch must terminate once the DAG of sends quiesces");
    assert_eq!(r2_hits.get(), 2, "both leaf sends must have been delivered");
}

//! Spec §8 S5 — sequencer wait: rank 0 enqueues
//! `wait(H,10,A); sequenced{ wait(H,20,B); wait(H,30,C) }; sequenced{ wait(H,40,D) }`
//! then sends itself messages tagged {10, 40, 20, 30}, in that order.
//! Expected continuation order: A, B, C, D — tag 40 must not fire D until
//! after C, even though its message arrives second.

use std::cell::RefCell;
use std::rc::Rc;

use amt_core::HandlerKind;
use amt_test::{build_ranks, drain_until};
use amt_transport::RankId;

#[test]
fn out_of_order_arrivals_still_run_continuations_in_sequence_order() {
    let ranks = build_ranks(1);
    let rank = &ranks[0];
    let me = RankId::new(0);

    let handler = rank
        .messenger()
        .register_handler(HandlerKind::FreeFunction, |_msg| {}, None);

    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let seq = rank.sequencer();
    {
        let order = order.clone();
        seq.new_sequence(move |b| {
            let order_a = order.clone();
            b.wait(handler, Some(10), move |_msg| order_a.borrow_mut().push("A"));

            let order_bc = order.clone();
            b.sequenced(move |b| {
                let order_b = order_bc.clone();
                b.wait(handler, Some(20), move |_msg| order_b.borrow_mut().push("B"));
                let order_c = order_bc.clone();
                b.wait(handler, Some(30), move |_msg| order_c.borrow_mut().push("C"));
            });

            let order_d = order.clone();
            b.sequenced(move |b| {
                b.wait(handler, Some(40), move |_msg| order_d.borrow_mut().push("D"));
            });
        });
    }

    for tag in [10u64, 40, 20, 30] {
        rank.messenger().send(me, handler, b"x", Some(tag)).unwrap();
    }

    let done = drain_until(&ranks, 64, || order.borrow().len() == 4);
    assert!(done, "all four continuations must eventually run");
    assert_eq!(*order.borrow(), vec!["A", "B", "C", "D"]);
}

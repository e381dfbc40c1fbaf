//! Spec §8 S1 — hello broadcast: 2 ranks, rank 0 broadcasts a 4-byte
//! payload; every rank invokes the handler exactly once with the same
//! bytes, and the epoch terminates afterwards with produce == consume.

use std::cell::RefCell;
use std::rc::Rc;

use amt_core::HandlerKind;
use amt_test::{build_ranks, drain_until};

#[test]
fn hello_broadcast_delivers_to_every_rank_then_terminates() {
    let ranks = build_ranks(2);
    let r0 = &ranks[0];
    let r1 = &ranks[1];

    let r0_seen: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let r1_seen: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let r0_seen2 = r0_seen.clone();
    let r1_seen2 = r1_seen.clone();

    let hello0 = r0
        .messenger()
        .register_collective(HandlerKind::FreeFunction, move |msg| {
            *r0_seen2.borrow_mut() = Some(msg.payload().to_vec());
        })
        .unwrap();
    let hello1 = r1
        .messenger()
        .register_collective(HandlerKind::FreeFunction, move |msg| {
            *r1_seen2.borrow_mut() = Some(msg.payload().to_vec());
        })
        .unwrap();
    assert_eq!(hello0, hello1, "collective registration must agree across ranks (P8)");

    let epoch = r0.open_collective_epoch();
    // Every other rank must also open the same logical epoch so its wave
    // state exists when the root's decision broadcast arrives.
    let epoch1 = r1.open_collective_epoch();
    assert_eq!(epoch, epoch1);

    r0.termination().enter(epoch);
    r0.messenger().broadcast(hello0, b"ping", None, false);
    r0.termination().exit(epoch);

    let terminated = drain_until(&ranks, 64, || {
        r0.termination().is_terminated(epoch) && r1.termination().is_terminated(epoch)
    });
    assert!(terminated, "collective epoch must terminate (P1)");

    assert_eq!(r0_seen.borrow().as_deref(), Some(b"ping".as_slice()));
    assert_eq!(r1_seen.borrow().as_deref(), Some(b"ping".as_slice()));
}

//! Spec §8 S4 — put channel: rank 0 registers a handle over
//! `double[2]={-1,-1}`; rank 1 opens a put channel against it and pushes
//! `{2,3}` from its own `double[4]={2,3,4,5}`. After a fence, rank 0's
//! region must read back `{2,3}`.

use std::cell::RefCell;
use std::rc::Rc;

use amt_core::{ChannelKind, HandlerKind, RdmaHandle};
use amt_test::{build_ranks, drain_until};
use amt_transport::RankId;

#[test]
fn put_over_a_channel_then_fence_observes_the_write() {
    let ranks = build_ranks(2);
    let owner = &ranks[0];
    let putter = &ranks[1];

    let announced: Rc<RefCell<Option<RdmaHandle>>> = Rc::new(RefCell::new(None));
    let announced2 = announced.clone();
    let announce = putter
        .messenger()
        .register_collective(HandlerKind::FreeFunction, move |msg| {
            let bits = u64::from_le_bytes(msg.payload().try_into().unwrap());
            *announced2.borrow_mut() = Some(RdmaHandle::from_bits(bits));
        })
        .unwrap();
    owner
        .messenger()
        .register_collective(HandlerKind::FreeFunction, |_msg| {})
        .unwrap();

    let region: Vec<u8> = [-1.0f64, -1.0f64].iter().flat_map(|v| v.to_le_bytes()).collect();
    let handle = owner
        .rdma()
        .register_handle(Some(Rc::new(RefCell::new(region))), 16, 8);
    owner
        .messenger()
        .broadcast(announce, &handle.to_bits().to_le_bytes(), None, false);

    let arrived = drain_until(&ranks, 64, || announced.borrow().is_some());
    assert!(arrived, "handle announcement must be delivered");
    let handle = announced.borrow().unwrap();

    putter.rdma().new_channel(handle, RankId::new(1), ChannelKind::Put).unwrap();
    putter.rdma().sync_local(handle, RankId::new(1), ChannelKind::Put).unwrap();

    let source: Vec<f64> = vec![2.0, 3.0, 4.0, 5.0];
    let bytes: Vec<u8> = source[0..2].iter().flat_map(|v| v.to_le_bytes()).collect();
    putter.rdma_put(handle, 0, bytes, 9);

    // The put is a fire-and-forget control message (spec §4.6); a fence
    // is just enough ticks for it to land, the same role `barrier` plays
    // for ordinary sends.
    let id0 = owner.barrier();
    let id1 = putter.barrier();
    let released = drain_until(&ranks, 64, || owner.barrier_is_released(id0) && putter.barrier_is_released(id1));
    assert!(released, "fence (barrier) must release once the put has landed");

    let got = owner.rdma().local_copy(handle).unwrap();
    let v0 = f64::from_le_bytes(got[0..8].try_into().unwrap());
    let v1 = f64::from_le_bytes(got[8..16].try_into().unwrap());
    assert_eq!((v0, v1), (2.0, 3.0));
}

//! Spec §8 S3 — simple get: rank 0 registers a handle over `double[64]`
//! initialized to `i*1.0`; rank 1 fetches the first two elements and must
//! see `{0.0, 1.0}`.

use std::cell::RefCell;
use std::rc::Rc;

use amt_core::{HandlerKind, RdmaHandle};
use amt_test::{build_ranks, drain_until};
use amt_transport::RankId;

#[test]
fn get_returns_the_owners_first_two_elements() {
    let ranks = build_ranks(2);
    let owner = &ranks[0];
    let getter = &ranks[1];

    // Rank 0 registers the region, then announces the handle's bits over
    // an ordinary broadcast so rank 1 can reconstruct it (no
    // collective-registration step publishes an `RdmaHandle` the way a
    // collectively-registered `HandlerId` is already known everywhere).
    let announced: Rc<RefCell<Option<RdmaHandle>>> = Rc::new(RefCell::new(None));
    let announced2 = announced.clone();
    let announce = getter
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

    let region: Vec<u8> = (0..64u64).flat_map(|i| (i as f64).to_le_bytes()).collect();
    let handle = owner
        .rdma()
        .register_handle(Some(Rc::new(RefCell::new(region))), 64 * 8, 8);
    owner
        .messenger()
        .broadcast(announce, &handle.to_bits().to_le_bytes(), None, false);

    let arrived = drain_until(&ranks, 64, || announced.borrow().is_some());
    assert!(arrived, "handle announcement must be delivered");
    let handle = announced.borrow().unwrap();

    getter.rdma_get(handle, 0, 16, 7);
    let mut local = None;
    let fetched = drain_until(&ranks, 64, || {
        local = getter.rdma_get_result(RankId::new(0), 7);
        local.is_some()
    });
    assert!(fetched, "get reply must arrive");
    let bytes = local.unwrap();
    let v0 = f64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let v1 = f64::from_le_bytes(bytes[8..16].try_into().unwrap());
    assert_eq!((v0, v1), (0.0, 1.0));
}

//! Spec §8 S7 — location routing: rank 0 registers entity `E` at
//! home=rank 0; rank 1 routes a message to `E`. After `E` migrates to
//! rank 2 and a cache miss (rank 1 never learned the new location), the
//! message must be forwarded home→rank 2 and delivered exactly once.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use amt_core::config::PoolConfig;
use amt_core::{HandlerId, HandlerKind, Pool, Registry, RouteDecision};
use amt_test::{build_ranks, drain_until};
use amt_transport::RankId;

const ENTITY: u64 = 0; // round_robin_map(0, 3) == rank 0

#[test]
fn forwarded_message_reaches_the_migrated_entity_exactly_once() {
    let ranks = build_ranks(3);

    let delivered = Rc::new(Cell::new(0u32));
    let deliver_cell: Rc<RefCell<Option<HandlerId>>> = Rc::new(RefCell::new(None));

    let mut deliver_id = None;
    for (r, runtime) in ranks.iter().enumerate() {
        let location = runtime.location();
        let messenger = runtime.messenger();
        let cell = deliver_cell.clone();
        let delivered = delivered.clone();
        let is_entity_rank = r == 2;
        let id = runtime
            .messenger()
            .register_collective(HandlerKind::FreeFunction, move |msg| {
                let handler = cell.borrow().expect("handler id filled in before messages can arrive");
                match location.route(ENTITY, 0) {
                    Ok(RouteDecision::DeliverLocally) => {
                        assert!(is_entity_rank, "delivery must land on the rank the entity actually lives on");
                        delivered.set(delivered.get() + 1);
                    }
                    Ok(RouteDecision::Forward { to, .. }) => {
                        let _ = messenger.send(to, handler, msg.payload(), None);
                    }
                    Err(_) => panic!("hop limit should never be hit by this scenario"),
                }
            })
            .unwrap();
        deliver_id = Some(id);
    }
    *deliver_cell.borrow_mut() = deliver_id;
    let deliver = deliver_id.unwrap();

    ranks[0].location().register_local(ENTITY);

    let collection = ranks[0].new_collection(Registry::new(RankId::new(0)), Pool::new(PoolConfig::default()));
    ranks[0].migrate_entity(&collection, ENTITY, RankId::new(2)).unwrap();

    let migrated = drain_until(&ranks, 64, || {
        ranks[2].location().route(ENTITY, 0) == Ok(RouteDecision::DeliverLocally)
    });
    assert!(migrated, "migration control messages must land before we route through it");

    // Rank 1 never learned about the entity at all — its route() call
    // falls straight back to the (stale, since-migrated) home rank.
    let entity_bytes = ENTITY.to_le_bytes();
    ranks[1].messenger().send_to_entity(ENTITY, deliver, &entity_bytes, None).unwrap();

    let done = drain_until(&ranks, 64, || delivered.get() == 1);
    assert!(done, "message must be forwarded home -> rank 2 and delivered");
    assert_eq!(delivered.get(), 1, "exactly one delivery, no duplicate");
}

//! Runs a handful of the runtime's headline scenarios (spec §8 S1-S3) over
//! the in-process loopback transport, the way naia's basic demo exercises
//! a client and a server in one process without a real socket.
//!
//! Every rank here lives on its own OS thread, since [`amt_core::Runtime`]
//! is `Rc`-based and therefore rank-local by construction (spec §5:
//! "single-threaded cooperative per rank"); the loopback hub is the only
//! thing shared across threads.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;

use amt_core::{HandlerKind, RdmaHandle, Runtime, RuntimeConfig};
use amt_transport::{LoopbackEndpoint, LoopbackHub, RankId};

const WORLD_SIZE: u32 = 4;

fn main() {
    env_logger::init();

    hello_broadcast();
    named_barrier();
    simple_get();
}

/// Spec S1: rank 0 broadcasts a 4-byte payload; every rank (including the
/// sender) invokes the handler exactly once with the same bytes, and the
/// enclosing collective epoch terminates afterwards.
fn hello_broadcast() {
    log::info!("=== hello broadcast (S1) ===");
    let hub = LoopbackHub::new(WORLD_SIZE);
    run_ranks(&hub, |rank, runtime| {
        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = received.clone();
        let hello = runtime
            .messenger()
            .register_collective(HandlerKind::FreeFunction, move |msg| {
                received2.borrow_mut().extend_from_slice(msg.payload());
            })
            .expect("collective registration must agree across ranks");

        let epoch = runtime.open_collective_epoch();
        if rank == RankId::new(0) {
            runtime.termination().enter(epoch);
            runtime.messenger().broadcast(hello, b"hi!!", None, false);
            runtime.termination().exit(epoch);
        }

        for _ in 0..64 {
            runtime.progress();
            if runtime.termination().is_terminated(epoch) {
                break;
            }
        }
        assert_eq!(&*received.borrow(), b"hi!!");
        log::info!("rank {rank}: handler invoked with {:?}", received.borrow());
    });
}

/// Spec S2 (scaled down to 4 ranks): every rank sends to its successor
/// then calls `barrier`; the barrier only releases once all sends have
/// been delivered everywhere.
fn named_barrier() {
    log::info!("=== named barrier (S2) ===");
    let hub = LoopbackHub::new(WORLD_SIZE);
    run_ranks(&hub, |rank, runtime| {
        let count = Rc::new(RefCell::new(0u32));
        let count2 = count.clone();
        let ping = runtime
            .messenger()
            .register_collective(HandlerKind::FreeFunction, move |_msg| {
                *count2.borrow_mut() += 1;
            })
            .expect("collective registration must agree across ranks");

        let successor = RankId::new((rank.as_u32() + 1) % WORLD_SIZE);
        for _ in 0..3 {
            let _ = runtime.messenger().send(successor, ping, b"ping", None);
        }

        let id = runtime.barrier();
        for _ in 0..64 {
            runtime.progress();
            if runtime.barrier_is_released(id) {
                break;
            }
        }
        assert!(runtime.barrier_is_released(id));
        assert_eq!(*count.borrow(), 3, "every send must be delivered before barrier release");
        log::info!("rank {rank}: barrier released after receiving {} pings", count.borrow());
    });
}

/// Spec S3: rank 0 registers a handle over `double[8]` initialized to
/// `i*1.0`, announces the handle to everyone else over an ordinary
/// broadcast, and every other rank fetches the first two elements via a
/// plain (non-channel) get.
fn simple_get() {
    log::info!("=== simple RDMA get (S3) ===");
    let hub = LoopbackHub::new(WORLD_SIZE);
    run_ranks(&hub, |rank, runtime| {
        let owner = RankId::new(0);
        let announced = Rc::new(RefCell::new(None));
        let announced2 = announced.clone();
        let announce = runtime
            .messenger()
            .register_collective(HandlerKind::FreeFunction, move |msg| {
                let bits = u64::from_le_bytes(msg.payload().try_into().unwrap());
                *announced2.borrow_mut() = Some(RdmaHandle::from_bits(bits));
            })
            .expect("collective registration must agree across ranks");

        if rank == owner {
            let region: Vec<u8> = (0..8u64).flat_map(|i| (i as f64).to_le_bytes()).collect();
            let handle = runtime
                .rdma()
                .register_handle(Some(Rc::new(RefCell::new(region))), 64, 8);
            runtime
                .messenger()
                .broadcast(announce, &handle.to_bits().to_le_bytes(), None, false);
        }

        for _ in 0..64 {
            runtime.progress();
            if announced.borrow().is_some() {
                break;
            }
        }
        let handle = announced.borrow().expect("handle announcement must arrive");

        if rank != owner {
            runtime.rdma_get(handle, 0, 16, 7);
            let mut local = None;
            for _ in 0..64 {
                runtime.progress();
                local = runtime.rdma_get_result(owner, 7);
                if local.is_some() {
                    break;
                }
            }
            let bytes = local.expect("get reply must arrive");
            let v0 = f64::from_le_bytes(bytes[0..8].try_into().unwrap());
            let v1 = f64::from_le_bytes(bytes[8..16].try_into().unwrap());
            assert_eq!((v0, v1), (0.0, 1.0));
            log::info!("rank {rank}: get({v0}, {v1}) from rank {owner}");
        }
    });
}

/// Build one [`Runtime`] per rank on its own thread, run `body`, and join
/// every thread before returning.
fn run_ranks<F>(hub: &LoopbackHub, body: F)
where
    F: Fn(RankId, Runtime<LoopbackEndpoint>) + Sync,
{
    thread::scope(|scope| {
        for r in 0..WORLD_SIZE {
            let rank = RankId::new(r);
            let endpoint = hub.endpoint(rank);
            let body = &body;
            scope.spawn(move || {
                let runtime = Runtime::new(endpoint, RuntimeConfig::default())
                    .expect("runtime construction must succeed");
                body(rank, runtime);
            });
        }
    });
}

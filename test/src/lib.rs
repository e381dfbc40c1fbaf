//! Shared test harness for the scenario/property suites under `tests/`,
//! the way naia's `test` crate centralizes its `helpers` module instead
//! of repeating socket/world wiring in every integration test file.
//!
//! Every [`amt_core::Runtime`] is `Rc`-based and therefore rank-local
//! (spec §5), so a multi-rank test drives every rank's progress loop
//! cooperatively from one thread rather than spawning one OS thread per
//! rank — the same single-process cooperative-scheduling shape
//! `amt_core::messenger`'s own unit tests already use for a 2-rank pair.

use amt_core::{Runtime, RuntimeConfig};
use amt_transport::{LoopbackEndpoint, LoopbackHub, RankId};

/// Build `world_size` runtimes sharing one loopback hub, ranks numbered
/// `0..world_size`.
pub fn build_ranks(world_size: u32) -> Vec<Runtime<LoopbackEndpoint>> {
    build_ranks_with(world_size, RuntimeConfig::default())
}

pub fn build_ranks_with(world_size: u32, config: RuntimeConfig) -> Vec<Runtime<LoopbackEndpoint>> {
    let hub = LoopbackHub::new(world_size);
    (0..world_size)
        .map(|r| {
            Runtime::new(hub.endpoint(RankId::new(r)), config.clone())
                .expect("runtime construction must succeed")
        })
        .collect()
}

/// One scheduler tick on every rank, in rank order.
pub fn progress_all(runtimes: &[Runtime<LoopbackEndpoint>]) {
    for r in runtimes {
        r.progress();
    }
}

/// Tick every rank up to `max_ticks` times, stopping early once `done`
/// returns `true`. Returns whether `done` was satisfied before the tick
/// budget ran out, so callers can assert on it instead of silently
/// passing a test that actually stalled.
pub fn drain_until(
    runtimes: &[Runtime<LoopbackEndpoint>],
    max_ticks: usize,
    mut done: impl FnMut() -> bool,
) -> bool {
    for _ in 0..max_ticks {
        if done() {
            return true;
        }
        progress_all(runtimes);
    }
    done()
}

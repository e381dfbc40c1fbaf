//! # AMT Core
//! The single-threaded, per-rank core of an asynchronous many-task
//! runtime for distributed-memory parallel computing: active messaging,
//! event-driven completions, termination detection, a location manager
//! for migratable entities, an RDMA manager, and a structured
//! continuation sequencer.
//!
//! Every component here is a cheaply `Clone`-able handle (`Rc<RefCell<..>>`)
//! over per-rank state, built to be wired together by
//! [`runtime::Runtime`] rather than reached for as ambient global state
//! (spec §5 "Shared-resource policy").

#![deny(trivial_casts, trivial_numeric_casts, unstable_features, unused_import_braces)]

pub mod barrier;
pub mod config;
pub mod envelope;
pub mod epoch;
pub mod error;
pub mod event;
pub mod handler_id;
pub mod location;
pub mod message;
pub mod messenger;
pub mod pool;
pub mod registry;
pub mod rdma;
pub mod runtime;
pub mod sequencer;
pub mod stats;
pub mod termination;
pub mod topology;
pub mod trace;
pub mod types;
pub mod vc;
pub mod wire;

pub use barrier::{Barrier, BarrierAction, BarrierId, ReduceOp};
pub use config::RuntimeConfig;
pub use envelope::{Envelope, EnvelopeKind, Ownership};
pub use epoch::{EpochAlgorithm, EpochId};
pub use error::{CoreError, FatalError};
pub use event::{EventId, EventSystem};
pub use handler_id::HandlerId;
pub use location::{EntityId, LocationManager, RouteDecision};
pub use message::Message;
pub use messenger::ActiveMessenger;
pub use pool::{Pool, PoolBuf};
pub use registry::{HandlerKind, Registry};
pub use rdma::{ChannelKind, RdmaAction, RdmaHandle, RdmaManager};
pub use runtime::Runtime;
pub use sequencer::{SeqId, Sequencer, SequenceBuilder};
pub use termination::{TermAction, TerminationDetector};
pub use topology::Tree;
pub use types::{RankId, SequenceId, Tag, DEFAULT_USER_TAG_OFFSET, NO_TAG};
pub use vc::{CollectionManager, VirtualContextManager};

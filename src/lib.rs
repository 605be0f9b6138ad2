//! From-space pool for a pause-less, region-based generational collector.
//!
//! During a young-generation relocation phase the pool owns the set of
//! from-space pages whose survivors must move. Mutator and GC threads race
//! to request fresh pages ([`FromSpacePool::alloc_page`]), drive
//! object-by-object evacuation, fall back to in-place compaction when no
//! target pages are available, and recycle fully evacuated pages through
//! per-CPU free lists.
//!
//! The embedding collector supplies its page allocator, in-place relocator,
//! phase oracle, CPU topology and object utilities through the [`Runtime`]
//! trait; the pool is generic over it so tests can inject mocks.

pub mod forwarding;
pub mod forwarding_table;
pub mod live_map;
pub mod options;
pub mod page;
pub mod pool;
pub mod runtime;
pub mod stats;
pub mod util;

pub use forwarding::Forwarding;
pub use forwarding_table::{ForwardingCursor, ForwardingTable};
pub use live_map::LiveMap;
pub use options::PoolOptions;
pub use page::{AllocFlags, Page, PageAge, PageType};
pub use pool::FromSpacePool;
pub use runtime::Runtime;
pub use util::Address;

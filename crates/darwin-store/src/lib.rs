pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod traits;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::SqlStore;
pub use traits::{
    Store, TaskFilter, QUEUE_TO_CLASSIFY, QUEUE_TO_CLASSIFY_DEAD, QUEUE_TO_EMBED,
    QUEUE_TO_EMBED_DEAD, QUEUE_TRIAGE,
};

pub mod classifier;
pub mod conflict;
pub mod engine;
pub mod entry;
pub mod filter;
pub mod lock;
pub mod maintenance;
pub mod metadata;
pub mod report;
pub mod resolver;

pub use classifier::Classifier;
pub use conflict::{ConflictChoice, ConflictPolicy, ConflictPrompt, ConflictResolver};
pub use engine::Synchronizer;
pub use entry::{pair_entries, Classification, EntryPair, Side};
pub use filter::{EntryFilter, DEFAULT_EXCLUDES};
pub use maintenance::{purge_locks, purge_metadata};
pub use metadata::{DirMetadata, MetaRecord, METADATA_VERSION};
pub use report::{Decision, NullReporter, Reporter, SyncReport, SyncStats, TracingReporter};
pub use resolver::{resolve, Operation, SyncMode};

//! Storage instances: documents plus secondary indexes in one namespace of a
//! transactional key-value backend, with a change stream and a change buffer.
//!
//! Layout under `rxdb::<database>::<collection>::<schema version>`:
//!
//! - `main`: primary key -> MessagePack document
//! - one subspace per index, named `fields.join("|")`: encoded index string -> primary key

pub mod categorize;
pub mod change_buffer;
pub mod change_stream;
pub mod index_meta;
pub mod instance;
mod scan;

pub use categorize::{BulkWriteCategorizer, CategorizedWrites, DefaultCategorizer};
pub use change_buffer::{ChangeEventBuffer, EventsSince, OutOfBounds};
pub use change_stream::Multicast;
pub use index_meta::IndexMeta;
pub use instance::{
    ChangeStreamReceiver, ConflictResolutionSolution, ConflictResolutionTask, MAIN_STORE,
    StorageInstance, StorageInstanceBuilder, StorageInstanceParams, namespace,
};

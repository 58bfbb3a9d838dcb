//! Transaction publishing for Wiretap
//!
//! The [`Publisher`] batches transactions and delivers them to one sink,
//! spooling batches the sink could not take.

pub mod elasticsearch;
pub mod jsonl;
pub mod publisher;
pub mod spool;

pub use elasticsearch::{ElasticsearchConfig, ElasticsearchExporter};
pub use jsonl::{JsonlExporter, JsonlExporterConfig};
pub use publisher::{Publisher, PublisherClosed, PublisherConfig, PublisherHandle};
pub use spool::{Spool, SpoolError};

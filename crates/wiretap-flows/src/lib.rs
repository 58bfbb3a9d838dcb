//! Wiretap Flows - flow demultiplexing and TCP reassembly
//!
//! Packets are grouped into bidirectional flows keyed by transport and
//! endpoint pair. TCP payloads are reassembled per direction; UDP datagrams
//! pass through as individual chunks. Each flow carries caller-owned state,
//! which the sensor uses for the flow's decoder and correlator.

pub mod flow;
pub mod reassembly;
pub mod sharded;
pub mod table;

pub use flow::{DirectionStats, Flow, FlowKey};
pub use reassembly::{Chunk, StreamBuffer};
pub use sharded::ShardedFlowTable;
pub use table::{FlowTable, FlowTableConfig, Ingest};

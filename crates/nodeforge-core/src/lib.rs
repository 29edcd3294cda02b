//! Core engine: nodes, terminal backends, parsers, history, and graph scheduling.
//!
//! This crate has no notion of sessions, transports, or command dispatch — those
//! live in `nodeforge-server`, which composes the types here into the full
//! orchestration server. Everything in this crate is usable standalone: a single
//! node can be driven directly without a session, a graph can be executed against
//! any [`graph::NodeResolver`] a caller supplies.

pub mod error;
pub mod event;
pub mod graph;
pub mod history;
pub mod node;
pub mod parser;
pub mod terminal;

pub use error::{NodeError, Result};
pub use event::{Event, EventSink, EventType, NullSink, RecordingSink};
pub use graph::{
    CancelToken, ErrorPolicy, Graph, GraphResult, NodeRef, NodeResolver, Step, StepInput, StepSpec,
};
pub use history::{HistoryConfig, HistoryOp, HistoryRecord, HistoryWriter};
pub use node::{ExecutionContext, Forkable, Node, NodeInfo, NodeInput, NodeResult, NodeState, OutputChunk, ToolCapable};
pub use parser::{ParsedResponse, Parser, Section, SectionKind};

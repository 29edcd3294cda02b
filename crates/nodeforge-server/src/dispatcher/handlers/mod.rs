//! Handler families (§4.7), one module per entity the command catalogue groups by:
//! node lifecycle and interaction, script execution, graph, session, workflow, and
//! server meta-commands.

pub mod graph;
pub mod node;
pub mod script;
pub mod server;
pub mod session;
pub mod workflow;

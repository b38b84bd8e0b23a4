//! Curation Engine Planner
//!
//! Static planning for cleaning rules: rule descriptors, generated query
//! specs, the sandbox requirement on destructive statements, and the
//! dependency resolver that turns a rule catalog into an execution order.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dag;
pub mod descriptor;
pub mod query;
pub mod resolve;
pub mod validate;

pub use dag::{Edge, EdgeKind, RuleGraph};
pub use descriptor::RuleDescriptor;
pub use query::{QuerySpec, WriteMode};
pub use resolve::{DependencyResolver, ExecutionOrder, ResolveError};
pub use validate::{
    promote_covering_writes, sandbox_table_name, SandboxCoverage, SandboxNames, SandboxTable,
    SandboxValidator, SandboxViolation,
};

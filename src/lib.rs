#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod analysis;
mod cache;
mod codec;
mod core;
mod engine;
mod error;
mod executor;
mod expr;
mod graph;
mod imports;
mod interp;
mod meta;
mod options;
mod plan;
mod scope;
mod trigger;
mod utils;
mod value;
mod workflow;

pub use crate::analysis::{SpecCache, Specification};
pub use crate::cache::{
    Cache, Event, FormatPlugin, FsStorage, MemoryStorage, Namespace, Progress, Storage, StorageRef, Stored,
};
pub use crate::codec::{NameCodec, codec};
pub use crate::core::Hash32;
pub use crate::engine::{Failure, FailureKind, Report};
pub use crate::error::*;
pub use crate::executor::{Budget, ExecRequest, Executor};
pub use crate::expr::{Arg, BinaryOp, Expr, UnaryOp};
pub use crate::graph::{DependencyGraph, Node};
pub use crate::imports::{Args, Import, Imports, NativeFn};
pub use crate::interp::Interpreter;
pub use crate::meta::{FileStamp, Metadata};
pub use crate::options::{CancelToken, Options};
pub use crate::plan::{Caching, Dynamic, Format, Plan, Target, Trigger};
pub use crate::scope::{Base, Binding, Frame, Layer, MemoryStrategy, ScopeManager};
pub use crate::trigger::{Decision, Reason};
pub use crate::value::Value;
pub use crate::workflow::Workflow;

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

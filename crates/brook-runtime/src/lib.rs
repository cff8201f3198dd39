//! Brook Runtime - Distributed dataflow engine over a stream broker
//!
//! This crate hosts the engine core: the broker adapter, the splitter that
//! fans input reports out into per-field sub-streams, the field generators
//! that join dependencies and run user computations, the dependency
//! resolvers that assemble output reports, and the worker runtime that
//! supervises all of them.

pub mod broker;
pub mod consumer;
pub mod dlq;
pub mod encoding;
pub mod generator;
pub mod history;
pub mod model;
pub mod pending;
pub mod resolver;
pub mod splitter;
pub mod worker;

pub use broker::{Broker, BrokerError, MemoryBroker, RedisBroker, StreamRecord};
pub use model::{
    CompileError, CompiledModel, DerivedField, FieldContext, FieldError, FieldRef, InputReport,
    Model, OutputReport,
};
pub use worker::{Engine, EngineConfig};

//! Connection Management Module
//!
//! Binding, flow acceptance, filtering, and hand-off of flows to workers.

pub mod acceptor;
pub mod binder;
pub mod filter;
pub mod listener;
pub mod single;
pub mod sink;
pub mod worker;

pub use acceptor::{AcceptOutcome, AcceptedFlow, DatagramDemux, FlowSocket, FlowSource, StreamAcceptor};
pub use binder::{BoundSocket, EndpointBinder};
pub use filter::{ClientFilter, FilterDecision, WorkerBudget};
pub use listener::{Listener, StopReason};
pub use single::CollapsedServer;
pub use sink::SinkWorker;
pub use worker::{ClientSettings, Dispatcher, FlowSettings, FlowWorker, TestAmount, TestMode};

//! Per-connection session layer: headers, proxy transport, and the worker
//! state machine.

pub mod headers;
pub mod transport;
pub mod worker;

pub use transport::ProxyTransport;
pub use worker::{ExitReason, SessionWorker, WorkerExit};

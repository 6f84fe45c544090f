//! The unified log ("echo"): every runtime event becomes one structured row.
//!
//! Three writers share one interface: [`EchoStore`] persists rows to the
//! engine database, [`LiveMirror`] keeps an indexed in-memory copy for
//! active sessions, and [`FanOutWriter`] sends every append/update to both.
//! The [`CostReconciler`] resolves deferred provider costs asynchronously
//! and feeds the same interface, so aggregations stay correct regardless of
//! arrival order.

pub mod cost;
pub mod hash;
pub mod mirror;
pub mod row;
pub mod store;
pub mod writer;

pub use cost::{CostFetcher, CostJob, CostReconciler, HttpCostFetcher};
pub use hash::content_hash;
pub use mirror::LiveMirror;
pub use row::{CostUpdate, LogRow, NodeType};
pub use store::EchoStore;
pub use writer::{CostApplied, EchoError, FanOutWriter, LogWriter};

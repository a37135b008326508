pub mod costs;
pub mod dialog;
pub mod retention;

pub use costs::{CostFilter, CostRow, CostStore, CostSummary, NewCostRow};
pub use dialog::{read_logs, DialogEntry, DialogLogger, LogFilter};
pub use retention::{cleanup_logs, cleanup_metrics, DbSweepStats, LogSweepStats};

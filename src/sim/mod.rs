pub mod config;
pub mod stats;
pub mod top;
pub mod trace;

pub use config::SimConfig;
pub use stats::PhaseStats;
pub use top::{PhaseInfo, SimTop};
pub use trace::{TraceInstr, TraceReader};

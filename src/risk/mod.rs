// Risk management module
pub mod evaluator;
pub mod halt;
pub mod status;

pub use evaluator::{evaluate, ExitCheckReport, ExitDecision, ExitEvaluator, PositionCheck, Ratchet};
pub use halt::{HaltState, HaltSwitch};
pub use status::{risk_status, PositionRisk, RiskStatus};

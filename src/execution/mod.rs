// Order sizing, execution and position closing
pub mod closer;
pub mod fees;
pub mod lock;
pub mod quantize;
pub mod sizer;

pub use closer::{realized_pnl, CloseReport, PositionCloser, PositionExit};
pub use lock::SymbolLock;
pub use quantize::{executable_quantity, floor_to_step};
pub use sizer::{BuyReport, BuyRequest, PositionSizer, SizingParams, SizingPlan, StopPolicy};

//! Round lifecycle: state machine, table ticker, and round/table types

pub mod machine;
pub mod round;
pub mod ticker;

pub use machine::RoundMachine;
pub use round::{round_id, Round, RoundPhase, Table, TableStatus};
pub use ticker::TableTicker;

//! Transaction logging: the function-code progress ladder, the per-TID log
//! used for rollback/recovery playback, the priority log used to recover a
//! crashed writer mid-finalization, and the expired-log sweeper.

pub mod function_code;
pub mod log;
pub mod priority_log;
pub mod sweeper;

pub use function_code::FunctionCode;
pub use log::{InMemoryTransactionLog, LogEntry, TransactionLog};
pub use priority_log::{
    InMemoryPriorityLog, PriorityHandle, PriorityPayload, PriorityRecord, TransactionPriorityLog,
};
pub use sweeper::ExpiredLogSweeper;

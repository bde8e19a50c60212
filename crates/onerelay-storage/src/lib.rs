pub mod entities;
pub mod seaorm;
pub mod sinks;
pub mod snapshot;
pub mod storage;

pub use seaorm::{ABILITY_BATCH, SeaOrmStorage};
pub use sinks::DbEventSink;
pub use snapshot::{
    ChannelSnapshot, GlobalConfigRow, ROLE_COMMON, ROLE_ROOT, TokenRow, TopUpRow, TopUpStatus,
    UserRow,
};
pub use storage::{
    LogKind, LogRecord, NewToken, NewUser, QuotaField, Storage, StorageError, StorageResult,
    TagUpdate,
};

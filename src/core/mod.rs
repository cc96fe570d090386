// 核心数据结构和类型定义

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

// 重新导出常用类型
pub use clock::{ClockSet, SyncMode, VideoClock};
pub use config::SyncConfig;
pub use error::{EngineError, Result};
pub use types::{MediaInfo, RefreshEvent, StreamKind};

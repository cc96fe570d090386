//! 音视频解封装-解码-同步引擎
//!
//! 从可寻址的媒体源分离音视频基本流，分别解码后在共同的时间线上
//! 呈现：视频由独立的解码线程推进，音频由输出设备按自己的节奏
//! 拉取，两边只通过时钟比较对齐，从不互相阻塞。
//!
//! 宿主的接入方式见 [`Session`]：`initialize` 打开媒体源并启动
//! 管线，之后把 `refresh_events()` 收到的每个事件转发给
//! `refresh()`，每个渲染 tick 用 `frame_pixels()` 取最近呈现的
//! 一帧，结束时调用 `shutdown()`。

pub mod core;
pub mod player;

pub use crate::core::{
    ClockSet, EngineError, MediaInfo, RefreshEvent, Result, SyncConfig, SyncMode,
};
pub use crate::player::Session;

use serde::{Deserialize, Serialize};

/// 基本流类型（本引擎只处理音频和视频两种基本流）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// 刷新事件
///
/// 刷新定时器到期时向宿主事件循环投递一个该事件；
/// 宿主必须按顺序、不延迟地把每个事件转发回 `Session::refresh()`，
/// 每个事件恰好转发一次。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshEvent;

/// 媒体信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: i64,          // 总时长（毫秒，未知为 0）
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for MediaInfo {
    fn default() -> Self {
        Self {
            duration: 0,
            width: 0,
            height: 0,
            fps: 0.0,
            video_codec: String::new(),
            audio_codec: String::new(),
            sample_rate: 0,
            channels: 0,
        }
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("FFmpeg 错误: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),

    #[error("无法打开媒体源: {0}")]
    Open(String),

    #[error("找不到可解码的音频或视频流")]
    NoStream,

    #[error("音频输出错误: {0}")]
    Audio(String),

    #[error("已取消")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;

use serde::{Deserialize, Serialize};

use crate::core::clock::SyncMode;

/// 同步与缓冲参数
///
/// 这些阈值都是经验调出来的，没有理论推导；
/// 默认值保持原样，宿主可以按需覆盖。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 主时钟选择
    pub sync_mode: SyncMode,

    /// 音频包队列字节上限（超过后解封装线程暂停读取）
    pub max_audio_queue_bytes: usize,
    /// 视频包队列字节上限
    pub max_video_queue_bytes: usize,
    /// 队列超限时解封装线程的重试间隔（毫秒）
    pub backpressure_poll_ms: u64,

    /// 音频漂移滑动平均的样本窗口
    pub audio_diff_avg_nb: u32,
    /// 失同步判定阈值（秒）：音频时钟偏离主时钟超过该值时放弃校正、重新开始平均
    pub nosync_threshold: f64,
    /// 单块样本修正量的上限（相对原始块大小的百分比）
    pub sample_correction_percent_max: u32,

    /// 音画同步判定阈值（秒）：画面超前/落后小于该值不做修正
    pub sync_threshold: f64,
    /// 刷新等待的下限（秒），避免忙转
    pub min_refresh_delay: f64,
    /// 画面缓冲为空时的重试延迟（毫秒）
    pub idle_refresh_ms: u64,
    /// 没有视频流时的重试延迟（毫秒）
    pub no_video_refresh_ms: u64,
    /// 首次刷新延迟（毫秒）
    pub first_refresh_ms: u64,
    /// 定时器回调通常比请求的时间晚一点，调度时提前这么多毫秒补偿
    pub refresh_fudge_ms: f64,

    /// 音频设备缓冲帧数（用于推导漂移校正阈值）
    pub device_buffer_frames: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::ExternalMaster,
            max_audio_queue_bytes: 5 * 16 * 1024,
            max_video_queue_bytes: 5 * 256 * 1024,
            backpressure_poll_ms: 10,
            audio_diff_avg_nb: 20,
            nosync_threshold: 10.0,
            sample_correction_percent_max: 10,
            sync_threshold: 0.010,
            min_refresh_delay: 0.010,
            idle_refresh_ms: 10,
            no_video_refresh_ms: 100,
            first_refresh_ms: 40,
            refresh_fudge_ms: 5.0,
            device_buffer_frames: 2048,
        }
    }
}

impl SyncConfig {
    /// 漂移滑动平均系数：20 个样本后旧值权重衰减到 1%
    pub fn audio_diff_avg_coef(&self) -> f64 {
        (0.01f64.ln() / self.audio_diff_avg_nb as f64).exp()
    }

    /// 每条音频流的漂移校正阈值（秒）：两个设备缓冲的时长
    pub fn audio_diff_threshold(&self, sample_rate: u32) -> f64 {
        2.0 * self.device_buffer_frames as f64 / sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_coef_matches_window() {
        let cfg = SyncConfig::default();
        let coef = cfg.audio_diff_avg_coef();
        // coef^20 == 0.01：窗口长度之后旧样本只剩 1% 权重
        assert!((coef.powi(20) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_diff_threshold() {
        let cfg = SyncConfig::default();
        assert!((cfg.audio_diff_threshold(48000) - 2.0 * 2048.0 / 48000.0).abs() < 1e-12);
    }
}

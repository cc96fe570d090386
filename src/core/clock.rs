use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// 主时钟选择 - 决定以哪个时间源为基准做音画同步
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// 以音频时钟为主（音频不可校正，跳过漂移校正）
    AudioMaster,
    /// 以视频时钟为主（刷新调度不做跳帧/拉伸修正）
    VideoMaster,
    /// 以墙钟为主
    ExternalMaster,
}

/// 视频时钟 - 为解码出的帧推导平滑的显示时间戳
///
/// pts 为 0 视为"未知"，用运行时钟代替；无论哪种情况，
/// 时钟都按名义帧间隔推进，repeat_pict 按半帧补偿。
pub struct VideoClock {
    clock: f64,
    frame_duration: f64,
}

impl VideoClock {
    pub fn new(frame_duration: f64) -> Self {
        Self {
            clock: 0.0,
            frame_duration,
        }
    }

    /// 平滑一帧的 pts 并推进时钟，返回实际采用的 pts（秒）
    pub fn synchronize(&mut self, pts: f64, repeat_pict: i32) -> f64 {
        let pts = if pts != 0.0 {
            // 有 pts 就直接采纳为视频时钟
            self.clock = pts;
            pts
        } else {
            // 没有 pts，用运行时钟代替
            self.clock
        };

        let mut delay = self.frame_duration;
        // 编码器标记了重复场时，按半帧延长
        delay += repeat_pict as f64 * (self.frame_duration * 0.5);
        self.clock += delay;
        pts
    }

    pub fn current(&self) -> f64 {
        self.clock
    }
}

struct VideoSample {
    pts: f64,
    captured_at: Instant,
}

/// 时钟组 - 维护三个候选时间源并按 SyncMode 选出主时钟
///
/// 音频时钟由音频阶段在每次回调后发布（已扣除尚未播出的暂存字节）；
/// 视频时钟是最近一次呈现的 pts 按墙钟外推；外部时钟是会话启动以来的秒数。
pub struct ClockSet {
    mode: SyncMode,
    origin: Instant,
    audio: Mutex<f64>,
    video: Mutex<VideoSample>,
}

impl ClockSet {
    pub fn new(mode: SyncMode) -> Self {
        let origin = Instant::now();
        Self {
            mode,
            origin,
            audio: Mutex::new(0.0),
            video: Mutex::new(VideoSample {
                pts: 0.0,
                captured_at: origin,
            }),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// 发布音频时钟（秒），由音频回调线程调用
    pub fn set_audio(&self, pts: f64) {
        *self.audio.lock() = pts;
    }

    pub fn audio(&self) -> f64 {
        *self.audio.lock()
    }

    /// 记录刚呈现的画面 pts，同时记下采样时刻用于外推
    pub fn set_video_pts(&self, pts: f64) {
        let mut sample = self.video.lock();
        sample.pts = pts;
        sample.captured_at = Instant::now();
    }

    pub fn video(&self) -> f64 {
        let sample = self.video.lock();
        sample.pts + sample.captured_at.elapsed().as_secs_f64()
    }

    /// 外部时钟：会话启动以来的墙钟秒数
    pub fn external(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// 当前主时钟读数（秒）
    pub fn master(&self) -> f64 {
        match self.mode {
            SyncMode::AudioMaster => self.audio(),
            SyncMode::VideoMaster => self.video(),
            SyncMode::ExternalMaster => self.external(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_pts_uses_running_clock() {
        // pts 全为 0 时时钟按名义帧间隔推进
        let mut clock = VideoClock::new(1.0 / 30.0);
        let mut values = Vec::new();
        for _ in 0..3 {
            clock.synchronize(0.0, 0);
            values.push(clock.current());
        }
        assert!((values[0] - 1.0 / 30.0).abs() < 1e-9);
        assert!((values[1] - 2.0 / 30.0).abs() < 1e-9);
        assert!((values[2] - 3.0 / 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_known_pts_resets_clock() {
        let mut clock = VideoClock::new(1.0 / 30.0);
        clock.synchronize(0.0, 0);
        let pts = clock.synchronize(5.0, 0);
        assert_eq!(pts, 5.0);
        assert!((clock.current() - (5.0 + 1.0 / 30.0)).abs() < 1e-9);
    }

    #[test]
    fn test_repeat_pict_extends_delay() {
        let mut clock = VideoClock::new(1.0 / 30.0);
        clock.synchronize(1.0, 1);
        // 一帧 + 半帧
        assert!((clock.current() - (1.0 + 1.5 / 30.0)).abs() < 1e-9);
    }

    #[test]
    fn test_master_clock_selection() {
        let clocks = ClockSet::new(SyncMode::AudioMaster);
        clocks.set_audio(42.0);
        assert_eq!(clocks.master(), 42.0);

        let clocks = ClockSet::new(SyncMode::VideoMaster);
        clocks.set_video_pts(7.0);
        let master = clocks.master();
        assert!(master >= 7.0 && master < 7.1);
    }
}

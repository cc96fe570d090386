use crate::core::{ClockSet, Result, SyncConfig, SyncMode};
use crate::player::packet_queue::{is_end_of_stream, PacketQueue};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, software, util};
use log::{debug, info, warn};
use std::sync::Arc;

/// 输出永远是双声道 s16：每个采样帧 4 字节
const OUT_BYTES_PER_FRAME: usize = 4;
/// 解码失败或流结束后输出的静音块大小（字节）
const SILENCE_BLOCK_BYTES: usize = 1024;

/// 音频漂移校正 - 把音频时钟往主时钟方向拉
///
/// 对 diff 做指数滑动平均，攒满窗口样本后才动手；单块的修正量
/// 截断在原始大小的 ±sample_correction_percent_max 以内。
/// 偏差超过 nosync_threshold 视为不可恢复的跳变，清零重新平均。
pub struct DriftCorrector {
    audio_is_master: bool,
    avg_coef: f64,
    threshold: f64,
    nosync_threshold: f64,
    clamp_percent: u32,
    window: u32,
    sample_rate: u32,
    diff_cum: f64,
    avg_count: u32,
}

impl DriftCorrector {
    pub fn new(config: &SyncConfig, sample_rate: u32) -> Self {
        Self {
            audio_is_master: config.sync_mode == SyncMode::AudioMaster,
            avg_coef: config.audio_diff_avg_coef(),
            threshold: config.audio_diff_threshold(sample_rate),
            nosync_threshold: config.nosync_threshold,
            clamp_percent: config.sample_correction_percent_max,
            window: config.audio_diff_avg_nb,
            sample_rate,
            diff_cum: 0.0,
            avg_count: 0,
        }
    }

    /// 根据当前漂移调整样本块大小（字节），返回希望送出的字节数
    ///
    /// 音频自己就是主时钟时原样返回（无法对着自己校正）。
    pub fn correct(&mut self, samples_size: usize, diff: f64) -> usize {
        if self.audio_is_master {
            return samples_size;
        }

        if diff.abs() < self.nosync_threshold {
            self.diff_cum = diff + self.avg_coef * self.diff_cum;

            if self.avg_count < self.window {
                self.avg_count += 1;
            } else {
                let avg_diff = self.diff_cum * (1.0 - self.avg_coef);
                if avg_diff.abs() >= self.threshold {
                    let wanted = samples_size as f64
                        + diff * self.sample_rate as f64 * OUT_BYTES_PER_FRAME as f64;
                    let min = samples_size as f64 * (100 - self.clamp_percent) as f64 / 100.0;
                    let max = samples_size as f64 * (100 + self.clamp_percent) as f64 / 100.0;
                    let wanted = wanted.clamp(min, max) as usize;
                    // 对齐到整帧，并且永不缩到零
                    let wanted = wanted - wanted % OUT_BYTES_PER_FRAME;
                    return wanted.max(OUT_BYTES_PER_FRAME);
                }
            }
        } else {
            // 偏差太大：放弃单次大修正，重新开始平均
            self.avg_count = 0;
            self.diff_cum = 0.0;
        }

        samples_size
    }
}

/// 音频解码/重采样阶段 - 由音频设备在它自己的线程上拉动
///
/// `fill` 每次被回调时先耗尽暂存块，用完再解码下一块；
/// 哨兵包之后永远输出静音。重采样是常开的归一化步骤，
/// 初始化失败时降级为透传原始样本而不是中止播放。
pub struct AudioStage {
    decoder: codec::decoder::Audio,
    resampler: Option<software::resampling::Context>,
    queue: Arc<PacketQueue>,
    clocks: Arc<ClockSet>,
    drift: DriftCorrector,
    time_base: f64,
    sample_rate: u32,
    staging: Vec<u8>,
    staging_pos: usize,
    audio_clock: f64,
    finished: bool,
}

// 解码器与重采样上下文不是 Send，但整个阶段移入 cpal 回调后
// 只会在设备线程上被使用
unsafe impl Send for AudioStage {}

impl AudioStage {
    pub fn new(
        stream: format::stream::Stream,
        queue: Arc<PacketQueue>,
        clocks: Arc<ClockSet>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let time_base = stream.time_base();
        let time_base = time_base.numerator() as f64 / time_base.denominator() as f64;

        let context = codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().audio()?;
        let sample_rate = decoder.rate();

        // 有些容器不写声道布局，按声道数补一个默认布局
        let mut layout = decoder.channel_layout();
        if layout.is_empty() {
            layout = util::channel_layout::ChannelLayout::default(decoder.channels() as i32);
        }

        debug!(
            "音频解码器: {} Hz, {} 声道, 格式: {:?} → s16 双声道 {} Hz",
            sample_rate,
            decoder.channels(),
            decoder.format(),
            sample_rate
        );

        // 目标格式协商失败不是致命错误：透传原始样本继续播放
        let resampler = match software::resampling::Context::get(
            decoder.format(),
            layout,
            sample_rate,
            util::format::Sample::I16(util::format::sample::Type::Packed),
            util::channel_layout::ChannelLayout::STEREO,
            sample_rate,
        ) {
            Ok(resampler) => Some(resampler),
            Err(e) => {
                warn!("音频重采样器初始化失败，降级为透传原始样本: {}", e);
                None
            }
        };

        let drift = DriftCorrector::new(config, sample_rate);

        Ok(Self {
            decoder,
            resampler,
            queue,
            clocks,
            drift,
            time_base,
            sample_rate,
            staging: Vec::new(),
            staging_pos: 0,
            audio_clock: 0.0,
            finished: false,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// 填满设备要的输出缓冲（双声道 s16 交错）
    pub fn fill(&mut self, out: &mut [i16]) {
        let bytes_per_sec = (2 * 2 * self.sample_rate) as f64;
        let mut index = 0;

        while index < out.len() {
            if self.staging_pos >= self.staging.len() {
                // 暂存块用完了，解下一块
                if !self.decode_block() {
                    // 流结束/取消/解码失败：输出一段静音
                    self.staging.clear();
                    self.staging.resize(SILENCE_BLOCK_BYTES, 0);
                    self.staging_pos = 0;
                }
            }

            let remaining = self.staging.len() - self.staging_pos;
            let want_bytes = (out.len() - index) * 2;
            let n = want_bytes.min(remaining) & !1;
            for sample in out[index..index + n / 2].iter_mut() {
                *sample = i16::from_ne_bytes([
                    self.staging[self.staging_pos],
                    self.staging[self.staging_pos + 1],
                ]);
                self.staging_pos += 2;
            }
            index += n / 2;

            // 发布有效音频时钟：扣掉暂存区里还没送出的字节
            let pending = (self.staging.len() - self.staging_pos) as f64;
            self.clocks.set_audio(self.audio_clock - pending / bytes_per_sec);
        }
    }

    /// 解出下一个样本块到暂存区；返回 false 表示流结束或已取消
    fn decode_block(&mut self) -> bool {
        if self.finished {
            return false;
        }
        let bytes_per_sec = (2 * 2 * self.sample_rate) as f64;

        loop {
            // 先取解码器里已经就绪的帧
            let mut frame = util::frame::Audio::empty();
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    let produced = self.stage_frame(&frame);
                    if produced == 0 {
                        // 没解出可用样本，继续消费数据
                        continue;
                    }

                    // 时钟按未校正的块大小推进；校正只改变实际送出的字节数，
                    // 设备时间相对音频时钟的偏移由此被慢慢拉回
                    self.audio_clock += produced as f64 / bytes_per_sec;

                    let diff = self.audio_clock - self.clocks.master();
                    let wanted = self.drift.correct(produced, diff);
                    if wanted < produced {
                        self.staging.truncate(wanted);
                    } else if wanted > produced {
                        self.pad_with_final_frame(wanted);
                    }
                    return true;
                }
                Err(ffmpeg::Error::Other { errno: 11 }) | Err(ffmpeg::Error::Eof) => {}
                Err(e) => {
                    warn!("接收音频帧失败（已跳过）: {}", e);
                }
            }

            // 需要下一个包
            let packet = match self.queue.get(true) {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(_) => return false, // running 已清除
            };

            if is_end_of_stream(&packet) {
                info!("音频队列收到流结束哨兵，后续输出静音");
                self.finished = true;
                return false;
            }

            // 包自带 pts 时用它校准音频时钟
            if let Some(pts) = packet.pts() {
                self.audio_clock = pts as f64 * self.time_base;
            }

            if let Err(e) = self.decoder.send_packet(&packet) {
                // 单个包解码失败只跳过
                warn!("音频包解码失败（已跳过）: {}", e);
            }
        }
    }

    /// 把一帧解码输出重采样进暂存区，返回字节数
    ///
    /// 不变式：暂存区长度始终等于当前块的字节数（按需增长，不做
    /// 最坏情况的固定预留）。
    fn stage_frame(&mut self, frame: &util::frame::Audio) -> usize {
        self.staging.clear();
        self.staging_pos = 0;

        match self.resampler.as_mut() {
            Some(resampler) => {
                let mut resampled = util::frame::Audio::empty();
                if let Err(e) = resampler.run(frame, &mut resampled) {
                    warn!("音频重采样失败（已跳过）: {}", e);
                    return 0;
                }
                let bytes = resampled.samples() * OUT_BYTES_PER_FRAME;
                if bytes == 0 {
                    return 0;
                }
                self.staging.extend_from_slice(&resampled.data(0)[..bytes]);
                bytes
            }
            None => {
                // 降级路径：原样透传第一个数据平面（截到偶数字节，
                // 保证 fill 的 16 位拷贝总能前进）
                let data = frame.data(0);
                let len = data.len() & !1;
                self.staging.extend_from_slice(&data[..len]);
                len
            }
        }
    }

    /// 把暂存块补齐到 wanted 字节：重复最后一个完整采样帧，不用静音
    fn pad_with_final_frame(&mut self, wanted: usize) {
        if self.staging.len() < OUT_BYTES_PER_FRAME {
            return;
        }
        let start = self.staging.len() - OUT_BYTES_PER_FRAME;
        let mut last = [0u8; OUT_BYTES_PER_FRAME];
        last.copy_from_slice(&self.staging[start..]);
        while self.staging.len() < wanted {
            self.staging.extend_from_slice(&last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_mode(mode: SyncMode) -> SyncConfig {
        SyncConfig {
            sync_mode: mode,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_noop_when_audio_is_master() {
        let config = config_with_mode(SyncMode::AudioMaster);
        let mut drift = DriftCorrector::new(&config, 48000);
        for _ in 0..100 {
            assert_eq!(drift.correct(4096, 0.5), 4096);
        }
    }

    #[test]
    fn test_no_correction_until_window_filled() {
        let config = config_with_mode(SyncMode::ExternalMaster);
        let mut drift = DriftCorrector::new(&config, 48000);
        for _ in 0..config.audio_diff_avg_nb {
            assert_eq!(drift.correct(4096, 0.5), 4096);
        }
    }

    #[test]
    fn test_constant_drift_clamped_within_ten_percent() {
        let config = config_with_mode(SyncMode::ExternalMaster);
        let mut drift = DriftCorrector::new(&config, 48000);
        let original = 4096usize;

        let mut corrected = original;
        for _ in 0..40 {
            corrected = drift.correct(original, 0.5);
        }
        // 修正量最终截断在 +10% 以内，且永远是正的整帧数
        assert!(corrected > original);
        assert!(corrected <= original * 110 / 100);
        assert_eq!(corrected % OUT_BYTES_PER_FRAME, 0);

        let mut drift = DriftCorrector::new(&config, 48000);
        let mut corrected = original;
        for _ in 0..40 {
            corrected = drift.correct(original, -0.5);
        }
        assert!(corrected < original);
        // 帧对齐最多再减掉一帧
        assert!(corrected + OUT_BYTES_PER_FRAME >= original * 90 / 100);
        assert!(corrected > 0);
    }

    #[test]
    fn test_tiny_drift_not_corrected() {
        let config = config_with_mode(SyncMode::ExternalMaster);
        let mut drift = DriftCorrector::new(&config, 48000);
        // 阈值 = 2 × 2048 / 48000 ≈ 85ms；10ms 的漂移不该触发修正
        let mut corrected = 4096;
        for _ in 0..40 {
            corrected = drift.correct(4096, 0.010);
        }
        assert_eq!(corrected, 4096);
    }

    #[test]
    fn test_huge_desync_resets_averaging() {
        let config = config_with_mode(SyncMode::ExternalMaster);
        let mut drift = DriftCorrector::new(&config, 48000);

        // 攒满窗口并触发修正
        let mut corrected = 4096;
        for _ in 0..40 {
            corrected = drift.correct(4096, 0.5);
        }
        assert_ne!(corrected, 4096);

        // 超过失同步阈值：本块不修正，且平均状态清零
        assert_eq!(drift.correct(4096, 20.0), 4096);
        // 窗口重新从头攒起，小于窗口数的样本不会再触发修正
        for _ in 0..config.audio_diff_avg_nb {
            assert_eq!(drift.correct(4096, 0.5), 4096);
        }
    }
}

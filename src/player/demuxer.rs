use crate::core::{EngineError, MediaInfo, Result, StreamKind};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{format, media};
use log::{debug, info, warn};
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// FFmpeg 内部可能阻塞的读取会定期调用这个回调，返回非零就立即中止。
// opaque 指向会话的 running 标志（Arc 持有，地址稳定）。
unsafe extern "C" fn demux_interrupt_cb(opaque: *mut c_void) -> c_int {
    let running = &*(opaque as *const AtomicBool);
    (!running.load(Ordering::Relaxed)) as c_int
}

/// 解封装器 - 打开媒体源并按流索引分离音视频基本流
pub struct Demuxer {
    input: format::context::Input,
    video_stream_index: Option<usize>,
    audio_stream_index: Option<usize>,
    media_info: MediaInfo,
    source_path: String,
    // 中断回调通过裸指针读取该标志，必须与 input 同生命周期
    #[allow(dead_code)]
    running: Arc<AtomicBool>,
}

impl Demuxer {
    /// 打开媒体源并安装中断回调
    pub fn open(path: &str, running: Arc<AtomicBool>) -> Result<Self> {
        info!("正在打开媒体源: {}", path);

        let mut input = format::input(&path)
            .map_err(|e| EngineError::Open(format!("{}: {}", path, e)))?;

        // 让后续所有阻塞读取都能被 running 标志打断
        unsafe {
            let ctx = input.as_mut_ptr();
            (*ctx).interrupt_callback = ffmpeg::ffi::AVIOInterruptCB {
                callback: Some(demux_interrupt_cb),
                opaque: Arc::as_ptr(&running) as *mut c_void,
            };
        }

        let video_stream_index = input
            .streams()
            .best(media::Type::Video)
            .map(|s| s.index());
        let audio_stream_index = input
            .streams()
            .best(media::Type::Audio)
            .map(|s| s.index());

        if video_stream_index.is_none() && audio_stream_index.is_none() {
            return Err(EngineError::NoStream);
        }

        debug!("视频流索引: {:?}", video_stream_index);
        debug!("音频流索引: {:?}", audio_stream_index);

        let mut demuxer = Self {
            input,
            video_stream_index,
            audio_stream_index,
            media_info: MediaInfo::default(),
            source_path: path.to_string(),
            running,
        };
        demuxer.media_info = demuxer.extract_media_info()?;

        Ok(demuxer)
    }

    /// 提取媒体信息（内部使用）
    fn extract_media_info(&self) -> Result<MediaInfo> {
        let duration = self.input.duration().max(0) / 1000; // 微秒转毫秒

        let (video_codec, width, height, fps) = if let Some(idx) = self.video_stream_index {
            let stream = self.input.stream(idx).ok_or(EngineError::NoStream)?;
            let params = stream.parameters();
            let codec_name = params.id().name().to_string();

            let context = ffmpeg::codec::context::Context::from_parameters(params)?;
            let decoder = context.decoder().video()?;

            let rate = stream.avg_frame_rate();
            let fps = if rate.denominator() != 0 {
                rate.numerator() as f64 / rate.denominator() as f64
            } else {
                0.0
            };

            (codec_name, decoder.width(), decoder.height(), fps)
        } else {
            ("none".to_string(), 0, 0, 0.0)
        };

        let (audio_codec, sample_rate, channels) = if let Some(idx) = self.audio_stream_index {
            let stream = self.input.stream(idx).ok_or(EngineError::NoStream)?;
            let params = stream.parameters();
            let codec_name = params.id().name().to_string();

            let context = ffmpeg::codec::context::Context::from_parameters(params)?;
            let decoder = context.decoder().audio()?;

            (codec_name, decoder.rate(), decoder.channels())
        } else {
            ("none".to_string(), 0, 0)
        };

        Ok(MediaInfo {
            duration,
            width,
            height,
            fps,
            video_codec,
            audio_codec,
            sample_rate,
            channels,
        })
    }

    pub fn video_stream_index(&self) -> Option<usize> {
        self.video_stream_index
    }

    pub fn audio_stream_index(&self) -> Option<usize> {
        self.audio_stream_index
    }

    pub fn video_stream(&self) -> Option<format::stream::Stream> {
        self.video_stream_index.and_then(|idx| self.input.stream(idx))
    }

    pub fn audio_stream(&self) -> Option<format::stream::Stream> {
        self.audio_stream_index.and_then(|idx| self.input.stream(idx))
    }

    /// 视频流时间基（秒/刻度）
    pub fn video_time_base(&self) -> f64 {
        self.video_stream()
            .map(|s| {
                let tb = s.time_base();
                tb.numerator() as f64 / tb.denominator() as f64
            })
            .unwrap_or(0.0)
    }

    /// 音频流时间基（秒/刻度）
    pub fn audio_time_base(&self) -> f64 {
        self.audio_stream()
            .map(|s| {
                let tb = s.time_base();
                tb.numerator() as f64 / tb.denominator() as f64
            })
            .unwrap_or(0.0)
    }

    /// 名义帧间隔（秒），帧率未知时退回 40ms
    pub fn nominal_frame_duration(&self) -> f64 {
        if self.media_info.fps > 0.0 {
            1.0 / self.media_info.fps
        } else {
            0.040
        }
    }

    /// 读取下一个属于音频流或视频流的包
    ///
    /// - `Ok(Some(..))`: 读到一个包；不属于这两条流的包直接丢弃
    /// - `Ok(None)`: 真正的源末尾
    /// - `Err(Cancelled)`: 中断回调触发（running 已清除）
    /// - 其余错误视为瞬时读取错误，由调用方决定重试
    pub fn read_packet(&mut self) -> Result<Option<(ffmpeg::Packet, StreamKind)>> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    let index = packet.stream() as usize;
                    if Some(index) == self.video_stream_index {
                        return Ok(Some((packet, StreamKind::Video)));
                    }
                    if Some(index) == self.audio_stream_index {
                        return Ok(Some((packet, StreamKind::Audio)));
                    }
                    // 其他流的包立即丢弃
                }
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(ffmpeg::Error::Exit) => return Err(EngineError::Cancelled),
                Err(e) => {
                    warn!("读取数据包失败（瞬时）: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.media_info
    }

    pub fn description(&self) -> &str {
        &self.source_path
    }
}

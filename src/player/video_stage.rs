use crate::core::{Result, VideoClock};
use crate::player::packet_queue::{is_end_of_stream, PacketQueue};
use crate::player::picture_buffer::PictureBuffer;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, software, util};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// 视频解码阶段 - 独立线程：包队列 → 解码 → pts 平滑 → RGBA 转换 → 画面缓冲
pub struct VideoStage {
    decoder: codec::decoder::Video,
    scaler: Option<software::scaling::Context>,
    time_base: f64,
    clock: VideoClock,
    queue: Arc<PacketQueue>,
    pictures: Arc<PictureBuffer>,
    width: u32,
    height: u32,
}

// SwsContext 本身不是 Send，但解码阶段整体移入自己的线程后只在那里使用
unsafe impl Send for VideoStage {}

impl VideoStage {
    pub fn new(
        stream: format::stream::Stream,
        queue: Arc<PacketQueue>,
        pictures: Arc<PictureBuffer>,
        frame_duration: f64,
    ) -> Result<Self> {
        let time_base = stream.time_base();
        let time_base = time_base.numerator() as f64 / time_base.denominator() as f64;

        let context = codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().video()?;

        debug!(
            "视频解码器: {}x{}, 格式: {:?}, 帧间隔 {:.4}s",
            decoder.width(),
            decoder.height(),
            decoder.format(),
            frame_duration
        );

        let width = decoder.width();
        let height = decoder.height();

        Ok(Self {
            decoder,
            scaler: None,
            time_base,
            clock: VideoClock::new(frame_duration),
            queue,
            pictures,
            width,
            height,
        })
    }

    /// 启动解码线程
    pub fn spawn(mut self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("vrmedia-video".to_string())
            .spawn(move || self.run())
            .expect("spawn video decode thread")
    }

    fn run(&mut self) {
        info!("视频解码线程启动");
        loop {
            let packet = match self.queue.get(true) {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(_) => break, // running 已清除
            };

            if is_end_of_stream(&packet) {
                // 纯视频源的结束信号（有音频流时哨兵不会进视频队列）
                info!("视频队列收到流结束哨兵");
                break;
            }

            match self.decoder.send_packet(&packet) {
                Ok(()) => {}
                Err(e) => {
                    // 单个包解码失败只跳过，不中断播放
                    warn!("视频包解码失败（已跳过）: {}", e);
                    continue;
                }
            }

            if !self.drain_frames() {
                return; // 发布时被取消
            }
        }
        info!("视频解码线程退出");
    }

    /// 取出解码器里所有就绪的帧；返回 false 表示已取消
    fn drain_frames(&mut self) -> bool {
        loop {
            let mut decoded = util::frame::Video::empty();
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    if !self.publish(&decoded) {
                        return false;
                    }
                }
                Err(ffmpeg::Error::Other { errno: 11 }) => return true, // EAGAIN：需要更多包
                Err(ffmpeg::Error::Eof) => return true,
                Err(e) => {
                    warn!("接收视频帧失败（已跳过）: {}", e);
                    return true;
                }
            }
        }
    }

    /// 转换一帧并写入画面缓冲；返回 false 表示等待空槽时被取消
    fn publish(&mut self, frame: &util::frame::Video) -> bool {
        // 优先解码器报告的最优时间戳；没有就传 0，交给运行时钟平滑
        let mut pts = frame
            .timestamp()
            .map(|t| t as f64 * self.time_base)
            .unwrap_or(0.0);
        let repeat_pict = unsafe { (*frame.as_ptr()).repeat_pict };
        pts = self.clock.synchronize(pts, repeat_pict);

        // 转换上下文按源尺寸建立，从不缩放到别的输出尺寸
        if self.scaler.is_none() {
            match software::scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                util::format::Pixel::RGBA,
                frame.width(),
                frame.height(),
                software::scaling::Flags::BILINEAR,
            ) {
                Ok(scaler) => self.scaler = Some(scaler),
                Err(e) => {
                    warn!("创建像素格式转换上下文失败: {}", e);
                    return true;
                }
            }
        }

        let mut rgba = util::frame::Video::empty();
        if let Err(e) = self.scaler.as_mut().unwrap().run(frame, &mut rgba) {
            warn!("像素格式转换失败（已跳过）: {}", e);
            return true;
        }

        if rgba.width() != self.width || rgba.height() != self.height {
            warn!(
                "帧尺寸 {}x{} 与流尺寸 {}x{} 不一致，丢弃",
                rgba.width(),
                rgba.height(),
                self.width,
                self.height
            );
            return true;
        }

        let width = self.width as usize;
        let height = self.height as usize;
        let stride = rgba.stride(0);
        let src = rgba.data(0);
        let row_bytes = width * 4;

        self.pictures.acquire(pts, |dst| {
            for y in 0..height {
                let s = y * stride;
                let d = y * row_bytes;
                dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
            }
        })
    }
}

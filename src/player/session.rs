use crate::core::{ClockSet, MediaInfo, RefreshEvent, Result, SyncConfig, SyncMode};
use crate::player::audio_output::AudioOutput;
use crate::player::audio_stage::AudioStage;
use crate::player::demuxer::Demuxer;
use crate::player::dispatcher;
use crate::player::packet_queue::PacketQueue;
use crate::player::picture_buffer::PictureBuffer;
use crate::player::refresh::{RefreshState, RefreshTimer};
use crate::player::video_stage::VideoStage;
use crossbeam_channel::{unbounded, Receiver};
use ffmpeg_next as ffmpeg;
use log::info;
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// 媒体会话 - 一次打开的媒体源拥有的全部管线状态
///
/// 会话对象取代了全局状态：队列、画面缓冲、时钟组、各工作线程
/// 都由它独占；running 标志是它的字段，只与它派生的组件共享，
/// 也是唯一的取消机制。同一时间只应有一个活跃会话驱动音频设备。
pub struct Session {
    running: Arc<AtomicBool>,
    config: SyncConfig,
    clocks: Arc<ClockSet>,
    media_info: MediaInfo,
    audio_queue: Arc<PacketQueue>,
    video_queue: Arc<PacketQueue>,
    pictures: Option<Arc<PictureBuffer>>,
    presented: RwLock<Option<Vec<u8>>>,
    refresh_state: Mutex<RefreshState>,
    timer: RefreshTimer,
    events: Receiver<RefreshEvent>,
    dispatcher: Option<JoinHandle<()>>,
    video_thread: Option<JoinHandle<()>>,
    audio_output: Option<AudioOutput>,
}

impl Session {
    /// 打开媒体源并启动整条管线
    ///
    /// 成功返回时：解封装线程与视频解码线程已运行，音频设备已开始
    /// 拉取样本，首个刷新任务已排入定时器。失败条件：源打不开、
    /// 找不到可解码的音视频流、解码器或音频设备初始化失败。
    pub fn initialize(path: &str, config: SyncConfig) -> Result<Self> {
        ffmpeg::init()?;
        info!("初始化媒体会话: {}", path);

        let running = Arc::new(AtomicBool::new(true));
        let demuxer = Demuxer::open(path, running.clone())?;
        let media_info = demuxer.media_info().clone();
        info!("媒体信息: {:?}", media_info);

        let clocks = Arc::new(ClockSet::new(config.sync_mode));
        let audio_queue = Arc::new(PacketQueue::new(running.clone()));
        let video_queue = Arc::new(PacketQueue::new(running.clone()));

        // 视频子流：解码线程 + 画面缓冲
        let (pictures, video_thread) = if let Some(stream) = demuxer.video_stream() {
            let pictures = Arc::new(PictureBuffer::new(
                media_info.width,
                media_info.height,
                running.clone(),
            ));
            let stage = VideoStage::new(
                stream,
                video_queue.clone(),
                pictures.clone(),
                demuxer.nominal_frame_duration(),
            )?;
            (Some(pictures), Some(stage.spawn()))
        } else {
            (None, None)
        };

        // 音频子流：设备从这里开始按自己的节奏回调
        let audio_output = if let Some(stream) = demuxer.audio_stream() {
            let stage = AudioStage::new(stream, audio_queue.clone(), clocks.clone(), &config)?;
            Some(AudioOutput::start(stage)?)
        } else {
            None
        };

        // 解封装线程（拿走 demuxer 的所有权）
        let dispatcher = dispatcher::spawn(
            demuxer,
            video_queue.clone(),
            audio_queue.clone(),
            running.clone(),
            config.clone(),
        );

        // 刷新定时器与首个刷新任务
        let (events_tx, events_rx) = unbounded();
        let timer = RefreshTimer::new(running.clone(), events_tx);
        timer.schedule(Duration::from_millis(config.first_refresh_ms));

        let refresh_state = Mutex::new(RefreshState::new(clocks.external()));

        Ok(Self {
            running,
            config,
            clocks,
            media_info,
            audio_queue,
            video_queue,
            pictures,
            presented: RwLock::new(None),
            refresh_state,
            timer,
            events: events_rx,
            dispatcher: Some(dispatcher),
            video_thread,
            audio_output,
        })
    }

    /// 刷新事件接收端
    ///
    /// 宿主事件循环每收到一个事件，必须按顺序、不延迟地调用一次
    /// `refresh()`。
    pub fn refresh_events(&self) -> Receiver<RefreshEvent> {
        self.events.clone()
    }

    /// 刷新处理 - 每个 RefreshEvent 对应一次调用
    ///
    /// 画面缓冲为空就短延迟重试；有画面就绪时执行节奏算法：
    /// 把像素拷贝到对外帧缓冲、释放槽位、按修正后的间隔重新排定时器。
    pub fn refresh(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let pictures = match &self.pictures {
            Some(pictures) => pictures,
            None => {
                // 纯音频会话：慢速空转
                self.timer
                    .schedule(Duration::from_millis(self.config.no_video_refresh_ms));
                return;
            }
        };

        let presented_pts = pictures.peek_oldest(|picture| {
            let mut out = self.presented.write();
            let buffer = out.get_or_insert_with(|| vec![0u8; picture.data.len()]);
            buffer.copy_from_slice(&picture.data);
            picture.pts
        });

        match presented_pts {
            None => {
                self.timer
                    .schedule(Duration::from_millis(self.config.idle_refresh_ms));
            }
            Some(pts) => {
                self.clocks.set_video_pts(pts);

                // 视频自己是主时钟时不做修正
                let master = match self.clocks.mode() {
                    SyncMode::VideoMaster => None,
                    _ => Some(self.clocks.master()),
                };
                let now = self.clocks.external();
                let actual = self.refresh_state.lock().pace(pts, master, &self.config, now);

                pictures.release();

                // 定时器回调通常晚一点到，扣掉固定补偿
                let wait_ms =
                    (actual * 1000.0 + 0.5 - self.config.refresh_fudge_ms).max(1.0) as u64;
                self.timer.schedule(Duration::from_millis(wait_ms));
            }
        }
    }

    /// 最近一次呈现的帧像素（RGBA，流原始尺寸）
    ///
    /// 第一帧就绪之前返回 None。返回的是读保护的引用，调用方
    /// 每个渲染 tick 把它推进显示纹理即可，不产生拷贝。
    pub fn frame_pixels(&self) -> Option<MappedRwLockReadGuard<'_, [u8]>> {
        RwLockReadGuard::try_map(self.presented.read(), |p| p.as_deref()).ok()
    }

    pub fn width(&self) -> u32 {
        self.media_info.width
    }

    pub fn height(&self) -> u32 {
        self.media_info.height
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.media_info
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 当前主时钟读数（秒），宿主显示进度用
    pub fn position(&self) -> f64 {
        self.clocks.master()
    }

    /// 音频包队列的积压量（字节），调试/监控用
    pub fn audio_backlog_bytes(&self) -> usize {
        self.audio_queue.total_bytes()
    }

    /// 视频包队列的积压量（字节）
    pub fn video_backlog_bytes(&self) -> usize {
        self.video_queue.total_bytes()
    }

    /// 关闭会话
    ///
    /// 顺序很重要：先清 running 标志，再广播两个队列和画面缓冲的
    /// 条件变量（即使不再有新数据，阻塞中的消费者也必须被唤醒），
    /// 最后停定时器、join 各线程、释放音频设备。
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("关闭媒体会话");

        self.audio_queue.shutdown();
        self.video_queue.shutdown();
        if let Some(pictures) = &self.pictures {
            pictures.shutdown();
        }
        self.timer.shutdown();

        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
            info!("解封装线程已结束");
        }
        if let Some(handle) = self.video_thread.take() {
            let _ = handle.join();
            info!("视频解码线程已结束");
        }
        if let Some(mut output) = self.audio_output.take() {
            output.stop();
        }

        info!("媒体会话已关闭");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

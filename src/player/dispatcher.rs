use crate::core::{EngineError, StreamKind, SyncConfig};
use crate::player::demuxer::Demuxer;
use crate::player::packet_queue::PacketQueue;
use ffmpeg_next as ffmpeg;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 启动解封装线程
///
/// 循环：队列超限就小睡重试（背压），否则读一个包并按流索引路由。
/// 读到真正的源末尾时合成哨兵包入队并退出；running 清除时立即退出
/// （阻塞中的读取由解封装器的中断回调打断）。
pub fn spawn(
    mut demuxer: Demuxer,
    video_queue: Arc<PacketQueue>,
    audio_queue: Arc<PacketQueue>,
    running: Arc<AtomicBool>,
    config: SyncConfig,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("vrmedia-dispatch".to_string())
        .spawn(move || {
            info!("解封装线程启动: {}", demuxer.description());
            let mut packet_count: usize = 0;

            while running.load(Ordering::SeqCst) {
                // 背压：任一队列的累计字节超限就暂停读取
                if audio_queue.total_bytes() > config.max_audio_queue_bytes
                    || video_queue.total_bytes() > config.max_video_queue_bytes
                {
                    thread::sleep(Duration::from_millis(config.backpressure_poll_ms));
                    continue;
                }

                match demuxer.read_packet() {
                    Ok(Some((packet, kind))) => {
                        packet_count += 1;
                        match kind {
                            StreamKind::Video => video_queue.put(packet),
                            StreamKind::Audio => audio_queue.put(packet),
                        }
                    }
                    Ok(None) => {
                        // 源末尾：哨兵走音频队列（音频消费者按设备节奏运行，
                        // 要靠它感知播放结束）；没有音频流时改挂到视频队列。
                        let sentinel = ffmpeg::Packet::empty();
                        if demuxer.audio_stream_index().is_some() {
                            audio_queue.put(sentinel);
                        } else {
                            video_queue.put(sentinel);
                        }
                        info!("解封装到达源末尾，共读取 {} 个包", packet_count);
                        break;
                    }
                    Err(EngineError::Cancelled) => break,
                    Err(e) => {
                        // 瞬时读取错误：记录后重试
                        warn!("读取数据包失败: {}", e);
                        thread::sleep(Duration::from_millis(config.backpressure_poll_ms));
                    }
                }
            }

            info!("解封装线程退出");
        })
        .expect("spawn dispatcher thread")
}

use crate::core::{EngineError, Result};
use ffmpeg_next as ffmpeg;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 判断是否为流结束哨兵包
///
/// 哨兵是一个空包（无数据且 duration 为 0），由解封装线程在
/// 读到源末尾时合成；真实媒体包即使 duration 未知也带有数据。
pub fn is_end_of_stream(packet: &ffmpeg::Packet) -> bool {
    packet.size() == 0 && packet.duration() == 0
}

struct QueueInner {
    packets: VecDeque<ffmpeg::Packet>,
    total_bytes: usize,
}

/// 压缩包队列 - 解封装线程与解码阶段之间的 FIFO
///
/// 队列本身不限容量；背压由解封装线程按 `total_bytes` 粗粒度控制。
/// 取消通过会话级 running 标志协作完成：标志清除后，所有阻塞的
/// `get` 都会被 `shutdown` 的广播唤醒并返回 `Cancelled`。
pub struct PacketQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
    running: Arc<AtomicBool>,
}

impl PacketQueue {
    pub fn new(running: Arc<AtomicBool>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                packets: VecDeque::new(),
                total_bytes: 0,
            }),
            cond: Condvar::new(),
            running,
        }
    }

    /// 入队并唤醒一个等待的消费者
    ///
    /// 包的所有权移入队列，不存在复制失败的路径。
    pub fn put(&self, packet: ffmpeg::Packet) {
        let mut inner = self.inner.lock();
        inner.total_bytes += packet.size();
        inner.packets.push_back(packet);
        self.cond.notify_one();
    }

    /// 出队最旧的包
    ///
    /// - `Ok(Some(p))`: 取到一个包
    /// - `Ok(None)`: 非阻塞调用且队列为空
    /// - `Err(Cancelled)`: running 标志已清除（与"队列为空"严格区分）
    pub fn get(&self, block: bool) -> Result<Option<ffmpeg::Packet>> {
        let mut inner = self.inner.lock();
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(EngineError::Cancelled);
            }

            if let Some(packet) = inner.packets.pop_front() {
                inner.total_bytes -= packet.size();
                return Ok(Some(packet));
            }

            if !block {
                return Ok(None);
            }

            self.cond.wait(&mut inner);
        }
    }

    /// 当前累计字节数（背压判断用）
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 关停：广播唤醒所有阻塞的消费者
    ///
    /// 必须在 running 标志清除之后调用，否则消费者会继续等待。
    pub fn shutdown(&self) {
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn make_packet(len: usize) -> ffmpeg::Packet {
        ffmpeg::Packet::copy(&vec![0u8; len])
    }

    fn running_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    #[test]
    fn test_fifo_order_and_byte_accounting() {
        let queue = PacketQueue::new(running_flag());
        let sizes = [100usize, 7, 42, 1, 2048];

        for &len in &sizes {
            queue.put(make_packet(len));
        }
        assert_eq!(queue.len(), sizes.len());
        assert_eq!(queue.total_bytes(), sizes.iter().sum::<usize>());

        let mut remaining: usize = sizes.iter().sum();
        for &len in &sizes {
            let packet = queue.get(false).unwrap().unwrap();
            assert_eq!(packet.size(), len);
            remaining -= len;
            assert_eq!(queue.total_bytes(), remaining);
        }
        assert_eq!(queue.total_bytes(), 0);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_nonblocking_empty_is_not_cancellation() {
        let queue = PacketQueue::new(running_flag());
        assert!(matches!(queue.get(false), Ok(None)));
    }

    #[test]
    fn test_blocking_get_woken_by_put() {
        let running = running_flag();
        let queue = Arc::new(PacketQueue::new(running));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.get(true))
        };
        thread::sleep(Duration::from_millis(50));
        queue.put(make_packet(16));
        let got = consumer.join().unwrap().unwrap().unwrap();
        assert_eq!(got.size(), 16);
    }

    #[test]
    fn test_cancellation_wakes_blocked_consumer() {
        let running = running_flag();
        let queue = Arc::new(PacketQueue::new(running.clone()));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.get(true))
        };
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        running.store(false, Ordering::SeqCst);
        queue.shutdown();

        let result = consumer.join().unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sentinel_detection() {
        assert!(is_end_of_stream(&ffmpeg::Packet::empty()));
        assert!(!is_end_of_stream(&make_packet(1)));
    }
}

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 深度 2 就够了：解码线程最多领先呈现一帧
pub const PICTURE_QUEUE_SIZE: usize = 2;

/// 已解码、已转成 RGBA 的一帧画面
///
/// 槽位在打开视频流时一次性分配（width × height × 4 字节），之后复用。
pub struct DecodedPicture {
    pub pts: f64,
    pub data: Vec<u8>,
}

struct RingState {
    slots: Vec<DecodedPicture>,
    live: usize,
    read_index: usize,
    write_index: usize,
}

/// 画面环形缓冲 - 视频解码线程（唯一生产者）与刷新调度器（唯一消费者）之间的交接点
///
/// 一对 mutex/condvar 保护 live/read_index/write_index 三个字段；
/// 写满时生产者阻塞，取消时由 `shutdown` 广播释放。
pub struct PictureBuffer {
    state: Mutex<RingState>,
    cond: Condvar,
    running: Arc<AtomicBool>,
}

impl PictureBuffer {
    pub fn new(width: u32, height: u32, running: Arc<AtomicBool>) -> Self {
        let frame_bytes = width as usize * height as usize * 4;
        let slots = (0..PICTURE_QUEUE_SIZE)
            .map(|_| DecodedPicture {
                pts: 0.0,
                data: vec![0u8; frame_bytes],
            })
            .collect();
        Self {
            state: Mutex::new(RingState {
                slots,
                live: 0,
                read_index: 0,
                write_index: 0,
            }),
            cond: Condvar::new(),
            running,
        }
    }

    /// 等到有空槽后写入一帧并发布
    ///
    /// 返回 false 表示等待期间 running 标志被清除，调用方应退出循环。
    pub fn acquire(&self, pts: f64, fill: impl FnOnce(&mut [u8])) -> bool {
        let mut state = self.state.lock();
        while state.live == PICTURE_QUEUE_SIZE && self.running.load(Ordering::SeqCst) {
            self.cond.wait(&mut state);
        }
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }

        let index = state.write_index;
        state.slots[index].pts = pts;
        fill(&mut state.slots[index].data);
        state.write_index = (index + 1) % PICTURE_QUEUE_SIZE;
        state.live += 1;
        self.cond.notify_one();
        true
    }

    /// 只读访问最旧的一帧；缓冲为空时返回 None（不阻塞）
    pub fn peek_oldest<R>(&self, f: impl FnOnce(&DecodedPicture) -> R) -> Option<R> {
        let state = self.state.lock();
        if state.live == 0 {
            return None;
        }
        Some(f(&state.slots[state.read_index]))
    }

    /// 释放最旧的一帧并唤醒可能阻塞的生产者
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.live == 0 {
            return;
        }
        state.read_index = (state.read_index + 1) % PICTURE_QUEUE_SIZE;
        state.live -= 1;
        self.cond.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 关停：running 清除后广播，释放阻塞中的生产者
    pub fn shutdown(&self) {
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn buffer() -> (Arc<PictureBuffer>, Arc<AtomicBool>) {
        let running = Arc::new(AtomicBool::new(true));
        (
            Arc::new(PictureBuffer::new(2, 2, running.clone())),
            running,
        )
    }

    #[test]
    fn test_live_count_bounded() {
        let (buf, _running) = buffer();
        assert_eq!(buf.len(), 0);
        assert!(buf.acquire(0.1, |d| d.fill(1)));
        assert!(buf.acquire(0.2, |d| d.fill(2)));
        assert_eq!(buf.len(), PICTURE_QUEUE_SIZE);

        buf.release();
        assert_eq!(buf.len(), 1);
        buf.release();
        assert_eq!(buf.len(), 0);
        // 空缓冲上的 release 不会把计数减成负数
        buf.release();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_fifo_pts_order() {
        let (buf, _running) = buffer();
        assert!(buf.acquire(1.0, |_| {}));
        assert!(buf.acquire(2.0, |_| {}));

        assert_eq!(buf.peek_oldest(|p| p.pts), Some(1.0));
        buf.release();
        assert_eq!(buf.peek_oldest(|p| p.pts), Some(2.0));
        buf.release();
        assert_eq!(buf.peek_oldest(|p| p.pts), None);
    }

    #[test]
    fn test_blocked_writer_released_by_release() {
        let (buf, _running) = buffer();
        assert!(buf.acquire(1.0, |_| {}));
        assert!(buf.acquire(2.0, |_| {}));

        let writer = {
            let buf = buf.clone();
            thread::spawn(move || buf.acquire(3.0, |_| {}))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(buf.len(), PICTURE_QUEUE_SIZE);

        buf.release();
        assert!(writer.join().unwrap());
        assert_eq!(buf.len(), PICTURE_QUEUE_SIZE);
    }

    #[test]
    fn test_blocked_writer_released_by_shutdown() {
        let (buf, running) = buffer();
        assert!(buf.acquire(1.0, |_| {}));
        assert!(buf.acquire(2.0, |_| {}));

        let writer = {
            let buf = buf.clone();
            thread::spawn(move || buf.acquire(3.0, |_| {}))
        };
        thread::sleep(Duration::from_millis(50));

        running.store(false, Ordering::SeqCst);
        buf.shutdown();
        assert!(!writer.join().unwrap());
    }
}

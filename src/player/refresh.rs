use crate::core::{RefreshEvent, SyncConfig};
use crossbeam_channel::Sender;
use log::info;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 刷新节奏状态 - 维护调度基线与上一帧的 pts/间隔
pub struct RefreshState {
    frame_timer: f64,
    last_pts: f64,
    last_delay: f64,
}

impl RefreshState {
    /// `now` 用外部时钟（会话启动以来的秒数）作为调度基线起点
    pub fn new(now: f64) -> Self {
        Self {
            frame_timer: now,
            last_pts: 0.0,
            last_delay: 0.040,
        }
    }

    /// 计算呈现这帧后到下一次刷新的实际等待时间（秒）
    ///
    /// `master` 为 None 表示视频自己是主时钟，不做跳帧/拉伸修正。
    /// 落后主时钟超过阈值就立即呈现（delay 归零），超前就把间隔翻倍；
    /// 都是粗粒度修正，不丢帧。
    pub fn pace(&mut self, pts: f64, master: Option<f64>, config: &SyncConfig, now: f64) -> f64 {
        let mut delay = pts - self.last_pts;
        if delay <= 0.0 || delay >= 1.0 {
            // 间隔不合理，沿用上一次的
            delay = self.last_delay;
        }
        self.last_delay = delay;
        self.last_pts = pts;

        if let Some(master) = master {
            let diff = pts - master;
            let sync_threshold = if delay > config.sync_threshold {
                delay
            } else {
                config.sync_threshold
            };
            if diff.abs() < config.nosync_threshold {
                if diff <= -sync_threshold {
                    delay = 0.0;
                } else if diff >= sync_threshold {
                    delay = 2.0 * delay;
                }
            }
        }

        self.frame_timer += delay;
        let mut actual = self.frame_timer - now;
        if actual < config.min_refresh_delay {
            actual = config.min_refresh_delay;
        }
        actual
    }
}

struct TimerShared {
    deadline: Mutex<Option<Instant>>,
    cond: Condvar,
    running: Arc<AtomicBool>,
}

/// 刷新定时器 - 单个待决任务的延迟调度器
///
/// `schedule` 设置（或替换）唯一的待决期限，工作线程睡到期限后
/// 向宿主事件循环投递一个 RefreshEvent；`cancel` 直接移除待决任务。
/// 没有嵌套的回调重注册，取消就是清掉期限。
pub struct RefreshTimer {
    shared: Arc<TimerShared>,
    worker: Option<JoinHandle<()>>,
}

impl RefreshTimer {
    pub fn new(running: Arc<AtomicBool>, events: Sender<RefreshEvent>) -> Self {
        let shared = Arc::new(TimerShared {
            deadline: Mutex::new(None),
            cond: Condvar::new(),
            running,
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("vrmedia-timer".to_string())
                .spawn(move || Self::run(shared, events))
                .expect("spawn refresh timer thread")
        };

        Self {
            shared,
            worker: Some(worker),
        }
    }

    fn run(shared: Arc<TimerShared>, events: Sender<RefreshEvent>) {
        let mut deadline = shared.deadline.lock();
        while shared.running.load(Ordering::SeqCst) {
            match *deadline {
                None => {
                    shared.cond.wait(&mut deadline);
                }
                Some(at) => {
                    if Instant::now() >= at {
                        *deadline = None;
                        // 发送时不持锁，避免挡住 schedule/cancel
                        MutexGuard::unlocked(&mut deadline, || {
                            let _ = events.send(RefreshEvent);
                        });
                    } else {
                        shared.cond.wait_until(&mut deadline, at);
                    }
                }
            }
        }
        info!("刷新定时器线程退出");
    }

    /// 安排（或替换）下一次刷新
    pub fn schedule(&self, delay: Duration) {
        let mut deadline = self.shared.deadline.lock();
        *deadline = Some(Instant::now() + delay);
        self.shared.cond.notify_one();
    }

    /// 移除待决任务
    pub fn cancel(&self) {
        *self.shared.deadline.lock() = None;
        self.shared.cond.notify_one();
    }

    /// 关停：running 清除后唤醒并等待工作线程退出
    pub fn shutdown(&mut self) {
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn config() -> SyncConfig {
        SyncConfig::default()
    }

    #[test]
    fn test_implausible_delay_uses_previous() {
        let cfg = config();
        let mut state = RefreshState::new(0.0);
        // 第一帧的间隔 5.0s 不合理，应沿用初始的 40ms
        let actual = state.pace(5.0, None, &cfg, 0.0);
        assert!((actual - 0.040).abs() < 1e-9);
    }

    #[test]
    fn test_steady_cadence_without_master() {
        let cfg = config();
        let mut state = RefreshState::new(0.0);
        state.pace(0.0, None, &cfg, 0.0);
        // 均匀 30fps 序列，调度间隔应跟随帧间隔
        let actual = state.pace(1.0 / 30.0, None, &cfg, 0.0);
        assert!((actual - (0.040 + 1.0 / 30.0)).abs() < 1e-9);
    }

    #[test]
    fn test_behind_master_presents_immediately() {
        let cfg = config();
        let mut state = RefreshState::new(0.0);
        state.pace(1.0, None, &cfg, 0.0);
        let before = state.frame_timer;
        // 画面落后主时钟很多：delay 归零，调度基线不再前移
        let actual = state.pace(1.0 + 1.0 / 30.0, Some(5.0), &cfg, before);
        assert_eq!(state.frame_timer, before);
        assert!((actual - cfg.min_refresh_delay).abs() < 1e-9);
    }

    #[test]
    fn test_ahead_of_master_doubles_delay() {
        let cfg = config();
        let mut state = RefreshState::new(0.0);
        state.pace(1.0, None, &cfg, 0.0);
        let before = state.frame_timer;
        // 画面超前主时钟：间隔翻倍
        state.pace(1.0 + 1.0 / 30.0, Some(0.5), &cfg, 0.0);
        assert!((state.frame_timer - (before + 2.0 / 30.0)).abs() < 1e-9);
    }

    #[test]
    fn test_huge_desync_leaves_delay_unchanged() {
        let cfg = config();
        let mut state = RefreshState::new(0.0);
        state.pace(1.0, None, &cfg, 0.0);
        let before = state.frame_timer;
        // 偏差超过失同步阈值：不做修正
        state.pace(1.0 + 1.0 / 30.0, Some(100.0), &cfg, 0.0);
        assert!((state.frame_timer - (before + 1.0 / 30.0)).abs() < 1e-9);
    }

    #[test]
    fn test_timer_fires_once_per_schedule() {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = unbounded();
        let mut timer = RefreshTimer::new(running.clone(), tx);

        timer.schedule(Duration::from_millis(10));
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        // 没有重新安排就不会再触发
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        running.store(false, Ordering::SeqCst);
        timer.shutdown();
    }

    #[test]
    fn test_cancel_removes_pending_task() {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = unbounded();
        let mut timer = RefreshTimer::new(running.clone(), tx);

        timer.schedule(Duration::from_millis(200));
        timer.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());

        running.store(false, Ordering::SeqCst);
        timer.shutdown();
    }
}

use anyhow::Result;
use log::info;
use vrmedia::{Session, SyncConfig};

/// 无界面播放演示：打开文件，把刷新事件转回会话，直到播完为止
fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("用法: play <媒体文件>"))?;

    let mut session = Session::initialize(&path, SyncConfig::default())?;
    info!(
        "已打开: {}x{} @ {:.2} fps, 时长 {} ms",
        session.width(),
        session.height(),
        session.media_info().fps,
        session.media_info().duration
    );

    let duration_secs = session.media_info().duration as f64 / 1000.0;
    let events = session.refresh_events();
    let mut presented: u64 = 0;

    // 宿主事件循环：每个刷新事件恰好转发一次
    for _event in events.iter() {
        session.refresh();

        if let Some(pixels) = session.frame_pixels() {
            // 真实宿主在这里把 pixels 推进显示纹理
            presented += 1;
            if presented % 120 == 0 {
                info!(
                    "位置 {:.2}s，已呈现 {} 次（{} 字节/帧）",
                    session.position(),
                    presented,
                    pixels.len()
                );
            }
        }

        // 播完后多给一秒，让尾部的音频放完
        if duration_secs > 0.0 && session.position() > duration_secs + 1.0 {
            break;
        }
    }

    info!("播放结束，共呈现 {} 次", presented);
    session.shutdown();
    Ok(())
}

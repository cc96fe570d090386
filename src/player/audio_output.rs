use crate::core::{EngineError, Result};
use crate::player::audio_stage::AudioStage;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use log::{debug, error, info};

/// 音频输出 - 用 cpal 打开输出流，设备回调直接拉动解码阶段
pub struct AudioOutput {
    stream: Option<Stream>,
}

// cpal::Stream 本身不是 Send，但 Session 创建后只在持有它的线程上
// 启停，不会跨线程使用
unsafe impl Send for AudioOutput {}

impl AudioOutput {
    /// 打开输出流并立即开始播放（设备从此开始回调 `fill`）
    pub fn start(mut stage: AudioStage) -> Result<Self> {
        let sample_rate = stage.sample_rate();
        info!("初始化音频输出: {} Hz, 双声道 s16", sample_rate);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| EngineError::Audio("无法找到音频输出设备".to_string()))?;

        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let config = StreamConfig {
            channels: 2,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    stage.fill(data);
                },
                move |err| {
                    error!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| EngineError::Audio(format!("创建音频流失败: {}", e)))?;

        stream
            .play()
            .map_err(|e| EngineError::Audio(format!("启动音频流失败: {}", e)))?;

        info!("音频输出已启动");
        Ok(Self {
            stream: Some(stream),
        })
    }

    /// 停止播放并释放设备流
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            info!("音频输出已停止");
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

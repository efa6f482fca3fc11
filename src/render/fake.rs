//! 测试用渲染器
//!
//! 记录所有调用，结果可配置；渲染由测试通过 `FakeHandle::render` 手动驱动。

use std::sync::{Arc, Mutex, MutexGuard};

use super::{DeviceClass, NegotiatedFormat, Renderer, RendererError};
use crate::audio::{RenderCursor, SampleLayout, StreamFormat};
use crate::engine::spatial::SpatialScene;

#[derive(Clone, Debug, PartialEq)]
pub enum FakeCall {
    Configure(StreamFormat),
    Start,
    Pause,
    Resume,
    Stop,
    Spatial(SpatialScene),
}

#[derive(Clone, Debug)]
pub struct FakeBehavior {
    pub name: String,
    pub reject_format: bool,
    pub fail_start: bool,
    /// None 表示查询失败
    pub device_class: Option<DeviceClass>,
    pub spatial_error: bool,
    pub layout: SampleLayout,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            name: "Fake Output".to_string(),
            reject_format: false,
            fail_start: false,
            device_class: Some(DeviceClass::Other),
            spatial_error: false,
            layout: SampleLayout::Interleaved,
        }
    }
}

#[derive(Default)]
struct FakeState {
    behavior: Option<FakeBehavior>,
    calls: Vec<FakeCall>,
    cursor: Option<RenderCursor>,
    format: Option<StreamFormat>,
    paused: bool,
}

/// 测试侧句柄，与渲染器共享状态
#[derive(Clone, Default)]
pub struct FakeHandle(Arc<Mutex<FakeState>>);

impl FakeHandle {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn last_scene(&self) -> Option<SpatialScene> {
        self.lock().calls.iter().rev().find_map(|c| match c {
            FakeCall::Spatial(scene) => Some(*scene),
            _ => None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.lock().cursor.is_some()
    }

    /// 模拟一次渲染回调，返回有效帧数；未运行或暂停时返回 0
    pub fn render(&self, frames: usize) -> usize {
        let mut state = self.lock();
        let channels = state.format.map(|f| f.channels as usize).unwrap_or(2);
        if state.paused {
            return 0;
        }
        match state.cursor.as_mut() {
            Some(cursor) => {
                let mut out = vec![0.0f32; frames * channels];
                cursor.render_interleaved(&mut out, channels)
            }
            None => 0,
        }
    }

    /// 模拟渲染上下文报告故障
    pub fn fault(&self) {
        if let Some(cursor) = self.lock().cursor.as_ref() {
            cursor.mark_faulted();
        }
    }

    pub fn set_behavior(&self, behavior: FakeBehavior) {
        self.lock().behavior = Some(behavior);
    }
}

pub struct FakeRenderer {
    handle: FakeHandle,
}

impl FakeRenderer {
    pub fn new(behavior: FakeBehavior) -> (Self, FakeHandle) {
        let handle = FakeHandle::default();
        handle.set_behavior(behavior);
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }

    fn behavior(&self) -> FakeBehavior {
        self.handle.lock().behavior.clone().unwrap_or_default()
    }
}

impl Renderer for FakeRenderer {
    fn device_name(&self) -> String {
        self.behavior().name
    }

    fn configure(&mut self, format: StreamFormat) -> Result<NegotiatedFormat, RendererError> {
        let behavior = self.behavior();
        let mut state = self.handle.lock();
        state.calls.push(FakeCall::Configure(format));
        if behavior.reject_format {
            return Err(RendererError::UnsupportedFormat {
                sample_rate: format.sample_rate,
                channels: format.channels,
            });
        }
        state.format = Some(format);
        Ok(NegotiatedFormat {
            format,
            layout: behavior.layout,
        })
    }

    fn start(&mut self, cursor: RenderCursor) -> Result<(), RendererError> {
        let behavior = self.behavior();
        let mut state = self.handle.lock();
        state.calls.push(FakeCall::Start);
        if behavior.fail_start {
            return Err(RendererError::Unavailable("fake start failure".to_string()));
        }
        if state.format.is_none() {
            return Err(RendererError::NotConfigured);
        }
        state.cursor = Some(cursor);
        state.paused = false;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), RendererError> {
        let mut state = self.handle.lock();
        state.calls.push(FakeCall::Pause);
        state.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), RendererError> {
        let mut state = self.handle.lock();
        state.calls.push(FakeCall::Resume);
        state.paused = false;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.handle.lock();
        state.calls.push(FakeCall::Stop);
        state.cursor = None;
        state.paused = false;
    }

    fn device_class(&self) -> Result<DeviceClass, RendererError> {
        self.behavior()
            .device_class
            .ok_or_else(|| RendererError::DeviceQuery("fake query failure".to_string()))
    }

    fn apply_spatial(&mut self, scene: &SpatialScene) -> Result<(), RendererError> {
        let behavior = self.behavior();
        if behavior.spatial_error {
            return Err(RendererError::Unavailable("fake spatial failure".to_string()));
        }
        self.handle.lock().calls.push(FakeCall::Spatial(*scene));
        Ok(())
    }
}

//! 空间音频控制
//!
//! 保存听者/声源的位置和朝向，启用时转发给渲染器。
//! 不做范围校验，数值原样传递。

use glam::Vec3;

use crate::render::{Renderer, RendererError};

/// 听者朝向（度）
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Orientation {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

impl Orientation {
    pub fn new(yaw: f32, pitch: f32, roll: f32) -> Self {
        Self { yaw, pitch, roll }
    }
}

/// 空间场景
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpatialScene {
    pub enabled: bool,
    pub listener_position: Vec3,
    pub listener_orientation: Orientation,
    pub source_position: Vec3,
}

impl Default for SpatialScene {
    fn default() -> Self {
        Self {
            enabled: false,
            listener_position: Vec3::ZERO,
            listener_orientation: Orientation::default(),
            source_position: Vec3::ZERO,
        }
    }
}

/// 空间音频控制器
#[derive(Debug, Default)]
pub struct SpatialController {
    scene: SpatialScene,
    /// 渲染器接受了最近一次推送的启用场景
    rendered: bool,
}

impl SpatialController {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.scene.enabled
    }

    /// 启用且渲染器确实在做空间渲染
    #[inline]
    pub fn is_rendered(&self) -> bool {
        self.rendered
    }

    #[inline]
    pub fn scene(&self) -> &SpatialScene {
        &self.scene
    }

    /// 切换启用状态；启用时推送最近一次设置的完整场景
    pub fn set_enabled(&mut self, enabled: bool, renderer: &mut dyn Renderer) {
        if self.scene.enabled == enabled {
            return;
        }
        self.scene.enabled = enabled;
        log::info!(
            "Spatial audio {}",
            if enabled { "enabled" } else { "disabled" }
        );
        self.push(renderer);
    }

    pub fn set_listener_position(&mut self, position: Vec3, renderer: &mut dyn Renderer) {
        self.scene.listener_position = position;
        self.forward(renderer);
    }

    pub fn set_listener_orientation(
        &mut self,
        orientation: Orientation,
        renderer: &mut dyn Renderer,
    ) {
        self.scene.listener_orientation = orientation;
        self.forward(renderer);
    }

    pub fn set_source_position(&mut self, position: Vec3, renderer: &mut dyn Renderer) {
        self.scene.source_position = position;
        self.forward(renderer);
    }

    /// 重新推送当前场景（渲染器重新启动后调用）
    pub fn reapply(&mut self, renderer: &mut dyn Renderer) {
        self.forward(renderer);
    }

    fn forward(&mut self, renderer: &mut dyn Renderer) {
        if self.scene.enabled {
            self.push(renderer);
        }
    }

    fn push(&mut self, renderer: &mut dyn Renderer) {
        let accepted = match renderer.apply_spatial(&self.scene) {
            Ok(()) => true,
            Err(RendererError::SpatialUnsupported(name)) => {
                log::debug!("Spatial update ignored: {} has no spatial support", name);
                false
            }
            Err(e) => {
                log::warn!("Spatial update rejected by renderer: {}", e);
                false
            }
        };
        self.rendered = self.scene.enabled && accepted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::fake::{FakeBehavior, FakeCall, FakeRenderer};

    #[test]
    fn test_setters_store_without_forwarding_when_disabled() {
        let (mut renderer, handle) = FakeRenderer::new(FakeBehavior::default());
        let mut spatial = SpatialController::new();

        spatial.set_listener_position(Vec3::new(1.0, 2.0, 3.0), &mut renderer);
        spatial.set_source_position(Vec3::new(0.0, 0.0, -5.0), &mut renderer);

        assert_eq!(spatial.scene().listener_position, Vec3::new(1.0, 2.0, 3.0));
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_enable_pushes_last_scene() {
        let (mut renderer, handle) = FakeRenderer::new(FakeBehavior::default());
        let mut spatial = SpatialController::new();

        spatial.set_listener_orientation(Orientation::new(90.0, 0.0, 0.0), &mut renderer);
        spatial.set_enabled(true, &mut renderer);

        let scene = handle.last_scene().unwrap();
        assert!(scene.enabled);
        assert_eq!(scene.listener_orientation.yaw, 90.0);

        // 启用后每次设置都转发
        spatial.set_source_position(Vec3::X, &mut renderer);
        assert_eq!(handle.last_scene().unwrap().source_position, Vec3::X);
        assert_eq!(
            handle
                .calls()
                .iter()
                .filter(|c| matches!(c, FakeCall::Spatial(_)))
                .count(),
            2
        );
    }

    #[test]
    fn test_out_of_range_values_pass_through() {
        let (mut renderer, handle) = FakeRenderer::new(FakeBehavior::default());
        let mut spatial = SpatialController::new();
        spatial.set_enabled(true, &mut renderer);

        spatial.set_listener_orientation(Orientation::new(720.0, -400.0, 1e6), &mut renderer);
        let scene = handle.last_scene().unwrap();
        assert_eq!(scene.listener_orientation, Orientation::new(720.0, -400.0, 1e6));
    }

    #[test]
    fn test_renderer_error_absorbed() {
        let behavior = FakeBehavior {
            spatial_error: true,
            ..FakeBehavior::default()
        };
        let (mut renderer, _handle) = FakeRenderer::new(behavior);
        let mut spatial = SpatialController::new();

        spatial.set_enabled(true, &mut renderer);
        spatial.set_listener_position(Vec3::ONE, &mut renderer);
        assert!(spatial.is_enabled());
        assert!(!spatial.is_rendered());
        assert_eq!(spatial.scene().listener_position, Vec3::ONE);
    }

    #[test]
    fn test_rendered_follows_enabled_state() {
        let (mut renderer, _handle) = FakeRenderer::new(FakeBehavior::default());
        let mut spatial = SpatialController::new();
        assert!(!spatial.is_rendered());

        spatial.set_enabled(true, &mut renderer);
        assert!(spatial.is_rendered());

        spatial.set_enabled(false, &mut renderer);
        assert!(!spatial.is_rendered());
    }
}

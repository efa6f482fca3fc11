//! 设备适配策略
//!
//! 启用时查询输出设备类别：无线耳机自动打开空间音频、
//! 在设备名后加后缀并加深队列。查询失败不阻止启用。

use crate::render::{DeviceClass, Renderer};

/// 设备适配配置
#[derive(Clone, Debug)]
pub struct AdaptationConfig {
    pub enabled: bool,
    /// 无线耳机自动启用空间音频
    pub auto_spatial: bool,
    pub label_suffix: String,
    /// 无线耳机的最小队列容量
    pub min_queue_capacity: usize,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_spatial: true,
            label_suffix: " (Spatial)".to_string(),
            min_queue_capacity: 6,
        }
    }
}

/// 一次启用的适配结果
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Adaptation {
    pub device_class: Option<DeviceClass>,
    pub enable_spatial: bool,
    /// None 表示使用渲染器自带的设备名
    pub device_label: Option<String>,
    pub min_queue_capacity: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct DeviceAdaptationPolicy {
    config: AdaptationConfig,
}

impl DeviceAdaptationPolicy {
    pub fn new(config: AdaptationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AdaptationConfig {
        &self.config
    }

    /// 查询设备类别，失败记录日志并返回 None
    pub fn classify(&self, renderer: &dyn Renderer) -> Option<DeviceClass> {
        match renderer.device_class() {
            Ok(class) => Some(class),
            Err(e) => {
                log::warn!("Device classification failed: {}", e);
                None
            }
        }
    }

    pub fn on_enable(&self, renderer: &dyn Renderer) -> Adaptation {
        if !self.config.enabled {
            return Adaptation::default();
        }

        let device_class = self.classify(renderer);
        if !device_class.is_some_and(DeviceClass::is_wireless_headset) {
            return Adaptation {
                device_class,
                ..Adaptation::default()
            };
        }

        let label = format!("{}{}", renderer.device_name(), self.config.label_suffix);
        log::info!("Wireless headset detected: {}", label);

        Adaptation {
            device_class,
            enable_spatial: self.config.auto_spatial,
            device_label: Some(label),
            min_queue_capacity: Some(self.config.min_queue_capacity),
        }
    }
}

//! Core Audio 默认输出渲染器
//!
//! 使用 DefaultOutput AudioUnit（经系统混音器，跟随系统默认设备）。
//! 流格式固定为 Float32 非交织，渲染回调直接驱动 `RenderCursor::render_planar`。
//! 设备类别由默认设备的传输类型判断（Bluetooth / Bluetooth LE）。

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::CachePadded;

use super::{DeviceClass, NegotiatedFormat, Renderer, RendererError};
use crate::audio::{RenderCursor, SampleLayout, StreamFormat, MAX_CHANNELS};
use crate::engine::spatial::SpatialScene;

/// Core Audio 类型定义
type AudioDeviceID = u32;
type AudioObjectID = u32;
type AudioObjectPropertySelector = u32;
type AudioObjectPropertyScope = u32;
type AudioObjectPropertyElement = u32;
type OSStatus = i32;
type AudioUnit = *mut c_void;
type AudioComponent = *mut c_void;

const NO_ERR: OSStatus = 0;

const K_AUDIO_OBJECT_SYSTEM_OBJECT: AudioObjectID = 1;
const K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE: AudioObjectPropertySelector = 0x644F7574; // 'dOut'
const K_AUDIO_DEVICE_PROPERTY_TRANSPORT_TYPE: AudioObjectPropertySelector = 0x7472616E; // 'tran'
const K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL: AudioObjectPropertyScope = 0x676C6F62; // 'glob'
const K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN: AudioObjectPropertyElement = 0;

const K_AUDIO_DEVICE_TRANSPORT_TYPE_BLUETOOTH: u32 = 0x626C7565; // 'blue'
const K_AUDIO_DEVICE_TRANSPORT_TYPE_BLUETOOTH_LE: u32 = 0x62746C65; // 'btle'

const K_AUDIO_FORMAT_LINEAR_PCM: u32 = 0x6C70636D; // 'lpcm'
const K_AUDIO_FORMAT_FLAG_IS_FLOAT: u32 = 1 << 0;
const K_AUDIO_FORMAT_FLAG_IS_PACKED: u32 = 1 << 3;
const K_AUDIO_FORMAT_FLAG_IS_NON_INTERLEAVED: u32 = 1 << 5;

const K_AUDIO_UNIT_SCOPE_INPUT: u32 = 1;
const K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT: u32 = 8;
const K_AUDIO_UNIT_PROPERTY_SET_RENDER_CALLBACK: u32 = 23;

const K_AUDIO_UNIT_TYPE_OUTPUT: u32 = 0x61756F75; // 'auou'
const K_AUDIO_UNIT_SUB_TYPE_DEFAULT_OUTPUT: u32 = 0x64656620; // 'def '
const K_AUDIO_UNIT_MANUFACTURER_APPLE: u32 = 0x6170706C; // 'appl'

/// Core Audio 支持的采样率范围（经系统混音器 SRC）
const MIN_SAMPLE_RATE: f64 = 8_000.0;
const MAX_SAMPLE_RATE: f64 = 384_000.0;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct AudioObjectPropertyAddress {
    selector: AudioObjectPropertySelector,
    scope: AudioObjectPropertyScope,
    element: AudioObjectPropertyElement,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct AudioStreamBasicDescription {
    sample_rate: f64,
    format_id: u32,
    format_flags: u32,
    bytes_per_packet: u32,
    frames_per_packet: u32,
    bytes_per_frame: u32,
    channels_per_frame: u32,
    bits_per_channel: u32,
    reserved: u32,
}

#[repr(C)]
struct AudioComponentDescription {
    component_type: u32,
    component_sub_type: u32,
    component_manufacturer: u32,
    component_flags: u32,
    component_flags_mask: u32,
}

#[repr(C)]
struct AURenderCallbackStruct {
    input_proc: RenderCallback,
    input_proc_ref_con: *mut c_void,
}

type RenderCallback = extern "C" fn(
    in_ref_con: *mut c_void,
    io_action_flags: *mut u32,
    in_time_stamp: *const c_void,
    in_bus_number: u32,
    in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OSStatus;

/// 变长结构：`buffers` 实际有 `number_buffers` 个元素
#[repr(C)]
struct AudioBufferList {
    number_buffers: u32,
    buffers: [AudioBuffer; 1],
}

#[repr(C)]
struct AudioBuffer {
    number_channels: u32,
    data_byte_size: u32,
    data: *mut c_void,
}

#[link(name = "CoreAudio", kind = "framework")]
extern "C" {
    fn AudioObjectGetPropertyData(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        data_size: *mut u32,
        data: *mut c_void,
    ) -> OSStatus;
}

#[link(name = "AudioToolbox", kind = "framework")]
extern "C" {
    fn AudioComponentFindNext(
        component: AudioComponent,
        desc: *const AudioComponentDescription,
    ) -> AudioComponent;

    fn AudioComponentInstanceNew(component: AudioComponent, out: *mut AudioUnit) -> OSStatus;

    fn AudioComponentInstanceDispose(instance: AudioUnit) -> OSStatus;

    fn AudioUnitInitialize(unit: AudioUnit) -> OSStatus;
    fn AudioUnitUninitialize(unit: AudioUnit) -> OSStatus;
    fn AudioOutputUnitStart(unit: AudioUnit) -> OSStatus;
    fn AudioOutputUnitStop(unit: AudioUnit) -> OSStatus;

    fn AudioUnitSetProperty(
        unit: AudioUnit,
        id: u32,
        scope: u32,
        element: u32,
        data: *const c_void,
        size: u32,
    ) -> OSStatus;
}

/// 回调上下文，地址在 start 到 stop 之间固定
struct CallbackContext {
    cursor: RenderCursor,
    running: CachePadded<AtomicBool>,
}

pub struct CoreAudioRenderer {
    audio_unit: AudioUnit,
    format: Option<StreamFormat>,
    initialized: bool,
    context: Option<Box<CallbackContext>>,
    paused: bool,
}

// AudioUnit 句柄只在生产者线程上操作
unsafe impl Send for CoreAudioRenderer {}

impl CoreAudioRenderer {
    pub fn new() -> Result<Self, RendererError> {
        let desc = AudioComponentDescription {
            component_type: K_AUDIO_UNIT_TYPE_OUTPUT,
            component_sub_type: K_AUDIO_UNIT_SUB_TYPE_DEFAULT_OUTPUT,
            component_manufacturer: K_AUDIO_UNIT_MANUFACTURER_APPLE,
            component_flags: 0,
            component_flags_mask: 0,
        };

        let component = unsafe { AudioComponentFindNext(ptr::null_mut(), &desc) };
        if component.is_null() {
            return Err(RendererError::Unavailable(
                "DefaultOutput component not found".to_string(),
            ));
        }

        let mut audio_unit: AudioUnit = ptr::null_mut();
        let status = unsafe { AudioComponentInstanceNew(component, &mut audio_unit) };
        if status != NO_ERR {
            return Err(RendererError::Os(status));
        }

        log::info!("Using DefaultOutput (via system mixer)");
        Ok(Self {
            audio_unit,
            format: None,
            initialized: false,
            context: None,
            paused: false,
        })
    }

    /// 获取默认输出设备
    fn default_device_id() -> Result<AudioDeviceID, RendererError> {
        let address = AudioObjectPropertyAddress {
            selector: K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE,
            scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };

        let mut device_id: AudioDeviceID = 0;
        let mut size = std::mem::size_of::<AudioDeviceID>() as u32;

        let status = unsafe {
            AudioObjectGetPropertyData(
                K_AUDIO_OBJECT_SYSTEM_OBJECT,
                &address,
                0,
                ptr::null(),
                &mut size,
                &mut device_id as *mut _ as *mut c_void,
            )
        };

        if status != NO_ERR {
            return Err(RendererError::Os(status));
        }
        if device_id == 0 {
            return Err(RendererError::DeviceQuery("no default output device".to_string()));
        }
        Ok(device_id)
    }

    /// 读取设备传输类型
    fn transport_type(device_id: AudioDeviceID) -> Result<u32, RendererError> {
        let address = AudioObjectPropertyAddress {
            selector: K_AUDIO_DEVICE_PROPERTY_TRANSPORT_TYPE,
            scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };

        let mut transport_type: u32 = 0;
        let mut size = std::mem::size_of::<u32>() as u32;

        let status = unsafe {
            AudioObjectGetPropertyData(
                device_id,
                &address,
                0,
                ptr::null(),
                &mut size,
                &mut transport_type as *mut _ as *mut c_void,
            )
        };

        if status != NO_ERR {
            return Err(RendererError::Os(status));
        }
        Ok(transport_type)
    }

    /// 获取设备名称
    fn device_name_of(device_id: AudioDeviceID) -> String {
        use core_foundation::base::TCFType;
        use core_foundation::string::CFString;
        use coreaudio_sys::{
            kAudioObjectPropertyElementMain, kAudioObjectPropertyName,
            kAudioObjectPropertyScopeGlobal, AudioObjectGetPropertyData as sysGetPropertyData,
            AudioObjectPropertyAddress as SysPropertyAddress,
        };

        let address = SysPropertyAddress {
            mSelector: kAudioObjectPropertyName,
            mScope: kAudioObjectPropertyScopeGlobal,
            mElement: kAudioObjectPropertyElementMain,
        };

        let mut size: u32 = std::mem::size_of::<*const c_void>() as u32;
        let mut cf_string_ref: *const c_void = ptr::null();

        let status = unsafe {
            sysGetPropertyData(
                device_id,
                &address,
                0,
                ptr::null(),
                &mut size,
                &mut cf_string_ref as *mut _ as *mut c_void,
            )
        };

        if status != 0 || cf_string_ref.is_null() {
            return format!("Device {}", device_id);
        }

        // create rule：我们持有引用，drop 时释放
        let cf_string = unsafe { CFString::wrap_under_create_rule(cf_string_ref as *const _) };
        cf_string.to_string()
    }

    fn uninitialize(&mut self) {
        if self.initialized {
            let _ = unsafe { AudioUnitUninitialize(self.audio_unit) };
            self.initialized = false;
        }
    }
}

impl Renderer for CoreAudioRenderer {
    fn device_name(&self) -> String {
        match Self::default_device_id() {
            Ok(id) => Self::device_name_of(id),
            Err(_) => "Default Output".to_string(),
        }
    }

    fn configure(&mut self, format: StreamFormat) -> Result<NegotiatedFormat, RendererError> {
        if self.context.is_some() {
            return Err(RendererError::InvalidState("configure while running"));
        }

        let unsupported = RendererError::UnsupportedFormat {
            sample_rate: format.sample_rate,
            channels: format.channels,
        };
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&format.sample_rate)
            || !(1..=MAX_CHANNELS).contains(&format.channels)
        {
            return Err(unsupported);
        }

        self.uninitialize();

        // 非交织：每个 buffer 一个声道，bytes_per_frame 按单声道计
        let asbd = AudioStreamBasicDescription {
            sample_rate: format.sample_rate,
            format_id: K_AUDIO_FORMAT_LINEAR_PCM,
            format_flags: K_AUDIO_FORMAT_FLAG_IS_FLOAT
                | K_AUDIO_FORMAT_FLAG_IS_PACKED
                | K_AUDIO_FORMAT_FLAG_IS_NON_INTERLEAVED,
            bytes_per_packet: 4,
            frames_per_packet: 1,
            bytes_per_frame: 4,
            channels_per_frame: format.channels,
            bits_per_channel: 32,
            reserved: 0,
        };

        let status = unsafe {
            AudioUnitSetProperty(
                self.audio_unit,
                K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT,
                K_AUDIO_UNIT_SCOPE_INPUT,
                0,
                &asbd as *const _ as *const c_void,
                std::mem::size_of::<AudioStreamBasicDescription>() as u32,
            )
        };
        if status != NO_ERR {
            log::warn!("Stream format {} rejected (OSStatus {})", format, status);
            return Err(unsupported);
        }

        self.format = Some(format);
        log::info!("Core Audio configured: {} Float32 non-interleaved", format);
        Ok(NegotiatedFormat {
            format,
            layout: SampleLayout::Planar,
        })
    }

    fn start(&mut self, cursor: RenderCursor) -> Result<(), RendererError> {
        if self.context.is_some() {
            return Err(RendererError::InvalidState("already running"));
        }
        if self.format.is_none() {
            return Err(RendererError::NotConfigured);
        }

        let mut context = Box::new(CallbackContext {
            cursor,
            running: CachePadded::new(AtomicBool::new(true)),
        });
        let callback_struct = AURenderCallbackStruct {
            input_proc: render_callback,
            input_proc_ref_con: &mut *context as *mut CallbackContext as *mut c_void,
        };

        let status = unsafe {
            AudioUnitSetProperty(
                self.audio_unit,
                K_AUDIO_UNIT_PROPERTY_SET_RENDER_CALLBACK,
                K_AUDIO_UNIT_SCOPE_INPUT,
                0,
                &callback_struct as *const _ as *const c_void,
                std::mem::size_of::<AURenderCallbackStruct>() as u32,
            )
        };
        if status != NO_ERR {
            return Err(RendererError::Os(status));
        }

        if !self.initialized {
            let status = unsafe { AudioUnitInitialize(self.audio_unit) };
            if status != NO_ERR {
                return Err(RendererError::Os(status));
            }
            self.initialized = true;
        }

        // 先保存上下文，保证回调开始时地址有效
        self.context = Some(context);
        let status = unsafe { AudioOutputUnitStart(self.audio_unit) };
        if status != NO_ERR {
            self.context = None;
            return Err(RendererError::Os(status));
        }

        self.paused = false;
        log::info!("Core Audio output started");
        Ok(())
    }

    fn pause(&mut self) -> Result<(), RendererError> {
        if self.context.is_none() {
            return Err(RendererError::InvalidState("pause while stopped"));
        }
        if self.paused {
            return Ok(());
        }

        let status = unsafe { AudioOutputUnitStop(self.audio_unit) };
        if status != NO_ERR {
            return Err(RendererError::Os(status));
        }
        self.paused = true;
        log::info!("Core Audio output paused");
        Ok(())
    }

    fn resume(&mut self) -> Result<(), RendererError> {
        if self.context.is_none() {
            return Err(RendererError::InvalidState("resume while stopped"));
        }
        if !self.paused {
            return Ok(());
        }

        let status = unsafe { AudioOutputUnitStart(self.audio_unit) };
        if status != NO_ERR {
            return Err(RendererError::Os(status));
        }
        self.paused = false;
        log::info!("Core Audio output resumed");
        Ok(())
    }

    fn stop(&mut self) {
        let Some(context) = self.context.as_ref() else {
            return;
        };
        context.running.store(false, Ordering::Release);

        // AudioOutputUnitStop 返回后回调不再被调用
        let _ = unsafe { AudioOutputUnitStop(self.audio_unit) };
        self.context = None;
        self.paused = false;
        log::info!("Core Audio output stopped");
    }

    fn device_class(&self) -> Result<DeviceClass, RendererError> {
        let device_id = Self::default_device_id()?;
        let transport = Self::transport_type(device_id)?;

        if transport == K_AUDIO_DEVICE_TRANSPORT_TYPE_BLUETOOTH
            || transport == K_AUDIO_DEVICE_TRANSPORT_TYPE_BLUETOOTH_LE
        {
            Ok(DeviceClass::WirelessHeadset)
        } else {
            Ok(DeviceClass::Other)
        }
    }

    fn apply_spatial(&mut self, _scene: &SpatialScene) -> Result<(), RendererError> {
        Err(RendererError::SpatialUnsupported("DefaultOutput".to_string()))
    }
}

impl Drop for CoreAudioRenderer {
    fn drop(&mut self) {
        self.stop();
        self.uninitialize();
        if !self.audio_unit.is_null() {
            let _ = unsafe { AudioComponentInstanceDispose(self.audio_unit) };
        }
    }
}

/// Render Callback (AudioUnit)
///
/// **绝对禁止：**
/// - 锁
/// - 分配
/// - I/O
extern "C" fn render_callback(
    in_ref_con: *mut c_void,
    _io_action_flags: *mut u32,
    _in_time_stamp: *const c_void,
    _in_bus_number: u32,
    _in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OSStatus {
    let ctx = unsafe { &mut *(in_ref_con as *mut CallbackContext) };
    let list = unsafe { &mut *io_data };

    let count = (list.number_buffers as usize).min(MAX_CHANNELS as usize);
    let buffers = list.buffers.as_mut_ptr();
    let mut planes: [&mut [f32]; MAX_CHANNELS as usize] = Default::default();
    for (i, plane) in planes.iter_mut().enumerate().take(count) {
        let buffer = unsafe { &mut *buffers.add(i) };
        let len = buffer.data_byte_size as usize / std::mem::size_of::<f32>();
        *plane = unsafe { std::slice::from_raw_parts_mut(buffer.data as *mut f32, len) };
    }

    if ctx.running.load(Ordering::Acquire) {
        ctx.cursor.render_planar(&mut planes[..count]);
    } else {
        for plane in planes[..count].iter_mut() {
            plane.fill(0.0);
        }
    }

    NO_ERR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // 需要音频设备
    fn test_default_device_class() {
        let renderer = CoreAudioRenderer::new().unwrap();
        println!("Device: {}", renderer.device_name());
        assert!(renderer.device_class().is_ok());
    }

    #[test]
    #[ignore] // 需要音频设备
    fn test_configure_planar() {
        let mut renderer = CoreAudioRenderer::new().unwrap();
        let negotiated = renderer.configure(StreamFormat::new(48000.0, 2)).unwrap();
        assert_eq!(negotiated.layout, SampleLayout::Planar);
    }
}

//! Local audio device inventory: enumeration and selection of input/output
//! devices, with per-device error state surfaced to the UI collaborator.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Device;
use tracing::warn;

/// Display name used for the platform default device slot.
pub const SYSTEM_DEFAULT_DEVICE_NAME: &str = "System Default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    pub name: String,
    pub is_default: bool,
}

impl AudioDevice {
    pub fn system_default() -> Self {
        Self {
            name: SYSTEM_DEFAULT_DEVICE_NAME.to_string(),
            is_default: true,
        }
    }
}

impl std::fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone)]
pub enum DeviceError {
    NotFound(String),
    /// Enumeration failed at the host layer.
    Enumeration(String),
    /// The device exists but could not be opened (busy, revoked permission).
    Unavailable(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::NotFound(name) => write!(f, "audio device '{}' not found", name),
            DeviceError::Enumeration(msg) => write!(f, "device enumeration failed: {}", msg),
            DeviceError::Unavailable(msg) => write!(f, "audio device unavailable: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Lists available input devices, default slot first.
pub fn list_input_devices() -> Vec<AudioDevice> {
    let mut devices = vec![AudioDevice::system_default()];
    match cpal::default_host().input_devices() {
        Ok(inputs) => {
            for device in inputs {
                if let Ok(name) = device.name() {
                    if !devices.iter().any(|d| d.name == name) {
                        devices.push(AudioDevice {
                            name,
                            is_default: false,
                        });
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "Input device enumeration failed"),
    }
    devices
}

/// Lists available output devices, default slot first.
pub fn list_output_devices() -> Vec<AudioDevice> {
    let mut devices = vec![AudioDevice::system_default()];
    match cpal::default_host().output_devices() {
        Ok(outputs) => {
            for device in outputs {
                if let Ok(name) = device.name() {
                    if !devices.iter().any(|d| d.name == name) {
                        devices.push(AudioDevice {
                            name,
                            is_default: false,
                        });
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "Output device enumeration failed"),
    }
    devices
}

/// Resolves an input device by display name; the default slot (or an empty
/// name) maps to the host default.
pub fn find_input_device(name: &str) -> Result<Device, DeviceError> {
    let host = cpal::default_host();
    if name.is_empty() || name == SYSTEM_DEFAULT_DEVICE_NAME {
        return host
            .default_input_device()
            .ok_or_else(|| DeviceError::NotFound(SYSTEM_DEFAULT_DEVICE_NAME.to_string()));
    }
    host.input_devices()
        .map_err(|e| DeviceError::Enumeration(e.to_string()))?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| DeviceError::NotFound(name.to_string()))
}

/// Resolves an output device by display name.
pub fn find_output_device(name: &str) -> Result<Device, DeviceError> {
    let host = cpal::default_host();
    if name.is_empty() || name == SYSTEM_DEFAULT_DEVICE_NAME {
        return host
            .default_output_device()
            .ok_or_else(|| DeviceError::NotFound(SYSTEM_DEFAULT_DEVICE_NAME.to_string()));
    }
    host.output_devices()
        .map_err(|e| DeviceError::Enumeration(e.to_string()))?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| DeviceError::NotFound(name.to_string()))
}

/// Per-session device selection plus the last device-scoped error. A device
/// failure never affects the rest of the session.
#[derive(Debug, Clone, Default)]
pub struct DeviceInventory {
    pub selected_input: Option<String>,
    pub selected_output: Option<String>,
    pub last_error: Option<String>,
}

impl DeviceInventory {
    pub fn select_input(&mut self, name: String) {
        self.selected_input = Some(name);
        self.last_error = None;
    }

    pub fn select_output(&mut self, name: String) {
        self.selected_output = Some(name);
        self.last_error = None;
    }

    pub fn record_error(&mut self, err: &DeviceError) {
        self.last_error = Some(err.to_string());
    }

    pub fn input_name(&self) -> &str {
        self.selected_input.as_deref().unwrap_or("")
    }

    pub fn output_name(&self) -> &str {
        self.selected_output.as_deref().unwrap_or("")
    }
}

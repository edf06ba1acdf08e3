// local capture devices; nothing here leaves the machine

use std::fs::File;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("camera unavailable: {0}")]
    Camera(#[source] std::io::Error),
    #[error("screen capture not permitted")]
    ScreenDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Camera,
    Screen,
}

/// Held for as long as the device is in use; dropping it releases the device.
#[derive(Debug)]
pub struct MediaHandle {
    kind: MediaKind,
    _device: Option<File>,
}

impl MediaHandle {
    pub fn kind(&self) -> MediaKind {
        self.kind
    }
}

pub trait MediaCapture: Send + Sync {
    fn acquire_camera(&self) -> Result<MediaHandle, MediaError>;
    fn acquire_screen(&self) -> Result<MediaHandle, MediaError>;
}

pub struct DeviceCapture {
    pub camera_path: PathBuf,
    pub allow_screen: bool,
}

impl MediaCapture for DeviceCapture {
    fn acquire_camera(&self) -> Result<MediaHandle, MediaError> {
        let device = File::open(&self.camera_path).map_err(MediaError::Camera)?;
        Ok(MediaHandle {
            kind: MediaKind::Camera,
            _device: Some(device),
        })
    }

    fn acquire_screen(&self) -> Result<MediaHandle, MediaError> {
        if self.allow_screen {
            Ok(MediaHandle {
                kind: MediaKind::Screen,
                _device: None,
            })
        } else {
            Err(MediaError::ScreenDenied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_camera_is_an_error() {
        let cap = DeviceCapture {
            camera_path: PathBuf::from("/definitely/not/a/camera"),
            allow_screen: false,
        };
        assert!(matches!(cap.acquire_camera(), Err(MediaError::Camera(_))));
        assert!(matches!(cap.acquire_screen(), Err(MediaError::ScreenDenied)));
    }

    #[test]
    fn screen_granted_when_enabled() {
        let cap = DeviceCapture {
            camera_path: PathBuf::from("/dev/null"),
            allow_screen: true,
        };
        assert_eq!(cap.acquire_screen().unwrap().kind(), MediaKind::Screen);
        assert_eq!(cap.acquire_camera().unwrap().kind(), MediaKind::Camera);
    }
}

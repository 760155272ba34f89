//! Device identifiers, enumeration and hot-plug watching.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::ingest::synthetic::STUB_SCHEME;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Camera,
    /// A whole display (screen capture).
    Display,
    /// A single top-level window.
    Window,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Camera => "camera",
            DeviceKind::Display => "display",
            DeviceKind::Window => "window",
        })
    }
}

impl FromStr for DeviceKind {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera" => Ok(DeviceKind::Camera),
            "display" | "screen" => Ok(DeviceKind::Display),
            "window" => Ok(DeviceKind::Window),
            other => Err(CaptureError::InvalidConfig(format!(
                "unknown device kind '{}'",
                other
            ))),
        }
    }
}

/// Opaque device identifier plus an optional human-readable name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevicePath {
    pub path: String,
    pub name: Option<String>,
    pub kind: DeviceKind,
}

impl DevicePath {
    pub fn new(path: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            path: path.into(),
            name: None,
            kind,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Infer the device kind from a path string.
    ///
    /// - `window:<id>` and `stub://window...` are windows
    /// - `:0`, `:0.0`, `display:<name>` and `stub://display...` are displays
    /// - everything else (`/dev/video0`, `stub://camera`) is a camera
    pub fn parse(path: &str) -> Self {
        let kind = if let Some(stub) = path.strip_prefix(STUB_SCHEME) {
            if stub.starts_with("window") {
                DeviceKind::Window
            } else if stub.starts_with("display") || stub.starts_with("screen") {
                DeviceKind::Display
            } else {
                DeviceKind::Camera
            }
        } else if path.starts_with("window:") {
            DeviceKind::Window
        } else if path.starts_with(':') || path.starts_with("display:") {
            DeviceKind::Display
        } else {
            DeviceKind::Camera
        };
        Self::new(path, kind)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.path)
    }

    pub fn is_stub(&self) -> bool {
        self.path.starts_with(STUB_SCHEME)
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({}, {})", self.path, name, self.kind),
            None => write!(f, "{} ({})", self.path, self.kind),
        }
    }
}

// ----------------------------------------------------------------------------
// Enumeration
// ----------------------------------------------------------------------------

pub trait DeviceEnumerator: Send {
    fn enumerate(&self) -> Result<Vec<DevicePath>>;
}

/// Enumerates `/dev/video*` capture nodes and the X display named by
/// `$DISPLAY`.
pub struct SystemEnumerator {
    dev_dir: PathBuf,
    sysfs_dir: PathBuf,
    display: Option<String>,
}

impl Default for SystemEnumerator {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            sysfs_dir: PathBuf::from("/sys/class/video4linux"),
            display: std::env::var("DISPLAY").ok().filter(|d| !d.is_empty()),
        }
    }
}

impl SystemEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enumerate under alternative roots instead of `/dev` and sysfs.
    pub fn with_roots(dev_dir: impl Into<PathBuf>, sysfs_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            sysfs_dir: sysfs_dir.into(),
            display: None,
        }
    }

    pub fn with_display(mut self, display: Option<String>) -> Self {
        self.display = display;
        self
    }

    fn cameras(&self) -> Vec<DevicePath> {
        let entries = match std::fs::read_dir(&self.dev_dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::debug!(
                    "SystemEnumerator: cannot read {}: {}",
                    self.dev_dir.display(),
                    err
                );
                return Vec::new();
            }
        };

        // Keyed by node number so video10 sorts after video2.
        let mut nodes = BTreeMap::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(number) = file_name
                .strip_prefix("video")
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let mut device = DevicePath::new(
                self.dev_dir.join(file_name.as_ref()).to_string_lossy(),
                DeviceKind::Camera,
            );
            let name_file = self.sysfs_dir.join(file_name.as_ref()).join("name");
            let sysfs_name = std::fs::read_to_string(name_file)
                .unwrap_or_default()
                .trim()
                .to_string();
            if !sysfs_name.is_empty() {
                device.name = Some(sysfs_name);
            }
            nodes.insert(number, device);
        }
        nodes.into_values().collect()
    }
}

impl DeviceEnumerator for SystemEnumerator {
    fn enumerate(&self) -> Result<Vec<DevicePath>> {
        let mut devices = self.cameras();
        if let Some(display) = &self.display {
            devices.push(
                DevicePath::new(display.clone(), DeviceKind::Display)
                    .with_name(format!("X display {}", display)),
            );
        }
        Ok(devices)
    }
}

/// A fixed, mutable device list. Clones share the list.
#[derive(Clone, Default)]
pub struct StaticEnumerator {
    devices: Arc<Mutex<Vec<DevicePath>>>,
}

impl StaticEnumerator {
    pub fn new(devices: Vec<DevicePath>) -> Self {
        Self {
            devices: Arc::new(Mutex::new(devices)),
        }
    }

    pub fn add(&self, device: DevicePath) {
        self.lock().push(device);
    }

    pub fn remove(&self, path: &str) {
        self.lock().retain(|d| d.path != path);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DevicePath>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeviceEnumerator for StaticEnumerator {
    fn enumerate(&self) -> Result<Vec<DevicePath>> {
        Ok(self.lock().clone())
    }
}

// ----------------------------------------------------------------------------
// Hot-plug watching
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Added(DevicePath),
    Removed(DevicePath),
}

/// Polls an enumerator on a background thread and reports changes.
///
/// Devices present at the first poll are reported as `Added`. `stop()`
/// returns only after the thread has exited, so no event fires afterwards.
pub struct DeviceWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    pub fn start<F>(
        enumerator: Box<dyn DeviceEnumerator>,
        interval: Duration,
        mut handler: F,
    ) -> Result<Self>
    where
        F: FnMut(DeviceEvent) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("device-watcher".to_string())
            .spawn(move || {
                let mut known: BTreeMap<String, DevicePath> = BTreeMap::new();
                while !stop_thread.load(Ordering::SeqCst) {
                    match enumerator.enumerate() {
                        Ok(devices) => {
                            let current: BTreeMap<String, DevicePath> = devices
                                .into_iter()
                                .map(|d| (d.path.clone(), d))
                                .collect();
                            for (path, device) in known.iter() {
                                if !current.contains_key(path) {
                                    log::info!("DeviceWatcher: removed {}", device);
                                    handler(DeviceEvent::Removed(device.clone()));
                                }
                            }
                            for (path, device) in current.iter() {
                                if !known.contains_key(path) {
                                    log::info!("DeviceWatcher: added {}", device);
                                    handler(DeviceEvent::Added(device.clone()));
                                }
                            }
                            known = current;
                        }
                        Err(err) => log::warn!("DeviceWatcher: enumeration failed: {}", err),
                    }
                    if stop_thread.load(Ordering::SeqCst) {
                        break;
                    }
                    // Woken early by stop().
                    std::thread::park_timeout(interval);
                }
            })
            .map_err(|err| CaptureError::Unsupported(format!("spawn device watcher: {}", err)))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        handle.thread().unpark();
        if handle.join().is_err() {
            log::error!("DeviceWatcher: watcher thread panicked");
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

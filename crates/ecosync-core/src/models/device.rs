//! Client device model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Kind of client replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Android,
    Ios,
    Desktop,
    Web,
}

impl DeviceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Desktop => "desktop",
            Self::Web => "web",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "android" => Ok(Self::Android),
            "ios" => Ok(Self::Ios),
            "desktop" => Ok(Self::Desktop),
            "web" => Ok(Self::Web),
            other => Err(Error::InvalidInput(format!("unknown device kind: {other}"))),
        }
    }
}

/// Operating system a replica runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePlatform {
    Android,
    Ios,
    Macos,
    Windows,
    Linux,
    Web,
}

impl DevicePlatform {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Macos => "macos",
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::Web => "web",
        }
    }
}

impl fmt::Display for DevicePlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DevicePlatform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "android" => Ok(Self::Android),
            "ios" => Ok(Self::Ios),
            "macos" => Ok(Self::Macos),
            "windows" => Ok(Self::Windows),
            "linux" => Ok(Self::Linux),
            "web" => Ok(Self::Web),
            other => Err(Error::InvalidInput(format!("unknown platform: {other}"))),
        }
    }
}

/// A registered replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Persistent id generated by the client on first launch
    pub id: String,
    /// Account that owns the device
    pub client_id: String,
    pub kind: DeviceKind,
    pub name: Option<String>,
    pub platform: Option<DevicePlatform>,
    pub os_version: Option<String>,
    pub app_version: Option<String>,
    /// Push notification token, opaque to the engine
    pub push_token: Option<String>,
    /// Registration timestamp (Unix ms)
    pub registered_at: i64,
    pub last_seen_at: Option<i64>,
    /// Last completed sync session (Unix ms)
    pub last_sync_at: Option<i64>,
    /// False once revoked
    pub is_active: bool,
}

impl Device {
    /// Most recent sign of life, used for the abandoned-device policy
    pub fn last_activity(&self) -> i64 {
        self.last_sync_at
            .or(self.last_seen_at)
            .unwrap_or(self.registered_at)
    }
}

/// Request to register or refresh a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub device_id: String,
    pub client_id: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub platform: Option<DevicePlatform>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub push_token: Option<String>,
}

impl DeviceRegistration {
    pub fn new(
        device_id: impl Into<String>,
        client_id: impl Into<String>,
        kind: DeviceKind,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            client_id: client_id.into(),
            kind,
            name: None,
            platform: None,
            os_version: None,
            app_version: None,
            push_token: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub const fn with_platform(mut self, platform: DevicePlatform) -> Self {
        self.platform = Some(platform);
        self
    }

    #[must_use]
    pub fn with_versions(mut self, os_version: impl Into<String>, app_version: impl Into<String>) -> Self {
        self.os_version = Some(os_version.into());
        self.app_version = Some(app_version.into());
        self
    }

    #[must_use]
    pub fn with_push_token(mut self, token: impl Into<String>) -> Self {
        self.push_token = Some(token.into());
        self
    }
}

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cpu,
    Cuda,
    Mps,
}

impl Device {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Mps => "mps",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda),
            "mps" => Ok(Device::Mps),
            other => Err(format!("unknown device '{other}'")),
        }
    }
}

/// How the compute device is chosen. `Auto` prefers an accelerator when the
/// runtime reports one.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DevicePolicy {
    #[default]
    Auto,
    Fixed(Device),
}

impl DevicePolicy {
    pub fn resolve(self, accelerator_available: bool) -> Device {
        match self {
            DevicePolicy::Fixed(device) => device,
            DevicePolicy::Auto if accelerator_available => Device::Cuda,
            DevicePolicy::Auto => Device::Cpu,
        }
    }
}

impl FromStr for DevicePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(DevicePolicy::Auto);
        }
        s.parse().map(DevicePolicy::Fixed)
    }
}

impl TryFrom<String> for DevicePolicy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DevicePolicy> for String {
    fn from(policy: DevicePolicy) -> Self {
        match policy {
            DevicePolicy::Auto => "auto".to_string(),
            DevicePolicy::Fixed(device) => device.as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_prefers_accelerator() {
        assert_eq!(DevicePolicy::Auto.resolve(true), Device::Cuda);
        assert_eq!(DevicePolicy::Auto.resolve(false), Device::Cpu);
    }

    #[test]
    fn fixed_device_ignores_hardware() {
        let policy: DevicePolicy = "cpu".parse().unwrap();
        assert_eq!(policy.resolve(true), Device::Cpu);
        let policy: DevicePolicy = "CUDA".parse().unwrap();
        assert_eq!(policy.resolve(false), Device::Cuda);
    }

    #[test]
    fn rejects_unknown_device() {
        assert!("tpu".parse::<DevicePolicy>().is_err());
    }
}

use std::fmt;

use serde::Serialize;

/// Compute device the model runs on. Serialised with the names clients see in
/// `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cuda,
    Mps,
    Cpu,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Cuda => "cuda",
            DeviceKind::Mps => "mps",
            DeviceKind::Cpu => "cpu",
        }
    }

    pub fn is_accelerator(self) -> bool {
        !matches!(self, DeviceKind::Cpu)
    }

    #[cfg(feature = "tch-backend")]
    pub fn to_tch(self) -> tch::Device {
        match self {
            DeviceKind::Cuda => tch::Device::Cuda(0),
            DeviceKind::Mps => tch::Device::Mps,
            DeviceKind::Cpu => tch::Device::Cpu,
        }
    }

    /// Reduced precision on accelerators, full precision on the CPU.
    #[cfg(feature = "tch-backend")]
    pub fn weight_kind(self) -> tch::Kind {
        if self.is_accelerator() {
            tch::Kind::Half
        } else {
            tch::Kind::Float
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probes CUDA first, then Apple Silicon, then falls back to the CPU.
#[cfg(feature = "tch-backend")]
pub fn select_device() -> DeviceKind {
    if tch::Cuda::is_available() {
        DeviceKind::Cuda
    } else if tch::utils::has_mps() {
        DeviceKind::Mps
    } else {
        DeviceKind::Cpu
    }
}

#[cfg(not(feature = "tch-backend"))]
pub fn select_device() -> DeviceKind {
    DeviceKind::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names() {
        assert_eq!(serde_json::to_value(DeviceKind::Cuda).unwrap(), "cuda");
        assert_eq!(serde_json::to_value(DeviceKind::Mps).unwrap(), "mps");
        assert_eq!(DeviceKind::Cpu.to_string(), "cpu");
    }

    #[test]
    fn probe_returns_a_known_device() {
        let device = select_device();
        assert!(["cuda", "mps", "cpu"].contains(&device.as_str()));
    }

    #[cfg(feature = "tch-backend")]
    #[test]
    fn precision_follows_device() {
        assert_eq!(DeviceKind::Cpu.weight_kind(), tch::Kind::Float);
        assert_eq!(DeviceKind::Cuda.weight_kind(), tch::Kind::Half);
        assert_eq!(DeviceKind::Mps.weight_kind(), tch::Kind::Half);
    }
}

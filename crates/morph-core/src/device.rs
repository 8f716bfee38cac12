//! Execution devices and their ONNX Runtime provider names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hardware target a model session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    TensorRt,
    Rocm,
    DirectMl,
    OpenVino,
    CoreMl,
}

impl Device {
    pub const ALL: [Device; 7] = [
        Device::Cpu,
        Device::Cuda,
        Device::TensorRt,
        Device::Rocm,
        Device::DirectMl,
        Device::OpenVino,
        Device::CoreMl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::TensorRt => "tensorrt",
            Device::Rocm => "rocm",
            Device::DirectMl => "directml",
            Device::OpenVino => "openvino",
            Device::CoreMl => "coreml",
        }
    }

    /// ONNX Runtime execution provider name (e.g. `CUDAExecutionProvider`).
    pub fn provider_name(&self) -> &'static str {
        match self {
            Device::Cpu => "CPUExecutionProvider",
            Device::Cuda => "CUDAExecutionProvider",
            Device::TensorRt => "TensorrtExecutionProvider",
            Device::Rocm => "ROCMExecutionProvider",
            Device::DirectMl => "DmlExecutionProvider",
            Device::OpenVino => "OpenVINOExecutionProvider",
            Device::CoreMl => "CoreMLExecutionProvider",
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

    /// Accepts short names (`cuda`), encoded provider names (`dml`) and full
    /// provider names (`CUDAExecutionProvider`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let short = encode_provider(s);
        Device::ALL
            .into_iter()
            .find(|d| d.as_str() == short || encode_provider(d.provider_name()) == short)
            .ok_or_else(|| format!("unknown execution device '{s}'"))
    }
}

fn encode_provider(name: &str) -> String {
    name.replace("ExecutionProvider", "").to_lowercase()
}

/// Shorten provider names: `CUDAExecutionProvider` → `cuda`.
pub fn encode_execution_providers(providers: &[&str]) -> Vec<String> {
    providers.iter().map(|p| encode_provider(p)).collect()
}

/// Resolve short names to devices, dropping names that match nothing.
pub fn decode_execution_providers(names: &[&str]) -> Vec<Device> {
    names.iter().filter_map(|n| n.parse().ok()).collect()
}

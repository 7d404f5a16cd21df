//! Hardware accelerator selection

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Requested execution backend for a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Cpu,
    Gpu,
    Npu,
    /// Best available: NPU, then GPU, then CPU
    #[default]
    #[serde(alias = "default")]
    Auto,
}

bitflags! {
    /// Accelerators present on a device
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AcceleratorSet: u8 {
        const CPU = 0b001;
        const GPU = 0b010;
        const NPU = 0b100;
    }
}

impl AcceleratorSet {
    pub fn from_list(list: &[Accelerator]) -> Self {
        list.iter()
            .filter_map(|a| a.flag())
            .fold(AcceleratorSet::CPU, |set, flag| set | flag)
    }

    /// Concrete accelerators in preference order (cpu first)
    pub fn to_list(self) -> Vec<Accelerator> {
        [Accelerator::Cpu, Accelerator::Gpu, Accelerator::Npu]
            .into_iter()
            .filter(|a| a.flag().is_some_and(|flag| self.contains(flag)))
            .collect()
    }
}

impl Accelerator {
    fn flag(self) -> Option<AcceleratorSet> {
        match self {
            Accelerator::Cpu => Some(AcceleratorSet::CPU),
            Accelerator::Gpu => Some(AcceleratorSet::GPU),
            Accelerator::Npu => Some(AcceleratorSet::NPU),
            Accelerator::Auto => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Accelerator::Cpu => "cpu",
            Accelerator::Gpu => "gpu",
            Accelerator::Npu => "npu",
            Accelerator::Auto => "auto",
        }
    }

    /// Pick the concrete accelerator to use on a device.
    ///
    /// `Auto` never fails since the CPU is always available; an explicit
    /// choice the device lacks is a resource error.
    pub fn resolve(self, available: AcceleratorSet) -> Result<Accelerator> {
        match self {
            Accelerator::Auto => Ok([Accelerator::Npu, Accelerator::Gpu]
                .into_iter()
                .find(|a| a.flag().is_some_and(|flag| available.contains(flag)))
                .unwrap_or(Accelerator::Cpu)),
            Accelerator::Cpu => Ok(Accelerator::Cpu),
            explicit => match explicit.flag() {
                Some(flag) if available.contains(flag) => Ok(explicit),
                _ => Err(BridgeError::Resource(format!(
                    "accelerator {} is not available on this device",
                    explicit
                ))),
            },
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Accelerator {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Accelerator::Cpu),
            "gpu" => Ok(Accelerator::Gpu),
            "npu" => Ok(Accelerator::Npu),
            "auto" | "default" => Ok(Accelerator::Auto),
            other => Err(BridgeError::InvalidArgument(format!(
                "unknown accelerator '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_prefers_npu_then_gpu() {
        let all = AcceleratorSet::all();
        assert_eq!(Accelerator::Auto.resolve(all).unwrap(), Accelerator::Npu);

        let gpu = AcceleratorSet::CPU | AcceleratorSet::GPU;
        assert_eq!(Accelerator::Auto.resolve(gpu).unwrap(), Accelerator::Gpu);

        let cpu = AcceleratorSet::CPU;
        assert_eq!(Accelerator::Auto.resolve(cpu).unwrap(), Accelerator::Cpu);
    }

    #[test]
    fn test_explicit_choice_is_capability_checked() {
        let cpu = AcceleratorSet::CPU;
        assert_eq!(Accelerator::Cpu.resolve(cpu).unwrap(), Accelerator::Cpu);

        let err = Accelerator::Npu.resolve(cpu).unwrap_err();
        assert_eq!(err.code(), "RESOURCE");
        assert!(Accelerator::Gpu.resolve(AcceleratorSet::all()).is_ok());
    }

    #[test]
    fn test_parse() {
        assert_eq!("GPU".parse::<Accelerator>().unwrap(), Accelerator::Gpu);
        assert_eq!("default".parse::<Accelerator>().unwrap(), Accelerator::Auto);
        assert!("tpu".parse::<Accelerator>().is_err());
    }

    #[test]
    fn test_set_from_list_always_has_cpu() {
        let set = AcceleratorSet::from_list(&[Accelerator::Npu, Accelerator::Auto]);
        assert_eq!(set, AcceleratorSet::CPU | AcceleratorSet::NPU);
        assert_eq!(set.to_list(), vec![Accelerator::Cpu, Accelerator::Npu]);
    }
}

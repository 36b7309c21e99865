use itertools::Itertools;
use std::{fmt, str::FromStr};
use tch::{utils::has_mps, Device};
use thiserror::Error;
use tracing::warn;

fn cuda_indices() -> Vec<usize> {
    (0..tch::Cuda::device_count().max(0) as usize).collect()
}

/// Best device set libtorch can see: MPS on macOS, else every CUDA card, else CPU.
pub fn get_optimal_devices() -> Devices {
    #[cfg(target_os = "macos")]
    {
        if has_mps() {
            return Devices::Mps;
        }
    }
    match cuda_indices() {
        indices if indices.is_empty() => Devices::Cpu,
        indices => Devices::Cuda(indices),
    }
}

/// The set of devices a model is placed on, one rank per device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Devices {
    Cpu,
    Mps,
    Cuda(Vec<usize>),
}

impl Default for Devices {
    fn default() -> Self {
        get_optimal_devices()
    }
}

impl fmt::Display for Devices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Devices::Cpu => write!(f, "cpu"),
            Devices::Mps => write!(f, "mps"),
            Devices::Cuda(indices) => write!(f, "cuda:{}", indices.iter().join(",")),
        }
    }
}

impl Devices {
    /// Number of ranks this set supports. CPU and MPS count as one device.
    pub fn size(&self) -> usize {
        match self {
            Devices::Cpu | Devices::Mps => 1,
            Devices::Cuda(indices) => indices.len(),
        }
    }

    pub fn device_for_rank(&self, rank: usize) -> Option<Device> {
        match self {
            Devices::Cpu if rank == 0 => Some(Device::Cpu),
            Devices::Mps if rank == 0 => Some(Device::Mps),
            Devices::Cuda(indices) => indices.get(rank).map(|idx| Device::Cuda(*idx)),
            _ => None,
        }
    }

    /// One device per rank, in rank order.
    pub fn torch_devices(&self) -> Vec<Device> {
        (0..self.size())
            .filter_map(|rank| self.device_for_rank(rank))
            .collect()
    }

    /// Keeps the first `count` devices. Asking for more than the set holds keeps the set
    /// as is.
    pub fn limit(&self, count: usize) -> Devices {
        match self {
            Devices::Cuda(indices) if count < indices.len() => {
                Devices::Cuda(indices[..count.max(1)].to_vec())
            }
            Devices::Cuda(indices) => {
                if count > indices.len() {
                    warn!(
                        requested = count,
                        available = indices.len(),
                        "fewer devices than requested"
                    );
                }
                self.clone()
            }
            other => other.clone(),
        }
    }
}

fn available_device_strings() -> String {
    let mut strings = vec!["auto".to_string(), "cpu".to_string()];
    if has_mps() {
        strings.push("mps".to_string());
    }
    let cuda = cuda_indices();
    if !cuda.is_empty() {
        strings.push("cuda".to_string());
        strings.push(format!("cuda:{}", cuda.iter().join(",")));
    }
    strings.join(", ")
}

#[derive(Error, Debug)]
pub enum DevicesParseError {
    #[error("device {0} is not available on this system. Available devices are: {1}")]
    DeviceNotAvailable(String, String),

    #[error("invalid format for device(s) {0}: '{1}'")]
    InvalidDeviceFormat(String, String),

    #[error("invalid device '{0}'. Available devices are: {1}")]
    InvalidDevicesString(String, String),
}

fn require_cuda() -> Result<Vec<usize>, DevicesParseError> {
    match cuda_indices() {
        indices if indices.is_empty() => Err(DevicesParseError::DeviceNotAvailable(
            "CUDA".to_string(),
            available_device_strings(),
        )),
        indices => Ok(indices),
    }
}

fn parse_cuda_list(requested: &str, list: &str) -> Result<Vec<usize>, DevicesParseError> {
    let available = require_cuda()?;
    let ids = list
        .split(',')
        .map(|id| {
            let parsed = id.trim().parse::<usize>().map_err(|_| {
                DevicesParseError::InvalidDeviceFormat(requested.to_string(), id.to_string())
            })?;
            match available.contains(&parsed) {
                true => Ok(parsed),
                false => Err(DevicesParseError::DeviceNotAvailable(
                    format!("cuda:{parsed}"),
                    available_device_strings(),
                )),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    match ids.iter().all_unique() {
        true => Ok(ids),
        false => Err(DevicesParseError::InvalidDeviceFormat(
            requested.to_string(),
            list.to_string(),
        )),
    }
}

impl FromStr for Devices {
    type Err = DevicesParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let requested = s.trim().to_lowercase();
        match requested.as_str() {
            "auto" => Ok(get_optimal_devices()),
            "cpu" => Ok(Devices::Cpu),
            "cuda" => Ok(Devices::Cuda(require_cuda()?)),
            "mps" if has_mps() => Ok(Devices::Mps),
            "mps" => Err(DevicesParseError::DeviceNotAvailable(
                "MPS".to_string(),
                available_device_strings(),
            )),
            _ => match requested.strip_prefix("cuda:") {
                Some(list) => Ok(Devices::Cuda(parse_cuda_list(&requested, list)?)),
                None => Err(DevicesParseError::InvalidDevicesString(
                    requested.clone(),
                    available_device_strings(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        assert!("auto".parse::<Devices>().is_ok());
        assert_eq!(" CPU ".parse::<Devices>().unwrap(), Devices::Cpu);
        assert!("".parse::<Devices>().is_err());
        assert!("nvidia".parse::<Devices>().is_err());

        let count = tch::Cuda::device_count();
        if count > 0 {
            assert_eq!(
                "cuda:0".parse::<Devices>().unwrap(),
                Devices::Cuda(vec![0])
            );
            assert!(format!("cuda:{count}").parse::<Devices>().is_err());
            assert!("cuda:0,0".parse::<Devices>().is_err());
            assert!("cuda:abc".parse::<Devices>().is_err());
        } else {
            assert!(matches!(
                "cuda:0".parse::<Devices>(),
                Err(DevicesParseError::DeviceNotAvailable(_, _))
            ));
        }
    }

    #[test]
    fn test_rank_devices() {
        let cuda = Devices::Cuda(vec![0, 2, 3]);
        assert_eq!(cuda.size(), 3);
        assert_eq!(cuda.device_for_rank(1), Some(Device::Cuda(2)));
        assert_eq!(cuda.device_for_rank(3), None);
        assert_eq!(
            cuda.torch_devices(),
            [Device::Cuda(0), Device::Cuda(2), Device::Cuda(3)]
        );
        assert_eq!(cuda.to_string(), "cuda:0,2,3");
        assert_eq!(Devices::Cpu.torch_devices(), [Device::Cpu]);
        assert_eq!(Devices::Cpu.device_for_rank(1), None);
    }

    #[test]
    fn test_limit() {
        let cuda = Devices::Cuda(vec![0, 1, 2, 3]);
        assert_eq!(cuda.limit(2), Devices::Cuda(vec![0, 1]));
        assert_eq!(cuda.limit(8), cuda);
        assert_eq!(cuda.limit(0), Devices::Cuda(vec![0]));
        assert_eq!(Devices::Cpu.limit(4), Devices::Cpu);
    }
}

//! Accelerators found on the PCI bus

use super::AcceleratorProvider;
use crate::provider::{
    linux::{parse_sysfs, read_sysfs},
    LoadError,
};
use std::{fs, io, path::Path};
use tracing::debug;

/// PCI base class and subclass of 3D controllers, i.e. compute GPUs
///
/// VGA controllers (subclass 0x00) are left out, as servers usually carry one
/// for their management console.
const COMPUTE_GPU_SUBCLASS: u32 = 0x0302;

/// PCI base class of processing accelerators
const ACCELERATOR_CLASS: u32 = 0x12;

/// Truth that a 24-bit PCI class code denotes a compute device
fn is_compute_class(class: u32) -> bool {
    class >> 8 == COMPUTE_GPU_SUBCLASS || class >> 16 == ACCELERATOR_CLASS
}

/// Accelerator device found on the PCI bus
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PciDevice {
    /// Bus address, e.g. `0000:3b:00.0`
    pub address: String,

    /// 24-bit PCI class code
    pub class: u32,

    /// OS index of the NUMA node the device is attached to, if known
    pub numa_node: Option<usize>,
}

/// Accelerator provider backed by the sysfs PCI device list
///
/// Only 3D controllers and processing accelerators are reported. Devices are
/// numbered in order of increasing PCI bus address, which is the order that
/// `CUDA_DEVICE_ORDER=PCI_BUS_ID` gives to CUDA devices.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct PciAccelerators(Vec<PciDevice>);
//
impl PciAccelerators {
    /// Scan the PCI devices of the sysfs hierarchy mounted at `root`
    ///
    /// A machine without a PCI bus has no accelerator.
    ///
    /// # Errors
    ///
    /// [`LoadError`] if the device list exists but cannot be read.
    pub fn from_sysfs(root: impl AsRef<Path>) -> Result<Self, LoadError> {
        let bus = root.as_ref().join("bus/pci/devices");
        let entries = match fs::read_dir(&bus) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no PCI bus at {}", bus.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(LoadError::io(&bus)(e)),
        };

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(LoadError::io(&bus))?;
            let path = entry.path();
            let class_path = path.join("class");
            let class_str = read_sysfs(&class_path)?;
            let class = u32::from_str_radix(class_str.trim_start_matches("0x"), 16).map_err(
                |_| LoadError::Malformed {
                    path: class_path,
                    content: class_str,
                },
            )?;
            if !is_compute_class(class) {
                continue;
            }
            let node_path = path.join("numa_node");
            let numa_node = if node_path.is_file() {
                usize::try_from(parse_sysfs::<i64>(&node_path)?).ok()
            } else {
                None
            };
            let address = entry.file_name().to_string_lossy().into_owned();
            debug!("found accelerator {address} of class {class:#08x} on NUMA node {numa_node:?}");
            devices.push(PciDevice {
                address,
                class,
                numa_node,
            });
        }
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(Self(devices))
    }

    /// Detected devices, indexed by device ID
    pub fn devices(&self) -> &[PciDevice] {
        &self.0
    }
}
//
impl AcceleratorProvider for PciAccelerators {
    fn device_count(&self) -> usize {
        self.0.len()
    }

    fn devices_on_node(&self, node_os_index: usize) -> Vec<usize> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, device)| device.numa_node == Some(node_os_index))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn closest_devices(&self) -> Vec<usize> {
        (0..self.0.len()).collect()
    }
}

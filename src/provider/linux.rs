//! Linux host provider
//!
//! The hardware hierarchy is read from the sysfs pseudo-filesystem, which can
//! be relocated for testing purposes. Bindings are applied through the
//! `sched_setaffinity` and `set_mempolicy` system calls, and therefore always
//! affect the calling process, whatever sysfs root is used.

use super::{HardwareProvider, LoadError};
use crate::{
    cpu::{binding::BindingTarget, cpuset::CpuSet},
    errors::{self, RawOsError},
    memory::{binding::MemoryBindingPolicy, nodeset::NodeSet},
    object::{types::ObjectType, ObjectSpec, ObjectTree},
};
use libc::{c_long, c_ulong, cpu_set_t, pid_t};
use std::{
    collections::BTreeMap,
    fs, mem,
    path::{Path, PathBuf},
    ptr,
    str::FromStr,
};
use tracing::{debug, warn};

/// Number of CPUs that fit in a `cpu_set_t`
const CPU_SETSIZE: usize = libc::CPU_SETSIZE as usize;

/// Number of words of the node masks exchanged with the memory policy calls
const NODE_MASK_WORDS: usize = 16;

/// Number of NUMA nodes that fit in a node mask
const MAX_NODES: usize = NODE_MASK_WORDS * c_ulong::BITS as usize;

// Memory policy modes, from <linux/mempolicy.h>
const MPOL_DEFAULT: c_long = 0;
const MPOL_PREFERRED: c_long = 1;
const MPOL_BIND: c_long = 2;
const MPOL_INTERLEAVE: c_long = 3;
const MPOL_LOCAL: c_long = 4;
const MPOL_PREFERRED_MANY: c_long = 5;
const MPOL_WEIGHTED_INTERLEAVE: c_long = 6;

/// Optional mode flags that `get_mempolicy` may report on top of the mode
const MPOL_MODE_FLAGS: c_long = (1 << 15) | (1 << 14) | (1 << 13);

/// Hardware provider backed by sysfs and Linux system calls
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SysfsProvider {
    root: PathBuf,
}
//
impl SysfsProvider {
    /// Provider for the live `/sys` hierarchy
    pub fn new() -> Self {
        Self::with_root("/sys")
    }

    /// Provider for a sysfs hierarchy mounted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root of the sysfs hierarchy
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a CPU list file, restricted to the online CPUs
    fn cpu_list(&self, path: &Path, online: &CpuSet) -> Result<CpuSet, LoadError> {
        parse_sysfs::<CpuSet>(path).map(|set| &set & online)
    }

    /// Describe one CPU and the objects it belongs to
    fn scan_cpu(&self, cpu: usize, online: &CpuSet, objects: &mut Objects) -> Result<(), LoadError> {
        let cpu_dir = self.root.join(format!("devices/system/cpu/cpu{cpu}"));
        objects.pus.push(ObjectSpec::pu(cpu));

        // Packages and cores
        let topology = cpu_dir.join("topology");
        if topology.is_dir() {
            let package = parse_sysfs::<i64>(&topology.join("physical_package_id"))?;
            objects
                .packages
                .entry(usize::try_from(package).ok())
                .or_default()
                .set(cpu);

            let core_cpus = ["core_cpus_list", "thread_siblings_list"]
                .into_iter()
                .map(|name| topology.join(name))
                .find(|path| path.is_file())
                .map(|path| self.cpu_list(&path, online))
                .transpose()?;
            if let Some(core_cpus) = core_cpus.filter(|set| !set.is_empty()) {
                let core_id = parse_sysfs::<usize>(&topology.join("core_id")).ok();
                objects.cores.entry(core_cpus.to_string()).or_insert_with(|| {
                    ObjectSpec::new(ObjectType::Core, core_id, core_cpus.clone())
                });
            }
        } else {
            debug!("no topology information for CPU #{cpu}");
        }

        // Data and unified caches
        let cache_dir = cpu_dir.join("cache");
        let Ok(entries) = fs::read_dir(&cache_dir) else {
            return Ok(());
        };
        for entry in entries {
            let index = entry.map_err(LoadError::io(&cache_dir))?.path();
            let is_index = index
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("index"));
            if !is_index {
                continue;
            }
            match self.scan_cache(&index, cpu, online) {
                Ok(Some((key, cache))) => {
                    objects.caches.entry(key).or_insert(cache);
                }
                Ok(None) => {}
                Err(e) => warn!("ignoring cache {}: {e}", index.display()),
            }
        }
        Ok(())
    }

    /// Describe one data or unified cache of a CPU, keyed by level and CPU set
    fn scan_cache(
        &self,
        index: &Path,
        cpu: usize,
        online: &CpuSet,
    ) -> Result<Option<((usize, String), ObjectSpec)>, LoadError> {
        if read_sysfs(&index.join("type"))? == "Instruction" {
            return Ok(None);
        }
        let level = parse_sysfs::<usize>(&index.join("level"))?;
        let Some(object_type) = ObjectType::from_cache_level(level) else {
            warn!("ignoring unsupported level {level} cache of CPU #{cpu}");
            return Ok(None);
        };
        let size_path = index.join("size");
        let size = read_sysfs(&size_path)?;
        let size = parse_cache_size(&size).ok_or(LoadError::Malformed {
            path: size_path,
            content: size,
        })?;
        let shared = self.cpu_list(&index.join("shared_cpu_list"), online)?;
        if shared.is_empty() {
            return Ok(None);
        }
        let key = (level, shared.to_string());
        Ok(Some((key, ObjectSpec::cache(object_type, shared, size))))
    }

    /// Describe the NUMA nodes that have CPUs
    fn scan_nodes(&self, online: &CpuSet) -> Result<Vec<ObjectSpec>, LoadError> {
        let node_dir = self.root.join("devices/system/node");
        let Ok(entries) = fs::read_dir(&node_dir) else {
            debug!("no NUMA node information in {}", node_dir.display());
            return Ok(Vec::new());
        };
        let mut nodes = BTreeMap::new();
        for entry in entries {
            let path = entry.map_err(LoadError::io(&node_dir))?.path();
            let Some(os_index) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix("node"))
                .and_then(|index| index.parse::<usize>().ok())
            else {
                continue;
            };
            let cpus = self.cpu_list(&path.join("cpulist"), online)?;
            if cpus.is_empty() {
                warn!("ignoring NUMA node #{os_index}, which has no online CPU");
                continue;
            }
            let total_memory = node_memory(&path.join("meminfo"))?;
            nodes.insert(os_index, ObjectSpec::numa_node(os_index, cpus, total_memory));
        }
        Ok(nodes.into_values().collect())
    }

    /// NUMA nodes the kernel knows about, used when a memory policy applies
    /// to all of them
    fn online_nodes(&self) -> NodeSet {
        parse_sysfs::<NodeSet>(&self.root.join("devices/system/node/online")).unwrap_or_default()
    }
}
//
impl Default for SysfsProvider {
    fn default() -> Self {
        Self::new()
    }
}
//
impl HardwareProvider for SysfsProvider {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn load(&self) -> Result<ObjectTree, LoadError> {
        let online = parse_sysfs::<CpuSet>(&self.root.join("devices/system/cpu/online"))?;
        debug!("online CPUs: {online}");
        let mut objects = Objects::default();
        for cpu in online.iter_set() {
            self.scan_cpu(cpu, &online, &mut objects)?;
        }

        // NUMA nodes come first so that a node with the same CPUs as a
        // package ends up above it
        let mut specs = self.scan_nodes(&online)?;
        specs.extend(objects.packages.into_iter().map(|(os_index, cpuset)| {
            ObjectSpec::new(ObjectType::Package, os_index, cpuset)
        }));
        specs.extend(objects.cores.into_values());
        specs.extend(objects.caches.into_values());
        specs.extend(objects.pus);
        Ok(ObjectTree::from_objects(specs)?)
    }

    fn cpu_binding(&self, target: BindingTarget) -> Result<CpuSet, RawOsError> {
        match target {
            BindingTarget::Thread => thread_affinity(0),
            BindingTarget::Process => {
                let mut union = CpuSet::new();
                let api = "sched_getaffinity";
                for_each_live_thread(api, process_threads(api)?, |tid| {
                    union |= &thread_affinity(tid)?;
                    Ok(())
                })?;
                Ok(union)
            }
        }
    }

    fn bind_cpu(&self, set: &CpuSet, target: BindingTarget) -> Result<(), RawOsError> {
        let raw = to_cpu_set(set)?;
        match target {
            BindingTarget::Thread => set_thread_affinity(0, &raw),
            BindingTarget::Process => {
                let api = "sched_setaffinity";
                for_each_live_thread(api, process_threads(api)?, |tid| {
                    set_thread_affinity(tid, &raw)
                })
            }
        }
    }

    fn memory_binding(&self) -> Result<(NodeSet, MemoryBindingPolicy), RawOsError> {
        let mut mode: libc::c_int = 0;
        let mut mask = [0 as c_ulong; NODE_MASK_WORDS];
        errors::call_os_int("get_mempolicy", || {
            // SAFETY: mode and mask are valid for writes, and mask is large
            //         enough to hold MAX_NODES bits. No address is passed, so
            //         flags must be 0.
            unsafe {
                libc::syscall(
                    libc::SYS_get_mempolicy,
                    &mut mode as *mut libc::c_int,
                    mask.as_mut_ptr(),
                    MAX_NODES as c_ulong,
                    ptr::null_mut::<libc::c_void>(),
                    0 as c_ulong,
                )
            }
        })?;
        let nodes = from_node_mask(&mask);
        let policy = match c_long::from(mode) & !MPOL_MODE_FLAGS {
            MPOL_DEFAULT | MPOL_LOCAL => {
                let nodes = if nodes.is_empty() {
                    self.online_nodes()
                } else {
                    nodes
                };
                return Ok((nodes, MemoryBindingPolicy::FirstTouch));
            }
            MPOL_PREFERRED | MPOL_BIND | MPOL_PREFERRED_MANY => MemoryBindingPolicy::Bind,
            MPOL_INTERLEAVE => MemoryBindingPolicy::Interleave,
            MPOL_WEIGHTED_INTERLEAVE => MemoryBindingPolicy::WeightedInterleave,
            other => {
                debug!("unknown memory policy mode {other}");
                MemoryBindingPolicy::Other
            }
        };
        Ok((nodes, policy))
    }

    fn bind_memory(&self, set: &NodeSet, policy: MemoryBindingPolicy) -> Result<(), RawOsError> {
        let mode = match policy {
            MemoryBindingPolicy::FirstTouch => {
                return set_mempolicy(MPOL_DEFAULT, None);
            }
            MemoryBindingPolicy::Bind => MPOL_BIND,
            MemoryBindingPolicy::Interleave => MPOL_INTERLEAVE,
            MemoryBindingPolicy::WeightedInterleave => MPOL_WEIGHTED_INTERLEAVE,
            MemoryBindingPolicy::NextTouch | MemoryBindingPolicy::Other => {
                return Err(RawOsError::with_errno("set_mempolicy", libc::EINVAL));
            }
        };
        set_mempolicy(mode, Some(&to_node_mask(set)?))
    }
}

/// Objects discovered while scanning CPUs, deduplicated by CPU set
#[derive(Default)]
struct Objects {
    pus: Vec<ObjectSpec>,
    packages: BTreeMap<Option<usize>, CpuSet>,
    cores: BTreeMap<String, ObjectSpec>,
    caches: BTreeMap<(usize, String), ObjectSpec>,
}

/// Read a sysfs attribute, without its trailing newline
pub(crate) fn read_sysfs(path: &Path) -> Result<String, LoadError> {
    fs::read_to_string(path)
        .map(|content| content.trim().to_owned())
        .map_err(LoadError::io(path))
}

/// Read and parse a sysfs attribute
pub(crate) fn parse_sysfs<T: FromStr>(path: &Path) -> Result<T, LoadError> {
    let content = read_sysfs(path)?;
    content.parse().map_err(|_| LoadError::Malformed {
        path: path.to_owned(),
        content,
    })
}

/// Parse a cache size such as `32K` into bytes
fn parse_cache_size(size: &str) -> Option<u64> {
    let (digits, shift) = match size.as_bytes().last()? {
        b'K' => (&size[..size.len() - 1], 10),
        b'M' => (&size[..size.len() - 1], 20),
        b'G' => (&size[..size.len() - 1], 30),
        _ => (size, 0),
    };
    digits.parse::<u64>().ok()?.checked_mul(1 << shift)
}

/// Local memory of a NUMA node, from its `meminfo` file
fn node_memory(path: &Path) -> Result<u64, LoadError> {
    let meminfo = read_sysfs(path)?;
    let malformed = || LoadError::Malformed {
        path: path.to_owned(),
        content: meminfo.clone(),
    };
    // Lines look like "Node 0 MemTotal:       16384 kB"
    let line = meminfo
        .lines()
        .find(|line| line.contains("MemTotal:"))
        .ok_or_else(malformed)?;
    let kib = line
        .split_whitespace()
        .rev()
        .nth(1)
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(malformed)?;
    Ok(kib * 1024)
}

/// Thread IDs of the calling process
fn process_threads(api: &'static str) -> Result<Vec<pid_t>, RawOsError> {
    let os_error = |error: std::io::Error| RawOsError {
        api,
        errno: error.raw_os_error().map(errno::Errno),
    };
    let mut tids = Vec::new();
    for entry in fs::read_dir("/proc/self/task").map_err(os_error)? {
        let entry = entry.map_err(os_error)?;
        if let Some(tid) = entry.file_name().to_str().and_then(|tid| tid.parse().ok()) {
            tids.push(tid);
        }
    }
    Ok(tids)
}

/// Apply `op` to the threads of a process
///
/// Threads that exited since `tids` was listed fail with `ESRCH` and are
/// skipped. The call only fails with `ESRCH` if no thread was left.
fn for_each_live_thread(
    api: &'static str,
    tids: impl IntoIterator<Item = pid_t>,
    mut op: impl FnMut(pid_t) -> Result<(), RawOsError>,
) -> Result<(), RawOsError> {
    let mut any_alive = false;
    for tid in tids {
        match op(tid) {
            Ok(()) => any_alive = true,
            Err(RawOsError {
                errno: Some(errno::Errno(libc::ESRCH)),
                ..
            }) => debug!("thread {tid} exited during {api}"),
            Err(e) => return Err(e),
        }
    }
    if any_alive {
        Ok(())
    } else {
        Err(RawOsError::with_errno(api, libc::ESRCH))
    }
}

/// Translate a CPU set into the kernel's representation
fn to_cpu_set(set: &CpuSet) -> Result<cpu_set_t, RawOsError> {
    // SAFETY: cpu_set_t is a plain bit array, for which all-zeroes is the
    //         empty set
    let mut raw = unsafe { mem::zeroed::<cpu_set_t>() };
    for cpu in set.iter_set() {
        if cpu >= CPU_SETSIZE {
            return Err(RawOsError::with_errno("sched_setaffinity", libc::EINVAL));
        }
        // SAFETY: cpu is in bounds of the cpu_set_t, as checked above
        unsafe { libc::CPU_SET(cpu, &mut raw) };
    }
    Ok(raw)
}

/// CPU affinity of a thread, 0 meaning the calling thread
fn thread_affinity(tid: pid_t) -> Result<CpuSet, RawOsError> {
    // SAFETY: see to_cpu_set
    let mut raw = unsafe { mem::zeroed::<cpu_set_t>() };
    errors::call_os_int("sched_getaffinity", || {
        // SAFETY: raw is valid for writes of size_of::<cpu_set_t>() bytes
        c_long::from(unsafe { libc::sched_getaffinity(tid, mem::size_of::<cpu_set_t>(), &mut raw) })
    })?;
    Ok((0..CPU_SETSIZE)
        // SAFETY: cpu is in bounds of the cpu_set_t
        .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &raw) })
        .collect())
}

/// Set the CPU affinity of a thread, 0 meaning the calling thread
fn set_thread_affinity(tid: pid_t, raw: &cpu_set_t) -> Result<(), RawOsError> {
    errors::call_os_int("sched_setaffinity", || {
        // SAFETY: raw is valid for reads of size_of::<cpu_set_t>() bytes
        c_long::from(unsafe { libc::sched_setaffinity(tid, mem::size_of::<cpu_set_t>(), raw) })
    })
    .map(|_| ())
}

/// Translate a node set into a node mask
fn to_node_mask(set: &NodeSet) -> Result<[c_ulong; NODE_MASK_WORDS], RawOsError> {
    let word_bits = c_ulong::BITS as usize;
    let mut mask = [0; NODE_MASK_WORDS];
    for node in set.iter_set() {
        if node >= MAX_NODES {
            return Err(RawOsError::with_errno("set_mempolicy", libc::EINVAL));
        }
        mask[node / word_bits] |= 1 << (node % word_bits);
    }
    Ok(mask)
}

/// Translate a node mask into a node set
fn from_node_mask(mask: &[c_ulong; NODE_MASK_WORDS]) -> NodeSet {
    let word_bits = c_ulong::BITS as usize;
    (0..MAX_NODES)
        .filter(|&node| mask[node / word_bits] & (1 << (node % word_bits)) != 0)
        .collect()
}

/// Set the memory policy of the calling thread
fn set_mempolicy(mode: c_long, mask: Option<&[c_ulong; NODE_MASK_WORDS]>) -> Result<(), RawOsError> {
    let (mask_ptr, maxnode) = match mask {
        Some(mask) => (mask.as_ptr(), MAX_NODES as c_ulong),
        None => (ptr::null(), 0),
    };
    errors::call_os_int("set_mempolicy", || {
        // SAFETY: mask_ptr is either null with maxnode 0, or points to a mask
        //         of maxnode bits that outlives the call
        unsafe { libc::syscall(libc::SYS_set_mempolicy, mode, mask_ptr, maxnode) }
    })
    .map(|_| ())
}

use archtopo::{ArchTopology, BindingTarget, BuildFlags};
use std::thread;

/// Example which describes the host machine, then spawns one thread per core
/// and pins each thread to its core.
///
/// Set `ARCHTOPO_SYNTHETIC` to describe an imaginary machine instead.
///
/// Example output on a 2-core machine without NUMA nodes:
///
/// ```text
/// Counts { nnodes: 0, nsockets: 1, ncores: 2, npus: 2, ... }
/// Core 0: caches [48, 1280, 12288] KiB, siblings []
/// Core 1: caches [48, 1280, 12288] KiB, siblings []
/// Thread 0: now bound to CPU 0, NUMA node None, accelerator None
/// Thread 1: now bound to CPU 1, NUMA node None, accelerator None
/// ```
fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt().init();

    let topology = ArchTopology::builder()
        .with_flags(BuildFlags::DETECT_ACCELERATORS)
        .build()?;
    println!("{:?}", topology.counts());
    for (idx, core) in topology.cores().iter().enumerate() {
        println!(
            "Core {idx}: caches {:?} KiB, siblings {:?}",
            core.caches(),
            core.siblings()
        );
    }
    for (idx, node) in topology.nodes().iter().enumerate() {
        println!(
            "Node {idx}: {} MiB, cores {:?}",
            node.total_memory() >> 20,
            node.owned_cores()
        );
    }

    let ncores = topology.counts().ncores;
    thread::scope(|scope| {
        let handles = topology
            .cores()
            .iter()
            .enumerate()
            .map(|(idx, core)| {
                let topology = &topology;
                scope.spawn(move || -> eyre::Result<()> {
                    topology.set_core_affinity(BindingTarget::Thread, core.id())?;
                    println!(
                        "Thread {idx}: now bound to CPU {:?}, NUMA node {:?}, accelerator {:?}",
                        topology.get_core_affinity(BindingTarget::Thread)?,
                        topology.get_node(BindingTarget::Thread)?,
                        topology.assign_gpu(idx, idx, ncores),
                    );
                    Ok(())
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => eyre::bail!("a binding thread panicked"),
            }
        }
        Ok(())
    })
}

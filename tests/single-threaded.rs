//! Single-threaded test process for the CPU and memory binding operations of
//! the host provider, whose effects are visible process-wide.
//!
//! The test is skipped when the host's sysfs cannot be used, e.g. inside some
//! sandboxes.
#![cfg(target_os = "linux")]

// WARNING: DO NOT CREATE ANY OTHER #[test] FUNCTION IN THIS INTEGRATION TEST!
//
// If you need more tests, create more integration tests (but beware that they
// won't be able to share code.

use archtopo::{
    provider::{linux::SysfsProvider, HardwareProvider},
    ArchTopology, BindError, BindingTarget, BuildFlags, MemoryPolicy,
};
#[allow(unused)]
use similar_asserts::assert_eq;

#[test]
fn single_threaded_test() {
    tracing_subscriber::fmt().with_test_writer().init();

    let topology = match ArchTopology::builder()
        .with_flags(BuildFlags::IGNORE_ENV | BuildFlags::DETECT_ACCELERATORS)
        .build()
    {
        Ok(topology) => topology,
        Err(e) => {
            eprintln!("skipping host binding test: {e}");
            return;
        }
    };
    let counts = topology.counts();
    dbg!(counts);
    assert_eq!(topology.provider_name(), Some("sysfs"));
    assert_eq!(topology.cores().len(), counts.ncores);
    assert_eq!(topology.nodes().len(), counts.nnodes);
    assert!(archtopo::current_thread_id().is_some());

    // Bindings are restored through the provider, which can bind to any set
    let provider = SysfsProvider::new();
    let original = provider.cpu_binding(BindingTarget::Thread).unwrap();
    dbg!(&original);

    // Thread binding to each core that this process may run on
    for (idx, core) in topology.cores().iter().enumerate() {
        if !original.is_set(core.id()) {
            continue;
        }
        topology
            .set_core_affinity(BindingTarget::Thread, core.id())
            .unwrap();
        assert_eq!(
            topology.get_core_affinity(BindingTarget::Thread).unwrap(),
            Some(core.id())
        );
        assert_eq!(
            topology.get_node(BindingTarget::Thread).unwrap(),
            topology.core_node(idx)
        );
    }
    provider
        .bind_cpu(&original, BindingTarget::Thread)
        .unwrap();
    assert_eq!(
        provider.cpu_binding(BindingTarget::Thread).unwrap(),
        original
    );

    // Memory policies, which some sandboxes forbid changing
    let initial = match topology.get_memory_policy() {
        Ok(binding) => binding,
        Err(BindError::Rejected(e)) => {
            eprintln!("skipping memory policy checks: {e}");
            return;
        }
        Err(e) => panic!("{e}"),
    };
    dbg!(initial);
    if counts.nnodes == 0 {
        assert_eq!(initial.policy, MemoryPolicy::Unknown);
        return;
    }
    match topology.set_memory_policy(MemoryPolicy::Os) {
        Ok(()) => {}
        Err(BindError::Rejected(e)) => {
            eprintln!("skipping memory policy checks: {e}");
            return;
        }
        Err(e) => panic!("{e}"),
    }
    assert_eq!(
        topology.get_memory_policy().unwrap().policy,
        MemoryPolicy::Os
    );
    topology.set_memory_policy(MemoryPolicy::Local).unwrap();
    assert_eq!(
        topology.get_memory_policy().unwrap().policy,
        MemoryPolicy::Local
    );
    topology.set_memory_policy(MemoryPolicy::Os).unwrap();
}

// WARNING: DO NOT CREATE ANY OTHER #[test] FUNCTION IN THIS INTEGRATION TEST!

use aero_pc_platform::{CpuExecutor, ExitReason, MachineConfig, PcPlatform};

/// Always retires every requested cycle; exercises the scheduler/checkpoint
/// cadence without modeling any real instruction semantics.
struct FakeCpu;

impl CpuExecutor for FakeCpu {
    fn run(&mut self, cycles: u64) -> (u64, ExitReason) {
        (cycles, ExitReason::Normal)
    }
}

#[test]
fn checkpoint_is_produced_only_on_the_eighth_slice() {
    let mut pc = PcPlatform::new(MachineConfig::default()).unwrap();
    let mut cpu = FakeCpu;

    for i in 1..PcPlatform::CHECKPOINT_INTERVAL {
        let outcome = pc.run_slice(&mut cpu);
        assert!(outcome.checkpoint.is_none(), "slice {i} should not checkpoint");
    }

    let outcome = pc.run_slice(&mut cpu);
    assert!(
        outcome.checkpoint.is_some(),
        "slice {} should produce a checkpoint",
        PcPlatform::CHECKPOINT_INTERVAL
    );

    let outcome = pc.run_slice(&mut cpu);
    assert!(outcome.checkpoint.is_none(), "cadence should restart after a checkpoint");
}

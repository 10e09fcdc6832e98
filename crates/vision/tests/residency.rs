mod common;

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::anyhow;
use common::{FakeAllocator, FakeModel, Probe};
use vision::{
    PipelineError, PipelineStage, ResidencyController, ResidencyMode, ResidencySettings,
    VisionError,
    ml_core::{DeviceTransferOps, Precision, Tier, TieredModel, TransferOp},
};

struct Harness {
    controller: ResidencyController<FakeModel>,
    probe: Arc<Probe>,
    allocator: Arc<FakeAllocator>,
}

fn harness(mode: ResidencyMode, idle_timeout: Duration, device_available: bool) -> Harness {
    let probe = Arc::new(Probe::default());
    let allocator = FakeAllocator::new(device_available);
    let loader_probe = probe.clone();
    let controller = ResidencyController::new(
        ResidencySettings::new(mode, idle_timeout),
        DeviceTransferOps::new(allocator.clone()),
        move |tier| Ok(FakeModel::new(tier, loader_probe)),
    )
    .unwrap();
    Harness {
        controller,
        probe,
        allocator,
    }
}

fn infer(controller: &ResidencyController<FakeModel>, work: Duration) -> Tier {
    controller
        .run(|model| {
            model
                .infer(&work)
                .map_err(|err| PipelineError::new(PipelineStage::ElementLabeling, err))
        })
        .unwrap()
}

#[test]
fn persistent_with_device_stays_on_device() {
    let h = harness(ResidencyMode::Persistent, Duration::from_millis(10), true);
    assert_eq!(h.controller.location(), Tier::Device);

    for _ in 0..5 {
        assert_eq!(infer(&h.controller, Duration::ZERO), Tier::Device);
        assert_eq!(h.controller.location(), Tier::Device);
    }
    thread::sleep(Duration::from_millis(60));

    assert_eq!(h.controller.location(), Tier::Device);
    assert!(!h.controller.has_pending_eviction());
    assert!(h.probe.placements().is_empty());
    assert_eq!(h.allocator.releases(), 0);
    assert_eq!(h.controller.precision(), Precision::F32);
}

#[test]
fn host_only_never_touches_device() {
    let h = harness(ResidencyMode::HostOnly, Duration::from_millis(10), true);
    assert_eq!(h.controller.location(), Tier::Host);

    for _ in 0..3 {
        assert_eq!(infer(&h.controller, Duration::ZERO), Tier::Host);
        assert_eq!(h.controller.location(), Tier::Host);
    }

    assert!(h.probe.placements().is_empty());
    assert_eq!(h.controller.effective_mode(), ResidencyMode::HostOnly);
}

#[test]
fn persistent_without_device_runs_on_host_forever() {
    let h = harness(ResidencyMode::Persistent, Duration::from_secs(1), false);

    assert_eq!(h.controller.mode(), ResidencyMode::Persistent);
    assert_eq!(h.controller.effective_mode(), ResidencyMode::HostOnly);
    for _ in 0..3 {
        assert_eq!(infer(&h.controller, Duration::ZERO), Tier::Host);
    }
    assert_eq!(h.controller.location(), Tier::Host);
    assert!(h.probe.placements().is_empty());
}

#[test]
fn on_demand_without_device_degrades_without_staging() {
    let h = harness(ResidencyMode::OnDemand, Duration::from_millis(20), false);

    assert_eq!(h.controller.effective_mode(), ResidencyMode::HostOnly);
    assert_eq!(infer(&h.controller, Duration::ZERO), Tier::Host);
    assert!(!h.controller.has_pending_eviction());
    assert!(h.probe.placements().is_empty());
    assert_eq!(h.probe.conversions.load(Ordering::SeqCst), 0);
}

#[test]
fn on_demand_stages_half_precision_once() {
    let h = harness(ResidencyMode::OnDemand, Duration::ZERO, true);
    assert_eq!(h.controller.location(), Tier::Host);
    assert_eq!(h.controller.precision(), Precision::F16);

    for _ in 0..3 {
        infer(&h.controller, Duration::ZERO);
    }

    assert_eq!(h.probe.conversions.load(Ordering::SeqCst), 1);
    assert_eq!(h.probe.pins.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.precision(), Precision::F16);
}

#[test]
fn on_demand_evicts_after_quiet_period() {
    let h = harness(ResidencyMode::OnDemand, Duration::from_millis(300), true);

    assert_eq!(infer(&h.controller, Duration::from_millis(50)), Tier::Device);
    assert_eq!(h.controller.location(), Tier::Device);
    assert!(h.controller.has_pending_eviction());

    thread::sleep(Duration::from_millis(150));
    assert_eq!(h.controller.location(), Tier::Device);

    thread::sleep(Duration::from_millis(450));
    assert_eq!(h.controller.location(), Tier::Host);
    assert!(!h.controller.has_pending_eviction());
    assert_eq!(h.probe.placements(), vec![Tier::Device, Tier::Host]);
    assert_eq!(h.allocator.releases(), 1);
}

#[test]
fn second_request_debounces_eviction() {
    let h = harness(ResidencyMode::OnDemand, Duration::from_millis(400), true);

    infer(&h.controller, Duration::ZERO);
    thread::sleep(Duration::from_millis(250));
    infer(&h.controller, Duration::ZERO);

    // Past the first deadline, inside the second.
    thread::sleep(Duration::from_millis(250));
    assert_eq!(h.controller.location(), Tier::Device);
    assert!(h.controller.has_pending_eviction());

    thread::sleep(Duration::from_millis(500));
    assert_eq!(h.controller.location(), Tier::Host);
    assert_eq!(h.probe.placements(), vec![Tier::Device, Tier::Host]);
    assert_eq!(h.allocator.releases(), 1);
}

#[test]
fn request_after_eviction_reloads_onto_device() {
    let h = harness(ResidencyMode::OnDemand, Duration::from_millis(50), true);

    infer(&h.controller, Duration::ZERO);
    thread::sleep(Duration::from_millis(250));
    assert_eq!(h.controller.location(), Tier::Host);

    assert_eq!(infer(&h.controller, Duration::ZERO), Tier::Device);
    assert_eq!(
        h.probe.placements(),
        vec![Tier::Device, Tier::Host, Tier::Device]
    );
}

#[test]
fn zero_idle_timeout_offloads_before_returning() {
    let h = harness(ResidencyMode::OnDemand, Duration::ZERO, true);

    for _ in 0..2 {
        assert_eq!(infer(&h.controller, Duration::ZERO), Tier::Device);
        assert_eq!(h.controller.location(), Tier::Host);
        assert!(!h.controller.has_pending_eviction());
    }
    assert_eq!(h.allocator.releases(), 2);
}

#[test]
fn transfer_failure_surfaces_and_keeps_host_location() {
    let h = harness(ResidencyMode::OnDemand, Duration::from_millis(100), true);
    h.probe.fail_to_device.store(true, Ordering::SeqCst);
    let executed = AtomicUsize::new(0);

    let err = h
        .controller
        .run(|_model| {
            executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap_err();

    match err {
        VisionError::Transfer { mode, source } => {
            assert_eq!(mode, ResidencyMode::OnDemand);
            assert_eq!(source.op(), TransferOp::ToDevice);
            assert_eq!(source.location(), Tier::Host);
        }
        other => panic!("expected transfer error, got {other:?}"),
    }
    assert_eq!(executed.load(Ordering::SeqCst), 0);
    assert_eq!(h.controller.location(), Tier::Host);
    assert!(!h.controller.has_pending_eviction());

    h.probe.fail_to_device.store(false, Ordering::SeqCst);
    assert_eq!(infer(&h.controller, Duration::ZERO), Tier::Device);
}

#[test]
fn pipeline_failure_still_schedules_eviction() {
    let h = harness(ResidencyMode::OnDemand, Duration::from_millis(100), true);

    let err = h
        .controller
        .run::<(), _>(|_model| {
            Err(PipelineError::new(
                PipelineStage::TextRegions,
                anyhow!("OCR engine crashed"),
            ))
        })
        .unwrap_err();

    match &err {
        VisionError::Pipeline(pipeline) => {
            assert_eq!(pipeline.stage, PipelineStage::TextRegions);
            assert_eq!(pipeline.source.to_string(), "OCR engine crashed");
        }
        other => panic!("expected pipeline error, got {other:?}"),
    }
    assert_eq!(h.controller.location(), Tier::Device);
    assert!(h.controller.has_pending_eviction());

    thread::sleep(Duration::from_millis(350));
    assert_eq!(h.controller.location(), Tier::Host);
}

#[test]
fn panicking_request_still_arms_eviction() {
    let h = harness(ResidencyMode::OnDemand, Duration::from_millis(50), true);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        h.controller
            .run::<(), _>(|_model| panic!("caption kernel aborted"))
    }));

    assert!(outcome.is_err());
    assert!(h.controller.has_pending_eviction());
    thread::sleep(Duration::from_millis(400));
    assert_eq!(h.controller.location(), Tier::Host);
    assert_eq!(h.probe.placements(), vec![Tier::Device, Tier::Host]);

    assert_eq!(infer(&h.controller, Duration::ZERO), Tier::Device);
}

#[test]
fn panicking_request_with_zero_timeout_offloads_before_unwinding() {
    let h = harness(ResidencyMode::OnDemand, Duration::ZERO, true);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        h.controller
            .run::<(), _>(|_model| panic!("caption kernel aborted"))
    }));

    assert!(outcome.is_err());
    assert_eq!(h.controller.location(), Tier::Host);
    assert_eq!(h.allocator.releases(), 1);
}

#[test]
fn concurrent_runs_never_overlap() {
    let h = Arc::new(harness(
        ResidencyMode::OnDemand,
        Duration::from_millis(1),
        true,
    ));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let h = h.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    assert_eq!(infer(&h.controller, Duration::from_millis(2)), Tier::Device);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(h.probe.inferences.load(Ordering::SeqCst), 40);
    assert_eq!(h.probe.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(
        h.probe
            .seen_during_infer()
            .iter()
            .all(|tier| *tier == Tier::Device)
    );

    thread::sleep(Duration::from_millis(100));
    assert_eq!(h.controller.location(), Tier::Host);
}

#[test]
fn load_failure_is_initialization_error() {
    let allocator = FakeAllocator::new(true);
    let result = ResidencyController::<FakeModel>::new(
        ResidencySettings::new(ResidencyMode::Persistent, Duration::from_secs(1)),
        DeviceTransferOps::new(allocator),
        |_tier| Err(anyhow!("weights missing")),
    );

    match result {
        Err(VisionError::Initialization { component, source }) => {
            assert_eq!(component, "caption model");
            assert_eq!(source.to_string(), "weights missing");
        }
        Err(other) => panic!("expected initialization error, got {other:?}"),
        Ok(_) => panic!("controller built without a model"),
    }
}

#[test]
fn dropping_controller_with_pending_eviction_returns_promptly() {
    let h = harness(ResidencyMode::OnDemand, Duration::from_secs(30), true);
    infer(&h.controller, Duration::ZERO);
    assert!(h.controller.has_pending_eviction());
    drop(h);
}

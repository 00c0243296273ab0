//! Report export against live snapshots

use std::sync::Arc;
use svmem_core::host::{HostDevice, HostPlatform, HostRuntime};
use svmem_core::{ExportFormat, RegionFlags, Report, SvmCapabilities, SvmManager};

fn manager() -> SvmManager {
    let rt = HostRuntime::new(vec![
        HostPlatform::new("first", "Vendor One")
            .with_device(HostDevice::cpu("cpu0"))
            .with_device(HostDevice::gpu("gpu0", SvmCapabilities::COARSE_GRAIN_BUFFER)),
        HostPlatform::new("empty", "Vendor Two"),
        HostPlatform::new("third", "Vendor Three")
            .with_device(HostDevice::gpu("old", SvmCapabilities::NONE).with_version("OpenCL 1.1"))
            .with_device(HostDevice::cpu("mangled").with_raw_name(b"dev\xC3\x28ice")),
    ]);
    SvmManager::new(Arc::new(rt))
}

#[test]
fn test_export_round_trip_reconciles_with_snapshot() {
    let manager = manager();
    manager.discover().unwrap();
    let mut ctx = manager.create_default_context().unwrap();
    let region = ctx.allocate(4096, RegionFlags::FINE_GRAIN).unwrap();

    let snapshot = manager.snapshot();
    let bytes = Report::from_snapshot(&snapshot).to_bytes(ExportFormat::Json).unwrap();
    let parsed = Report::from_slice(&bytes).unwrap();

    assert_eq!(parsed.platforms.len(), snapshot.platforms.len());
    assert_eq!(parsed.device_count(), snapshot.device_count());
    for (p, platform) in snapshot.platforms.iter().enumerate() {
        assert_eq!(parsed.platforms[p].name, platform.name.to_string_lossy());
        let names: Vec<_> = parsed.platforms[p].devices.iter().map(|d| d.name.clone()).collect();
        let expected: Vec<_> = platform
            .devices
            .iter()
            .map(|d| d.device.name.to_string_lossy())
            .collect();
        assert_eq!(names, expected);
    }
    let regions: usize = parsed
        .platforms
        .iter()
        .flat_map(|p| p.devices.iter())
        .flat_map(|d| d.contexts.iter())
        .map(|c| c.regions.len())
        .sum();
    assert_eq!(regions, snapshot.region_count());

    // invalid UTF-8 degrades the report instead of dropping the device
    assert!(!parsed.ok);
    assert_eq!(parsed.errors.len(), 1);
    assert!(parsed.errors[0].contains("device 1"));

    ctx.free(region).unwrap();
    ctx.destroy().unwrap();
}

#[test]
fn test_export_to_file() {
    let manager = manager();
    manager.discover().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.json");
    std::fs::write(&path, manager.export(ExportFormat::JsonPretty).unwrap()).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains('\n'));
    let report = Report::from_slice(text.as_bytes()).unwrap();
    assert_eq!(report.device_count(), 4);
    assert!(report.platforms[1].devices.is_empty());
    assert_eq!(report.platforms[2].vendor, "Vendor Three");
}

#[test]
fn test_single_device_export_matches_full_report() {
    let manager = manager();
    manager.discover().unwrap();
    let report = manager.report();
    for index in 0..report.device_count() {
        let bytes = report.device_json(index, ExportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["name"], report.device(index).unwrap().name.as_str());
    }
}

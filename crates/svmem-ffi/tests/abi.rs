//! C ABI behavior against the built-in host runtime

use std::ffi::{c_char, c_int, CString};
use std::ptr;
use svmem::*;

fn last_error() -> String {
    let mut buf = vec![0u8; 256];
    let len = unsafe { svmem_last_error(buf.as_mut_ptr().cast::<c_char>(), buf.len()) };
    assert!(len >= 0);
    String::from_utf8_lossy(&buf[..len as usize]).into_owned()
}

#[test]
fn test_version_and_selftest() {
    let (mut major, mut minor, mut patch) = (-1 as c_int, -1 as c_int, -1 as c_int);
    assert_eq!(unsafe { svmem_get_version(&mut major, &mut minor, &mut patch) }, 0);
    assert_eq!((major, minor, patch), (0, 1, 0));
    assert_eq!(
        unsafe { svmem_get_version(ptr::null_mut(), &mut minor, &mut patch) },
        -1
    );
    assert_eq!(svmem_selftest(), 0);
}

#[test]
fn test_device_count_matches_enumeration() {
    let count = svmem_device_count();
    assert_eq!(count, 1);

    let needed = unsafe { svmem_enumerate_devices_json(ptr::null_mut(), 0) };
    assert!(needed > 0);
    let mut buf = vec![0u8; needed as usize + 1];
    let written =
        unsafe { svmem_enumerate_devices_json(buf.as_mut_ptr().cast::<c_char>(), buf.len()) };
    assert_eq!(written, needed);
    assert_eq!(buf[needed as usize], 0);

    let value: serde_json::Value = serde_json::from_slice(&buf[..needed as usize]).unwrap();
    assert_eq!(value["ok"], true);
    let devices: usize = value["platforms"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["devices"].as_array().unwrap().len())
        .sum();
    assert_eq!(devices as c_int, count);
}

#[test]
fn test_enumerate_into_small_buffer() {
    let needed = unsafe { svmem_enumerate_devices_json(ptr::null_mut(), 0) };
    // room for the text but not the terminator
    let mut buf = vec![0u8; needed as usize];
    let rc = unsafe { svmem_enumerate_devices_json(buf.as_mut_ptr().cast::<c_char>(), buf.len()) };
    assert_eq!(rc, -5);
    assert!(last_error().contains("needed"));
}

#[test]
fn test_export_single_device() {
    let export = |index: i32, buf: &mut [u8], cap: usize| unsafe {
        svmem_export_device_info_json(index, buf.as_mut_ptr().cast::<c_char>(), cap)
    };
    let mut buf = vec![0u8; 8192];
    let cap = buf.len();
    assert_eq!(export(0, &mut buf, cap), 0);
    let end = buf.iter().position(|&b| b == 0).unwrap();
    let device: serde_json::Value = serde_json::from_slice(&buf[..end]).unwrap();
    assert_eq!(device["name"], "Host CPU");
    assert_eq!(device["type"], 2);

    assert_eq!(export(7, &mut buf, cap), -2);
    assert_eq!(export(-1, &mut buf, cap), -2);

    let mut tiny = [0u8; 4];
    assert_eq!(export(0, &mut tiny, 4), -5);

    // a zero capacity is too small, not a size query
    let mut untouched = [0x55u8; 16];
    assert_eq!(export(0, &mut untouched, 0), -5);
    assert!(untouched.iter().all(|&b| b == 0x55));
    assert!(last_error().contains("buffer of 0 bytes"));
}

#[test]
fn test_export_all_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.json");
    let c_path = CString::new(path.to_str().unwrap()).unwrap();
    assert_eq!(unsafe { svmem_export_all_devices_json(c_path.as_ptr()) }, 0);
    let value: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(value["platforms"][0]["devices"][0]["name"], "Host CPU");

    let missing = dir.path().join("no/such/dir/devices.json");
    let c_missing = CString::new(missing.to_str().unwrap()).unwrap();
    assert_eq!(unsafe { svmem_export_all_devices_json(c_missing.as_ptr()) }, -6);
    assert!(last_error().contains("devices.json"));

    assert_eq!(unsafe { svmem_export_all_devices_json(ptr::null()) }, -1);
}

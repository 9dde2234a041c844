//! `devices` subcommand: list HiDes modulators with their identity.

use tsmod_lib::session::enumerate_device_info;

use super::{DeviceInfo, DevicesOutput, Result, print_json};

fn describe(dev: &DeviceInfo) -> String {
    let index = dev.index.map_or_else(|| "-".to_string(), |i| i.to_string());
    format!(
        "  [{index}] {}  chip 0x{:04X}, device type {}, driver {}",
        dev.path, dev.chip_type, dev.device_type, dev.driver_version
    )
}

pub(super) fn cmd_devices(json: bool) -> Result<()> {
    let devices = enumerate_device_info();

    if json {
        let output = DevicesOutput {
            count: devices.len(),
            devices,
        };
        return print_json(&output);
    }

    if devices.is_empty() {
        println!("No HiDes modulators found.");
        return Ok(());
    }

    println!(
        "Found {} HiDes modulator{}:",
        devices.len(),
        if devices.len() == 1 { "" } else { "s" }
    );
    println!();

    for dev in &devices {
        println!("{}", describe(dev));
    }

    Ok(())
}

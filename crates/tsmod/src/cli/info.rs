//! `info` subcommand: open a modulator and show its identity.

use std::path::Path;

use super::{
    DeviceInfo, InfoOutput, PlatformSession, Result, device_identifier, kv, kv_indent, kv_width,
    load_config, print_json,
};

fn print_info(info: &DeviceInfo, gain: Option<i32>) {
    let w = kv_width(
        &["Device:", "Driver:"],
        &[
            "Path:",
            "Index:",
            "Chip type:",
            "Device type:",
            "Gain:",
            "Version:",
            "API version:",
            "Link firmware:",
            "OFDM firmware:",
            "Company:",
            "Hardware:",
        ],
    );

    kv("Device:", &info.name, w);
    kv_indent("Path:", &info.path, w);
    if let Some(index) = info.index {
        kv_indent("Index:", index, w);
    }
    kv_indent("Chip type:", format_args!("0x{:04X}", info.chip_type), w);
    kv_indent("Device type:", info.device_type, w);
    match gain {
        Some(g) => kv_indent("Gain:", format_args!("{g} dB"), w),
        None => kv_indent("Gain:", "unavailable", w),
    }
    println!();

    println!("Driver:");
    kv_indent("Version:", &info.driver_version, w);
    kv_indent("API version:", &info.api_version, w);
    kv_indent("Link firmware:", &info.link_fw_version, w);
    kv_indent("OFDM firmware:", &info.ofdm_fw_version, w);
    kv_indent("Company:", &info.company, w);
    kv_indent("Hardware:", &info.hw_info, w);
}

pub(super) fn cmd_info(device: Option<&str>, json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path);
    let mut session = PlatformSession::new();
    session.open(&device_identifier(&config, device))?;

    let gain = session
        .gain()
        .inspect_err(|e| log::warn!("gain query failed: {e}"))
        .ok();
    let info = session.info()?.clone();
    session.close();

    if json {
        return print_json(&InfoOutput { device: info, gain });
    }
    print_info(&info, gain);
    Ok(())
}

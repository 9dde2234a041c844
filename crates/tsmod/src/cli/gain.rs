//! `gain` subcommand: output gain pass-throughs.

use std::path::Path;

use super::{
    GainOutput, PlatformSession, Result, device_identifier, kv, kv_width, load_config, print_json,
};

pub(super) fn cmd_gain(
    device: Option<&str>,
    set: Option<i32>,
    range: bool,
    json: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path);
    let mut session = PlatformSession::new();
    session.open(&device_identifier(&config, device))?;

    let gain = match set {
        Some(requested) => {
            let applied = session.set_gain(requested)?;
            if applied != requested {
                log::warn!("requested gain {requested} dB, device applied {applied} dB");
            }
            applied
        }
        None => session.gain()?,
    };

    let range = if range {
        let t = &config.tuning;
        Some(session.gain_range(t.frequency_hz, t.bandwidth)?)
    } else {
        None
    };

    let path = session.info()?.path.clone();
    session.close();

    let output = GainOutput { path, gain, range };
    if json {
        return print_json(&output);
    }

    let w = kv_width(&["Device:", "Gain:", "Range:"], &[]);
    kv("Device:", &output.path, w);
    kv("Gain:", format_args!("{} dB", output.gain), w);
    if let Some(r) = output.range {
        kv(
            "Range:",
            format_args!(
                "{} to {} dB at {} Hz, {}",
                r.min, r.max, config.tuning.frequency_hz, config.tuning.bandwidth
            ),
            w,
        );
    }
    Ok(())
}

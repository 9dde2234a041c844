//! `bitrate` subcommand: theoretical bitrate of a tuning, no hardware needed.

use std::path::Path;

use super::{BitrateOutput, Result, TuningArgs, kv, kv_width, load_config, print_json};

pub(super) fn cmd_bitrate(tuning: &TuningArgs, json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path);
    let params = tuning.apply(&config.tuning);
    let output = BitrateOutput {
        bitrate: params.theoretical_bitrate(),
        packets_per_second: params.packets_per_second(),
        tuning: params,
    };

    if json {
        return print_json(&output);
    }

    let w = kv_width(&["Tuning:", "Bitrate:", "Packets/s:"], &[]);
    kv("Tuning:", &output.tuning, w);
    if output.bitrate == 0 {
        kv("Bitrate:", "unknown (unspecified parameters, sending unpaced)", w);
    } else {
        kv("Bitrate:", format_args!("{} b/s", output.bitrate), w);
        kv("Packets/s:", format_args!("{:.1}", output.packets_per_second), w);
    }
    Ok(())
}

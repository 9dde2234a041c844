//! `config` subcommand: show current configuration and file path.

use std::path::Path;

use super::{
    Config, ConfigOutput, Result, config_file, kv, kv_indent, kv_width, load_config, print_json,
};

pub(super) fn cmd_config(save: bool, json: bool, custom_path: Option<&Path>) -> Result<()> {
    let config = load_config(custom_path);
    let config_path = config_file(custom_path);

    if save {
        match &config_path {
            Some(p) => config.save_to(p)?,
            None => config.save()?,
        }
        log::info!("saved configuration");
    }

    let config_exists = config_path.as_ref().is_some_and(|p| p.exists());
    let problems: Vec<String> = match config.validate() {
        Ok(()) => vec![],
        Err(errors) => errors.iter().map(ToString::to_string).collect(),
    };

    if json {
        let output = ConfigOutput {
            config_file: config_path.as_ref().map(|p| p.display().to_string()),
            config_file_exists: config_exists,
            settings: config,
            problems,
        };
        return print_json(&output);
    }

    print_config(&config, config_path.as_deref(), config_exists, save, &problems);
    Ok(())
}

fn print_config(
    config: &Config,
    config_path: Option<&Path>,
    exists: bool,
    saved: bool,
    problems: &[String],
) {
    let w = kv_width(
        &["Config file:"],
        &[
            "device:",
            "gain:",
            "frequency_hz:",
            "bandwidth:",
            "modulation:",
            "code_rate:",
            "guard_interval:",
            "transmission_mode:",
            "inversion:",
            "max_chunk_packets:",
            "retry_delay_us:",
            "max_retries:",
        ],
    );

    match config_path {
        Some(p) if saved => kv("Config file:", format_args!("{} (saved)", p.display()), w),
        Some(p) if exists => kv("Config file:", format_args!("{} (loaded)", p.display()), w),
        Some(p) => kv(
            "Config file:",
            format_args!("{} (not found, using defaults)", p.display()),
            w,
        ),
        None => kv("Config file:", "(no config directory)", w),
    }
    println!();

    println!("Settings:");
    if config.device.is_empty() {
        kv_indent("device:", "(first modulator)", w);
    } else {
        kv_indent("device:", &config.device, w);
    }
    match config.gain {
        Some(g) => kv_indent("gain:", format_args!("{g} dB"), w),
        None => kv_indent("gain:", "(unchanged)", w),
    }
    println!();

    let t = &config.tuning;
    println!("Tuning:");
    kv_indent("frequency_hz:", t.frequency_hz, w);
    kv_indent("bandwidth:", t.bandwidth, w);
    kv_indent("modulation:", t.modulation, w);
    kv_indent("code_rate:", t.code_rate, w);
    kv_indent("guard_interval:", t.guard_interval, w);
    kv_indent("transmission_mode:", t.transmission_mode, w);
    kv_indent("inversion:", t.inversion, w);
    println!();

    let p = &config.pacing;
    println!("Pacing:");
    kv_indent("max_chunk_packets:", p.max_chunk_packets, w);
    kv_indent("retry_delay_us:", p.retry_delay_us, w);
    kv_indent("max_retries:", p.max_retries, w);

    if !problems.is_empty() {
        println!();
        println!("Problems:");
        for problem in problems {
            println!("  {problem}");
        }
    }
}

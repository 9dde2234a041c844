//! `transmit` subcommand: tune, start, stream a file, stop.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tsmod_lib::session::Modulator;
use tsmod_lib::stream::stream_packets;

use super::{
    Config, PlatformSession, Result, SHUTDOWN, StreamSummary, TransmitOutput, TuningArgs,
    check_config, device_identifier, kv, kv_width, load_config, print_json,
};

/// Chunks read from the file per `send` call.
const BURST_CHUNKS: usize = 8;

/// Stream `source` once, or over and over with `repeat` until cancelled.
///
/// Returns the merged summary and the number of passes started. An empty
/// source ends the loop.
fn stream_source<M, R>(
    modulator: &mut M,
    source: &mut R,
    burst_packets: usize,
    repeat: bool,
    cancel: &AtomicBool,
) -> Result<(StreamSummary, u64)>
where
    M: Modulator + ?Sized,
    R: Read + Seek,
{
    let mut total = StreamSummary::default();
    let mut passes = 0;
    loop {
        let pass = stream_packets(modulator, source, burst_packets, Some(cancel))?;
        passes += 1;
        total.merge(&pass);
        if !repeat || pass.cancelled || pass.packets == 0 {
            break;
        }
        log::debug!("end of file after {} packets, looping", pass.packets);
        source.seek(SeekFrom::Start(0))?;
    }
    Ok((total, passes))
}

fn print_transmit(output: &TransmitOutput) {
    let w = kv_width(
        &[
            "Device:", "Tuning:", "Bitrate:", "Packets:", "Passes:", "Writes:", "Resyncs:",
        ],
        &[],
    );
    kv("Device:", &output.path, w);
    kv("Tuning:", &output.tuning, w);
    if output.bitrate == 0 {
        kv("Bitrate:", "unpaced", w);
    } else {
        kv("Bitrate:", format_args!("{} b/s", output.bitrate), w);
    }
    kv("Packets:", output.summary.packets, w);
    if output.passes > 1 {
        kv("Passes:", output.passes, w);
    }
    let s = &output.statistics;
    kv(
        "Writes:",
        format_args!(
            "{} ({} failed, {:.2}%)",
            s.total_writes,
            s.failed_writes,
            s.failure_ratio() * 100.0
        ),
        w,
    );
    kv("Resyncs:", output.resyncs, w);
    if output.summary.bad_sync > 0 {
        println!(
            "Warning: {} packets without sync byte",
            output.summary.bad_sync
        );
    }
    if output.summary.cancelled {
        println!("Interrupted.");
    }
}

pub(super) fn cmd_transmit(
    file: &Path,
    device: Option<&str>,
    tuning: &TuningArgs,
    repeat: bool,
    json: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = load_config(config_path);
    config.tuning = tuning.apply(&config.tuning);
    check_config(&config)?;
    let Config {
        tuning: params,
        pacing,
        gain,
        ..
    } = config.clone();

    let mut source = File::open(file)?;

    let mut session = PlatformSession::new().with_pacing(pacing);
    session.set_cancel_flag(Some(Arc::clone(&*SHUTDOWN)));
    session.open(&device_identifier(&config, device))?;

    if let Some(requested) = gain {
        let applied = session.set_gain(requested)?;
        if applied != requested {
            log::warn!("requested gain {requested} dB, device applied {applied} dB");
        }
    }
    session.tune(&params)?;
    session.start_transmission()?;
    log::info!(
        "transmitting {} at {} b/s",
        file.display(),
        session.bitrate()
    );

    let burst = pacing.max_chunk_packets * BURST_CHUNKS;
    let streamed = stream_source(&mut session, &mut source, burst, repeat, &SHUTDOWN);
    let resyncs = session.pacing().resyncs();
    let statistics = session.statistics();
    let stopped = session.stop_transmission();

    let (summary, passes) = streamed?;
    stopped?;

    let output = TransmitOutput {
        path: session.info()?.path.clone(),
        bitrate: session.bitrate(),
        tuning: params,
        passes,
        summary,
        statistics,
        resyncs,
    };
    session.close();

    if json {
        return print_json(&output);
    }
    print_transmit(&output);
    Ok(())
}

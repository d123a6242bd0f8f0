// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{num::NonZeroU32, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use simpleperf_app_api::{
    device::DevicePaths,
    options::{CallGraph, RecordOptions},
    session::Session,
};

mod slow;

pub fn set_up_tracing() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    let format = tracing_subscriber::fmt::layer().pretty();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(format)
        .with(filter)
        .init();
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CallGraphArg {
    None,
    Dwarf,
    Fp,
}

impl From<CallGraphArg> for CallGraph {
    fn from(arg: CallGraphArg) -> Self {
        match arg {
            CallGraphArg::None => CallGraph::None,
            CallGraphArg::Dwarf => CallGraph::Dwarf,
            CallGraphArg::Fp => CallGraph::FramePointer,
        }
    }
}

/// Simple program recording itself with simpleperf
#[derive(Parser, Debug)]
struct Args {
    /// App data directory. Defaults to /data/data/<package name>.
    #[arg(long)]
    app_data_dir: Option<PathBuf>,
    /// JSON file with record options. Flags below override it.
    #[arg(long)]
    options: Option<PathBuf>,
    /// JSON file with device paths.
    #[arg(long)]
    device_paths: Option<PathBuf>,
    #[arg(long)]
    output: Option<String>,
    #[arg(long)]
    event: Option<String>,
    #[arg(long)]
    frequency: Option<NonZeroU32>,
    #[arg(long, value_enum)]
    call_graph: Option<CallGraphArg>,
    #[arg(long)]
    trace_off_cpu: bool,
    /// How long to run the workload for.
    #[arg(long, default_value = "5s")]
    #[clap(value_parser = humantime::parse_duration)]
    duration: Duration,
    /// Pause recording for this long in the middle of the workload.
    #[arg(long)]
    #[clap(value_parser = humantime::parse_duration)]
    pause_for: Option<Duration>,
    #[arg(long, default_value_t = 4)]
    worker_threads: usize,
}

fn record_options(args: &Args) -> anyhow::Result<RecordOptions> {
    let mut options = match &args.options {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?
        }
        None => RecordOptions::default(),
    };
    if let Some(output) = &args.output {
        options = options.with_output_filename(output);
    }
    if let Some(event) = &args.event {
        options = options.with_event(event);
    }
    if let Some(frequency) = args.frequency {
        options = options.with_sample_frequency(frequency);
    }
    if let Some(call_graph) = args.call_graph {
        options = options.with_call_graph(call_graph.into());
    }
    if args.trace_off_cpu {
        options = options.trace_off_cpu();
    }
    Ok(options)
}

pub fn main() -> anyhow::Result<()> {
    set_up_tracing();
    let args = Args::parse();
    tracing::info!("main started");

    let options = record_options(&args)?;
    let session = match (&args.app_data_dir, &args.device_paths) {
        (None, None) => Session::try_for_current_app()?,
        (app_data_dir, device_paths) => {
            let app_data_dir = match app_data_dir {
                Some(dir) => dir.clone(),
                None => Session::try_for_current_app()?.app_data_dir().to_owned(),
            };
            let device_paths = match device_paths {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => DevicePaths::default(),
            };
            Session::builder(app_data_dir)
                .with_device_paths(device_paths)
                .build()
        }
    };

    tracing::info!(args = ?options.to_record_args(), "starting simpleperf");
    session.try_start(&options)?;
    tracing::info!(pid = session.profiler_pid(), "recording");

    match args.pause_for {
        Some(pause_for) => {
            let half = args.duration / 2;
            slow::run(args.worker_threads, half);
            session.try_pause()?;
            tracing::info!("paused for {}", humantime::format_duration(pause_for));
            slow::run(args.worker_threads, pause_for);
            session.try_resume()?;
            slow::run(args.worker_threads, args.duration - half);
        }
        None => slow::run(args.worker_threads, args.duration),
    }

    session.try_stop()?;
    tracing::info!(workspace = ?session.workspace(), "recording finished");
    Ok(())
}

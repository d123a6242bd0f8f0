// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Options for `simpleperf record`, and their translation into command-line arguments.

use std::{num::NonZeroU32, time::Duration};

use serde::{Deserialize, Serialize};

const DEFAULT_EVENT: &str = "cpu-cycles";
const DEFAULT_SAMPLE_FREQUENCY: NonZeroU32 = match NonZeroU32::new(4000) {
    Some(freq) => freq,
    None => unreachable!(),
};

/// Which call graph `simpleperf` records alongside each sample.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallGraph {
    /// Only the sampled instruction pointer.
    #[default]
    None,
    /// Dwarf based call graph. It is needed to get Java callstacks.
    Dwarf,
    /// Frame pointer based call graph. Suitable for C++ callstacks on 64-bit devices.
    FramePointer,
}

/// Options for a recording session.
///
/// ```
/// # use simpleperf_app_api::options::RecordOptions;
/// let args = RecordOptions::default()
///     .with_output_filename("out.data")
///     .with_sample_threads([10, 20])
///     .record_dwarf_call_graph()
///     .to_record_args();
/// assert_eq!(&args[..2], ["-o", "out.data"]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordOptions {
    output_filename: Option<String>,
    event: String,
    sample_frequency: NonZeroU32,
    duration_secs: f64,
    sample_threads: Vec<libc::pid_t>,
    call_graph: CallGraph,
    trace_off_cpu: bool,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            output_filename: None,
            event: DEFAULT_EVENT.to_owned(),
            sample_frequency: DEFAULT_SAMPLE_FREQUENCY,
            duration_secs: 0.0,
            sample_threads: Vec::new(),
            call_graph: CallGraph::None,
            trace_off_cpu: false,
        }
    }
}

impl RecordOptions {
    /// Sets the output filename. The file is generated under `simpleperf_data/`.
    ///
    /// Default is `perf-<month>-<day>-<hour>-<minute>-<second>.data`, in local time at the
    /// moment the arguments are built.
    pub fn with_output_filename(mut self, filename: impl Into<String>) -> Self {
        self.output_filename = Some(filename.into());
        self
    }

    /// Sets the event to record. Default is `cpu-cycles`. See `simpleperf list` for all
    /// available events.
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    /// Sets how many samples to generate each second running. Default is 4000.
    pub fn with_sample_frequency(mut self, freq: NonZeroU32) -> Self {
        self.sample_frequency = freq;
        self
    }

    /// Stops recording after `duration`. By default, recording stops only when the session
    /// is stopped.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_secs = duration.as_secs_f64();
        self
    }

    /// Records only the given threads of the app process. By default, all threads are
    /// recorded.
    pub fn with_sample_threads(mut self, threads: impl IntoIterator<Item = libc::pid_t>) -> Self {
        self.sample_threads = threads.into_iter().collect();
        self
    }

    /// Sets the call graph mode, replacing any previous one.
    pub fn with_call_graph(mut self, call_graph: CallGraph) -> Self {
        self.call_graph = call_graph;
        self
    }

    /// Records a dwarf based call graph.
    pub fn record_dwarf_call_graph(self) -> Self {
        self.with_call_graph(CallGraph::Dwarf)
    }

    /// Records a frame pointer based call graph.
    pub fn record_frame_pointer_call_graph(self) -> Self {
        self.with_call_graph(CallGraph::FramePointer)
    }

    /// Traces context switches to show where threads spend time off cpu.
    ///
    /// Sessions recording with this option cannot be paused.
    pub fn trace_off_cpu(mut self) -> Self {
        self.trace_off_cpu = true;
        self
    }

    /// Translates the options into arguments for `simpleperf record`.
    pub fn to_record_args(&self) -> Vec<String> {
        let output_filename = match self.output_filename.as_deref() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => default_output_filename(),
        };
        let mut args = vec![
            "-o".to_owned(),
            output_filename,
            "-e".to_owned(),
            self.event.clone(),
            "-f".to_owned(),
            self.sample_frequency.to_string(),
        ];
        if self.duration_secs != 0.0 {
            args.extend(["--duration".to_owned(), format!("{:.6}", self.duration_secs)]);
        }
        if self.sample_threads.is_empty() {
            args.extend(["-p".to_owned(), std::process::id().to_string()]);
        } else {
            let threads = self
                .sample_threads
                .iter()
                .map(|tid| tid.to_string())
                .collect::<Vec<_>>()
                .join(",");
            args.extend(["-t".to_owned(), threads]);
        }
        match self.call_graph {
            CallGraph::None => {}
            CallGraph::Dwarf => args.push("-g".to_owned()),
            CallGraph::FramePointer => {
                args.extend(["--call-graph".to_owned(), "fp".to_owned()]);
            }
        }
        if self.trace_off_cpu {
            args.push("--trace-offcpu".to_owned());
        }
        args
    }
}

fn default_output_filename() -> String {
    chrono::Local::now()
        .format("perf-%m-%d-%H-%M-%S.data")
        .to_string()
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn freq(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn is_default_filename(name: &str) -> bool {
        // perf-MM-DD-HH-MM-SS.data
        let Some(stamp) = name
            .strip_prefix("perf-")
            .and_then(|s| s.strip_suffix(".data"))
        else {
            return false;
        };
        let fields: Vec<_> = stamp.split('-').collect();
        fields.len() == 5
            && fields
                .iter()
                .all(|f| f.len() == 2 && f.bytes().all(|b| b.is_ascii_digit()))
    }

    #[test]
    fn test_default_args() {
        let args = RecordOptions::default().to_record_args();
        assert_eq!(args.len(), 8);
        assert_eq!(args[0], "-o");
        assert!(is_default_filename(&args[1]), "bad filename {}", args[1]);
        assert_eq!(
            &args[2..],
            [
                "-e".to_owned(),
                "cpu-cycles".to_owned(),
                "-f".to_owned(),
                "4000".to_owned(),
                "-p".to_owned(),
                std::process::id().to_string(),
            ]
        );
    }

    #[test]
    fn test_empty_filename_uses_default() {
        let args = RecordOptions::default()
            .with_output_filename("")
            .to_record_args();
        assert!(is_default_filename(&args[1]));
    }

    #[test]
    fn test_full_configuration() {
        let args = RecordOptions::default()
            .with_output_filename("out.data")
            .with_event("instructions")
            .with_sample_frequency(freq(1000))
            .with_duration(Duration::from_secs_f64(2.5))
            .with_sample_threads([10, 20, 30])
            .record_dwarf_call_graph()
            .trace_off_cpu()
            .to_record_args();
        assert_eq!(
            args,
            [
                "-o",
                "out.data",
                "-e",
                "instructions",
                "-f",
                "1000",
                "--duration",
                "2.500000",
                "-t",
                "10,20,30",
                "-g",
                "--trace-offcpu"
            ]
        );
        assert_eq!(args[7].parse::<f64>().unwrap(), 2.5);
    }

    #[test_case(CallGraph::None, &[]; "no call graph")]
    #[test_case(CallGraph::Dwarf, &["-g"]; "dwarf")]
    #[test_case(CallGraph::FramePointer, &["--call-graph", "fp"]; "frame pointer")]
    fn test_call_graph_args(call_graph: CallGraph, expected: &[&str]) {
        let args = RecordOptions::default()
            .with_output_filename("x.data")
            .with_sample_threads([1])
            .with_call_graph(call_graph)
            .to_record_args();
        assert_eq!(&args[8..], expected);
    }

    #[test]
    fn test_last_call_graph_setter_wins() {
        let args = RecordOptions::default()
            .record_dwarf_call_graph()
            .record_frame_pointer_call_graph()
            .to_record_args();
        assert!(args.windows(2).any(|w| w == ["--call-graph", "fp"]));
        assert!(!args.iter().any(|a| a == "-g"));

        let args = RecordOptions::default()
            .record_frame_pointer_call_graph()
            .record_dwarf_call_graph()
            .to_record_args();
        assert!(args.iter().any(|a| a == "-g"));
        assert!(!args.iter().any(|a| a == "--call-graph"));
    }

    #[test]
    fn test_threads_select_target() {
        let args = RecordOptions::default().to_record_args();
        assert!(args.iter().any(|a| a == "-p"));
        assert!(!args.iter().any(|a| a == "-t"));

        let args = RecordOptions::default()
            .with_sample_threads([7])
            .to_record_args();
        assert!(args.windows(2).any(|w| w == ["-t", "7"]));
        assert!(!args.iter().any(|a| a == "-p"));
    }

    #[test]
    fn test_to_record_args_is_repeatable() {
        let options = RecordOptions::default()
            .with_output_filename("a.data")
            .with_duration(Duration::from_millis(1500));
        assert_eq!(options.to_record_args(), options.to_record_args());
    }

    #[test]
    fn test_options_from_json() {
        let json = r#"{
            "output_filename": "app.data",
            "event": "task-clock",
            "sample_frequency": 100,
            "call_graph": "frame-pointer",
            "trace_off_cpu": true
        }"#;
        let options: RecordOptions = serde_json::from_str(json).unwrap();
        assert_eq!(
            options,
            RecordOptions::default()
                .with_output_filename("app.data")
                .with_event("task-clock")
                .with_sample_frequency(freq(100))
                .record_frame_pointer_call_graph()
                .trace_off_cpu()
        );
        let args = options.to_record_args();
        assert_eq!(args.last().unwrap(), "--trace-offcpu");
    }
}

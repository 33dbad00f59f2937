//! Seeded synthetic profiler traces shaped like a sharded transformer
//! training run: annotated forward layers, linked backward ops, gradient
//! all-reduce on a side stream and an optimizer step.

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::info;

use crate::error::{AnalysisError, Result};
use crate::time::Ns;

const US: Ns = 1_000;

/// `(operator annotation, host op, kernel, kernel duration)`.
const FORWARD_OPS: [(&str, &str, &str, Ns); 4] = [
    ("attn_qkv_proj", "aten::linear", "Cijk_Alik_Bljk_BBS_MT128x128", 40 * US),
    ("attn_fa", "aten::_flash_attention_forward", "flash_fwd_kernel", 60 * US),
    ("attn_o_proj", "aten::linear", "Cijk_Alik_Bljk_BBS_MT64x128", 25 * US),
    ("mlp_up", "aten::linear", "Cijk_Alik_Bljk_BBS_MT256x128", 80 * US),
];
const BACKWARD_HOST_OP: &str = "autograd::engine::evaluate_function: MmBackward0";
const COLLECTIVE_HOST_OP: &str = "record_param_comms";
const COLLECTIVE_KERNEL: &str = "ncclDevKernel_Generic_4";
const OPTIMIZER_ANNOTATION: &str = "Optimizer.step#AdamW.step";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthConfig {
    pub devices: usize,
    pub iterations: usize,
    pub layers: usize,
    pub seed: u64,
    /// Upper bound of the random per-kernel delay, in microseconds.
    pub max_jitter_us: i64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            devices: 2,
            iterations: 3,
            layers: 2,
            seed: 42,
            max_jitter_us: 20,
        }
    }
}

struct TraceBuilder {
    events: Vec<Json>,
    now: Ns,
    next_external: i64,
    next_correlation: i64,
    next_flow: i64,
    next_sequence: i64,
    max_jitter: Ns,
    rng: StdRng,
}

fn us(ns: Ns) -> f64 {
    ns as f64 / US as f64
}

impl TraceBuilder {
    fn new(seed: u64, max_jitter: Ns) -> Self {
        Self {
            events: Vec::new(),
            now: 1_000 * US,
            next_external: 1,
            next_correlation: 1,
            next_flow: 1,
            next_sequence: 1,
            max_jitter,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn jitter(&mut self) -> Ns {
        if self.max_jitter <= 0 {
            0
        } else {
            self.rng.random_range(0..=self.max_jitter)
        }
    }

    fn annotation(&mut self, name: &str, start: Ns, end: Ns) {
        self.events.push(json!({
            "ph": "X", "cat": "user_annotation", "name": name,
            "ts": us(start), "dur": us(end - start),
        }));
    }

    fn cpu_op(&mut self, name: &str, ts: Ns, dur: Ns, sequence: Option<i64>, collective: Option<&str>) -> i64 {
        let external = self.next_external;
        self.next_external += 1;
        let mut args = json!({ "External id": external });
        if let Some(seq) = sequence {
            args["Sequence number"] = json!(seq);
        }
        if let Some(collective) = collective {
            args["Collective name"] = json!(collective);
        }
        self.events.push(json!({
            "ph": "X", "cat": "cpu_op", "name": name,
            "ts": us(ts), "dur": us(dur), "args": args,
        }));
        external
    }

    fn flow(&mut self, ts: Ns, id: i64, backward: bool) {
        let phase = if backward { "f" } else { "s" };
        let mut event = json!({ "ph": phase, "cat": "fwdbwd", "name": "fwdbwd", "ts": us(ts), "id": id });
        if backward {
            event["bp"] = json!("e");
        }
        self.events.push(event);
    }

    /// Launch call at `launch_ts` and the kernel it enqueues; returns the
    /// kernel end.
    fn kernel(&mut self, external: i64, name: &str, launch_ts: Ns, start: Ns, dur: Ns) -> Ns {
        let correlation = self.next_correlation;
        self.next_correlation += 1;
        self.events.push(json!({
            "ph": "X", "cat": "cuda_runtime", "name": "hipLaunchKernel",
            "ts": us(launch_ts), "dur": us(2 * US),
            "args": { "correlation": correlation, "External id": external },
        }));
        self.events.push(json!({
            "ph": "X", "cat": "kernel", "name": name,
            "ts": us(start), "dur": us(dur),
            "args": { "correlation": correlation, "External id": external, "device": 0, "stream": 7 },
        }));
        start + dur
    }

    /// Host op plus its kernel on the compute stream; advances the cursor.
    fn compute(&mut self, host: &str, kernel: &str, dur: Ns, sequence: Option<i64>, flow: Option<(i64, bool)>) {
        let host_ts = self.now + US;
        let external = self.cpu_op(host, host_ts, 8 * US, sequence, None);
        if let Some((id, backward)) = flow {
            self.flow(host_ts, id, backward);
        }
        let start = host_ts + 4 * US + self.jitter();
        let end = self.kernel(external, kernel, host_ts + US, start, dur);
        self.now = end + 2 * US;
    }

    fn iteration(&mut self, iteration: usize, layers: usize) {
        let iteration_start = self.now;
        let mut saved: Vec<(i64, i64, &'static str)> = Vec::new();

        for layer in 0..layers {
            let layer_start = self.now;
            for (annotation, host, kernel, dur) in FORWARD_OPS {
                let op_start = self.now;
                let (sequence, flow) = (self.next_sequence, self.next_flow);
                self.next_sequence += 1;
                self.next_flow += 1;
                self.compute(host, kernel, dur, Some(sequence), Some((flow, false)));
                saved.push((sequence, flow, kernel));
                self.annotation(annotation, op_start, self.now);
            }
            self.annotation(&format!("Layer{layer}"), layer_start, self.now);
        }

        for chunk in saved.chunks(FORWARD_OPS.len()).rev() {
            for &(sequence, flow, kernel) in chunk.iter().rev() {
                self.compute(BACKWARD_HOST_OP, kernel, 80 * US, Some(sequence), Some((flow, true)));
            }
            // Gradient all-reduce runs on a side stream, overlapping the next layer.
            let host_ts = self.now + US;
            let external = self.cpu_op(COLLECTIVE_HOST_OP, host_ts, 3 * US, None, Some("allreduce"));
            let dur = 120 * US + self.jitter();
            self.kernel(external, COLLECTIVE_KERNEL, host_ts + US, host_ts + 3 * US, dur);
            self.now = host_ts + 4 * US;
        }

        let optimizer_start = self.now;
        self.compute("aten::_foreach_add_", "multi_tensor_apply_kernel", 30 * US, None, None);
        self.annotation(OPTIMIZER_ANNOTATION, optimizer_start, self.now);

        self.annotation(&format!("Iteration{iteration}"), iteration_start, self.now);
        self.now += 50 * US;
    }
}

/// One device's trace as a profiler JSON document.
pub fn generate_trace(config: &SynthConfig, device: usize) -> Json {
    let mut builder = TraceBuilder::new(
        config.seed.wrapping_add(device as u64),
        config.max_jitter_us.max(0) * US,
    );
    for iteration in 0..config.iterations {
        builder.iteration(iteration, config.layers);
    }
    json!({
        "schemaVersion": 1,
        "distributedInfo": { "rank": device, "world_size": config.devices },
        "traceEvents": builder.events,
    })
}

/// Writes `rank<N>.json` for every device and returns the paths in device order.
pub fn write_traces(config: &SynthConfig, dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).map_err(|e| AnalysisError::io(dir.display().to_string(), e))?;
    let mut paths = Vec::with_capacity(config.devices);
    for device in 0..config.devices {
        let path = dir.join(format!("rank{device}.json"));
        let content = serde_json::to_string(&generate_trace(config, device))?;
        std::fs::write(&path, content).map_err(|e| AnalysisError::io(path.display().to_string(), e))?;
        paths.push(path);
    }
    info!("🧪 Wrote {} synthetic traces to {}", paths.len(), dir.display());
    Ok(paths)
}

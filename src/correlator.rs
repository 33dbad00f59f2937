//! Links device records to their host launch sites and propagates annotations.
//!
//! Stage order matters: root status comes from the causal-link id obtained in
//! [`link_fwd_bwd`], so subordinate propagation runs after it.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{AnalysisError, Result};
use crate::parser::{
    AnnotationKind, AnnotationSpan, AnnotationValue, CausalLink, CpuOpSpan, DeviceSpan,
    LaunchRecord, ParsedTrace,
};
use crate::record::{UnifiedRecord, UnifiedTable, NO_LAYER};
use crate::time::Ns;

pub const FORWARD_PREFIX: &str = "f_";
pub const BACKWARD_PREFIX: &str = "b_";

/// Left-joins device records to launch records on the correlation id.
///
/// An external id present on both sides must agree.
pub fn attach_launch_site(
    records: Vec<DeviceSpan>,
    launches: &[LaunchRecord],
) -> Result<Vec<DeviceSpan>> {
    let mut by_correlation: HashMap<i64, &LaunchRecord> = HashMap::with_capacity(launches.len());
    for launch in launches {
        by_correlation.entry(launch.correlation).or_insert(launch);
    }

    records
        .into_iter()
        .map(|mut record| {
            if let Some(launch) = by_correlation.get(&record.correlation) {
                match (record.external_id, launch.external_id) {
                    (Some(left), Some(right)) if left != right => {
                        return Err(AnalysisError::JoinIntegrity {
                            key: format!("correlation={}", record.correlation),
                            column: "external_id".to_string(),
                            left: left.to_string(),
                            right: right.to_string(),
                        });
                    }
                    (None, Some(right)) => record.external_id = Some(right),
                    _ => {}
                }
                record.launch = Some((*launch).clone());
            }
            Ok(record)
        })
        .collect()
}

/// Applies layer, iteration and operator-name spans to every host span whose
/// start lies inside `[start, end]`.
///
/// Per dimension, spans are applied by ascending start then descending end, so
/// a nested span always overwrites the broader span that contains it.
pub fn assign_annotations(cpu_ops: &mut [CpuOpSpan], annotations: &[AnnotationSpan]) {
    let mut order: Vec<usize> = (0..cpu_ops.len()).collect();
    order.sort_by_key(|&i| cpu_ops[i].ts);
    let starts: Vec<Ns> = order.iter().map(|&i| cpu_ops[i].ts).collect();

    for kind in [
        AnnotationKind::Layer,
        AnnotationKind::Iteration,
        AnnotationKind::OperatorName,
    ] {
        info!("assigning {} to cpu ops...", kind.as_str());
        let mut spans: Vec<&AnnotationSpan> =
            annotations.iter().filter(|a| a.kind == kind).collect();
        spans.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

        for span in spans {
            let lo = starts.partition_point(|&ts| ts < span.start);
            let hi = starts.partition_point(|&ts| ts <= span.end);
            for &op_idx in &order[lo..hi] {
                let op = &mut cpu_ops[op_idx];
                match (&span.value, kind) {
                    (AnnotationValue::Index(v), AnnotationKind::Layer) => op.layer = Some(*v),
                    (AnnotationValue::Index(v), AnnotationKind::Iteration) => {
                        op.iteration = Some(*v)
                    }
                    (AnnotationValue::Name(v), _) => op.operator_name = Some(v.clone()),
                    (AnnotationValue::Index(v), AnnotationKind::OperatorName) => {
                        op.operator_name = Some(v.to_string())
                    }
                }
            }
        }
    }
}

/// Attaches causal-link ids and renames forward/backward operator spans.
///
/// Spans whose link marks a forward start are recorded by sequence number.
/// Any other span with a sequence number takes `b_<forward name>` plus the
/// forward span's layer and link id. Remaining named spans get `f_`. A
/// backward candidate with no forward counterpart keeps its own name.
pub fn link_fwd_bwd(cpu_ops: &mut [CpuOpSpan], links: &[CausalLink]) {
    info!("setting fwd and bwd cpu op names...");
    let mut by_ts: HashMap<Ns, &CausalLink> = HashMap::with_capacity(links.len());
    for link in links {
        by_ts.entry(link.ts).or_insert(link);
    }

    let mut is_backward_candidate = vec![false; cpu_ops.len()];
    let mut forward_by_seq: HashMap<i64, (Option<String>, Option<i64>, Option<i64>)> =
        HashMap::new();

    for (i, op) in cpu_ops.iter_mut().enumerate() {
        let link = by_ts.get(&op.ts).copied();
        if let Some(link) = link {
            op.link_id = Some(link.id);
        }
        let is_forward = matches!(link, Some(l) if !l.is_backward);
        if let Some(seq) = op.sequence_number {
            if is_forward {
                forward_by_seq
                    .entry(seq)
                    .or_insert_with(|| (op.operator_name.clone(), op.layer, op.link_id));
            } else {
                is_backward_candidate[i] = true;
            }
        }
    }

    let mut unmatched = 0usize;
    for (op, backward) in cpu_ops.iter_mut().zip(is_backward_candidate) {
        if !backward {
            op.operator_name = op.operator_name.take().map(|n| format!("{FORWARD_PREFIX}{n}"));
            continue;
        }
        let Some(seq) = op.sequence_number else {
            continue;
        };
        match forward_by_seq.get(&seq) {
            Some((name, layer, id)) => {
                op.operator_name = name.as_ref().map(|n| format!("{BACKWARD_PREFIX}{n}"));
                op.layer = *layer;
                op.link_id = *id;
            }
            None => unmatched += 1,
        }
    }
    if unmatched > 0 {
        debug!("{} backward spans had no forward sequence match", unmatched);
    }
}

/// Answers "nearest root at or before position `i` whose end reaches `ts`"
/// with a max-end segment tree over roots sorted by start.
struct StabbingIndex {
    starts: Vec<Ns>,
    size: usize,
    max_end: Vec<Ns>,
}

impl StabbingIndex {
    fn new(starts: Vec<Ns>, ends: &[Ns]) -> Self {
        let size = ends.len().next_power_of_two().max(1);
        let mut max_end = vec![Ns::MIN; 2 * size];
        max_end[size..size + ends.len()].copy_from_slice(ends);
        for node in (1..size).rev() {
            max_end[node] = max_end[2 * node].max(max_end[2 * node + 1]);
        }
        Self {
            starts,
            size,
            max_end,
        }
    }

    /// Position of the latest root with `start <= ts` and `end >= ts`.
    fn enclosing(&self, ts: Ns) -> Option<usize> {
        let last = self.starts.partition_point(|&s| s <= ts).checked_sub(1)?;
        self.rightmost_reaching(1, 0, self.size - 1, last, ts)
    }

    fn rightmost_reaching(&self, node: usize, lo: usize, hi: usize, limit: usize, ts: Ns) -> Option<usize> {
        if lo > limit || self.max_end[node] < ts {
            return None;
        }
        if lo == hi {
            return Some(lo);
        }
        let mid = (lo + hi) / 2;
        self.rightmost_reaching(2 * node + 1, mid + 1, hi, limit, ts)
            .or_else(|| self.rightmost_reaching(2 * node, lo, mid, limit, ts))
    }
}

/// Copies operator name and layer from the nearest enclosing root span onto
/// every subordinate span.
///
/// The candidate is the latest root starting at or before the subordinate;
/// earlier roots are searched backward until one still covers its start. A
/// subordinate with no enclosing root is left untouched.
pub fn propagate_to_subordinates(cpu_ops: &mut [CpuOpSpan]) {
    info!("propagating operator-name to subordinate cpu ops...");
    let mut roots: Vec<usize> = (0..cpu_ops.len()).filter(|&i| cpu_ops[i].is_root()).collect();
    roots.sort_by_key(|&i| cpu_ops[i].ts);

    let starts: Vec<Ns> = roots.iter().map(|&i| cpu_ops[i].ts).collect();
    let ends: Vec<Ns> = roots.iter().map(|&i| cpu_ops[i].end()).collect();
    let inherited: Vec<(Option<String>, Option<i64>)> = roots
        .iter()
        .map(|&i| (cpu_ops[i].operator_name.clone(), cpu_ops[i].layer))
        .collect();
    let index = StabbingIndex::new(starts, &ends);

    let mut orphans = 0usize;
    for op in cpu_ops.iter_mut().filter(|op| !op.is_root()) {
        match index.enclosing(op.ts) {
            Some(pos) => {
                let (name, layer) = &inherited[pos];
                op.operator_name = name.clone();
                op.layer = *layer;
            }
            None => orphans += 1,
        }
    }
    if orphans > 0 {
        debug!("{} subordinate cpu ops have no enclosing root", orphans);
    }
}

/// Left-joins device spans to host spans by external id. Records outside any
/// layer get [`NO_LAYER`].
pub fn build_unified(device: i64, device_spans: Vec<DeviceSpan>, cpu_ops: &[CpuOpSpan]) -> UnifiedTable {
    info!("joining device records to cpu ops...");
    let mut by_external: HashMap<i64, Vec<&CpuOpSpan>> = HashMap::new();
    for op in cpu_ops {
        if let Some(ext) = op.external_id {
            by_external.entry(ext).or_default().push(op);
        }
    }

    let mut records = Vec::with_capacity(device_spans.len());
    for span in device_spans {
        let base = device_record(device, &span);
        let matches = span
            .external_id
            .and_then(|ext| by_external.get(&ext))
            .map(|ops| ops.as_slice())
            .unwrap_or(&[]);
        if matches.is_empty() {
            records.push(base);
            continue;
        }
        for op in matches {
            let mut record = base.clone();
            record.operator_name = op.operator_name.clone();
            record.layer = op.layer.or(Some(NO_LAYER));
            record.iteration = op.iteration;
            record.cpu_op_name = Some(op.name.clone());
            records.push(record);
        }
    }
    records.sort_by_key(|r| r.ts);
    UnifiedTable::new(records)
}

fn device_record(device: i64, span: &DeviceSpan) -> UnifiedRecord {
    let mut record = UnifiedRecord::new(device, span.ts, span.dur, span.name.clone()).with_layer(NO_LAYER);
    record.kind = span.kind;
    record.external_id = span.external_id;
    record.correlation = Some(span.correlation);
    record.bytes = span.bytes;
    if let Some(launch) = &span.launch {
        record.launch_ts = Some(launch.ts);
        record.launch_name = Some(launch.name.clone());
    }
    record
}

/// Runs the full correlation pass for one device's parsed trace.
pub fn reconstruct(device: i64, parsed: ParsedTrace) -> Result<UnifiedTable> {
    let ParsedTrace {
        mut cpu_ops,
        kernels,
        memcpys,
        memsets,
        annotations,
        links,
        launches,
        ..
    } = parsed;

    info!("adding launch records to device spans...");
    let mut device_spans = attach_launch_site(memsets, &launches)?;
    device_spans.extend(attach_launch_site(memcpys, &launches)?);
    device_spans.extend(attach_launch_site(kernels, &launches)?);

    assign_annotations(&mut cpu_ops, &annotations);
    link_fwd_bwd(&mut cpu_ops, &links);
    propagate_to_subordinates(&mut cpu_ops);
    Ok(build_unified(device, device_spans, &cpu_ops))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DeviceKind;

    fn op(ts: Ns, dur: Ns, name: &str) -> CpuOpSpan {
        CpuOpSpan {
            ts,
            dur,
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn span(kind: AnnotationKind, start: Ns, end: Ns, value: AnnotationValue) -> AnnotationSpan {
        AnnotationSpan {
            kind,
            start,
            end,
            value,
        }
    }

    fn kernel(correlation: i64, external_id: Option<i64>) -> DeviceSpan {
        DeviceSpan {
            kind: DeviceKind::Kernel,
            ts: 10,
            dur: 5,
            name: "k".into(),
            correlation,
            external_id,
            device: None,
            bytes: None,
            launch: None,
        }
    }

    fn launch(correlation: i64, external_id: Option<i64>) -> LaunchRecord {
        LaunchRecord {
            ts: 8,
            dur: 1,
            name: "hipLaunchKernel".into(),
            correlation,
            external_id,
        }
    }

    #[test]
    fn nested_annotation_wins_regardless_of_input_order() {
        let outer = span(AnnotationKind::OperatorName, 0, 100, AnnotationValue::Name("outer".into()));
        let inner = span(AnnotationKind::OperatorName, 40, 60, AnnotationValue::Name("inner".into()));

        for annotations in [vec![outer.clone(), inner.clone()], vec![inner, outer]] {
            let mut ops = vec![op(10, 1, "a"), op(50, 1, "b"), op(90, 1, "c")];
            assign_annotations(&mut ops, &annotations);
            let names: Vec<_> = ops.iter().map(|o| o.operator_name.as_deref()).collect();
            assert_eq!(names, vec![Some("outer"), Some("inner"), Some("outer")]);
        }
    }

    #[test]
    fn dimensions_are_assigned_independently() {
        let annotations = vec![
            span(AnnotationKind::Iteration, 0, 1000, AnnotationValue::Index(7)),
            span(AnnotationKind::Layer, 100, 200, AnnotationValue::Index(3)),
        ];
        let mut ops = vec![op(150, 10, "x"), op(500, 10, "y"), op(2000, 1, "z")];
        assign_annotations(&mut ops, &annotations);
        assert_eq!((ops[0].iteration, ops[0].layer), (Some(7), Some(3)));
        assert_eq!((ops[1].iteration, ops[1].layer), (Some(7), None));
        assert_eq!((ops[2].iteration, ops[2].layer), (None, None));
    }

    #[test]
    fn launch_join_fills_and_checks_external_id() {
        let joined = attach_launch_site(
            vec![kernel(1, None), kernel(2, Some(5)), kernel(3, None)],
            &[launch(1, Some(4)), launch(2, Some(5))],
        )
        .unwrap();
        assert_eq!(joined[0].external_id, Some(4));
        assert_eq!(joined[1].launch.as_ref().map(|l| l.ts), Some(8));
        assert!(joined[2].launch.is_none());

        let err = attach_launch_site(vec![kernel(1, Some(9))], &[launch(1, Some(4))]).unwrap_err();
        assert!(matches!(err, AnalysisError::JoinIntegrity { .. }));
    }

    #[test]
    fn backward_spans_take_forward_identity() {
        let mut fwd = op(100, 50, "aten::linear");
        fwd.sequence_number = Some(11);
        fwd.operator_name = Some("mlp_up".into());
        fwd.layer = Some(2);

        let mut bwd = op(900, 50, "autograd::engine::evaluate_function");
        bwd.sequence_number = Some(11);
        bwd.operator_name = Some("Iteration-scope".into());

        let mut orphan = op(950, 10, "aten::mm");
        orphan.sequence_number = Some(99);
        orphan.operator_name = Some("orphan".into());

        let plain = CpuOpSpan {
            operator_name: Some("Optimizer.step#AdamW.step".into()),
            ..op(1000, 10, "aten::add_")
        };

        let mut ops = vec![fwd, bwd, orphan, plain];
        let links = [
            CausalLink { ts: 100, id: 77, is_backward: false },
            CausalLink { ts: 900, id: 77, is_backward: true },
        ];
        link_fwd_bwd(&mut ops, &links);

        assert_eq!(ops[0].operator_name.as_deref(), Some("f_mlp_up"));
        assert_eq!(ops[0].link_id, Some(77));
        assert_eq!(ops[1].operator_name.as_deref(), Some("b_mlp_up"));
        assert_eq!((ops[1].layer, ops[1].link_id), (Some(2), Some(77)));
        assert_eq!(ops[2].operator_name.as_deref(), Some("orphan"));
        assert_eq!(ops[2].link_id, None);
        assert_eq!(ops[3].operator_name.as_deref(), Some("f_Optimizer.step#AdamW.step"));
    }

    #[test]
    fn subordinate_inherits_from_earlier_long_lived_root() {
        let mut long_root = op(0, 1000, "outer");
        long_root.link_id = Some(1);
        long_root.operator_name = Some("f_outer".into());
        long_root.layer = Some(4);

        let mut short_root = op(100, 10, "short");
        short_root.link_id = Some(2);
        short_root.operator_name = Some("f_short".into());
        short_root.layer = Some(5);

        let inside_short = op(105, 1, "aten::empty");
        let after_short = op(500, 1, "aten::copy_");
        let orphan = CpuOpSpan {
            operator_name: Some("f_own".into()),
            ..op(5000, 1, "aten::fill_")
        };

        let mut ops = vec![short_root, inside_short, long_root, after_short, orphan];
        propagate_to_subordinates(&mut ops);

        assert_eq!(ops[1].operator_name.as_deref(), Some("f_short"));
        assert_eq!(ops[1].layer, Some(5));
        assert_eq!(ops[3].operator_name.as_deref(), Some("f_outer"));
        assert_eq!(ops[3].layer, Some(4));
        assert_eq!(ops[4].operator_name.as_deref(), Some("f_own"));
    }

    #[test]
    fn subordinate_before_any_root_does_not_panic() {
        let mut root = op(100, 10, "root");
        root.link_id = Some(1);
        let mut ops = vec![op(5, 1, "early"), root];
        propagate_to_subordinates(&mut ops);
        assert_eq!(ops[0].operator_name, None);
    }

    #[test]
    fn stabbing_index_matches_backward_walk() {
        let starts = vec![0, 10, 20, 30, 40];
        let ends = vec![100, 15, 25, 35, 45];
        let index = StabbingIndex::new(starts.clone(), &ends);
        for ts in 0..120 {
            let mut expected = starts.partition_point(|&s| s <= ts).checked_sub(1);
            while let Some(i) = expected {
                if ends[i] >= ts {
                    break;
                }
                expected = i.checked_sub(1);
            }
            assert_eq!(index.enclosing(ts), expected, "ts={ts}");
        }
    }

    #[test]
    fn unified_join_keeps_unmatched_device_records() {
        let mut a = op(0, 100, "aten::mm");
        a.external_id = Some(5);
        a.operator_name = Some("f_q_proj".into());
        a.iteration = Some(1);
        let mut b = op(200, 10, "aten::add");
        b.external_id = Some(6);
        b.layer = Some(3);
        let mut device_spans = vec![kernel(1, Some(5)), kernel(2, Some(404)), kernel(3, Some(6))];
        device_spans[1].ts = 3;
        device_spans[2].ts = 300;
        let table = build_unified(0, device_spans, &[a, b]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.records[0].ts, 3);
        let layers: Vec<Option<i64>> = table.records.iter().map(|r| r.layer).collect();
        assert_eq!(layers, vec![Some(NO_LAYER), Some(NO_LAYER), Some(3)]);
        assert_eq!(table.records[0].operator_name, None);
        assert_eq!(table.records[1].operator_name.as_deref(), Some("f_q_proj"));
        assert_eq!(table.records[1].cpu_op_name.as_deref(), Some("aten::mm"));
    }
}

//! Owns the [`CallingContextTree`] and [`CallGraph`] for one client group,
//! consumes per-client sample batches, and locates both the hottest node and
//! a suitable tuning root (spec §4.1).

use crate::call_graph::CallGraph;
use crate::cct::{CallingContextTree, VertexId};
use crate::code_region::CodeRegionInfo;

/// One raw hardware-counter sample, already demultiplexed to a single
/// client. `call_context` is root-to-leaf (`call_context[0]` is the
/// outermost frame, the last element the most recent caller) — the wire
/// protocol sends base-first/top-last and the session layer leaves it in
/// that order.
#[derive(Debug, Clone)]
pub struct PerfSample {
    pub instr_ptr: u64,
    pub time: u64,
    pub thread_id: u32,
    pub call_context: Vec<u64>,
}

/// One client's accumulated, not-yet-consumed samples plus the
/// `CodeRegionInfo` needed to resolve them (each client has its own address
/// space, so this cannot be shared across a group).
pub struct ClientSampleBatch<'a> {
    pub client_id: u64,
    pub code_region: &'a CodeRegionInfo,
    pub samples: Vec<PerfSample>,
}

pub const MIN_ROOT_HOT: f64 = 2.0;
pub const MIN_PARENT_HOT: f64 = 0.5;
pub const DEFAULT_DECAY: f64 = 0.75;

pub struct Profiler {
    pub cct: CallingContextTree,
    pub call_graph: CallGraph,
    pub samples_consumed: u64,
    pub decay_discount: f64,
    pub min_root_hot: f64,
    pub min_parent_hot: f64,
    /// The "trim the artifact top frame" heuristic is empirical, so it
    /// stays behind a flag rather than always-on.
    pub trim_artifact_frame: bool,
    /// Instructions between samples, used to approximate IPC from
    /// inter-sample time deltas: `ipc ~= sampling_period / delta_time`.
    pub sampling_period: u64,
}

impl Default for Profiler {
    fn default() -> Self {
        Profiler {
            cct: CallingContextTree::new(),
            call_graph: CallGraph::new(),
            samples_consumed: 0,
            decay_discount: DEFAULT_DECAY,
            min_root_hot: MIN_ROOT_HOT,
            min_parent_hot: MIN_PARENT_HOT,
            trim_artifact_frame: true,
            sampling_period: 1,
        }
    }
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes every client's accumulated samples for the current library,
    /// `current_library`, tagging per-library IPC with that name. Malformed
    /// samples (unresolvable at both the sample site and the chain top) are
    /// skipped silently; this method is otherwise total.
    pub fn consume_perf_data(&mut self, batches: Vec<ClientSampleBatch>, current_library: &str) {
        for batch in batches {
            let ClientSampleBatch {
                client_id,
                code_region,
                mut samples,
            } = batch;

            samples.sort_by_key(|s| s.time);

            for sample in samples {
                self.consume_one(client_id, code_region, sample, current_library);
            }
        }
    }

    fn consume_one(
        &mut self,
        client_id: u64,
        code_region: &CodeRegionInfo,
        sample: PerfSample,
        current_library: &str,
    ) {
        let leaf_resolved = code_region.lookup(sample.instr_ptr);

        let mut chain = sample.call_context.clone();
        if self.trim_artifact_frame {
            if let Some(&top) = chain.last() {
                if code_region.lookup(top) == leaf_resolved {
                    chain.pop();
                }
            }
        }

        let chain_top_resolved = chain.last().and_then(|&ip| code_region.lookup(ip));
        if leaf_resolved.is_none() && chain_top_resolved.is_none() {
            // malformed: unknown at both the sample site and the chain top.
            return;
        }

        let mut frames: Vec<(String, bool)> = Vec::with_capacity(chain.len() + 1);
        for ip in &chain {
            if let Some(id) = code_region.lookup(*ip) {
                let info = code_region.get(id).expect("id came from lookup");
                frames.push((info.canonical_name().to_string(), info.is_patchable()));
            }
        }
        if let Some(id) = leaf_resolved {
            let info = code_region.get(id).expect("id came from lookup");
            frames.push((info.canonical_name().to_string(), info.is_patchable()));
        }
        if frames.is_empty() {
            return;
        }

        let vid = self.cct.insert_path(&frames);
        self.cct.bump_hotness(vid, 1.0);

        if let Some(prev) = self
            .cct
            .note_sample_time(vid, client_id, sample.thread_id, sample.time)
        {
            if sample.time > prev {
                let delta = (sample.time - prev) as f64;
                if delta > 0.0 {
                    let ipc = self.sampling_period as f64 / delta;
                    self.cct.record_ipc(vid, current_library, ipc);
                }
            }
        }

        self.samples_consumed += 1;
    }

    pub fn decay(&mut self) {
        self.cct.decay(self.decay_discount);
    }

    pub fn hottest_node(&self) -> Option<VertexId> {
        self.cct.hottest_node()
    }

    /// Walks the context path from `vid` toward the root, looking for a
    /// *suitable* (patchable, decayed-hot-enough) vertex that is also
    /// *confirmed* (its parent is itself hot, or it has nonzero observed
    /// call frequency). Among confirmed candidates the one closest to the
    /// root wins; the walk stops the first time it reaches a vertex that is
    /// not suitable.
    pub fn find_suitable_tuning_root(&self, vid: VertexId) -> Option<String> {
        let mut cur = Some(vid);
        let mut best_confirmed: Option<VertexId> = None;

        while let Some(v) = cur {
            if v == self.cct.root() {
                break;
            }
            let vertex = self.cct.get(v);
            let suitable = vertex.patchable && vertex.hotness >= self.min_root_hot;
            if !suitable {
                break;
            }

            let parent = self.cct.parent(v);
            let parent_hot_enough = parent
                .map(|p| self.cct.get(p).hotness >= self.min_parent_hot)
                .unwrap_or(false);
            let confirmed = parent_hot_enough || vertex.call_count_estimate > 0.0;

            if confirmed {
                best_confirmed = Some(v);
            }

            cur = parent;
        }

        best_confirmed.map(|v| self.cct.get(v).function.clone())
    }

    pub fn have_bitcode(&self, name: &str) -> bool {
        self.call_graph.have_bitcode(name)
    }

    /// Current observation count and most recent IPC sample for `library`
    /// at the named function's CCT vertex, used by `Bakeoff::take_step` to
    /// detect whether a new sample arrived since the last tick.
    pub fn current_perf(&self, function_name: &str, library: &str) -> Option<(usize, f64)> {
        let vid = self.cct.find_by_name(function_name)?;
        let rq = self.cct.get(vid).ipc(library)?;
        let last = rq.last()?;
        Some((rq.size(), last))
    }
}

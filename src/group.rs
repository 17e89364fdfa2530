//! One `ClientGroup`: the clients sharing a build identity (process triple,
//! host CPU, bitcode hash), the tuning state they share, and the actor loop
//! that drives both (spec §5). `GroupState` is the plain, socket-free half
//! — tests drive it directly; [`ClientGroup`] is the `tokio::spawn`ed
//! actor wrapping it behind a mailbox of boxed closures, following the
//! original's `SequentialAccess` pattern (spec §9) instead of a mutex.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;

use crate::bakeoff::BakeoffParams;
use crate::cli::{Cli, Strategy};
use crate::code_version::{CodeVersion, ORIGINAL_LIBRARY_NAME};
use crate::compilation_manager::CompilationManager;
use crate::config::ServerConfig;
use crate::config_manager::ConfigManager;
use crate::errors::ConfigError;
use crate::knob::KnobSet;
use crate::profiler::{ClientSampleBatch, PerfSample, Profiler};
use crate::section::AdaptiveTuningSection;
use crate::session::{ClientId, ClientState, Inbound};
use crate::stopper::StatisticalStopper;
use crate::strategy::{CompileOnceSection, SectionCommand, TuningEnv, TuningSection};
use crate::tuner::PseudoBayesTuner;
use crate::wire::message::{DesiredState, LoadDyLibBody, Message, ModifyFunctionBody, SetSamplingPeriodBody};

/// How often a group's service loop re-evaluates its tuning section, absent
/// any inbound traffic to react to sooner.
pub const SERVICE_ITERATION: Duration = Duration::from_millis(250);

/// The build identity new enrollments are matched against (spec §5,§7:
/// "enrollment mismatch" falls back to creating a new group).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupIdentity {
    pub process_triple: String,
    pub host_cpu: String,
    pub bitcode: Vec<u8>,
}

/// Plain tuning/client state for one group, with no socket or task
/// handles. Directly testable: the end-to-end scenarios construct this and
/// call `tick`/`handle_inbound` without a real `TcpStream` (spec §8).
pub struct GroupState {
    pub identity: GroupIdentity,
    pub clients: HashMap<ClientId, ClientState>,
    pub loaded: HashMap<ClientId, HashSet<String>>,
    pending_samples: HashMap<ClientId, Vec<PerfSample>>,
    pub profiler: Profiler,
    pub versions: HashMap<String, CodeVersion>,
    pub compiler_mgr: CompilationManager,
    pub config_mgr: ConfigManager,
    pub base_knobs: KnobSet,
    pub tuner: PseudoBayesTuner,
    pub stopper: StatisticalStopper,
    pub rng: StdRng,
    pub bakeoff_params: BakeoffParams,
    pub max_dupes_in_row: u32,
    pub section: Box<dyn TuningSection + Send>,
    /// Whichever library the last dispatched `Deploy` command named — what
    /// clients are actually running samples against right now. Tracked
    /// separately from `section.best_lib()`, which only changes once a
    /// bakeoff concludes and so lags behind the library actually deployed
    /// while one is in progress.
    currently_deployed: String,
    pub no_persist: bool,
    pub had_a_client: bool,
    pub shutdown: bool,
}

impl GroupState {
    pub fn new(identity: GroupIdentity, config: &ServerConfig, cli: &Cli) -> Result<Self, ConfigError> {
        let base_knobs = config.base_knobs(0)?;
        let mut bakeoff_params = config.bakeoff_params()?;
        bakeoff_params.force_merge = cli.forcemerge;

        let mut profiler = Profiler::new();
        profiler.decay_discount = config.callfreq_discount();
        profiler.sampling_period = config.perf_sample_period();

        let max_dupes_in_row = config.max_dupes_in_row();
        let section: Box<dyn TuningSection + Send> = match cli.strategy {
            Strategy::Adapt => Box::new(AdaptiveTuningSection::with_max_dupes_in_row(max_dupes_in_row)),
            Strategy::Jit => Box::new(CompileOnceSection::new()),
        };

        Ok(GroupState {
            identity,
            clients: HashMap::new(),
            loaded: HashMap::new(),
            pending_samples: HashMap::new(),
            profiler,
            versions: HashMap::new(),
            compiler_mgr: CompilationManager::new(),
            config_mgr: ConfigManager::new(),
            base_knobs,
            tuner: PseudoBayesTuner::new(config.tuner_params()),
            stopper: config.stopper(),
            rng: StdRng::seed_from_u64(config.seed()),
            bakeoff_params,
            max_dupes_in_row,
            section,
            currently_deployed: ORIGINAL_LIBRARY_NAME.to_string(),
            no_persist: cli.no_persist,
            had_a_client: false,
            shutdown: false,
        })
    }

    pub fn enroll(&mut self, id: ClientId, client: ClientState) {
        self.had_a_client = true;
        self.loaded.insert(id, HashSet::new());
        self.clients.insert(id, client);
    }

    fn disconnect(&mut self, id: ClientId) {
        self.clients.remove(&id);
        self.loaded.remove(&id);
        self.pending_samples.remove(&id);
        if self.no_persist && self.had_a_client && self.clients.is_empty() {
            self.shutdown = true;
        }
    }

    /// Applies one decoded message from a client to this group's state.
    /// Does not tick the tuning section — that only happens on the service
    /// loop's timer, per spec §5 (inbound traffic accumulates between
    /// ticks).
    pub fn handle_inbound(&mut self, msg: Inbound) {
        match msg {
            Inbound::Enrolled(id, body, outbox) => {
                self.enroll(id, ClientState::from_enrollment(id, body, outbox));
            }
            Inbound::Sample(id, raw) => {
                if let Some(client) = self.clients.get(&id) {
                    let sample = crate::session::resolve_sample(raw, client.vma_delta);
                    self.pending_samples.entry(id).or_default().push(sample);
                }
            }
            Inbound::CallCount(id, body) => {
                if let Some(client) = self.clients.get(&id) {
                    for (ip, count) in body.function_counts {
                        if let Some(fid) = client.code_region.lookup(ip) {
                            let name = client.code_region.canonical_name(fid).to_string();
                            self.profiler.call_graph.add_function(&name, client.code_region.is_patchable(fid));
                            // Fold the reported count into the CCT vertex's
                            // own frequency signal, on top of whatever
                            // sampling has already contributed there.
                            if let Some(vid) = self.profiler.cct.find_by_name(&name) {
                                self.profiler.cct.get_mut(vid).call_count_estimate += count as f64;
                            }
                        }
                    }
                }
            }
            Inbound::DyLibInfo(id, body) => {
                if let Some(client) = self.clients.get_mut(&id) {
                    for f in body.funcs {
                        let def = crate::code_region::FunctionDefinition {
                            name: f.label.clone(),
                            start: f.start,
                            end: f.start + f.size,
                            patchable: f.patchable,
                        };
                        match client.code_region.lookup_by_name(&f.label) {
                            Some(existing) => client.code_region.add_alias(existing, def),
                            None => {
                                client.code_region.add_function(def);
                            }
                        }
                    }
                    let _ = body.name;
                }
            }
            Inbound::Disconnected(id) => self.disconnect(id),
        }
    }

    /// One scheduling tick: decay, consume accumulated samples, advance the
    /// tuning section, and dispatch whatever commands it returns.
    pub fn tick(&mut self) {
        if self.clients.is_empty() && !(self.no_persist && self.had_a_client) {
            return;
        }
        self.profiler.decay();

        let current_lib = self.currently_deployed.clone();
        let mut batches = Vec::new();
        for (id, client) in self.clients.iter() {
            if let Some(samples) = self.pending_samples.remove(id) {
                if !samples.is_empty() {
                    batches.push(ClientSampleBatch {
                        client_id: *id,
                        code_region: &client.code_region,
                        samples,
                    });
                }
            }
        }
        self.profiler.consume_perf_data(batches, &current_lib);

        self.versions
            .entry(ORIGINAL_LIBRARY_NAME.to_string())
            .or_insert_with(|| CodeVersion::original(self.base_knobs.clone()));

        let bitcode = self
            .clients
            .values()
            .next()
            .map(|c| c.bitcode.clone())
            .unwrap_or_else(|| self.identity.bitcode.clone());

        let mut env = TuningEnv {
            compiler_mgr: &mut self.compiler_mgr,
            config_mgr: &mut self.config_mgr,
            versions: &mut self.versions,
            bitcode: &bitcode,
            base_knobs: &self.base_knobs,
            profiler: &mut self.profiler,
            tuner: &self.tuner,
            stopper: &self.stopper,
            rng: &mut self.rng,
            bakeoff_params: self.bakeoff_params,
            max_dupes_in_row: self.max_dupes_in_row,
        };
        let commands = self.section.tick(&mut env);
        self.dispatch_commands(commands);
    }

    fn dispatch_commands(&mut self, commands: Vec<SectionCommand>) {
        for cmd in commands {
            match cmd {
                SectionCommand::Deploy(lib) => {
                    self.currently_deployed = lib.clone();
                    self.deploy(&lib);
                }
                SectionCommand::RedirectAll(lib) => self.redirect_all(&lib),
                SectionCommand::DisableSampling => self.broadcast(Message::StopSampling),
                SectionCommand::EnableSampling => self.broadcast(Message::StartSampling),
                SectionCommand::SetSamplingPeriod(period) => {
                    self.broadcast(Message::SetSamplingPeriod(SetSamplingPeriodBody { period }))
                }
            }
        }
    }

    fn deploy(&mut self, lib: &str) {
        if lib == ORIGINAL_LIBRARY_NAME {
            return;
        }
        let Some(object) = self.versions.get(lib).and_then(|v| v.object.clone()) else {
            return;
        };
        for (id, client) in self.clients.iter_mut() {
            let loaded = self.loaded.entry(*id).or_default();
            if loaded.insert(lib.to_string()) {
                client.send(Message::LoadDyLib(LoadDyLibBody {
                    name: lib.to_string(),
                    objfile: object.clone(),
                }));
            }
        }
    }

    fn redirect_all(&mut self, lib: &str) {
        let Some(root) = self.section.tuning_root().map(|s| s.to_string()) else {
            return;
        };
        let desired_state = if lib == ORIGINAL_LIBRARY_NAME {
            DesiredState::Direct
        } else {
            DesiredState::Redirected
        };
        for client in self.clients.values_mut() {
            // `addr` is in the client's own (un-normalized) address space,
            // so the vma_delta subtracted on the way in gets added back here.
            let addr = client
                .code_region
                .lookup_by_name(&root)
                .and_then(|id| client.code_region.get(id))
                .and_then(|info| info.definitions().first())
                .map(|d| d.start.wrapping_add(client.vma_delta))
                .unwrap_or(0);
            client.send(Message::ModifyFunction(ModifyFunctionBody {
                name: root.clone(),
                desired_state,
                other_lib: lib.to_string(),
                other_name: root.clone(),
                addr,
            }));
        }
    }

    fn broadcast(&mut self, msg: Message) {
        for client in self.clients.values_mut() {
            client.send(msg.clone());
        }
    }
}

/// Boxed mutation applied to a `GroupState` by its owning task — the
/// "sequential access" mailbox entry.
pub type GroupCommand = Box<dyn FnOnce(&mut GroupState) + Send>;

/// A handle to a running group actor. Cloning is cheap (an mpsc sender);
/// every clone posts into the same sequential mailbox. `identity` is a
/// plain copy kept alongside the channel so a registrar can match a new
/// enrollment against every live group without a mailbox round trip.
#[derive(Clone)]
pub struct ClientGroup {
    pub identity: GroupIdentity,
    tx: mpsc::UnboundedSender<GroupCommand>,
}

impl ClientGroup {
    /// Spawns the actor task owning `state` and returns a handle to it plus
    /// a `JoinHandle` that resolves once the task exits (`state.shutdown`
    /// observed true after a tick), so a registrar can track how many
    /// groups are still alive under `--halo-no-persist`.
    pub fn spawn(state: GroupState) -> (Self, tokio::task::JoinHandle<()>) {
        let identity = state.identity.clone();
        let (tx, mut rx) = mpsc::unbounded_channel::<GroupCommand>();
        let join = tokio::spawn(async move {
            let mut state = state;
            let mut ticker = tokio::time::interval(SERVICE_ITERATION);
            loop {
                tokio::select! {
                    cmd = rx.recv() => {
                        match cmd {
                            Some(f) => f(&mut state),
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        state.tick();
                    }
                }
                if state.shutdown {
                    break;
                }
            }
        });
        (ClientGroup { identity, tx }, join)
    }

    /// Posts an inbound client message into the group's mailbox.
    pub fn send(&self, msg: Inbound) {
        let _ = self.tx.send(Box::new(move |state: &mut GroupState| state.handle_inbound(msg)));
    }

    /// A plain `Inbound` channel whose receiving half forwards every message
    /// into this group's mailbox — lets `session::run_session` hold an
    /// ordinary `mpsc::UnboundedSender<Inbound>` without seeing the
    /// closure-based mailbox representation.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<Inbound> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Inbound>();
        let group = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                group.send(msg);
            }
        });
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Metric, Strategy};
    use crate::wire::message::{BuildSettings, ClientEnrollBody, FuncRecord, ModuleRecord};

    fn cli() -> Cli {
        Cli {
            config: "server.json".into(),
            port: 4848,
            threads: 0,
            no_persist: false,
            strategy: Strategy::Adapt,
            metric: Metric::Ipc,
            forcemerge: true,
        }
    }

    fn config() -> ServerConfig {
        serde_json::from_str(
            r#"{
                "serverSettings": {
                    "bakeoff-switch-rate": 2,
                    "bakeoff-max-switches": 2,
                    "bakeoff-min-samples": 2,
                    "bakeoff-confidence": 95,
                    "perf-sample-period": 1000000,
                    "callfreq-discount": 0.75,
                    "pbtuner-learn-iters": 10,
                    "pbtuner-batch-size": 4,
                    "pbtuner-surrogate-batch-size": 20,
                    "pbtuner-min-prior": 4,
                    "pbtuner-heldout-ratio": 0.2,
                    "pbtuner-explore-ratio": 0.3,
                    "pbtuner-surrogate-explore-ratio": 0.3,
                    "pbtuner-energy-level": 50.0,
                    "ts-max-dupes-row": 3,
                    "seed": 1
                },
                "knobs": [
                    {"kind": "optlvl", "name": "opt-level", "default": 1, "min": null, "max": null, "scale": null}
                ],
                "loopKnobs": []
            }"#,
        )
        .unwrap()
    }

    fn enroll_body() -> ClientEnrollBody {
        ClientEnrollBody {
            process_triple: "x86_64-unknown-linux-gnu".into(),
            host_cpu: "skylake".into(),
            vma_delta: 0,
            funcs: vec![
                FuncRecord { label: "main".into(), start: 0x1000, size: 0x100, patchable: false },
                FuncRecord { label: "hot".into(), start: 0x2000, size: 0x100, patchable: true },
            ],
            module: ModuleRecord { bitcode: vec![1, 2, 3] },
            build_settings: BuildSettings { opt_level: "O0".into() },
        }
    }

    fn identity() -> GroupIdentity {
        GroupIdentity {
            process_triple: "x86_64-unknown-linux-gnu".into(),
            host_cpu: "skylake".into(),
            bitcode: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn enrollment_seeds_client_and_no_persist_shutdown_fires_after_last_disconnect() {
        let mut state = GroupState::new(identity(), &config(), &cli()).unwrap();
        state.no_persist = true;

        let (tx, _rx) = mpsc::unbounded_channel();
        state.handle_inbound(Inbound::Enrolled(1, enroll_body(), tx));
        assert_eq!(state.clients.len(), 1);
        assert!(!state.shutdown);

        state.handle_inbound(Inbound::Disconnected(1));
        assert!(state.clients.is_empty());
        assert!(state.shutdown);
    }

    #[tokio::test]
    async fn tick_on_empty_group_never_panics() {
        let mut state = GroupState::new(identity(), &config(), &cli()).unwrap();
        state.tick();
        assert!(state.versions.is_empty());
    }

    #[tokio::test]
    async fn first_tick_with_a_client_seeds_original_version_and_starts_compiling() {
        let mut state = GroupState::new(identity(), &config(), &cli()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        state.handle_inbound(Inbound::Enrolled(1, enroll_body(), tx));

        state.tick();
        assert!(state.versions.contains_key(ORIGINAL_LIBRARY_NAME));
    }
}

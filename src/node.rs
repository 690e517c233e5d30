//! The process topology: one master per physical node, one worker thread
//! per location.
//!
//! The master owns the work-request channel, the worker registry, and the
//! inter-node transport — workers never touch the transport handle. It
//! routes produced facts to a local worker's inbox or over the wire, polls
//! the transport for inbound facts, spawns workers on request, and backs off
//! exponentially while idle. Shutdown tears down without recovering
//! in-flight messages: delivery is best-effort by design.

use crate::engine::{LoopConfig, Outbox, RewriteLoop};
use crate::fact::{Fact, Goal};
use crate::location;
use crate::registry::{ConfigError, Registry};
use crate::store::Snapshot;
use crate::term::Value;
use crate::trace::{debug, info, warn};
use crate::transport::Transport;
use crate::wire::{self, Envelope};
use crossbeam_channel::{unbounded, Receiver, Sender};
use hashbrown::HashMap;
use std::mem;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Requests workers push to their master.
pub enum MasterTask {
    /// Route these envelopes: same rank to a local inbox, otherwise over the
    /// transport.
    Deliver(Vec<Envelope>),
    /// Spawn a worker for `proc_id` on this node.
    CreateWorker { proc_id: String },
    /// A worker finished; its final store contents ride along.
    Retire { proc_id: String, snapshot: Snapshot },
}

/// Master-side tuning. Defaults reproduce the calibrated constants; tests
/// shrink the sleeps.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Base idle sleep.
    pub sleep_length: Duration,
    /// Sleep growth per consecutive idle cycle.
    pub sleep_factor: u32,
    /// Consecutive sleeps before the length saturates; also the liveness
    /// budget once every worker is gone.
    pub sleep_limit: u32,
    /// Workers spawned at startup (the first always gets the rank's name).
    pub init_workers: usize,
    pub loop_cfg: LoopConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sleep_length: Duration::from_millis(100),
            sleep_factor: 2,
            sleep_limit: 4,
            init_workers: 1,
            loop_cfg: LoopConfig::default(),
        }
    }
}

/// Final store contents of every location a node ran.
#[derive(Debug, Default)]
pub struct NodeReport {
    pub rank: u32,
    pub locations: HashMap<String, Snapshot>,
}

impl NodeReport {
    /// Snapshot of one worker, by procId.
    pub fn location(&self, proc_id: &str) -> Option<&Snapshot> {
        self.locations.get(proc_id)
    }

    /// Total live facts across the node's locations.
    pub fn total(&self) -> usize {
        self.locations.values().map(Snapshot::total).sum()
    }
}

struct WorkerHandle {
    inbox: Sender<Envelope>,
    join: JoinHandle<()>,
}

/// The master unit of one physical node.
pub struct Master<T: Transport> {
    rank: u32,
    registry: Arc<Registry>,
    cfg: NodeConfig,
    tx: Sender<MasterTask>,
    rx: Receiver<MasterTask>,
    transport: T,
    workers: HashMap<String, WorkerHandle>,
    /// Initial goals not yet handed to their worker, keyed by procId.
    pending: Vec<(String, Goal)>,
    finished: Vec<JoinHandle<()>>,
    report: NodeReport,
    sleep: Duration,
    sleep_budget: u32,
}

impl<T: Transport> Master<T> {
    pub fn new(
        rank: u32,
        registry: Arc<Registry>,
        transport: T,
        cfg: NodeConfig,
        init_goals: Vec<(String, Goal)>,
    ) -> Result<Self, ConfigError> {
        registry.validate()?;
        let (tx, rx) = unbounded();
        Ok(Self {
            rank,
            registry,
            sleep: cfg.sleep_length,
            sleep_budget: cfg.sleep_limit,
            cfg,
            tx,
            rx,
            transport,
            workers: HashMap::new(),
            pending: init_goals,
            finished: Vec::new(),
            report: NodeReport {
                rank,
                locations: HashMap::new(),
            },
        })
    }

    /// Run the node to completion: spawn the initial workers, shuttle
    /// messages until every worker has retired and the idle budget is spent,
    /// then join the worker threads and report.
    pub fn run(mut self) -> NodeReport {
        info!(rank = self.rank, "master started");
        self.spawn_worker(self.rank.to_string());
        for _ in 1..self.cfg.init_workers {
            self.spawn_worker(location::gen_proc_id());
        }

        while self.is_alive() {
            let mut active = false;

            while let Ok(task) = self.rx.try_recv() {
                active = true;
                match task {
                    MasterTask::Deliver(msgs) => {
                        debug!(rank = self.rank, count = msgs.len(), "delivering messages");
                        for env in msgs {
                            self.route(env);
                        }
                    }
                    MasterTask::CreateWorker { proc_id } => self.spawn_worker(proc_id),
                    MasterTask::Retire { proc_id, snapshot } => self.retire(proc_id, snapshot),
                }
            }

            while let Some(frame) = self.transport.poll() {
                active = true;
                match wire::decode(&frame) {
                    Ok(env) => self.forward(env),
                    Err(err) => warn!(rank = self.rank, %err, "dropping inbound frame"),
                }
            }

            if active {
                self.reset_sleep();
            } else {
                self.idle_sleep();
            }
        }

        for handle in self.finished.drain(..) {
            let _ = handle.join();
        }
        info!(rank = self.rank, "master shutting down");
        self.report
    }

    /// Alive while any worker is registered or the idle budget remains.
    fn is_alive(&self) -> bool {
        !self.workers.is_empty() || self.sleep_budget > 0
    }

    fn idle_sleep(&mut self) {
        debug!(rank = self.rank, budget = self.sleep_budget, "sleeping");
        thread::sleep(self.sleep);
        if self.sleep_budget > 0 {
            self.sleep = self.sleep.saturating_mul(self.cfg.sleep_factor);
            self.sleep_budget -= 1;
        }
    }

    fn reset_sleep(&mut self) {
        self.sleep = self.cfg.sleep_length;
        self.sleep_budget = self.cfg.sleep_limit;
    }

    /// Local destination → worker inbox; remote → encode and transmit.
    /// Failures drop the one message, never the node.
    fn route(&mut self, env: Envelope) {
        if env.rank == self.rank {
            self.forward(env);
            return;
        }
        match wire::encode(&env, self.transport.max_frame()) {
            Ok(frame) => {
                if let Err(err) = self.transport.send(frame, env.rank) {
                    warn!(rank = self.rank, dest = env.rank, %err, "dropping outbound message");
                }
            }
            Err(err) => warn!(rank = self.rank, dest = env.rank, %err, "dropping outbound message"),
        }
    }

    fn forward(&mut self, env: Envelope) {
        if env.rank != self.rank {
            warn!(rank = self.rank, dest = env.rank, "dropping misrouted message");
            return;
        }
        match self.workers.get(&env.proc_id) {
            // A closed inbox means the worker retired between lookup and
            // send; the message is dropped like any other delivery failure.
            Some(worker) => {
                let _ = worker.inbox.send(env);
            }
            None => warn!(rank = self.rank, proc_id = %env.proc_id, "dropping message for unknown worker"),
        }
    }

    fn spawn_worker(&mut self, proc_id: String) {
        if self.workers.contains_key(&proc_id) {
            warn!(rank = self.rank, %proc_id, "worker already exists");
            return;
        }
        info!(rank = self.rank, %proc_id, "creating worker");
        let (inbox_tx, inbox_rx) = unbounded();

        let (mine, rest): (Vec<_>, Vec<_>) = mem::take(&mut self.pending)
            .into_iter()
            .partition(|(pid, _)| *pid == proc_id);
        self.pending = rest;
        let init: Vec<Goal> = mine.into_iter().map(|(_, goal)| goal).collect();

        let registry = Arc::clone(&self.registry);
        let master_tx = self.tx.clone();
        let rank = self.rank;
        let cfg = self.cfg.loop_cfg.clone();
        let pid = proc_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("worker-{rank}-{proc_id}"))
            .spawn(move || worker_main(rank, pid, registry, cfg, inbox_rx, master_tx, init));
        match spawned {
            Ok(join) => {
                self.workers.insert(
                    proc_id,
                    WorkerHandle {
                        inbox: inbox_tx,
                        join,
                    },
                );
            }
            Err(err) => warn!(rank = self.rank, %err, "failed to spawn worker"),
        }
    }

    fn retire(&mut self, proc_id: String, snapshot: Snapshot) {
        info!(rank = self.rank, %proc_id, "retiring worker");
        if let Some(worker) = self.workers.remove(&proc_id) {
            self.finished.push(worker.join);
        }
        self.report.locations.insert(proc_id, snapshot);
    }
}

fn worker_main(
    rank: u32,
    proc_id: String,
    registry: Arc<Registry>,
    cfg: LoopConfig,
    inbox: Receiver<Envelope>,
    master_tx: Sender<MasterTask>,
    init: Vec<Goal>,
) {
    info!(rank, %proc_id, "worker started");
    let outbox = Outbox::Master(master_tx.clone());
    let snapshot = match RewriteLoop::new(
        &registry,
        Some((rank, proc_id.clone())),
        outbox,
        Some(inbox),
        cfg,
    ) {
        Ok(mut engine) => engine.run(init),
        Err(err) => {
            warn!(rank, %proc_id, %err, "worker failed to start");
            Snapshot::default()
        }
    };
    info!(rank, %proc_id, "worker shutting down");
    let _ = master_tx.send(MasterTask::Retire { proc_id, snapshot });
}

/// Run a program in a single collapsed location: no topology, no transport.
/// Returns the final store contents.
pub fn execute(goals: Vec<Fact>, registry: &Arc<Registry>) -> Result<Snapshot, ConfigError> {
    execute_with_config(goals, registry, LoopConfig::default())
}

pub fn execute_with_config(
    goals: Vec<Fact>,
    registry: &Arc<Registry>,
    cfg: LoopConfig,
) -> Result<Snapshot, ConfigError> {
    let mut init = Vec::with_capacity(goals.len());
    for fact in &goals {
        init.push(fact.flatten().map_err(|_| ConfigError::UngroundGoal {
            pred: registry.pred_name(fact.pred).to_string(),
        })?);
    }
    let mut engine = RewriteLoop::new(registry, None, Outbox::Silent, None, cfg)?;
    Ok(engine.run(init))
}

/// Run this node of a distributed program. Initial goals must carry ground
/// locations; goals addressed to other ranks are ignored here (their own
/// nodes run them). Blocks until the node quiesces.
pub fn execute_distributed<T: Transport>(
    rank: u32,
    goals: Vec<Fact>,
    registry: Arc<Registry>,
    transport: T,
    cfg: NodeConfig,
) -> Result<NodeReport, ConfigError> {
    let mut init = Vec::new();
    for fact in &goals {
        let pred_name = || registry.pred_name(fact.pred).to_string();
        let goal = fact
            .flatten()
            .map_err(|_| ConfigError::UngroundGoal { pred: pred_name() })?;
        let loc = match fact.location.as_ref().and_then(crate::term::Term::value) {
            Some(Value::Str(loc)) => loc,
            _ => return Err(ConfigError::UnlocatedGoal { pred: pred_name() }),
        };
        let Some((goal_rank, proc_id)) = location::split(&loc) else {
            return Err(ConfigError::BadLocation { value: loc });
        };
        if goal_rank == rank {
            init.push((proc_id.to_string(), goal));
        }
    }
    Ok(Master::new(rank, registry, transport, cfg, init)?.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::PredId;
    use crate::rule::{RuleDef, RuleVars};
    use crate::term::Term;
    use crate::transport::NullTransport;

    struct Noop {
        p: PredId,
    }

    impl RuleDef for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn var_count(&self) -> usize {
            1
        }

        fn propagate(&self, v: &RuleVars) -> Vec<Fact> {
            vec![Fact::new(self.p, [v.var(0)])]
        }
    }

    fn quick() -> NodeConfig {
        NodeConfig {
            sleep_length: Duration::from_millis(1),
            sleep_limit: 2,
            loop_cfg: LoopConfig {
                idle_sleep: Duration::from_millis(1),
                ..LoopConfig::default()
            },
            ..NodeConfig::default()
        }
    }

    #[test]
    fn unlocated_goal_is_a_config_error() {
        let mut reg = Registry::new();
        let p = reg.register_pred("p", 1);
        reg.register_rule(Arc::new(Noop { p }));
        let reg = Arc::new(reg);
        let err = execute_distributed(
            0,
            vec![Fact::new(p, [Term::val(1)])],
            Arc::clone(&reg),
            NullTransport,
            quick(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnlocatedGoal { .. }));
    }

    #[test]
    fn single_node_round_trip() {
        let mut reg = Registry::new();
        let p = reg.register_pred("p", 1);
        reg.register_rule(Arc::new(Noop { p }));
        let reg = Arc::new(reg);
        let loc = Term::val(location::node_loc(0));
        let report = execute_distributed(
            0,
            vec![Fact::new(p, [Term::val(7)]).at(loc)],
            reg,
            NullTransport,
            quick(),
        )
        .unwrap();
        let snap = report.location("0").expect("first worker");
        assert!(snap.contains("p", &[Value::Int(7)]));
    }

    #[test]
    fn goals_for_other_ranks_are_ignored() {
        let mut reg = Registry::new();
        let p = reg.register_pred("p", 1);
        reg.register_rule(Arc::new(Noop { p }));
        let reg = Arc::new(reg);
        let other = Term::val(location::node_loc(5));
        let report = execute_distributed(
            0,
            vec![Fact::new(p, [Term::val(7)]).at(other)],
            reg,
            NullTransport,
            quick(),
        )
        .unwrap();
        assert_eq!(report.total(), 0);
    }
}

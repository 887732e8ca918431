//! A jail: one filter, one fail manager, one ban manager, an ordered
//! action chain, and the worker that pumps tickets through them.
//!
//! The worker task pulls failure tickets off the jail queue, folds them
//! into the fail manager, promotes threshold-crossers into the ban manager
//! and runs the action chain; a once-per-second tick drains expired bans.
//! Commands from the transmitter are serialized onto the same worker so
//! bans and unbans stay totally ordered within one jail.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use jail_proto::Value;

use crate::action::{Action, ActionInfo, ActionRegistry};
use crate::banmanager::{BanManager, BantimeIncrement};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::failmanager::FailManager;
use crate::filter::{Filter, Outcome, SeekTo};
use crate::ip::{DnsResolver, IpAddress};
use crate::mytime::MyTime;
use crate::observer::{JailFeedback, Observer, ObserverOp};
use crate::ticket::{BanTicket, FailTicket};

/// Bound on joining the worker at stop.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker and poller cadence.
const SLEEP_TIME: Duration = Duration::from_secs(1);

/// Jail lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailState {
    /// Created, never started.
    Fresh,
    /// Start in progress.
    Starting,
    /// Worker running (possibly idle).
    Running,
    /// Stop in progress.
    Stopping,
    /// Worker gone.
    Stopped,
}

/// Commands serialized onto the jail worker.
enum JailCmd {
    /// Manual bans; replies with the count of newly banned ids.
    BanTickets {
        tickets: Vec<BanTicket>,
        reply: oneshot::Sender<usize>,
    },
    /// Manual unbans; replies with (unbanned count, absent ids).
    Unban {
        ids: Vec<IpAddress>,
        reply: oneshot::Sender<(usize, Vec<String>)>,
    },
    /// Unban everything; replies with the count.
    FlushBans { reply: oneshot::Sender<usize> },
}

/// One named ban policy.
pub struct Jail {
    name: String,
    backend: String,
    filter: Arc<tokio::sync::Mutex<Filter>>,
    fail_manager: Arc<Mutex<FailManager>>,
    ban_manager: Arc<Mutex<BanManager>>,
    actions: Arc<ActionRegistry>,
    increment: Arc<Mutex<BantimeIncrement>>,
    state: Arc<Mutex<JailState>>,
    idle: Arc<AtomicBool>,
    resolver: Arc<DnsResolver>,
    observer: Arc<Observer>,
    db: Arc<RwLock<Option<Database>>>,
    db_max_matches: Arc<AtomicUsize>,
    ticket_tx: Mutex<Option<mpsc::UnboundedSender<FailTicket>>>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<JailCmd>>>,
    active_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Jail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jail")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl Jail {
    /// Create a jail on `backend`.
    ///
    /// Only the polling backend ships with the daemon; `auto` falls back
    /// to it. Journal-style backends are external collaborators.
    pub fn new(
        name: &str,
        backend: &str,
        resolver: Arc<DnsResolver>,
        observer: Arc<Observer>,
        db: Arc<RwLock<Option<Database>>>,
        db_max_matches: Arc<AtomicUsize>,
    ) -> Result<Jail> {
        let backend = match backend {
            "auto" | "polling" => "polling".to_string(),
            other => {
                return Err(Error::Backend(format!(
                    "backend {:?} is not available (only 'polling' ships with this daemon)",
                    other
                )))
            }
        };
        Ok(Jail {
            name: name.to_string(),
            filter: Arc::new(tokio::sync::Mutex::new(Filter::new(name, resolver.clone()))),
            fail_manager: Arc::new(Mutex::new(FailManager::new())),
            ban_manager: Arc::new(Mutex::new(BanManager::new())),
            actions: Arc::new(ActionRegistry::new()),
            increment: Arc::new(Mutex::new(BantimeIncrement::default())),
            state: Arc::new(Mutex::new(JailState::Fresh)),
            idle: Arc::new(AtomicBool::new(false)),
            resolver,
            observer,
            db,
            db_max_matches,
            ticket_tx: Mutex::new(None),
            cmd_tx: Mutex::new(None),
            active_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            backend,
        })
    }

    /// The jail name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backend identifier.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// The filter, for configuration operations.
    pub fn filter(&self) -> &Arc<tokio::sync::Mutex<Filter>> {
        &self.filter
    }

    /// The action registry.
    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JailState {
        *self.state.lock()
    }

    /// Whether the worker is up.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), JailState::Running)
    }

    /// The idle flag.
    pub fn idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    /// Pause/resume processing without stopping the worker.
    pub fn set_idle(&self, value: bool) {
        self.idle.store(value, Ordering::Relaxed);
        info!(jail = %self.name, idle = value, "Idle state changed");
    }

    // -- settings ------------------------------------------------------------

    /// The find window in seconds.
    pub fn find_time(&self) -> i64 {
        self.fail_manager.lock().max_time()
    }

    /// Set the find window (fail manager and filter agree on it).
    pub async fn set_find_time(&self, value: i64) {
        self.fail_manager.lock().set_max_time(value);
        self.filter.lock().await.set_find_time(value);
    }

    /// The default ban time in seconds.
    pub fn ban_time(&self) -> i64 {
        self.ban_manager.lock().ban_time()
    }

    /// Set the default ban time.
    pub fn set_ban_time(&self, value: i64) {
        self.ban_manager.lock().set_ban_time(value);
    }

    /// The ban threshold.
    pub fn max_retry(&self) -> u32 {
        self.fail_manager.lock().max_retry()
    }

    /// Set the ban threshold.
    pub fn set_max_retry(&self, value: u32) {
        self.fail_manager.lock().set_max_retry(value);
    }

    /// Matches kept in memory per ticket.
    pub fn max_matches(&self) -> usize {
        self.fail_manager.lock().max_matches()
    }

    /// Set the per-ticket match cap.
    pub fn set_max_matches(&self, value: usize) {
        self.fail_manager.lock().set_max_matches(value);
    }

    /// The ban-time increment policy.
    pub fn increment(&self) -> BantimeIncrement {
        self.increment.lock().clone()
    }

    /// Update the increment policy in place.
    pub fn update_increment(&self, update: impl FnOnce(&mut BantimeIncrement)) {
        update(&mut self.increment.lock());
    }

    // -- lifecycle -----------------------------------------------------------

    /// Start the jail worker and log poller.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                JailState::Running | JailState::Starting => {
                    return Err(Error::Busy(format!("Jail '{}' is already running", self.name)))
                }
                _ => *state = JailState::Starting,
            }
        }
        info!(jail = %self.name, "Starting jail");

        let (ticket_tx, ticket_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let (active_tx, active_rx) = watch::channel(true);
        *self.ticket_tx.lock() = Some(ticket_tx.clone());
        *self.cmd_tx.lock() = Some(cmd_tx.clone());
        *self.active_tx.lock() = Some(active_tx);

        self.filter.lock().await.set_in_operation(true);

        // restore current bans from the store before fresh tickets arrive
        let restored = {
            let db = self.db.read().clone();
            match db {
                Some(db) => match db.get_current_bans(&self.name).await {
                    Ok(tickets) => tickets,
                    Err(e) => {
                        warn!(jail = %self.name, error = %e, "Failed to restore bans");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            }
        };
        if !restored.is_empty() {
            info!(jail = %self.name, count = restored.len(), "Restoring banned hosts");
            let (reply, _drop) = oneshot::channel();
            let _ = cmd_tx.send(JailCmd::BanTickets {
                tickets: restored,
                reply,
            });
        }

        let ctx = WorkerCtx {
            name: self.name.clone(),
            fail_manager: self.fail_manager.clone(),
            ban_manager: self.ban_manager.clone(),
            actions: self.actions.clone(),
            increment: self.increment.clone(),
            idle: self.idle.clone(),
            resolver: self.resolver.clone(),
            observer: self.observer.clone(),
            db_max_matches: self.db_max_matches.clone(),
            feedback_tx,
        };
        let state = self.state.clone();
        let worker = tokio::spawn(async move {
            worker_loop(ctx, ticket_rx, cmd_rx, feedback_rx, active_rx).await;
            *state.lock() = JailState::Stopped;
        });

        let poller = tokio::spawn(poller_loop(
            self.name.clone(),
            self.filter.clone(),
            ticket_tx,
            self.idle.clone(),
            self.active_tx.lock().as_ref().expect("just set").subscribe(),
        ));

        self.tasks.lock().extend([worker, poller]);
        *self.state.lock() = JailState::Running;
        info!(jail = %self.name, backend = %self.backend, "Jail started");
        Ok(())
    }

    /// Stop the jail; idempotent. Flushes bans and stops the actions.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                JailState::Fresh | JailState::Stopped => {
                    *state = JailState::Stopped;
                    return Ok(());
                }
                JailState::Stopping => return Ok(()),
                _ => *state = JailState::Stopping,
            }
        }
        info!(jail = %self.name, "Stopping jail");
        self.filter.lock().await.set_in_operation(false);

        if let Some(active) = self.active_tx.lock().take() {
            let _ = active.send(false);
        }
        *self.ticket_tx.lock() = None;
        *self.cmd_tx.lock() = None;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, task).await.is_err() {
                warn!(jail = %self.name, "Worker did not stop within {:?}, abandoning", STOP_JOIN_TIMEOUT);
            }
        }
        *self.state.lock() = JailState::Stopped;
        info!(jail = %self.name, "Jail stopped");
        Ok(())
    }

    // -- operations ----------------------------------------------------------

    fn cmd_sender(&self) -> Result<mpsc::UnboundedSender<JailCmd>> {
        self.cmd_tx
            .lock()
            .clone()
            .ok_or_else(|| Error::Busy(format!("Jail '{}' is not running", self.name)))
    }

    /// Feed one failure into the jail queue (filter or `attempt`).
    pub fn put_fail_ticket(&self, ticket: FailTicket) -> Result<()> {
        match self.ticket_tx.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(ticket);
                Ok(())
            }
            None => {
                // not running: account the failure directly
                self.fail_manager.lock().add_failure(ticket);
                Ok(())
            }
        }
    }

    /// Manually record an attempt for `id`, with optional match lines.
    pub fn attempt(&self, id: &str, matches: Vec<String>) -> Result<i64> {
        let ticket = FailTicket::with_matches(IpAddress::id(id), None, matches);
        self.put_fail_ticket(ticket)?;
        Ok(1)
    }

    /// Manually ban identifiers; returns the number newly banned.
    ///
    /// Values that are neither IP nor DNS are kept verbatim as raw ids
    /// unless `strict`.
    pub async fn ban_ips(&self, ids: &[String], strict: bool) -> Result<usize> {
        let mut tickets = Vec::with_capacity(ids.len());
        for id in ids {
            let ip = IpAddress::id(id);
            if !ip.is_valid() {
                if strict {
                    return Err(Error::InvalidArgument(format!(
                        "{:?} is not a valid IP address",
                        id
                    )));
                }
                info!(jail = %self.name, id = %id, "Requested ban of a non-IP identifier, stored verbatim");
            }
            tickets.push(BanTicket::new(ip, None));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_sender()?
            .send(JailCmd::BanTickets {
                tickets,
                reply: reply_tx,
            })
            .map_err(|_| Error::Cancelled)?;
        reply_rx.await.map_err(|_| Error::Cancelled)
    }

    /// Manually unban identifiers; returns the number unbanned.
    pub async fn unban_ips(&self, ids: &[String], report_absent: bool) -> Result<usize> {
        let ids: Vec<IpAddress> = ids.iter().map(|id| IpAddress::id(id)).collect();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_sender()?
            .send(JailCmd::Unban {
                ids,
                reply: reply_tx,
            })
            .map_err(|_| Error::Cancelled)?;
        let (count, absent) = reply_rx.await.map_err(|_| Error::Cancelled)?;
        if report_absent && !absent.is_empty() {
            return Err(Error::NotFound(format!(
                "{} is not banned",
                absent.join(", ")
            )));
        }
        Ok(count)
    }

    /// Unban everything in this jail; returns the count.
    pub async fn flush_bans(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_sender()?
            .send(JailCmd::FlushBans { reply: reply_tx })
            .map_err(|_| Error::Cancelled)?;
        reply_rx.await.map_err(|_| Error::Cancelled)
    }

    /// Whether `id` is currently banned.
    pub fn is_banned(&self, id: &str) -> bool {
        self.ban_manager.lock().is_banned(&IpAddress::id(id))
    }

    /// Banned identifiers, ordered by end of ban.
    pub fn banned_ids(&self) -> Vec<String> {
        self.ban_manager.lock().banned_ids()
    }

    /// Banned identifiers with the ban window rendered.
    pub fn banned_ids_with_time(&self) -> Vec<String> {
        self.ban_manager.lock().banned_ids_with_time()
    }

    /// (currently failed, total failed, currently banned, total banned).
    pub fn counters(&self) -> (usize, u64, usize, u64) {
        let (failed, fail_total) = {
            let fm = self.fail_manager.lock();
            (fm.size(), fm.fail_total())
        };
        let (banned, ban_total) = {
            let bm = self.ban_manager.lock();
            (bm.size(), bm.ban_total())
        };
        (failed, fail_total, banned, ban_total)
    }

    /// Status tree for one flavor.
    pub async fn status(&self, flavor: &str) -> Result<Value> {
        let (failed, fail_total, banned, ban_total) = self.counters();
        match flavor {
            "basic" | "cymru" => {
                let files = self.filter.lock().await.log_paths();
                let mut actions_rows = vec![
                    Value::pair("Currently banned", banned),
                    Value::pair("Total banned", ban_total as i64),
                    Value::pair("Banned IP list", Value::list(self.banned_ids())),
                ];
                if flavor == "cymru" {
                    let (asn, country, rir) = self.ban_manager.lock().cymru_info();
                    actions_rows.push(Value::pair("Banned ASN list", Value::list(asn)));
                    actions_rows.push(Value::pair("Banned Country list", Value::list(country)));
                    actions_rows.push(Value::pair("Banned RIR list", Value::list(rir)));
                }
                Ok(Value::List(vec![
                    Value::pair(
                        "Filter",
                        Value::List(vec![
                            Value::pair("Currently failed", failed),
                            Value::pair("Total failed", fail_total as i64),
                            Value::pair("File list", Value::list(files)),
                        ]),
                    ),
                    Value::pair("Actions", Value::List(actions_rows)),
                ]))
            }
            "short" => Ok(Value::List(vec![
                Value::pair("Currently failed", failed),
                Value::pair("Currently banned", banned),
            ])),
            "stats" => Ok(Value::List(vec![
                Value::Int(failed as i64),
                Value::Int(fail_total as i64),
                Value::Int(banned as i64),
                Value::Int(ban_total as i64),
            ])),
            other => Err(Error::InvalidArgument(format!(
                "Invalid status flavor {:?}",
                other
            ))),
        }
    }

    /// Add a monitored log file.
    pub async fn add_log_path(&self, path: &str, seek: SeekTo) -> Result<()> {
        self.filter.lock().await.add_log_path(path, seek)
    }
}

/// Everything the worker task needs, detached from the jail handle.
struct WorkerCtx {
    name: String,
    fail_manager: Arc<Mutex<FailManager>>,
    ban_manager: Arc<Mutex<BanManager>>,
    actions: Arc<ActionRegistry>,
    increment: Arc<Mutex<BantimeIncrement>>,
    idle: Arc<AtomicBool>,
    resolver: Arc<DnsResolver>,
    observer: Arc<Observer>,
    db_max_matches: Arc<AtomicUsize>,
    feedback_tx: mpsc::UnboundedSender<JailFeedback>,
}

impl WorkerCtx {
    fn idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    async fn action_info(&self, ticket: &BanTicket, default_ban_time: i64) -> ActionInfo {
        let mut info = ActionInfo::for_ticket(&self.name, ticket.clone(), default_ban_time);
        if ticket.id().is_valid() && self.actions_reference_host() {
            info.ip_host = self.resolver.ip_to_name(ticket.id()).await;
        }
        info
    }

    /// Reverse DNS is only worth the lookup when a template mentions it.
    fn actions_reference_host(&self) -> bool {
        self.actions.ordered().iter().any(|action| {
            ["actionban", "actionunban", "actionstart", "actionstop"]
                .iter()
                .any(|key| {
                    action
                        .get_property(key)
                        .map(|t| t.contains("<ip-host>"))
                        .unwrap_or(false)
                })
        })
    }

    async fn handle_failure(&self, ticket: FailTicket) {
        let id = ticket.id().clone();
        let retry = self.fail_manager.lock().add_failure(ticket);
        debug!(jail = %self.name, id = %id, retry = retry, "Failure recorded");
        self.observer.add(ObserverOp::FailureFound {
            jail: self.name.clone(),
            id,
            retry,
        });
        self.drain_bans().await;
    }

    async fn drain_bans(&self) {
        loop {
            let ticket = self.fail_manager.lock().to_ban(None);
            match ticket {
                Some(ticket) => {
                    self.process_ban(ticket).await;
                }
                None => break,
            }
        }
    }

    /// Promote one ticket into the ban manager and run the action chain.
    async fn process_ban(&self, ticket: BanTicket) -> bool {
        let default_ban_time = self.ban_manager.lock().ban_time();
        let accepted = self.ban_manager.lock().add_ban_ticket(ticket.clone());
        if !accepted {
            info!(jail = %self.name, "{} already banned", ticket.id());
            return false;
        }
        if ticket.restored() {
            info!(jail = %self.name, "Restore Ban {}", ticket.id());
        } else {
            info!(jail = %self.name, "Ban {}", ticket.id());
        }

        let info = self.action_info(&ticket, default_ban_time).await;
        for action in self.actions.ordered() {
            if let Err(e) = action.ban(&info).await {
                error!(
                    jail = %self.name,
                    action = %action.name(),
                    error = %e,
                    code = e.error_code(),
                    "Failed to execute ban"
                );
            }
        }

        self.observer.add(ObserverOp::BanFound {
            jail: self.name.clone(),
            ticket,
            policy: self.increment.lock().clone(),
            default_ban_time,
            db_max_matches: self.db_max_matches.load(Ordering::Relaxed),
            feedback: self.feedback_tx.clone(),
        });
        true
    }

    /// Unban one ticket through the action chain (declaration order).
    async fn process_unban(&self, ticket: &BanTicket, default_ban_time: i64) {
        info!(jail = %self.name, "Unban {}", ticket.id());
        let info = self.action_info(ticket, default_ban_time).await;
        for action in self.actions.ordered() {
            if let Err(e) = action.unban(&info).await {
                error!(
                    jail = %self.name,
                    action = %action.name(),
                    error = %e,
                    code = e.error_code(),
                    "Failed to execute unban"
                );
            }
        }
    }

    async fn check_unban(&self) {
        let now = MyTime::time();
        let (expired, default_ban_time) = {
            let mut bm = self.ban_manager.lock();
            (bm.unban_list(now), bm.ban_time())
        };
        for ticket in expired {
            self.process_unban(&ticket, default_ban_time).await;
        }
    }

    async fn handle_cmd(&self, cmd: JailCmd) {
        match cmd {
            JailCmd::BanTickets { tickets, reply } => {
                let mut newly = 0;
                for ticket in tickets {
                    if self.process_ban(ticket).await {
                        newly += 1;
                    }
                }
                let _ = reply.send(newly);
            }
            JailCmd::Unban { ids, reply } => {
                let default_ban_time = self.ban_manager.lock().ban_time();
                let mut count = 0;
                let mut absent = Vec::new();
                for id in ids {
                    let removed = self.ban_manager.lock().unban(&id);
                    match removed {
                        Some(ticket) => {
                            self.process_unban(&ticket, default_ban_time).await;
                            self.observer.add(ObserverOp::UnbanFound {
                                jail: self.name.clone(),
                                id,
                            });
                            count += 1;
                        }
                        None => absent.push(id.ntoa()),
                    }
                }
                let _ = reply.send((count, absent));
            }
            JailCmd::FlushBans { reply } => {
                let _ = reply.send(self.flush_all().await);
            }
        }
    }

    /// Unban everything; uses `actionflush` where an action provides it.
    async fn flush_all(&self) -> usize {
        let (tickets, default_ban_time) = {
            let mut bm = self.ban_manager.lock();
            (bm.flush(), bm.ban_time())
        };
        if tickets.is_empty() {
            return 0;
        }
        info!(jail = %self.name, count = tickets.len(), "Flush ticket(s)");
        for action in self.actions.ordered() {
            if action.get_property("actionflush").filter(|t| !t.is_empty()).is_some() {
                let info = ActionInfo::jail_only(&self.name, default_ban_time);
                if let Err(e) = action.flush(&info).await {
                    error!(jail = %self.name, action = %action.name(), error = %e, "Failed to flush");
                }
            } else {
                for ticket in &tickets {
                    let info = self.action_info(ticket, default_ban_time).await;
                    if let Err(e) = action.unban(&info).await {
                        error!(jail = %self.name, action = %action.name(), error = %e, "Failed to execute unban");
                    }
                }
            }
        }
        tickets.len()
    }

    /// Cleanup path run exactly once when the worker leaves its loop.
    async fn on_stop(&self) {
        self.flush_all().await;
        let default_ban_time = self.ban_manager.lock().ban_time();
        let info = ActionInfo::jail_only(&self.name, default_ban_time);
        // stop runs the chain in reverse declaration order
        for action in self.actions.reversed() {
            if let Err(e) = action.stop(&info).await {
                error!(jail = %self.name, action = %action.name(), error = %e, "Failed to stop action");
            }
        }
    }
}

async fn worker_loop(
    ctx: WorkerCtx,
    mut ticket_rx: mpsc::UnboundedReceiver<FailTicket>,
    mut cmd_rx: mpsc::UnboundedReceiver<JailCmd>,
    mut feedback_rx: mpsc::UnboundedReceiver<JailFeedback>,
    mut active_rx: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(SLEEP_TIME);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            Some(ticket) = ticket_rx.recv() => {
                if !ctx.idle() {
                    ctx.handle_failure(ticket).await;
                }
            }
            Some(cmd) = cmd_rx.recv() => {
                ctx.handle_cmd(cmd).await;
            }
            Some(feedback) = feedback_rx.recv() => {
                match feedback {
                    JailFeedback::ProlongBan { id, ban_time } => {
                        ctx.ban_manager.lock().prolong_ban(&id, ban_time);
                    }
                }
            }
            _ = tick.tick() => {
                if !ctx.idle() {
                    ctx.check_unban().await;
                    ticks += 1;
                    if ticks.is_multiple_of(10) {
                        ctx.fail_manager.lock().cleanup(MyTime::time());
                    }
                }
            }
            changed = active_rx.changed() => {
                if changed.is_err() || !*active_rx.borrow() {
                    break;
                }
            }
        }
    }
    ctx.on_stop().await;
}

/// Poll monitored files and push matched lines into the jail queue.
async fn poller_loop(
    name: String,
    filter: Arc<tokio::sync::Mutex<Filter>>,
    ticket_tx: mpsc::UnboundedSender<FailTicket>,
    idle: Arc<AtomicBool>,
    mut active_rx: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(SLEEP_TIME);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if idle.load(Ordering::Relaxed) {
                    continue;
                }
                let containers = filter.lock().await.containers();
                for container in containers {
                    let lines = match container.read_new_lines() {
                        Ok(lines) => lines,
                        Err(e) => {
                            warn!(jail = %name, file = %container.path().display(), error = %e,
                                "Failed to read log file");
                            continue;
                        }
                    };
                    for line in lines {
                        let outcome = filter.lock().await.process_line(&line, None).await;
                        if let Outcome::Fail(ticket) = outcome {
                            if ticket_tx.send(ticket).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            changed = active_rx.changed() => {
                if changed.is_err() || !*active_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_jail(name: &str) -> Arc<Jail> {
        let db = Arc::new(RwLock::new(None));
        let observer = Arc::new(Observer::spawn(db.clone()));
        Arc::new(
            Jail::new(
                name,
                "polling",
                Arc::new(DnsResolver::new()),
                observer,
                db,
                Arc::new(AtomicUsize::new(10)),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected() {
        let db = Arc::new(RwLock::new(None));
        let observer = Arc::new(Observer::spawn(db.clone()));
        let err = Jail::new(
            "ssh",
            "systemd",
            Arc::new(DnsResolver::new()),
            observer,
            db,
            Arc::new(AtomicUsize::new(10)),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "backend");
    }

    #[tokio::test]
    async fn test_start_twice_rejected_stop_idempotent() {
        let jail = test_jail("ssh");
        jail.start().await.unwrap();
        assert!(jail.is_running());
        assert!(jail.start().await.is_err());
        jail.stop().await.unwrap();
        jail.stop().await.unwrap();
        assert_eq!(jail.state(), JailState::Stopped);
    }

    #[tokio::test]
    async fn test_manual_ban_counts_new_ids_only() {
        let jail = test_jail("ssh");
        jail.start().await.unwrap();

        let ids = vec![
            "192.0.2.1".to_string(),
            "192.0.2.1".to_string(),
            "192.0.2.2".to_string(),
        ];
        assert_eq!(jail.ban_ips(&ids, false).await.unwrap(), 2);
        assert_eq!(jail.ban_ips(&["192.0.2.1".to_string()], false).await.unwrap(), 0);
        assert_eq!(jail.banned_ids().len(), 2);
        jail.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_ip_ban_is_tolerated() {
        let jail = test_jail("ssh");
        jail.start().await.unwrap();
        assert_eq!(jail.ban_ips(&["Badger".to_string()], false).await.unwrap(), 1);
        assert!(jail.is_banned("Badger"));
        // strict mode surfaces the error instead
        assert!(jail.ban_ips(&["Mushroom".to_string()], true).await.is_err());
        jail.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unban_with_report_absent() {
        let jail = test_jail("ssh");
        jail.start().await.unwrap();
        jail.ban_ips(&["192.0.2.1".to_string()], false).await.unwrap();

        assert_eq!(
            jail.unban_ips(&["192.0.2.1".to_string(), "192.0.2.9".to_string()], false)
                .await
                .unwrap(),
            1
        );
        let err = jail
            .unban_ips(&["192.0.2.9".to_string()], true)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "not_found");
        jail.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_threshold_pipeline_bans_second_host_only() {
        let jail = test_jail("ssh");
        jail.set_max_retry(5);
        jail.start().await.unwrap();

        // two attempts for .1, five for .2
        for _ in 0..2 {
            jail.attempt("192.0.2.1", vec![]).unwrap();
        }
        for _ in 0..5 {
            jail.attempt("192.0.2.2", vec![]).unwrap();
        }
        // give the worker a moment to drain the queue
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if jail.is_banned("192.0.2.2") {
                break;
            }
        }
        assert!(jail.is_banned("192.0.2.2"));
        assert!(!jail.is_banned("192.0.2.1"));
        jail.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_flavors() {
        let jail = test_jail("ssh");
        jail.start().await.unwrap();
        jail.ban_ips(&["192.0.2.1".to_string()], false).await.unwrap();

        let status = jail.status("basic").await.unwrap();
        let rendered = format!("{}", status);
        assert!(rendered.contains("Currently banned"));
        assert!(rendered.contains("192.0.2.1"));

        let short = jail.status("short").await.unwrap();
        assert_eq!(short.as_list().unwrap().len(), 2);

        assert!(jail.status("nonsense").await.is_err());
        jail.stop().await.unwrap();
    }
}

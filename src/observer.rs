//! The shared side-effect worker.
//!
//! One task drains a FIFO of opcodes so jail workers never block on
//! persistence or ban-history lookups. Results never flow back
//! synchronously: the ban-time increment outcome is enqueued onto the
//! jail's own channel as a prolongation request.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::banmanager::BantimeIncrement;
use crate::db::Database;
use crate::ip::IpAddress;
use crate::ticket::BanTicket;

/// Bound on waiting for the worker to drain at shutdown.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Feedback the observer sends back to a jail worker.
#[derive(Debug)]
pub enum JailFeedback {
    /// Apply a recomputed ban time to an active ban.
    ProlongBan {
        /// The banned identifier.
        id: IpAddress,
        /// The new ban duration in seconds.
        ban_time: i64,
    },
}

/// One queued unit of observer work.
pub enum ObserverOp {
    /// A failure was recorded (informational).
    FailureFound {
        /// Owning jail.
        jail: String,
        /// Failing identifier.
        id: IpAddress,
        /// Its current retry count.
        retry: u32,
    },
    /// A ban happened: compute the increment policy and persist.
    BanFound {
        /// Owning jail.
        jail: String,
        /// The banned ticket (a snapshot).
        ticket: BanTicket,
        /// The jail's increment policy.
        policy: BantimeIncrement,
        /// The jail's default ban time.
        default_ban_time: i64,
        /// Cap on matches stored per ticket.
        db_max_matches: usize,
        /// The jail worker's feedback queue.
        feedback: mpsc::UnboundedSender<JailFeedback>,
    },
    /// An explicit unban: drop the history row.
    UnbanFound {
        /// Owning jail.
        jail: String,
        /// The identifier.
        id: IpAddress,
    },
    /// Purge expired history.
    Purge {
        /// Retention in seconds.
        purge_age: i64,
    },
    /// Barrier: answers once everything queued before it has run.
    Sync(oneshot::Sender<()>),
    /// Drain the queue, then exit.
    Stop,
}

/// Handle to the observer worker.
pub struct Observer {
    tx: mpsc::UnboundedSender<ObserverOp>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Observer {
    /// Spawn the worker. `db` is shared with the server, which may attach
    /// or detach the store at runtime.
    pub fn spawn(db: Arc<RwLock<Option<Database>>>) -> Observer {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::run(rx, db));
        Observer {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue one op; never blocks the caller.
    pub fn add(&self, op: ObserverOp) {
        let _ = self.tx.send(op);
    }

    /// Wait until all previously queued ops have run.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ObserverOp::Sync(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Signal stop and wait (bounded) for the queue to drain.
    pub async fn stop(&self) {
        let _ = self.tx.send(ObserverOp::Stop);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Observer did not stop within {:?}, abandoning", STOP_JOIN_TIMEOUT);
            }
        }
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<ObserverOp>, db: Arc<RwLock<Option<Database>>>) {
        info!("Observer started");
        while let Some(op) = rx.recv().await {
            match op {
                ObserverOp::FailureFound { jail, id, retry } => {
                    debug!(jail = %jail, id = %id, retry = retry, "Failure observed");
                }
                ObserverOp::BanFound {
                    jail,
                    mut ticket,
                    policy,
                    default_ban_time,
                    db_max_matches,
                    feedback,
                } => {
                    let db = db.read().clone();
                    Self::ban_found(
                        db,
                        &jail,
                        &mut ticket,
                        &policy,
                        default_ban_time,
                        db_max_matches,
                        &feedback,
                    )
                    .await;
                }
                ObserverOp::UnbanFound { jail, id } => {
                    let db = db.read().clone();
                    if let Some(db) = db {
                        if let Err(e) = db.del_ban(Some(&jail), Some(&id)).await {
                            warn!(jail = %jail, id = %id, error = %e, "Failed to remove ban from store");
                        }
                    }
                }
                ObserverOp::Purge { purge_age } => {
                    let db = db.read().clone();
                    if let Some(db) = db {
                        match db.purge(purge_age).await {
                            Ok(removed) if removed > 0 => {
                                info!(removed = removed, "Purged expired bans from store");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Database purge failed"),
                        }
                    }
                }
                ObserverOp::Sync(done) => {
                    let _ = done.send(());
                }
                ObserverOp::Stop => {
                    // refuse new work, drain what is already queued
                    rx.close();
                }
            }
        }
        info!("Observer stopped");
    }

    /// Ban side-effects: increment policy over the stored history, then
    /// persistence. Prolongation flows back through the jail's queue.
    async fn ban_found(
        db: Option<Database>,
        jail: &str,
        ticket: &mut BanTicket,
        policy: &BantimeIncrement,
        default_ban_time: i64,
        db_max_matches: usize,
        feedback: &mpsc::UnboundedSender<JailFeedback>,
    ) {
        if policy.enabled && !ticket.restored() {
            let history_jail = if policy.overall_jails { None } else { Some(jail) };
            let prior = match &db {
                Some(db) => match db.get_ban(ticket.id(), history_jail).await {
                    Ok(record) => record.map(|r| r.bancount).unwrap_or(0),
                    Err(e) => {
                        warn!(jail = %jail, error = %e, "Ban history lookup failed");
                        0
                    }
                },
                None => 0,
            };
            let ban_count = ticket.ban_count().max(prior);
            ticket.set_ban_count(ban_count + 1, true);

            let base = ticket.ban_time(default_ban_time);
            let ban_time = policy.compute(ban_count, base);
            if ban_time != base {
                debug!(jail = %jail, id = %ticket.id(), ban_time = ban_time, "Increasing ban time");
            }
            ticket.set_ban_time(Some(ban_time));
            let _ = feedback.send(JailFeedback::ProlongBan {
                id: ticket.id().clone(),
                ban_time,
            });
        } else if !ticket.restored() {
            ticket.incr_ban_count();
        }

        if let Some(db) = db {
            if let Err(e) = db
                .add_ban(jail, ticket, default_ban_time, db_max_matches)
                .await
            {
                warn!(jail = %jail, id = %ticket.id(), error = %e, "Failed to persist ban");
            }
        }
    }
}

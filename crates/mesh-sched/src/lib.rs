#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list @@
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
//! <!-- @@ end lint list @@ -->

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mesh_crypto::Fingerprint;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Redial interval after a successful exchange with a contact.
pub const SANITY_REDIAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Redial interval after a failed dial attempt.
pub const FAILURE_REDIAL: Duration = Duration::from_secs(60 * 60);

/// Dial priority used when broadcasting a profile update.
pub const PROFILE_BROADCAST_PRIORITY: Duration = Duration::from_secs(6 * 60 * 60);

/// Dial priority used when retrying an undelivered infection update.
pub const INFECTION_RETRY_PRIORITY: Duration = Duration::from_secs(30 * 60);

/// What the scheduler needs from the rest of the system to fire a dial.
#[async_trait]
pub trait Dial: Send + Sync + 'static {
    /// Whether the overlay is up at all. When it is not, due dials are
    /// skipped and retried later rather than reported as failures.
    fn online(&self) -> bool;

    /// Dial one contact. Returns true if the exchange succeeded.
    async fn dial(&self, fp: Fingerprint) -> bool;
}

/// Timing knobs of a scheduler; the defaults are the production values.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct SchedulerConfig {
    /// Redial interval after success.
    pub sanity_redial: Duration,
    /// Redial interval after failure.
    pub failure_redial: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            sanity_redial: SANITY_REDIAL,
            failure_redial: FAILURE_REDIAL,
        }
    }
}

/// Commands accepted by the scheduler task.
enum Command {
    /// Drop the whole schedule (overlay going down).
    Suspend,
    /// Reconcile the schedule against the current contact set.
    Reinit(Vec<Fingerprint>),
    /// Move the named contacts earlier, to at most now + the duration.
    Prioritize(Duration, Vec<Fingerprint>),
    /// Internal: a spawned dial attempt finished.
    Dialed(Fingerprint, bool),
    /// Stop the task.
    Close,
}

/// Handle to a running dial-scheduler task.
///
/// All methods are fire-and-forget sends to the task; once
/// [`close`](Scheduler::close) has run they become no-ops.
#[derive(Clone)]
pub struct Scheduler {
    /// Command channel into the task.
    tx: mpsc::UnboundedSender<Command>,
}

impl Scheduler {
    /// Spawn the scheduler task around `dialer`.
    pub fn spawn(dialer: Arc<dyn Dial>, config: SchedulerConfig) -> Scheduler {
        let (tx, rx) = mpsc::unbounded_channel();
        let internal = tx.clone();
        tokio::spawn(run(dialer, config, rx, internal));
        Scheduler { tx }
    }

    /// Clear the schedule entirely.
    pub fn suspend(&self) {
        let _ = self.tx.send(Command::Suspend);
    }

    /// Reconcile against the current contact set: newly seen contacts
    /// are scheduled immediately, removed contacts are dropped.
    pub fn reinit(&self, contacts: Vec<Fingerprint>) {
        let _ = self.tx.send(Command::Reinit(contacts));
    }

    /// Ask for the named contacts to be dialed within `deadline` from
    /// now. A contact already scheduled sooner is left alone; a contact
    /// not in the schedule at all is warned about and skipped.
    pub fn prioritize(&self, deadline: Duration, contacts: Vec<Fingerprint>) {
        let _ = self.tx.send(Command::Prioritize(deadline, contacts));
    }

    /// Terminate the scheduler task.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

/// The scheduler task: one earliest-time map, one armed timer.
async fn run(
    dialer: Arc<dyn Dial>,
    config: SchedulerConfig,
    mut rx: mpsc::UnboundedReceiver<Command>,
    internal: mpsc::UnboundedSender<Command>,
) {
    let mut schedule: HashMap<Fingerprint, Instant> = HashMap::new();
    let mut in_flight: HashSet<Fingerprint> = HashSet::new();

    loop {
        // The next contact due, ignoring those already being dialed.
        let next = schedule
            .iter()
            .filter(|(fp, _)| !in_flight.contains(*fp))
            .min_by_key(|(_, at)| **at)
            .map(|(fp, at)| (*fp, *at));

        let due = async {
            match next {
                Some((fp, at)) => {
                    tokio::time::sleep_until(at).await;
                    fp
                }
                // Nothing scheduled; park until a command arrives.
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(Command::Suspend) => {
                        debug!("schedule suspended");
                        schedule.clear();
                    }
                    Some(Command::Reinit(contacts)) => {
                        let keep: HashSet<Fingerprint> = contacts.iter().copied().collect();
                        schedule.retain(|fp, _| keep.contains(fp));
                        let now = Instant::now();
                        for fp in contacts {
                            schedule.entry(fp).or_insert(now);
                        }
                        trace!(contacts = schedule.len(), "schedule reinitialized");
                    }
                    Some(Command::Prioritize(deadline, contacts)) => {
                        let target = Instant::now() + deadline;
                        for fp in contacts {
                            match schedule.get_mut(&fp) {
                                // Only ever move dials earlier.
                                Some(at) if *at > target => *at = target,
                                Some(_) => {}
                                None => warn!(peer = %fp, "prioritize for unscheduled contact"),
                            }
                        }
                    }
                    Some(Command::Dialed(fp, ok)) => {
                        in_flight.remove(&fp);
                        if let Some(at) = schedule.get_mut(&fp) {
                            let delay = if ok { config.sanity_redial } else { config.failure_redial };
                            *at = Instant::now() + delay;
                            trace!(peer = %fp, ok, "dial finished; rescheduled");
                        }
                    }
                    Some(Command::Close) | None => {
                        debug!("scheduler closing");
                        break;
                    }
                }
            }
            fp = due => {
                if !dialer.online() {
                    // Overlay is down; quietly try again a cycle later.
                    if let Some(at) = schedule.get_mut(&fp) {
                        *at = Instant::now() + config.failure_redial;
                    }
                    continue;
                }
                // Park the entry pessimistically; a success report will
                // push it out to the sanity interval.
                if let Some(at) = schedule.get_mut(&fp) {
                    *at = Instant::now() + config.failure_redial;
                }
                in_flight.insert(fp);
                let dialer = Arc::clone(&dialer);
                let internal = internal.clone();
                tokio::spawn(async move {
                    trace!(peer = %fp, "scheduled dial firing");
                    let ok = dialer.dial(fp).await;
                    let _ = internal.send(Command::Dialed(fp, ok));
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// A dialer that records every attempt and answers from a script.
    struct FakeDial {
        /// Whether the overlay claims to be up.
        online: AtomicBool,
        /// Answer returned for every dial.
        answer: AtomicBool,
        /// Recorded dial attempts.
        dials: Mutex<Vec<Fingerprint>>,
        /// Signalled on every dial.
        notify: tokio::sync::Notify,
    }

    impl FakeDial {
        fn new(online: bool, answer: bool) -> Arc<Self> {
            Arc::new(FakeDial {
                online: AtomicBool::new(online),
                answer: AtomicBool::new(answer),
                dials: Mutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            })
        }

        fn count(&self) -> usize {
            self.dials.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Dial for FakeDial {
        fn online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }
        async fn dial(&self, fp: Fingerprint) -> bool {
            self.dials.lock().unwrap().push(fp);
            self.notify.notify_waiters();
            self.answer.load(Ordering::SeqCst)
        }
    }

    /// A distinct fingerprint per seed byte.
    fn fp(seed: u8) -> Fingerprint {
        mesh_crypto::SecretIdentity::from_seed([seed; 32]).fingerprint()
    }

    /// Let the scheduler task and any spawned dials run.
    async fn settle() {
        for _ in 0_u8..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn new_contacts_dial_immediately_then_daily() {
        let dial = FakeDial::new(true, true);
        let sched = Scheduler::spawn(
            Arc::clone(&dial) as Arc<dyn Dial>,
            SchedulerConfig::default(),
        );
        sched.reinit(vec![fp(1)]);
        settle().await;
        assert_eq!(dial.count(), 1);

        // A successful dial reschedules a day out, not an hour.
        tokio::time::advance(Duration::from_secs(60 * 60 + 1)).await;
        settle().await;
        assert_eq!(dial.count(), 1);
        tokio::time::advance(Duration::from_secs(23 * 60 * 60)).await;
        settle().await;
        assert_eq!(dial.count(), 2);
        sched.close();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_redial_hourly() {
        let dial = FakeDial::new(true, false);
        let sched = Scheduler::spawn(
            Arc::clone(&dial) as Arc<dyn Dial>,
            SchedulerConfig::default(),
        );
        sched.reinit(vec![fp(1)]);
        settle().await;
        assert_eq!(dial.count(), 1);
        tokio::time::advance(FAILURE_REDIAL).await;
        settle().await;
        assert_eq!(dial.count(), 2);
        sched.close();
    }

    #[tokio::test(start_paused = true)]
    async fn prioritize_moves_earlier_never_later() {
        let dial = FakeDial::new(true, true);
        let sched = Scheduler::spawn(
            Arc::clone(&dial) as Arc<dyn Dial>,
            SchedulerConfig::default(),
        );
        sched.reinit(vec![fp(1)]);
        settle().await;
        assert_eq!(dial.count(), 1);

        // Scheduled a day out after success; a 30 minute priority pulls
        // it in.
        sched.prioritize(INFECTION_RETRY_PRIORITY, vec![fp(1)]);
        settle().await;
        tokio::time::advance(INFECTION_RETRY_PRIORITY).await;
        settle().await;
        assert_eq!(dial.count(), 2);

        // Now due in a day again; a six hour priority pulls it in, and a
        // later twelve hour priority must NOT push it back out.
        sched.prioritize(Duration::from_secs(6 * 60 * 60), vec![fp(1)]);
        sched.prioritize(Duration::from_secs(12 * 60 * 60), vec![fp(1)]);
        settle().await;
        tokio::time::advance(Duration::from_secs(6 * 60 * 60)).await;
        settle().await;
        assert_eq!(dial.count(), 3);
        sched.close();
    }

    #[tokio::test(start_paused = true)]
    async fn prioritize_unknown_contact_is_harmless() {
        let dial = FakeDial::new(true, true);
        let sched = Scheduler::spawn(
            Arc::clone(&dial) as Arc<dyn Dial>,
            SchedulerConfig::default(),
        );
        sched.prioritize(Duration::from_secs(1), vec![fp(9)]);
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(dial.count(), 0);
        sched.close();
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_clears_and_reinit_restores() {
        let dial = FakeDial::new(true, true);
        let sched = Scheduler::spawn(
            Arc::clone(&dial) as Arc<dyn Dial>,
            SchedulerConfig::default(),
        );
        sched.reinit(vec![fp(1), fp(2)]);
        settle().await;
        assert_eq!(dial.count(), 2);

        sched.suspend();
        settle().await;
        tokio::time::advance(Duration::from_secs(48 * 60 * 60)).await;
        settle().await;
        assert_eq!(dial.count(), 2);

        sched.reinit(vec![fp(1)]);
        settle().await;
        assert_eq!(dial.count(), 3);
        sched.close();
    }

    #[tokio::test(start_paused = true)]
    async fn reinit_drops_removed_contacts() {
        let dial = FakeDial::new(true, true);
        let sched = Scheduler::spawn(
            Arc::clone(&dial) as Arc<dyn Dial>,
            SchedulerConfig::default(),
        );
        sched.reinit(vec![fp(1), fp(2)]);
        settle().await;
        assert_eq!(dial.count(), 2);

        // Drop contact 2; only contact 1 fires on the next cycle.
        sched.reinit(vec![fp(1)]);
        settle().await;
        tokio::time::advance(SANITY_REDIAL).await;
        settle().await;
        let dials = dial.dials.lock().unwrap().clone();
        assert_eq!(dials.len(), 3);
        assert_eq!(dials[2], fp(1));
        sched.close();
    }

    #[tokio::test(start_paused = true)]
    async fn offline_overlay_skips_silently() {
        let dial = FakeDial::new(false, true);
        let sched = Scheduler::spawn(
            Arc::clone(&dial) as Arc<dyn Dial>,
            SchedulerConfig::default(),
        );
        sched.reinit(vec![fp(1)]);
        settle().await;
        assert_eq!(dial.count(), 0);

        // Back online, the next cycle dials.
        dial.online.store(true, Ordering::SeqCst);
        tokio::time::advance(FAILURE_REDIAL).await;
        settle().await;
        assert_eq!(dial.count(), 1);
        sched.close();
    }
}

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, LazyLock, Mutex as StdMutex, MutexGuard},
    time::Duration,
};

use {
    futures::future::try_join_all,
    regex::{Regex, RegexBuilder},
    switchboard_protocol::{MAX_TOPIC_LENGTH, TOPIC_PATTERN},
    tokio::sync::Mutex as AsyncMutex,
    tokio_util::sync::CancellationToken,
    tracing::warn,
};

use crate::{
    adapter::{Settlement, TopicAdapter},
    error::TopicsError,
};

static DEFAULT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(TOPIC_PATTERN)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|err| unreachable!("default topic pattern is valid: {err}"))
});

// ── Configuration & options ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TopicsConfig {
    pub max_topics_per_connection: usize,
    pub pattern: Regex,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            max_topics_per_connection: switchboard_protocol::MAX_TOPICS_PER_CONNECTION,
            pattern: DEFAULT_PATTERN.clone(),
        }
    }
}

/// Confirmation mode for topic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Confirm {
    /// Resolve once local state is committed; adapter acknowledgments may
    /// still be in flight (await them with [`Topics::settle`]).
    #[default]
    Optimistic,
    /// Resolve only after the adapter acknowledges every change.
    Settled,
}

#[derive(Debug, Clone, Default)]
pub struct TopicOptions {
    pub confirm: Confirm,
    pub timeout: Option<Duration>,
    pub signal: Option<CancellationToken>,
}

impl TopicOptions {
    pub fn settled() -> Self {
        Self {
            confirm: Confirm::Settled,
            ..Self::default()
        }
    }

    fn check_not_cancelled(&self) -> Result<(), TopicsError> {
        match &self.signal {
            Some(signal) if signal.is_cancelled() => Err(TopicsError::Cancelled),
            _ => Ok(()),
        }
    }
}

// ── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub added: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubscribeOutcome {
    pub removed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOutcome {
    pub added: usize,
    pub removed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearOutcome {
    pub removed: usize,
}

// ── Internal plumbing ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Add,
    Remove,
}

struct Applied {
    kind: OpKind,
    topic: String,
    settlement: Settlement,
}

enum Plan {
    Modify {
        add: Vec<String>,
        remove: Vec<String>,
    },
    Set {
        desired: Vec<String>,
    },
    Update {
        mutate: Box<dyn FnOnce(&mut BTreeSet<String>) + Send>,
    },
    Clear,
}

// ── Topics ───────────────────────────────────────────────────────────────────

/// Per-connection subscription state.
///
/// Batch operations are strict all-or-nothing: every topic is validated and
/// the capacity checked before any adapter call; a failed adapter call rolls
/// back the already-issued calls in reverse order (new additions are undone
/// before old subscriptions are restored), and local state only changes after
/// every call was issued successfully.
///
/// Operations on one connection run in submission order; operations touching
/// a topic with an in-flight settlement wait for it first.
pub struct Topics {
    client_id: String,
    adapter: Arc<dyn TopicAdapter>,
    config: Arc<TopicsConfig>,
    members: StdMutex<BTreeSet<String>>,
    in_flight: StdMutex<HashMap<String, Vec<Settlement>>>,
    op_lock: AsyncMutex<()>,
}

impl Topics {
    pub(crate) fn new(
        client_id: impl Into<String>,
        adapter: Arc<dyn TopicAdapter>,
        config: Arc<TopicsConfig>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            adapter,
            config,
            members: StdMutex::new(BTreeSet::new()),
            in_flight: StdMutex::new(HashMap::new()),
            op_lock: AsyncMutex::new(()),
        }
    }

    // ── Read-only view ───────────────────────────────────────────────────

    pub fn has(&self, topic: &str) -> bool {
        self.lock_members().contains(topic)
    }

    pub fn len(&self) -> usize {
        self.lock_members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_members().is_empty()
    }

    /// A point-in-time copy of the subscription set.
    pub fn snapshot(&self) -> BTreeSet<String> {
        self.lock_members().clone()
    }

    // ── Operations ───────────────────────────────────────────────────────

    pub async fn subscribe(
        &self,
        topic: &str,
        opts: &TopicOptions,
    ) -> Result<SubscribeOutcome, TopicsError> {
        self.subscribe_many([topic], opts).await
    }

    pub async fn subscribe_many<I, T>(
        &self,
        topics: I,
        opts: &TopicOptions,
    ) -> Result<SubscribeOutcome, TopicsError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let add = self.validate_and_dedup(topics)?;
        let (added, _, total) = self.apply(Plan::Modify { add, remove: Vec::new() }, opts).await?;
        Ok(SubscribeOutcome { added, total })
    }

    pub async fn unsubscribe(
        &self,
        topic: &str,
        opts: &TopicOptions,
    ) -> Result<UnsubscribeOutcome, TopicsError> {
        self.unsubscribe_many([topic], opts).await
    }

    pub async fn unsubscribe_many<I, T>(
        &self,
        topics: I,
        opts: &TopicOptions,
    ) -> Result<UnsubscribeOutcome, TopicsError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let remove = self.validate_and_dedup(topics)?;
        let (_, removed, total) =
            self.apply(Plan::Modify { add: Vec::new(), remove }, opts).await?;
        Ok(UnsubscribeOutcome { removed, total })
    }

    /// Atomic replace: compute the delta against the current set and apply
    /// both directions in one all-or-nothing batch.
    pub async fn set<I, T>(&self, desired: I, opts: &TopicOptions) -> Result<SetOutcome, TopicsError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let desired = self.validate_and_dedup(desired)?;
        let (added, removed, total) = self.apply(Plan::Set { desired }, opts).await?;
        Ok(SetOutcome { added, removed, total })
    }

    /// Run a mutator over a draft of the set, then apply the resulting delta
    /// atomically.
    pub async fn update(
        &self,
        mutate: impl FnOnce(&mut BTreeSet<String>) + Send + 'static,
        opts: &TopicOptions,
    ) -> Result<SetOutcome, TopicsError> {
        let (added, removed, total) = self
            .apply(
                Plan::Update {
                    mutate: Box::new(mutate),
                },
                opts,
            )
            .await?;
        Ok(SetOutcome { added, removed, total })
    }

    pub async fn clear(&self, opts: &TopicOptions) -> Result<ClearOutcome, TopicsError> {
        let (_, removed, _) = self.apply(Plan::Clear, opts).await?;
        Ok(ClearOutcome { removed })
    }

    /// Wait until in-flight adapter operations for `topic` (or all topics)
    /// have settled.
    pub async fn settle(
        &self,
        topic: Option<&str>,
        opts: &TopicOptions,
    ) -> Result<(), TopicsError> {
        opts.check_not_cancelled()?;
        let settlements: Vec<Settlement> = {
            let in_flight = self.lock_in_flight();
            match topic {
                Some(topic) => in_flight.get(topic).cloned().unwrap_or_default(),
                None => in_flight.values().flatten().cloned().collect(),
            }
        };
        await_settlements(settlements, opts).await?;
        match topic {
            Some(topic) => {
                self.lock_in_flight().remove(topic);
            },
            None => self.lock_in_flight().clear(),
        }
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn lock_members(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.members.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, Vec<Settlement>>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn validate_topic(&self, topic: &str) -> Result<(), TopicsError> {
        if topic.len() > MAX_TOPIC_LENGTH || !self.config.pattern.is_match(topic) {
            return Err(TopicsError::InvalidTopic {
                topic: topic.to_string(),
            });
        }
        Ok(())
    }

    fn validate_and_dedup<I, T>(&self, topics: I) -> Result<Vec<String>, TopicsError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let mut deduped = Vec::new();
        for topic in topics {
            let topic = topic.into();
            self.validate_topic(&topic)?;
            if seen.insert(topic.clone()) {
                deduped.push(topic);
            }
        }
        Ok(deduped)
    }

    /// The batch engine: delta, capacity check, ordered adapter calls with
    /// reverse-order rollback, commit, confirmation.
    async fn apply(
        &self,
        plan: Plan,
        opts: &TopicOptions,
    ) -> Result<(usize, usize, usize), TopicsError> {
        opts.check_not_cancelled()?;
        let _serialized = self.op_lock.lock().await;
        opts.check_not_cancelled()?;

        let current = self.lock_members().clone();
        let (add, remove) = match plan {
            Plan::Modify { add, remove } => (
                add.into_iter().filter(|t| !current.contains(t)).collect::<Vec<_>>(),
                remove.into_iter().filter(|t| current.contains(t)).collect::<Vec<_>>(),
            ),
            Plan::Set { desired } => {
                let desired_set: BTreeSet<&String> = desired.iter().collect();
                let add = desired
                    .iter()
                    .filter(|t| !current.contains(*t))
                    .cloned()
                    .collect();
                let remove = current
                    .iter()
                    .filter(|t| !desired_set.contains(*t))
                    .cloned()
                    .collect();
                (add, remove)
            },
            Plan::Update { mutate } => {
                let mut draft = current.clone();
                mutate(&mut draft);
                for topic in draft.difference(&current) {
                    self.validate_topic(topic)?;
                }
                let add = draft.difference(&current).cloned().collect();
                let remove = current.difference(&draft).cloned().collect();
                (add, remove)
            },
            Plan::Clear => (Vec::new(), current.iter().cloned().collect()),
        };

        let resulting = current.len() + add.len() - remove.len();
        if resulting > self.config.max_topics_per_connection {
            return Err(TopicsError::LimitExceeded {
                limit: self.config.max_topics_per_connection,
                current: current.len(),
                requested: add.len(),
                resulting,
            });
        }

        if add.is_empty() && remove.is_empty() {
            return Ok((0, 0, current.len()));
        }

        // A pending operation on the same topic settles before this one
        // touches it.
        let prior: Vec<Settlement> = {
            let mut in_flight = self.lock_in_flight();
            remove
                .iter()
                .chain(add.iter())
                .filter_map(|topic| in_flight.remove(topic))
                .flatten()
                .collect()
        };
        for settlement in prior {
            let _ = settlement.await;
        }

        // Removals first: when the batch both frees and consumes capacity,
        // the adapter must see the frees before the new subscriptions.
        let mut applied: Vec<Applied> = Vec::with_capacity(add.len() + remove.len());
        for topic in &remove {
            match self.adapter.unsubscribe(&self.client_id, topic) {
                Ok(settlement) => applied.push(Applied {
                    kind: OpKind::Remove,
                    topic: topic.clone(),
                    settlement,
                }),
                Err(err) => {
                    self.undo_issued(&applied);
                    return Err(err.into());
                },
            }
        }
        for topic in &add {
            match self.adapter.subscribe(&self.client_id, topic) {
                Ok(settlement) => applied.push(Applied {
                    kind: OpKind::Add,
                    topic: topic.clone(),
                    settlement,
                }),
                Err(err) => {
                    self.undo_issued(&applied);
                    return Err(err.into());
                },
            }
        }

        // Every adapter call was issued; commit local state.
        let total = {
            let mut members = self.lock_members();
            for topic in &remove {
                members.remove(topic);
            }
            for topic in &add {
                members.insert(topic.clone());
            }
            members.len()
        };

        {
            let mut in_flight = self.lock_in_flight();
            for op in &applied {
                in_flight.insert(op.topic.clone(), vec![op.settlement.clone()]);
            }
        }

        if opts.confirm == Confirm::Settled {
            let settlements: Vec<Settlement> =
                applied.iter().map(|op| op.settlement.clone()).collect();
            match await_settlements(settlements, opts).await {
                Ok(()) => {
                    let mut in_flight = self.lock_in_flight();
                    for op in &applied {
                        in_flight.remove(&op.topic);
                    }
                },
                Err(err @ TopicsError::Adapter(_)) => {
                    // The platform refused a change after we committed it;
                    // restore both sides to the pre-operation state.
                    self.undo_issued(&applied);
                    let mut members = self.lock_members();
                    for op in applied.iter().rev() {
                        match op.kind {
                            OpKind::Add => {
                                members.remove(&op.topic);
                            },
                            OpKind::Remove => {
                                members.insert(op.topic.clone());
                            },
                        }
                    }
                    return Err(err);
                },
                // Timeout or abort: the operation stays committed and the
                // adapter calls run to their natural conclusion.
                Err(err) => return Err(err),
            }
        }

        Ok((add.len(), remove.len(), total))
    }

    /// Reverse-order rollback of issued adapter calls: undo additions first
    /// (freeing adapter capacity), then restore removals.
    fn undo_issued(&self, applied: &[Applied]) {
        for op in applied.iter().rev() {
            let result = match op.kind {
                OpKind::Add => self.adapter.unsubscribe(&self.client_id, &op.topic),
                OpKind::Remove => self.adapter.subscribe(&self.client_id, &op.topic),
            };
            if let Err(err) = result {
                warn!(
                    client_id = %self.client_id,
                    topic = %op.topic,
                    error = %err,
                    "rollback adapter call failed"
                );
            }
        }
    }
}

async fn await_settlements(
    settlements: Vec<Settlement>,
    opts: &TopicOptions,
) -> Result<(), TopicsError> {
    if settlements.is_empty() {
        return Ok(());
    }
    let timeout = async {
        match opts.timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        match &opts.signal {
            Some(signal) => signal.cancelled().await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        result = try_join_all(settlements) => result.map(|_| ()).map_err(TopicsError::from),
        () = timeout => Err(TopicsError::Timeout),
        () = cancelled => Err(TopicsError::Cancelled),
    }
}

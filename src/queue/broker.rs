//! Embedded queue broker backed by SQLite.
//!
//! A single actor task owns all queue state. Callers talk to it over an
//! unbounded command channel and wait on a oneshot reply, so delivery state
//! for any message is only ever touched by one task.
//!
//! Persistence rules:
//! - `enqueue` returns only after the row is committed
//! - `ack` deletes the row
//! - requeue rewrites the row's redelivery count and moves it to the tail
//! - dead-lettering moves the row to `dead_letters` in one transaction
//!
//! On startup every stored row is ready again, in its stored order.
//! Messages that were in flight when the broker stopped are redelivered.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::schema::{self, DeadLetters, QueueMessages};
use super::{
    DeadLetter, Delivery, DeliveryTag, EnqueueOptions, MessageQueue, NackOutcome, QueueConfig,
    QueueConsumer, QueueDepth, QueueError, QueueMessage, Result, Settler,
};

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Declare {
        queue: String,
        reply: Reply<()>,
    },
    Enqueue {
        queue: String,
        body: String,
        durable: bool,
        reply: Reply<()>,
    },
    Consume {
        queue: String,
        reply: Reply<QueueConsumer>,
    },
    Ack {
        tag: DeliveryTag,
        reply: Reply<()>,
    },
    Nack {
        tag: DeliveryTag,
        requeue: bool,
        reason: String,
        reply: Reply<NackOutcome>,
    },
    Release {
        tag: DeliveryTag,
    },
    Disconnect {
        queue: String,
        consumer: u64,
    },
    DeadLetters {
        queue: String,
        reply: Reply<Vec<DeadLetter>>,
    },
    Depth {
        queue: String,
        reply: Reply<QueueDepth>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Client side of the broker actor. Also settles deliveries.
#[derive(Clone)]
struct BrokerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl BrokerHandle {
    async fn request<T: Send>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| QueueError::Closed)?;
        response.await.map_err(|_| QueueError::Closed)?
    }
}

#[async_trait]
impl Settler for BrokerHandle {
    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        let tag = message.delivery_tag;
        self.request(|reply| Command::Ack { tag, reply }).await
    }

    async fn nack(
        &self,
        message: &QueueMessage,
        requeue: bool,
        reason: &str,
    ) -> Result<NackOutcome> {
        let tag = message.delivery_tag;
        let reason = reason.to_string();
        self.request(|reply| Command::Nack {
            tag,
            requeue,
            reason,
            reply,
        })
        .await
    }

    fn release(&self, message: &QueueMessage) {
        let tag = message.delivery_tag;
        if self.commands.send(Command::Release { tag }).is_err() {
            debug!(delivery_tag = %tag, "Broker gone, release skipped");
        }
    }
}

/// Durable queue broker persisted in a SQLite database.
pub struct SqliteQueue {
    handle: BrokerHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteQueue {
    /// Open (or create) the database at `config.path` and start the broker.
    pub async fn open(config: &QueueConfig) -> Result<Self> {
        if let Some(parent) = Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| QueueError::Connection(e.to_string()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        Self::start(options, config).await
    }

    /// Broker over a private in-memory database. Nothing survives shutdown.
    pub async fn open_in_memory(config: &QueueConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::start(options, config).await
    }

    async fn start(options: SqliteConnectOptions, config: &QueueConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        for statement in schema::create_statements() {
            sqlx::query(&statement).execute(&pool).await?;
        }

        let (commands, receiver) = mpsc::unbounded_channel();
        let mut broker = Broker {
            pool,
            commands: commands.downgrade(),
            max_redeliveries: config.max_redeliveries,
            ack_timeout: Duration::from_secs(config.ack_timeout_secs.max(1)),
            queues: HashMap::new(),
            inflight: HashMap::new(),
            next_tag: 0,
            next_seq: 1,
            next_consumer: 0,
        };
        let recovered = broker.load().await?;

        info!(
            recovered,
            max_redeliveries = config.max_redeliveries,
            ack_timeout_secs = config.ack_timeout_secs,
            "SQLite queue broker started"
        );

        let reap_interval = Duration::from_millis(config.reap_interval_ms.max(1));
        let task = tokio::spawn(broker.run(receiver, reap_interval));

        Ok(Self {
            handle: BrokerHandle { commands },
            task: Mutex::new(Some(task)),
        })
    }

    /// Stop the broker and close the database.
    ///
    /// Unsettled deliveries stay on disk and are redelivered on next open.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .handle
            .commands
            .send(Command::Shutdown { reply })
            .is_ok()
        {
            let _ = done.await;
        }

        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Queue broker task failed");
            }
        }
    }
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn declare(&self, queue: &str) -> Result<()> {
        let queue = queue.to_string();
        self.handle
            .request(|reply| Command::Declare { queue, reply })
            .await
    }

    #[tracing::instrument(name = "queue.enqueue", skip_all, fields(queue = %queue))]
    async fn enqueue(&self, queue: &str, body: &str, options: EnqueueOptions) -> Result<()> {
        let queue = queue.to_string();
        let body = body.to_string();
        self.handle
            .request(|reply| Command::Enqueue {
                queue,
                body,
                durable: options.durable,
                reply,
            })
            .await
    }

    async fn consume(&self, queue: &str) -> Result<QueueConsumer> {
        let queue = queue.to_string();
        self.handle
            .request(|reply| Command::Consume { queue, reply })
            .await
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        let queue = queue.to_string();
        self.handle
            .request(|reply| Command::DeadLetters { queue, reply })
            .await
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let queue = queue.to_string();
        self.handle
            .request(|reply| Command::Depth { queue, reply })
            .await
    }
}

// ============================================================================
// Broker actor
// ============================================================================

#[derive(Debug, Clone)]
struct StoredMessage {
    /// Row id. `None` for non-durable messages.
    id: Option<i64>,
    body: String,
    redelivery_count: u32,
}

struct ConsumerSlot {
    id: u64,
    sender: mpsc::Sender<Delivery>,
    /// Holding an unsettled delivery.
    busy: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

impl QueueState {
    /// Next idle consumer, round-robin, ignoring consumers in `skip`.
    fn next_idle(&mut self, skip: &HashSet<u64>) -> Option<usize> {
        let count = self.consumers.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            let slot = &self.consumers[index];
            if !slot.busy && !skip.contains(&slot.id) {
                self.cursor = (index + 1) % count;
                return Some(index);
            }
        }
        None
    }

    fn free(&mut self, consumer: u64) {
        if let Some(slot) = self.consumers.iter_mut().find(|c| c.id == consumer) {
            slot.busy = false;
        }
    }
}

struct InFlight {
    queue: String,
    consumer: u64,
    message: StoredMessage,
    delivered_at: Instant,
}

struct Broker {
    pool: SqlitePool,
    /// Weak so the broker's own deliveries do not keep it alive.
    commands: mpsc::WeakUnboundedSender<Command>,
    max_redeliveries: u32,
    ack_timeout: Duration,
    queues: HashMap<String, QueueState>,
    inflight: HashMap<DeliveryTag, InFlight>,
    next_tag: u64,
    next_seq: i64,
    next_consumer: u64,
}

impl Broker {
    /// Load stored messages. Returns how many were recovered.
    async fn load(&mut self) -> Result<usize> {
        let select = Query::select()
            .columns([
                QueueMessages::Id,
                QueueMessages::Queue,
                QueueMessages::Body,
                QueueMessages::RedeliveryCount,
                QueueMessages::Seq,
            ])
            .from(QueueMessages::Table)
            .order_by(QueueMessages::Seq, Order::Asc)
            .order_by(QueueMessages::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        let recovered = rows.len();

        for row in rows {
            let queue: String = row.try_get("queue")?;
            let seq: i64 = row.try_get("seq")?;
            let count: i64 = row.try_get("redelivery_count")?;
            self.next_seq = self.next_seq.max(seq + 1);
            self.queues
                .entry(queue)
                .or_default()
                .ready
                .push_back(StoredMessage {
                    id: Some(row.try_get("id")?),
                    body: row.try_get("body")?,
                    redelivery_count: count.max(0) as u32,
                });
        }

        Ok(recovered)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, reap_interval: Duration) {
        let mut reaper = tokio::time::interval(reap_interval);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.pool.close().await;
                        let _ = reply.send(());
                        info!("SQLite queue broker shut down");
                        return;
                    }
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = reaper.tick() => self.reap_expired().await,
            }
        }

        self.pool.close().await;
        debug!("All queue handles dropped, broker stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Declare { queue, reply } => {
                self.queues.entry(queue).or_default();
                let _ = reply.send(Ok(()));
            }
            Command::Enqueue {
                queue,
                body,
                durable,
                reply,
            } => {
                let result = self.enqueue(&queue, body, durable).await;
                let _ = reply.send(result);
                self.dispatch(&queue);
            }
            Command::Consume { queue, reply } => {
                let consumer = self.attach(&queue);
                let _ = reply.send(Ok(consumer));
                self.dispatch(&queue);
            }
            Command::Ack { tag, reply } => {
                match self.ack(tag).await {
                    Ok(queue) => {
                        let _ = reply.send(Ok(()));
                        self.dispatch(&queue);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Nack {
                tag,
                requeue,
                reason,
                reply,
            } => {
                let result = self.nack(tag, requeue, &reason).await;
                let queue = result.as_ref().ok().map(|(q, _)| q.clone());
                let _ = reply.send(result.map(|(_, outcome)| outcome));
                if let Some(queue) = queue {
                    self.dispatch(&queue);
                }
            }
            Command::Release { tag } => {
                if let Some(queue) = self.release(tag, "consumer released delivery").await {
                    self.dispatch(&queue);
                }
            }
            Command::Disconnect { queue, consumer } => {
                self.disconnect(&queue, consumer).await;
                self.dispatch(&queue);
            }
            Command::DeadLetters { queue, reply } => {
                let _ = reply.send(self.dead_letters(&queue).await);
            }
            Command::Depth { queue, reply } => {
                let _ = reply.send(Ok(self.depth(&queue)));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn take_seq(&mut self) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    async fn enqueue(&mut self, queue: &str, body: String, durable: bool) -> Result<()> {
        let id = if durable {
            let seq = self.take_seq();
            let insert = Query::insert()
                .into_table(QueueMessages::Table)
                .columns([
                    QueueMessages::Queue,
                    QueueMessages::Body,
                    QueueMessages::RedeliveryCount,
                    QueueMessages::Seq,
                    QueueMessages::EnqueuedAt,
                ])
                .values_panic([
                    queue.into(),
                    body.as_str().into(),
                    0i32.into(),
                    seq.into(),
                    Utc::now().to_rfc3339().into(),
                ])
                .to_string(SqliteQueryBuilder);

            let result = sqlx::query(&insert).execute(&self.pool).await?;
            Some(result.last_insert_rowid())
        } else {
            None
        };

        debug!(queue, id = ?id, durable, "Message enqueued");
        self.queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(StoredMessage {
                id,
                body,
                redelivery_count: 0,
            });
        Ok(())
    }

    fn attach(&mut self, queue: &str) -> QueueConsumer {
        self.next_consumer += 1;
        let id = self.next_consumer;
        let (sender, receiver) = mpsc::channel(1);

        let state = self.queues.entry(queue.to_string()).or_default();
        state.consumers.push(ConsumerSlot {
            id,
            sender,
            busy: false,
        });
        info!(queue, consumer = id, consumers = state.consumers.len(), "Consumer attached");

        let commands = self.commands.clone();
        let queue_name = queue.to_string();
        let on_close = move || {
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Disconnect {
                    queue: queue_name,
                    consumer: id,
                });
            }
        };

        QueueConsumer::new(queue, receiver, Some(Box::new(on_close)))
    }

    /// Hand ready messages to idle consumers.
    fn dispatch(&mut self, queue: &str) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let settler: Arc<dyn Settler> = Arc::new(BrokerHandle { commands });
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };

        // Consumers whose channel still buffers a delivery reclaimed by the
        // reaper. They are idle but cannot take another message yet.
        let mut full = HashSet::new();

        while !state.ready.is_empty() {
            let Some(index) = state.next_idle(&full) else {
                break;
            };
            let Some(message) = state.ready.pop_front() else {
                break;
            };

            self.next_tag += 1;
            let tag = DeliveryTag(self.next_tag);
            let delivery = Delivery::new(
                QueueMessage {
                    queue: queue.to_string(),
                    body: message.body.clone(),
                    delivery_tag: tag,
                    redelivery_count: message.redelivery_count,
                },
                Arc::clone(&settler),
            );

            let slot = &mut state.consumers[index];
            match slot.sender.try_send(delivery) {
                Ok(()) => {
                    slot.busy = true;
                    debug!(queue, delivery_tag = %tag, consumer = slot.id, "Message delivered");
                    self.inflight.insert(
                        tag,
                        InFlight {
                            queue: queue.to_string(),
                            consumer: slot.id,
                            message,
                            delivered_at: Instant::now(),
                        },
                    );
                }
                Err(mpsc::error::TrySendError::Full(delivery)) => {
                    delivery.disarm();
                    state.ready.push_front(message);
                    full.insert(slot.id);
                    debug!(queue, consumer = slot.id, "Consumer channel full, trying next");
                }
                Err(mpsc::error::TrySendError::Closed(delivery)) => {
                    delivery.disarm();
                    let consumer = slot.id;
                    state.consumers.remove(index);
                    state.ready.push_front(message);
                    debug!(queue, consumer, "Dropped closed consumer during dispatch");
                }
            }
        }
    }

    /// Returns the queue the acked message belonged to.
    async fn ack(&mut self, tag: DeliveryTag) -> Result<String> {
        let flight = self
            .inflight
            .remove(&tag)
            .ok_or(QueueError::UnknownDeliveryTag(tag))?;

        if let Some(id) = flight.message.id {
            let delete = Query::delete()
                .from_table(QueueMessages::Table)
                .and_where(Expr::col(QueueMessages::Id).eq(id))
                .to_string(SqliteQueryBuilder);

            if let Err(e) = sqlx::query(&delete).execute(&self.pool).await {
                error!(delivery_tag = %tag, error = %e, "Failed to remove acked message");
                self.inflight.insert(tag, flight);
                return Err(e.into());
            }
        }

        debug!(queue = %flight.queue, delivery_tag = %tag, "Message acked");
        self.free_consumer(&flight);
        Ok(flight.queue)
    }

    async fn nack(
        &mut self,
        tag: DeliveryTag,
        requeue: bool,
        reason: &str,
    ) -> Result<(String, NackOutcome)> {
        let flight = self
            .inflight
            .remove(&tag)
            .ok_or(QueueError::UnknownDeliveryTag(tag))?;

        match self.settle_negative(&flight, requeue, reason).await {
            Ok(outcome) => {
                self.free_consumer(&flight);
                Ok((flight.queue, outcome))
            }
            Err(e) => {
                self.inflight.insert(tag, flight);
                Err(e)
            }
        }
    }

    /// Requeue an unsettled delivery on behalf of a consumer that went away
    /// or timed out. Counts toward the redelivery ceiling.
    async fn release(&mut self, tag: DeliveryTag, reason: &str) -> Option<String> {
        let flight = self.inflight.remove(&tag)?;
        self.free_consumer(&flight);

        if let Err(e) = self.settle_negative(&flight, true, reason).await {
            // Row is unchanged on disk; keep the message deliverable.
            error!(delivery_tag = %tag, error = %e, "Failed to persist release, requeueing in memory");
            self.queues
                .entry(flight.queue.clone())
                .or_default()
                .ready
                .push_front(flight.message);
        }
        Some(flight.queue)
    }

    async fn disconnect(&mut self, queue: &str, consumer: u64) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.consumers.retain(|c| c.id != consumer);
        }

        let held: Vec<DeliveryTag> = self
            .inflight
            .iter()
            .filter(|(_, f)| f.consumer == consumer && f.queue == queue)
            .map(|(tag, _)| *tag)
            .collect();

        info!(queue, consumer, held = held.len(), "Consumer disconnected");
        for tag in held {
            self.release(tag, "consumer disconnected").await;
        }
    }

    async fn reap_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<(DeliveryTag, String)> = self
            .inflight
            .iter()
            .filter(|(_, f)| now.duration_since(f.delivered_at) >= self.ack_timeout)
            .map(|(tag, f)| (*tag, f.queue.clone()))
            .collect();

        for (tag, queue) in expired {
            warn!(
                queue = %queue,
                delivery_tag = %tag,
                ack_timeout_secs = self.ack_timeout.as_secs(),
                "Delivery not settled within ack timeout, requeueing"
            );
            self.release(tag, "ack timeout").await;
        }

        // Also retries messages that an earlier pass could only offer to
        // consumers with a full channel.
        let queues: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, state)| !state.ready.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        for queue in queues {
            self.dispatch(&queue);
        }
    }

    fn free_consumer(&mut self, flight: &InFlight) {
        if let Some(state) = self.queues.get_mut(&flight.queue) {
            state.free(flight.consumer);
        }
    }

    /// Requeue or dead-letter. Nothing in memory changes unless the write
    /// succeeds.
    async fn settle_negative(
        &mut self,
        flight: &InFlight,
        requeue: bool,
        reason: &str,
    ) -> Result<NackOutcome> {
        let next_count = flight.message.redelivery_count + 1;

        if requeue && next_count <= self.max_redeliveries {
            let seq = self.take_seq();
            if let Some(id) = flight.message.id {
                let update = Query::update()
                    .table(QueueMessages::Table)
                    .value(QueueMessages::RedeliveryCount, next_count)
                    .value(QueueMessages::Seq, seq)
                    .and_where(Expr::col(QueueMessages::Id).eq(id))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&update).execute(&self.pool).await?;
            }

            debug!(
                queue = %flight.queue,
                redelivery_count = next_count,
                reason,
                "Message requeued"
            );
            self.queues
                .entry(flight.queue.clone())
                .or_default()
                .ready
                .push_back(StoredMessage {
                    id: flight.message.id,
                    body: flight.message.body.clone(),
                    redelivery_count: next_count,
                });
            return Ok(NackOutcome::Requeued {
                redelivery_count: next_count,
            });
        }

        let reason = if requeue {
            format!(
                "redelivery limit of {} exceeded: {}",
                self.max_redeliveries, reason
            )
        } else {
            reason.to_string()
        };

        let insert = Query::insert()
            .into_table(DeadLetters::Table)
            .columns([
                DeadLetters::Queue,
                DeadLetters::Body,
                DeadLetters::Reason,
                DeadLetters::RedeliveryCount,
                DeadLetters::DeadLetteredAt,
            ])
            .values_panic([
                flight.queue.as_str().into(),
                flight.message.body.as_str().into(),
                reason.as_str().into(),
                flight.message.redelivery_count.into(),
                Utc::now().to_rfc3339().into(),
            ])
            .to_string(SqliteQueryBuilder);

        let mut tx = self.pool.begin().await?;
        sqlx::query(&insert).execute(&mut *tx).await?;
        if let Some(id) = flight.message.id {
            let delete = Query::delete()
                .from_table(QueueMessages::Table)
                .and_where(Expr::col(QueueMessages::Id).eq(id))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&delete).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        error!(
            queue = %flight.queue,
            redelivery_count = flight.message.redelivery_count,
            reason = %reason,
            body = %flight.message.body,
            "Message dead-lettered"
        );
        Ok(NackOutcome::DeadLettered)
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        let select = Query::select()
            .columns([
                DeadLetters::Queue,
                DeadLetters::Body,
                DeadLetters::Reason,
                DeadLetters::RedeliveryCount,
                DeadLetters::DeadLetteredAt,
            ])
            .from(DeadLetters::Table)
            .and_where(Expr::col(DeadLetters::Queue).eq(queue))
            .order_by(DeadLetters::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let at: String = row.try_get("dead_lettered_at")?;
                let count: i64 = row.try_get("redelivery_count")?;
                Ok(DeadLetter {
                    queue: row.try_get("queue")?,
                    body: row.try_get("body")?,
                    reason: row.try_get("reason")?,
                    redelivery_count: count.max(0) as u32,
                    dead_lettered_at: parse_timestamp(&at)?,
                })
            })
            .collect()
    }

    fn depth(&mut self, queue: &str) -> QueueDepth {
        let unacked = self.inflight.values().filter(|f| f.queue == queue).count();
        match self.queues.get_mut(queue) {
            Some(state) => {
                state.consumers.retain(|c| !c.sender.is_closed());
                QueueDepth {
                    ready: state.ready.len(),
                    unacked,
                    consumers: state.consumers.len(),
                }
            }
            None => QueueDepth {
                unacked,
                ..Default::default()
            },
        }
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QueueError::Persistence(sqlx::Error::Decode(Box::new(e))))
}

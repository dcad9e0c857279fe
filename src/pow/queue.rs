//! Serialized proof-of-work send queue
//!
//! One worker task runs one job at a time; each job is internally parallel
//! through the engine. Finished objects are stored in the inventory and their
//! vectors handed to the gossip channel. Jobs for recipients whose public key
//! is unknown are parked until a matching pubkey object is discovered.

use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use super::engine::{nonce, PowError, ProofOfWorkEngine};
use crate::core::{
    unix_time, BitmessageAddress, GetPubkey, InventoryVector, ObjectMessage, ObjectPayload,
    ObjectType, Pubkey, DAY,
};
use crate::crypto::CryptoError;
use crate::storage::Inventory;

pub type JobId = u64;

/// Builds the object to send once the recipient's public key is known
pub type ObjectBuilder =
    Box<dyn FnOnce(&Pubkey) -> Result<ObjectMessage, CryptoError> + Send + Sync + 'static>;

/// Lifetime of the pubkey requests sent for parked jobs
const PUBKEY_REQUEST_TTL: i64 = 2 * DAY;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    /// Waiting for the recipient's public key
    PubkeyRequested,
    Queued,
    DoingProofOfWork,
    Sent,
    Failed,
}

/// Status change of a job
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub id: JobId,
    pub status: JobStatus,
    pub inventory_vector: Option<InventoryVector>,
}

struct Job {
    id: JobId,
    object: ObjectMessage,
    nonce_trials_per_byte: u64,
    extra_bytes: u64,
}

struct ParkedJob {
    recipient: BitmessageAddress,
    build: ObjectBuilder,
}

/// State shared between the queue handle and its worker task
struct Shared {
    engine: Arc<dyn ProofOfWorkEngine>,
    inventory: Arc<dyn Inventory>,
    gossip: mpsc::UnboundedSender<InventoryVector>,
    statuses: DashMap<JobId, JobStatus>,
    events: broadcast::Sender<JobEvent>,
}

impl Shared {
    fn set_status(&self, id: JobId, status: JobStatus, inventory_vector: Option<InventoryVector>) {
        self.statuses.insert(id, status);
        // Nobody listening is fine
        let _ = self.events.send(JobEvent {
            id,
            status,
            inventory_vector,
        });
    }

    async fn process(&self, job: Job) {
        self.set_status(job.id, JobStatus::DoingProofOfWork, None);

        let mut object = job.object;
        let target = object.target(job.nonce_trials_per_byte, job.extra_bytes, unix_time());
        match nonce(self.engine.as_ref(), object.initial_hash(), target).await {
            Ok(found) => {
                object.nonce = found;
                let vector = object.inventory_vector();
                self.inventory.put(&object);
                if self.gossip.send(vector).is_err() {
                    warn!("Gossip channel closed, object {} is only stored locally", vector);
                }
                info!("Proof of work done for job {} ({})", job.id, vector);
                self.set_status(job.id, JobStatus::Sent, Some(vector));
            }
            Err(e) => {
                warn!("Proof of work for job {} failed: {}", job.id, e);
                self.set_status(job.id, JobStatus::Failed, None);
            }
        }
    }
}

/// Handle to the proof-of-work send queue
pub struct PowQueue {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<Job>,
    parked: DashMap<JobId, ParkedJob>,
    next_id: AtomicU64,
    min_nonce_trials_per_byte: u64,
    min_extra_bytes: u64,
}

impl PowQueue {
    /// Spawn the worker task. Jobs never run with less difficulty than the
    /// given minimums, which should match what the network accepts.
    pub fn start(
        engine: Arc<dyn ProofOfWorkEngine>,
        inventory: Arc<dyn Inventory>,
        gossip: mpsc::UnboundedSender<InventoryVector>,
        min_nonce_trials_per_byte: u64,
        min_extra_bytes: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            engine,
            inventory,
            gossip,
            statuses: DashMap::new(),
            events,
        });
        let (jobs, mut receiver) = mpsc::unbounded_channel::<Job>();

        let worker = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                worker.process(job).await;
            }
            debug!("Proof of work queue stopped");
        });

        Self {
            shared,
            jobs,
            parked: DashMap::new(),
            next_id: AtomicU64::new(1),
            min_nonce_trials_per_byte,
            min_extra_bytes,
        }
    }

    fn next_id(&self) -> JobId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(
        &self,
        id: JobId,
        object: ObjectMessage,
        nonce_trials_per_byte: u64,
        extra_bytes: u64,
    ) -> Result<(), PowError> {
        let job = Job {
            id,
            object,
            nonce_trials_per_byte: nonce_trials_per_byte.max(self.min_nonce_trials_per_byte),
            extra_bytes: extra_bytes.max(self.min_extra_bytes),
        };
        self.shared.set_status(id, JobStatus::Queued, None);
        self.jobs.send(job).map_err(|_| {
            self.shared.set_status(id, JobStatus::Failed, None);
            PowError::QueueClosed
        })
    }

    /// Queue an object for proof of work; returns immediately
    pub fn submit(
        &self,
        object: ObjectMessage,
        nonce_trials_per_byte: u64,
        extra_bytes: u64,
    ) -> Result<JobId, PowError> {
        let id = self.next_id();
        self.enqueue(id, object, nonce_trials_per_byte, extra_bytes)?;
        Ok(id)
    }

    /// Queue an object addressed to `recipient`, built with the recipient's
    /// public key. Without a known key the job is parked and a pubkey request
    /// is queued instead.
    pub fn submit_for(
        &self,
        recipient: &BitmessageAddress,
        build: ObjectBuilder,
    ) -> Result<JobId, PowError> {
        let id = self.next_id();
        if let Some(pubkey) = recipient.pubkey() {
            let object = build(pubkey)?;
            self.enqueue(id, object, pubkey.nonce_trials_per_byte, pubkey.extra_bytes)?;
            return Ok(id);
        }

        debug!("Public key of {} unknown, parking job {}", recipient, id);
        self.parked.insert(
            id,
            ParkedJob {
                recipient: recipient.clone(),
                build,
            },
        );
        self.shared.set_status(id, JobStatus::PubkeyRequested, None);

        let request = ObjectMessage::with_payload(
            unix_time() + PUBKEY_REQUEST_TTL,
            recipient.stream(),
            &ObjectPayload::GetPubkey(GetPubkey::for_address(recipient)),
        );
        self.submit(request, 0, 0)?;
        Ok(id)
    }

    /// Release parked jobs whose recipient published `object`; returns how
    /// many were released
    pub fn pubkey_discovered(&self, object: &ObjectMessage) -> usize {
        if object.kind() != Some(ObjectType::Pubkey) {
            return 0;
        }

        let matching: Vec<(JobId, Pubkey)> = self
            .parked
            .iter()
            .filter_map(|entry| {
                Pubkey::from_object(object, &entry.value().recipient)
                    .ok()
                    .map(|pubkey| (*entry.key(), pubkey))
            })
            .collect();

        let mut released = 0;
        for (id, pubkey) in matching {
            // Another caller may have released it in the meantime
            let Some((_, job)) = self.parked.remove(&id) else {
                continue;
            };
            released += 1;
            let result = (job.build)(&pubkey).map_err(PowError::from).and_then(|built| {
                self.enqueue(id, built, pubkey.nonce_trials_per_byte, pubkey.extra_bytes)
            });
            if let Err(e) = result {
                warn!("Cannot send parked job {}: {}", id, e);
                self.shared.set_status(id, JobStatus::Failed, None);
            }
        }
        released
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.shared.statuses.get(&id).map(|status| *status)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Behavior, MINUTE};
    use crate::pow::{MultiThreadedPowEngine, SimplePowEngine};
    use crate::storage::MemoryInventory;
    use std::time::Duration;
    use tokio::time::timeout;

    fn queue() -> (
        PowQueue,
        Arc<MemoryInventory>,
        mpsc::UnboundedReceiver<InventoryVector>,
    ) {
        let inventory = Arc::new(MemoryInventory::new());
        let (gossip, gossip_rx) = mpsc::unbounded_channel();
        let queue = PowQueue::start(
            Arc::new(MultiThreadedPowEngine::with_workers(2)),
            inventory.clone(),
            gossip,
            1,
            1,
        );
        (queue, inventory, gossip_rx)
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<JobEvent>,
        id: JobId,
        status: JobStatus,
    ) -> JobEvent {
        timeout(Duration::from_secs(30), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.id == id && event.status == status {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_stores_and_gossips() {
        let (queue, inventory, mut gossip) = queue();
        let mut events = queue.subscribe();

        let object = ObjectMessage::new(unix_time() + 10 * MINUTE, 42, 1, 1, b"hello".to_vec());
        let id = queue.submit(object, 1, 1).unwrap();

        let sent = wait_for(&mut events, id, JobStatus::Sent).await;
        let vector = sent.inventory_vector.unwrap();
        assert_eq!(queue.status(id), Some(JobStatus::Sent));
        assert_eq!(gossip.recv().await, Some(vector));

        let stored = inventory.get(&vector).unwrap();
        assert!(stored.validate(&[1], 1, 1, unix_time()).is_ok());
    }

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let (queue, _inventory, mut gossip) = queue();
        let mut events = queue.subscribe();

        let first = queue
            .submit(ObjectMessage::new(unix_time() + MINUTE * 10, 42, 1, 1, vec![1]), 1, 1)
            .unwrap();
        let second = queue
            .submit(ObjectMessage::new(unix_time() + MINUTE * 10, 42, 1, 1, vec![2]), 1, 1)
            .unwrap();

        let first_sent = wait_for(&mut events, first, JobStatus::Sent).await;
        assert_eq!(gossip.recv().await, first_sent.inventory_vector);
        let second_sent = wait_for(&mut events, second, JobStatus::Sent).await;
        assert_eq!(gossip.recv().await, second_sent.inventory_vector);
    }

    #[tokio::test]
    async fn test_unknown_recipient_parks_job_until_pubkey_arrives() {
        let (queue, inventory, _gossip) = queue();
        let mut events = queue.subscribe();

        let identity = BitmessageAddress::new_identity(1, Behavior::DOES_ACK, false, 1, 1);
        let recipient: BitmessageAddress = identity.to_string().parse().unwrap();

        let id = queue
            .submit_for(
                &recipient,
                Box::new(|pubkey: &Pubkey| -> Result<ObjectMessage, CryptoError> {
                    Ok(ObjectMessage::new(
                        unix_time() + 10 * MINUTE,
                        42,
                        1,
                        pubkey.stream,
                        b"for you".to_vec(),
                    ))
                }),
            )
            .unwrap();
        assert_eq!(queue.status(id), Some(JobStatus::PubkeyRequested));
        assert_eq!(queue.parked_count(), 1);

        // Unrelated objects release nothing
        let unrelated = ObjectMessage::new(unix_time() + MINUTE, 42, 1, 1, vec![]);
        assert_eq!(queue.pubkey_discovered(&unrelated), 0);

        let pubkey_object = identity
            .pubkey()
            .unwrap()
            .to_object(identity.private_key().unwrap(), unix_time() + DAY)
            .unwrap();
        assert_eq!(queue.pubkey_discovered(&pubkey_object), 1);
        assert_eq!(queue.parked_count(), 0);

        let sent = wait_for(&mut events, id, JobStatus::Sent).await;
        assert!(inventory.contains(&sent.inventory_vector.unwrap()));
        // The getpubkey request went out as well
        assert_eq!(inventory.query(1, Some(4), Some(0)).len(), 1);
    }

    #[tokio::test]
    async fn test_known_recipient_is_sent_directly() {
        let inventory = Arc::new(MemoryInventory::new());
        let (gossip, _gossip_rx) = mpsc::unbounded_channel();
        let queue = PowQueue::start(Arc::new(SimplePowEngine::new()), inventory, gossip, 1, 1);
        let mut events = queue.subscribe();

        let mut recipient = BitmessageAddress::new_identity(1, Behavior::empty(), false, 1, 1);
        let pubkey = recipient.pubkey().unwrap().clone();
        recipient.set_pubkey(pubkey).unwrap();

        let id = queue
            .submit_for(
                &recipient,
                Box::new(|_: &Pubkey| -> Result<ObjectMessage, CryptoError> {
                    Ok(ObjectMessage::new(unix_time() + MINUTE, 42, 1, 1, vec![]))
                }),
            )
            .unwrap();
        assert_eq!(queue.parked_count(), 0);
        wait_for(&mut events, id, JobStatus::Sent).await;
    }
}

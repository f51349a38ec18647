//! Identity client against in-process stand-ins for the service:
//! `QuorumService` keeps real per-identity state and counts signed votes,
//! `Scripted` plays back a fixed list of replies.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use collective_crypto::verify;
use collective_identity::{Identity, IdentityError, IdentityState};
use collective_network::{RequestClient, TransportError};
use collective_protocol::messages::*;
use collective_protocol::{
    Envelope, Message, MessageCatalog, Packet, PacketTypeId, ProtocolError, Roster, ServerIdentity,
};

fn roster() -> Roster {
    Roster::new(
        (0..3)
            .map(|i| ServerIdentity::new(format!("10.2.0.{i}:7770"), Default::default()))
            .collect(),
    )
}

fn catalog() -> MessageCatalog {
    let catalog = MessageCatalog::new();
    collective_identity::register_messages(&catalog).unwrap();
    catalog
}

fn envelope<T: Message>(msg: &T) -> Envelope {
    Envelope::new(msg).unwrap()
}

fn service_error(message: &str) -> Envelope {
    envelope(&ServiceError {
        message: message.into(),
    })
}

// ============================================================================
// Stateful stand-in
// ============================================================================

struct Ledger {
    config: Config,
    proposed: Option<Config>,
    votes: BTreeSet<String>,
    blocks: Vec<SkipBlock>,
}

#[derive(Default)]
struct QuorumService {
    identities: Mutex<HashMap<IdentityId, Ledger>>,
    requests: Mutex<Vec<PacketTypeId>>,
}

impl QuorumService {
    fn count<T: Message>(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|t| **t == T::packet_type())
            .count()
    }

    fn handle(&self, request: Envelope) -> Envelope {
        let mut identities = self.identities.lock().unwrap();

        if let Ok(add) = request.decode::<AddIdentity>() {
            let root = SkipBlock::new(0, vec![], b"root".to_vec(), vec![]);
            let data = SkipBlock::new(0, vec![], serde_json::to_vec(&add.config).unwrap(), vec![]);
            identities.insert(
                IdentityId(data.hash.clone()),
                Ledger {
                    config: add.config,
                    proposed: None,
                    votes: BTreeSet::new(),
                    blocks: vec![data.clone()],
                },
            );
            return envelope(&AddIdentityReply { root, data });
        }

        if let Ok(get) = request.decode::<GetLatestBlock>() {
            return match identities
                .values()
                .find(|l| l.blocks.iter().any(|b| b.hash == get.id))
            {
                Some(ledger) => envelope(&GetLatestBlockReply {
                    latest: ledger.blocks.last().unwrap().clone(),
                }),
                None => service_error("unknown block"),
            };
        }

        if let Ok(store) = request.decode::<StoreSkipBlock>() {
            let Some(ledger) = identities
                .values_mut()
                .find(|l| l.blocks.last().map(|b| &b.hash) == Some(&store.latest_id))
            else {
                return service_error("not the latest block");
            };
            let block = ledger.append(store.data, store.signers);
            return envelope(&StoreSkipBlockReply { block });
        }

        if let Ok(cu) = request.decode::<ConfigUpdate>() {
            return match identities.get(&cu.id) {
                Some(ledger) => envelope(&ConfigUpdate {
                    id: cu.id,
                    config: Some(ledger.config.clone()),
                }),
                None => service_error("unknown identity"),
            };
        }

        if let Ok(ps) = request.decode::<ProposeSend>() {
            let Some(ledger) = identities.get_mut(&ps.id) else {
                return service_error("unknown identity");
            };
            ledger.proposed = Some(ps.config.clone());
            ledger.votes.clear();
            return envelope(&ps);
        }

        if let Ok(pf) = request.decode::<ProposeFetch>() {
            return match identities.get(&pf.id) {
                Some(ledger) => envelope(&ProposeFetch {
                    id: pf.id,
                    config: ledger.proposed.clone(),
                }),
                None => service_error("unknown identity"),
            };
        }

        if let Ok(pv) = request.decode::<ProposeVote>() {
            let Some(ledger) = identities.get_mut(&pv.id) else {
                return service_error("unknown identity");
            };
            return ledger.vote(pv);
        }

        service_error("unsupported request")
    }
}

impl Ledger {
    fn append(&mut self, data: Vec<u8>, signers: Vec<collective_crypto::PublicKey>) -> SkipBlock {
        let prev = self.blocks.last().unwrap();
        let block = SkipBlock::new(prev.index + 1, prev.hash.clone(), data, signers);
        self.blocks.push(block.clone());
        block
    }

    fn vote(&mut self, pv: ProposeVote) -> Envelope {
        let Some(proposed) = self.proposed.clone() else {
            return service_error("nothing proposed");
        };
        let Some(device) = proposed.devices.get(&pv.signer) else {
            return service_error("unknown signer");
        };
        if !verify(&device.public, &proposed.hash(), &pv.signature) {
            return service_error("bad signature");
        }
        self.votes.insert(pv.signer);
        if (self.votes.len() as u32) < self.config.majority {
            return envelope(&ProposeVoteReply { block: None });
        }

        let signers = self
            .votes
            .iter()
            .filter_map(|a| proposed.devices.get(a).map(|d| d.public.clone()))
            .collect();
        let block = self.append(serde_json::to_vec(&proposed).unwrap(), signers);
        self.config = proposed;
        self.proposed = None;
        self.votes.clear();
        envelope(&ProposeVoteReply { block: Some(block) })
    }
}

impl RequestClient for QuorumService {
    async fn send(&self, to: &ServerIdentity, request: Envelope) -> Result<Packet, TransportError> {
        self.requests.lock().unwrap().push(request.msg_type);
        Ok(Packet::new(to.clone(), self.handle(request)))
    }
}

// ============================================================================
// Scripted stand-in
// ============================================================================

#[derive(Default)]
struct Scripted {
    replies: Mutex<VecDeque<Result<Envelope, TransportError>>>,
    sent: Mutex<Vec<PacketTypeId>>,
}

impl Scripted {
    fn with(replies: Vec<Result<Envelope, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<PacketTypeId> {
        self.sent.lock().unwrap().clone()
    }
}

impl RequestClient for Scripted {
    async fn send(&self, to: &ServerIdentity, request: Envelope) -> Result<Packet, TransportError> {
        self.sent.lock().unwrap().push(request.msg_type);
        let next = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("request beyond the script");
        next.map(|reply| Packet::new(to.clone(), reply))
    }
}

fn created_reply() -> Envelope {
    let data = SkipBlock::new(0, vec![], b"data".to_vec(), vec![]);
    envelope(&AddIdentityReply {
        root: SkipBlock::new(0, vec![], b"root".to_vec(), vec![]),
        data,
    })
}

fn proposal_ack() -> Envelope {
    envelope(&ProposeSend {
        id: IdentityId::default(),
        config: Config::new(1, Default::default(), "x"),
    })
}

fn timeout() -> Result<Envelope, TransportError> {
    Err(TransportError::Timeout("10.2.0.1:7770".into()))
}

// ============================================================================
// Propose / vote / finalize
// ============================================================================

#[tokio::test]
async fn test_two_device_majority() {
    let service = Arc::new(QuorumService::default());

    let mut alice = Identity::new(service.clone(), roster(), 2, "alice").unwrap();
    assert_eq!(alice.state(), IdentityState::Uninitialized);
    alice.create_identity().await.unwrap();
    assert_eq!(alice.state(), IdentityState::Active);
    let id = alice.id().unwrap().clone();
    assert_eq!(id.0, alice.data_block().unwrap().hash);
    assert!(alice.root_block().is_some());

    // Bob asks to join; the accepted config is still alice alone.
    let mut bob = Identity::new(service.clone(), roster(), 2, "bob").unwrap();
    bob.attach_to_identity(id.clone()).await.unwrap();
    assert_eq!(bob.state(), IdentityState::ProposalPending);
    assert_eq!(bob.config(), alice.config());
    let proposal = bob.proposed().unwrap().clone();
    assert!(proposal.contains_account("alice"));
    assert!(proposal.contains_account("bob"));

    // First vote: threshold not reached, nothing accepted yet.
    alice.propose_fetch().await.unwrap();
    assert_eq!(alice.proposed(), Some(&proposal));
    assert!(!alice.propose_vote(true).await.unwrap());
    assert_eq!(alice.config().devices.len(), 1);
    assert_eq!(alice.state(), IdentityState::ProposalPending);

    // Second vote finalizes.
    assert!(bob.propose_vote(true).await.unwrap());
    assert_eq!(bob.config(), &proposal);
    assert!(bob.proposed().is_none());
    assert_eq!(bob.state(), IdentityState::Active);
    let block = bob.data_block().unwrap().clone();
    assert_eq!(block.index, 1);
    assert_eq!(block.signers.len(), 2);

    // Alice catches up through the service.
    alice.config_update().await.unwrap();
    alice.propose_fetch().await.unwrap();
    assert_eq!(alice.config(), &proposal);
    assert_eq!(alice.state(), IdentityState::Active);
    alice.refresh_latest_block().await.unwrap();
    assert_eq!(alice.data_block(), Some(&block));
}

#[tokio::test]
async fn test_scripted_threshold_then_block() {
    let block = SkipBlock::new(1, vec![7; 32], b"accepted".to_vec(), vec![]);
    let service = Scripted::with(vec![
        Ok(created_reply()),
        Ok(proposal_ack()),
        Ok(envelope(&ProposeVoteReply { block: None })),
        Ok(envelope(&ProposeVoteReply {
            block: Some(block.clone()),
        })),
    ]);

    let mut id = Identity::new(service.clone(), roster(), 2, "alice").unwrap();
    id.create_identity().await.unwrap();
    let proposal = id.config().with_device("bob", Default::default());
    id.propose_send(proposal.clone()).await.unwrap();

    assert!(!id.propose_vote(true).await.unwrap());
    assert_eq!(id.proposed(), Some(&proposal));
    assert!(id.propose_vote(true).await.unwrap());
    assert_eq!(id.config(), &proposal);
    assert!(id.proposed().is_none());
    assert_eq!(id.data_block(), Some(&block));
    assert_eq!(
        service.sent(),
        vec![
            AddIdentity::packet_type(),
            ProposeSend::packet_type(),
            ProposeVote::packet_type(),
            ProposeVote::packet_type(),
        ]
    );
}

#[tokio::test]
async fn test_reject_sends_nothing() {
    let service = Scripted::with(vec![Ok(created_reply()), Ok(proposal_ack())]);
    let mut id = Identity::new(service.clone(), roster(), 2, "alice").unwrap();
    id.create_identity().await.unwrap();
    let proposal = id.config().with_device("bob", Default::default());
    id.propose_send(proposal.clone()).await.unwrap();
    let before = service.sent().len();

    assert!(!id.propose_vote(false).await.unwrap());
    assert_eq!(service.sent().len(), before);
    assert_eq!(id.proposed(), Some(&proposal));
    assert_eq!(id.state(), IdentityState::ProposalPending);
}

#[tokio::test]
async fn test_vote_without_proposal() {
    let service = Scripted::with(vec![Ok(created_reply())]);
    let mut id = Identity::new(service.clone(), roster(), 2, "alice").unwrap();
    id.create_identity().await.unwrap();

    assert!(matches!(
        id.propose_vote(true).await,
        Err(IdentityError::NoPendingProposal)
    ));
    assert_eq!(service.sent(), vec![AddIdentity::packet_type()]);
}

#[tokio::test]
async fn test_operations_need_an_identity() {
    let service = Scripted::with(vec![]);
    let mut id = Identity::new(service.clone(), roster(), 2, "alice").unwrap();

    assert!(matches!(id.propose_fetch().await, Err(IdentityError::NotAttached)));
    assert!(matches!(id.config_update().await, Err(IdentityError::NotAttached)));
    assert!(matches!(
        id.refresh_latest_block().await,
        Err(IdentityError::NotAttached)
    ));
    let proposal = id.proposed_or_current();
    assert!(matches!(
        id.propose_send(proposal).await,
        Err(IdentityError::NotAttached)
    ));
    assert!(service.sent().is_empty());
}

#[tokio::test]
async fn test_empty_roster() {
    let service = Scripted::with(vec![]);
    let mut id = Identity::new(service.clone(), Roster::default(), 2, "alice").unwrap();

    assert!(matches!(id.create_identity().await, Err(IdentityError::EmptyRoster)));
    assert!(matches!(id.config_update().await, Err(IdentityError::EmptyRoster)));
    assert!(service.sent().is_empty());
}

#[tokio::test]
async fn test_duplicate_account() {
    let service = Arc::new(QuorumService::default());
    let mut alice = Identity::new(service.clone(), roster(), 2, "alice").unwrap();
    alice.create_identity().await.unwrap();

    let mut other = Identity::new(service.clone(), roster(), 2, "alice").unwrap();
    let err = other
        .attach_to_identity(alice.id().unwrap().clone())
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::DuplicateAccount(ref name) if name == "alice"));
    assert_eq!(service.count::<ProposeSend>(), 0);
    assert!(other.proposed().is_none());
}

#[tokio::test]
async fn test_failed_requests_leave_state() {
    let service = Scripted::with(vec![
        Ok(created_reply()),
        timeout(),
        Ok(proposal_ack()),
        timeout(),
        timeout(),
        timeout(),
    ]);
    let mut id = Identity::new(service.clone(), roster(), 2, "alice").unwrap();
    id.create_identity().await.unwrap();
    let accepted = id.config().clone();
    let proposal = accepted.with_device("bob", Default::default());

    // A proposal that never reached the service is not recorded.
    let err = id.propose_send(proposal.clone()).await.unwrap_err();
    assert!(matches!(err, IdentityError::Remote(_)));
    assert_eq!(id.state(), IdentityState::Active);

    id.propose_send(proposal.clone()).await.unwrap();
    assert!(id.propose_fetch().await.is_err());
    assert!(id.propose_vote(true).await.is_err());
    assert!(id.config_update().await.is_err());

    assert_eq!(id.config(), &accepted);
    assert_eq!(id.proposed(), Some(&proposal));
    assert_eq!(id.proposed_or_current(), proposal);
}

#[tokio::test]
async fn test_service_error_is_remote() {
    let service = Arc::new(QuorumService::default());
    let mut stranger = Identity::new(service.clone(), roster(), 1, "carol").unwrap();
    let err = stranger
        .attach_to_identity(IdentityId(vec![0xde, 0xad]))
        .await
        .unwrap_err();
    match err {
        IdentityError::Remote(message) => assert_eq!(message, "unknown identity"),
        other => panic!("expected Remote, got {other:?}"),
    }
    assert_eq!(stranger.state(), IdentityState::Uninitialized);
}

#[tokio::test]
async fn test_unexpected_reply_is_remote() {
    let service = Scripted::with(vec![Ok(envelope(&ProposeVoteReply { block: None }))]);
    let mut id = Identity::new(service, roster(), 1, "alice").unwrap();
    assert!(matches!(id.create_identity().await, Err(IdentityError::Remote(_))));
    assert!(id.id().is_none());
}

#[tokio::test]
async fn test_proposal_needs_matching_ack() {
    let service = Scripted::with(vec![
        Ok(created_reply()),
        Ok(envelope(&GetLatestBlock {
            id: vec![1, 2, 3],
        })),
        Ok(envelope(&ProposeVoteReply { block: None })),
    ]);
    let mut id = Identity::new(service.clone(), roster(), 2, "alice").unwrap();
    id.create_identity().await.unwrap();
    let proposal = id.config().with_device("bob", Default::default());

    for _ in 0..2 {
        let err = id.propose_send(proposal.clone()).await.unwrap_err();
        assert!(matches!(err, IdentityError::Remote(_)));
        assert!(id.proposed().is_none());
        assert_eq!(id.state(), IdentityState::Active);
    }
    assert_eq!(service.sent().len(), 3);
}

// ============================================================================
// Following, ledger and persistence
// ============================================================================

#[tokio::test]
async fn test_follow_from_roster() {
    let service = Arc::new(QuorumService::default());
    let mut alice = Identity::new(service.clone(), roster(), 1, "alice").unwrap();
    alice.create_identity().await.unwrap();

    let id = alice.id().unwrap().clone();
    let follower = Identity::from_roster(service.clone(), roster(), id, "observer")
        .await
        .unwrap();
    assert_eq!(follower.config(), alice.config());
    assert_eq!(follower.state(), IdentityState::Active);
    assert!(!follower.config().contains_account("observer"));
}

#[tokio::test]
async fn test_store_and_refresh_block() {
    let service = Arc::new(QuorumService::default());
    let mut alice = Identity::new(service.clone(), roster(), 1, "alice").unwrap();
    alice.create_identity().await.unwrap();
    let genesis = alice.data_block().unwrap().clone();

    let stored = alice
        .skipchain()
        .store_block(&roster(), &genesis.hash, b"note".to_vec(), vec![alice.public_key()])
        .await
        .unwrap();
    assert_eq!(stored.index, 1);
    assert_eq!(stored.previous, genesis.hash);

    alice.refresh_latest_block().await.unwrap();
    assert_eq!(alice.data_block(), Some(&stored));
    assert_eq!(service.count::<GetLatestBlock>(), 1);
}

#[tokio::test]
async fn test_stream_round_trip() {
    let service = Arc::new(QuorumService::default());
    let mut alice = Identity::new(service.clone(), roster(), 2, "alice").unwrap();
    alice.create_identity().await.unwrap();
    let mut bob = Identity::new(service.clone(), roster(), 2, "bob").unwrap();
    bob.attach_to_identity(alice.id().unwrap().clone()).await.unwrap();

    let catalog = catalog();
    let mut buf = Vec::new();
    bob.save_to_stream(&mut buf, &catalog).unwrap();

    let mut restored = Identity::from_stream(buf.as_slice(), &catalog, service.clone()).unwrap();
    assert_eq!(restored.id(), bob.id());
    assert_eq!(restored.config(), bob.config());
    assert_eq!(restored.proposed(), bob.proposed());
    assert_eq!(restored.account(), "bob");
    assert_eq!(restored.roster(), bob.roster());
    assert_eq!(restored.public_key(), bob.public_key());
    assert_eq!(restored.state(), IdentityState::ProposalPending);

    // The restored key still signs valid votes.
    alice.propose_fetch().await.unwrap();
    alice.propose_vote(true).await.unwrap();
    assert!(restored.propose_vote(true).await.unwrap());
    assert!(restored.config().contains_account("bob"));
}

#[test]
fn test_stream_needs_registered_record() {
    let service = Scripted::with(vec![]);
    let id = Identity::new(service.clone(), roster(), 1, "alice").unwrap();

    let bare = MessageCatalog::new();
    let mut buf = Vec::new();
    assert!(matches!(
        id.save_to_stream(&mut buf, &bare),
        Err(IdentityError::Protocol(ProtocolError::UnknownMessageType(_)))
    ));

    let result = Identity::from_stream(&b"not an identity"[..], &catalog(), service);
    assert!(matches!(result, Err(IdentityError::Protocol(_))));
}

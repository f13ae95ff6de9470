use crate::error::{CallError, NegotiationStep, Result};
use crate::peer::connection::NegotiableConnection;
use crate::peer::fingerprint::verification_code;
use crate::peer::ice::{analyze_candidates, CandidateBuffer};
use crate::peer::types::{
    ConnectionEvent, IceCandidate, LocalTrack, PeerConnectionState, PresenceRecord, RemoteTrack,
    SessionDescription,
};
use crate::signaling::{ChannelEvent, ChannelSender, MessageKind};
use crate::utils::now_millis;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Как был обнаружен удалённый участник
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// Пришёл после нас (presence join): мы инициатор
    Joined,
    /// Уже был в канале, когда пришли мы: ждём offer
    AlreadyPresent,
    /// Прислал call-start: он новичок, мы инициатор
    Announced,
}

pub fn initial_role(discovery: Discovery) -> Role {
    match discovery {
        Discovery::Joined | Discovery::Announced => Role::Initiator,
        Discovery::AlreadyPresent => Role::Responder,
    }
}

/// При glare уступает сторона с меньшим id
pub fn yields_to(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    LocalMediaReady(Vec<LocalTrack>),
    PeerDiscovered {
        peer: PresenceRecord,
        discovery: Discovery,
    },
    PeerLeft {
        peer_id: String,
    },
    RemoteOfferReceived {
        from: String,
        description: SessionDescription,
    },
    RemoteAnswerReceived {
        from: String,
        description: SessionDescription,
    },
    LocalCandidateDiscovered(IceCandidate),
    LocalGatheringComplete,
    RemoteCandidateReceived {
        from: String,
        candidate: IceCandidate,
    },
    UnderlyingConnectionStateChanged(PeerConnectionState),
    RemoteTrackAdded(RemoteTrack),
    RemoteCallEnded {
        from: String,
    },
    MalformedSignal {
        from: String,
        kind: MessageKind,
        reason: String,
    },
}

impl From<ChannelEvent> for NegotiationEvent {
    fn from(event: ChannelEvent) -> Self {
        match event {
            ChannelEvent::PeerJoined(peer) => NegotiationEvent::PeerDiscovered {
                peer,
                discovery: Discovery::Joined,
            },
            ChannelEvent::PeerPresent(peer) => NegotiationEvent::PeerDiscovered {
                peer,
                discovery: Discovery::AlreadyPresent,
            },
            ChannelEvent::CallStart { from } => NegotiationEvent::PeerDiscovered {
                peer: PresenceRecord {
                    peer_id: from,
                    joined_at: now_millis(),
                },
                discovery: Discovery::Announced,
            },
            ChannelEvent::PeerLeft { peer_id } => NegotiationEvent::PeerLeft { peer_id },
            ChannelEvent::Offer { from, description } => {
                NegotiationEvent::RemoteOfferReceived { from, description }
            }
            ChannelEvent::Answer { from, description } => {
                NegotiationEvent::RemoteAnswerReceived { from, description }
            }
            ChannelEvent::Candidate { from, candidate } => {
                NegotiationEvent::RemoteCandidateReceived { from, candidate }
            }
            ChannelEvent::CallEnd { from } => NegotiationEvent::RemoteCallEnded { from },
            ChannelEvent::Rejected { from, kind, reason } => {
                NegotiationEvent::MalformedSignal { from, kind, reason }
            }
        }
    }
}

impl From<ConnectionEvent> for NegotiationEvent {
    fn from(event: ConnectionEvent) -> Self {
        match event {
            ConnectionEvent::LocalCandidate(c) => NegotiationEvent::LocalCandidateDiscovered(c),
            ConnectionEvent::GatheringComplete => NegotiationEvent::LocalGatheringComplete,
            ConnectionEvent::StateChanged(st) => {
                NegotiationEvent::UnderlyingConnectionStateChanged(st)
            }
            ConnectionEvent::RemoteTrack(t) => NegotiationEvent::RemoteTrackAdded(t),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationOutcome {
    PeerDiscovered { peer: PresenceRecord, role: Role },
    PeerLost { peer_id: String },
    RemoteHangup { peer_id: String },
    /// Состояние соединения, пересылается как есть
    ConnectionState(PeerConnectionState),
    RemoteStream(RemoteTrack),
    /// Offer/answer завершён
    Negotiated { verification_code: Option<String> },
    Failed(CallError),
}

/// Удалённый участник с точки зрения согласования
#[derive(Debug, Clone)]
enum Remote {
    Awaiting,
    Tracked(PresenceRecord),
    /// Участник ушёл. Соединение с ним не переиспользуется до перезапуска звонка.
    Departed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingState {
    Stable,
    HaveLocalOffer,
}

/// Владеет одним согласуемым соединением: offer/answer/кандидаты.
/// Автоматически не повторяет упавшие шаги.
pub struct NegotiationEngine {
    connection: Arc<dyn NegotiableConnection>,
    signals: ChannelSender,
    remote: Remote,
    role: Option<Role>,
    signaling: SignalingState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    candidates: CandidateBuffer,
    // локальные кандидаты, пока участник неизвестен
    outbound: Vec<IceCandidate>,
    gathered: Vec<IceCandidate>,
}

impl NegotiationEngine {
    pub fn new(connection: Arc<dyn NegotiableConnection>, signals: ChannelSender) -> Self {
        let candidates = CandidateBuffer::new(signals.session_id());
        Self {
            connection,
            signals,
            remote: Remote::Awaiting,
            role: None,
            signaling: SignalingState::Stable,
            local_description: None,
            remote_description: None,
            candidates,
            outbound: Vec::new(),
            gathered: Vec::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        self.signals.local_id()
    }

    pub fn remote_peer(&self) -> Option<&str> {
        match &self.remote {
            Remote::Tracked(peer) => Some(peer.peer_id.as_str()),
            _ => None,
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn sender(&self) -> &ChannelSender {
        &self.signals
    }

    pub async fn handle(&mut self, event: NegotiationEvent) -> Vec<NegotiationOutcome> {
        let mut out = Vec::new();
        if let Err(e) = self.step(event, &mut out).await {
            warn!("Negotiation step failed: {}", e);
            out.push(NegotiationOutcome::Failed(e));
        }
        out
    }

    async fn step(
        &mut self,
        event: NegotiationEvent,
        out: &mut Vec<NegotiationOutcome>,
    ) -> Result<()> {
        match event {
            NegotiationEvent::LocalMediaReady(tracks) => {
                for track in &tracks {
                    self.connection
                        .add_local_track(track)
                        .await
                        .map_err(|e| CallError::negotiation(NegotiationStep::AddTrack, e))?;
                }
                debug!("Attached {} local tracks", tracks.len());
            }
            NegotiationEvent::PeerDiscovered { peer, discovery } => {
                self.on_peer_discovered(peer, discovery, out).await?;
            }
            NegotiationEvent::PeerLeft { peer_id } => {
                if self.remote_peer() == Some(peer_id.as_str()) {
                    info!("Remote peer {} left the channel", peer_id);
                    self.forget_peer(&peer_id);
                    out.push(NegotiationOutcome::PeerLost { peer_id });
                }
            }
            NegotiationEvent::RemoteOfferReceived { from, description } => {
                self.on_remote_offer(from, description, out).await?;
            }
            NegotiationEvent::RemoteAnswerReceived { from, description } => {
                self.on_remote_answer(from, description, out).await?;
            }
            NegotiationEvent::LocalCandidateDiscovered(candidate) => {
                self.gathered.push(candidate.clone());
                match &self.remote {
                    Remote::Tracked(peer) => {
                        self.signals.send_candidate(&peer.peer_id, &candidate).await?
                    }
                    Remote::Awaiting => self.outbound.push(candidate),
                    Remote::Departed(_) => debug!("No peer to send local candidate to"),
                }
            }
            NegotiationEvent::LocalGatheringComplete => {
                analyze_candidates(&self.gathered);
            }
            NegotiationEvent::RemoteCandidateReceived { from, candidate } => {
                self.on_remote_candidate(from, candidate).await?;
            }
            NegotiationEvent::UnderlyingConnectionStateChanged(st) => {
                out.push(NegotiationOutcome::ConnectionState(st));
            }
            NegotiationEvent::RemoteTrackAdded(track) => {
                if matches!(self.remote, Remote::Departed(_)) {
                    debug!("Ignoring track {} from a finished negotiation", track.id);
                } else {
                    out.push(NegotiationOutcome::RemoteStream(track));
                }
            }
            NegotiationEvent::RemoteCallEnded { from } => {
                if self.remote_peer() == Some(from.as_str()) {
                    info!("Remote peer {} ended the call", from);
                    self.forget_peer(&from);
                    out.push(NegotiationOutcome::RemoteHangup { peer_id: from });
                }
            }
            NegotiationEvent::MalformedSignal { from, kind, reason } => {
                // ошибка звонка только от нашего участника или от offer,
                // который сделал бы отправителя нашим участником
                let ours = match &self.remote {
                    Remote::Tracked(peer) => peer.peer_id == from,
                    Remote::Awaiting => kind == MessageKind::Offer,
                    Remote::Departed(_) => false,
                };
                if !ours {
                    warn!("Dropping malformed {:?} from {}: {}", kind, from, reason);
                    return Ok(());
                }
                return Err(CallError::negotiation(
                    NegotiationStep::DecodePayload,
                    format!("{:?} from {}: {}", kind, from, reason),
                ));
            }
        }
        Ok(())
    }

    /// Сбрасывает согласование с ушедшим участником
    fn forget_peer(&mut self, peer_id: &str) {
        self.remote = Remote::Departed(peer_id.to_string());
        self.role = None;
        self.signaling = SignalingState::Stable;
        self.local_description = None;
        self.remote_description = None;
        self.candidates.clear();
        self.outbound.clear();
    }

    fn is_untouched(&self) -> bool {
        self.signaling == SignalingState::Stable
            && self.local_description.is_none()
            && self.remote_description.is_none()
    }

    async fn on_peer_discovered(
        &mut self,
        peer: PresenceRecord,
        discovery: Discovery,
        out: &mut Vec<NegotiationOutcome>,
    ) -> Result<()> {
        match &self.remote {
            Remote::Tracked(current) if current.peer_id != peer.peer_id => {
                warn!(
                    "Ignoring {} ({:?}): already tracking {}",
                    peer.peer_id, discovery, current.peer_id
                );
                return Ok(());
            }
            Remote::Tracked(_) => {
                // повторное обнаружение того же участника
                if initial_role(discovery) == Role::Initiator && self.is_untouched() {
                    self.role = Some(Role::Initiator);
                    self.make_offer().await?;
                }
                return Ok(());
            }
            Remote::Departed(previous) => {
                info!(
                    "Ignoring {} ({:?}): {} left, call must be restarted",
                    peer.peer_id, discovery, previous
                );
                return Ok(());
            }
            Remote::Awaiting => {}
        }

        let role = initial_role(discovery);
        let peer_id = peer.peer_id.clone();
        info!("Discovered peer {} ({:?}), acting as {:?}", peer_id, discovery, role);
        self.remote = Remote::Tracked(peer.clone());
        self.role = Some(role);
        out.push(NegotiationOutcome::PeerDiscovered { peer, role });

        match role {
            Role::Initiator => self.make_offer().await?,
            Role::Responder => self.signals.send_call_start(&peer_id).await?,
        }
        self.flush_outbound(&peer_id).await
    }

    async fn make_offer(&mut self) -> Result<()> {
        let Some(peer_id) = self.remote_peer().map(str::to_string) else {
            return Ok(());
        };

        let offer = self
            .connection
            .create_offer()
            .await
            .map_err(|e| CallError::negotiation(NegotiationStep::CreateOffer, e))?;
        // offer полностью применён до отправки
        self.connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| CallError::negotiation(NegotiationStep::SetLocalDescription, e))?;
        self.local_description = Some(offer.clone());
        self.signaling = SignalingState::HaveLocalOffer;

        info!("Sending offer to {}", peer_id);
        self.signals.send_description(&peer_id, &offer).await
    }

    async fn on_remote_offer(
        &mut self,
        from: String,
        description: SessionDescription,
        out: &mut Vec<NegotiationOutcome>,
    ) -> Result<()> {
        let newcomer = match &self.remote {
            Remote::Tracked(current) if current.peer_id != from => {
                warn!("Ignoring offer from {}: tracking {}", from, current.peer_id);
                return Ok(());
            }
            Remote::Tracked(_) => false,
            Remote::Departed(previous) => {
                info!("Ignoring offer from {}: {} left", from, previous);
                return Ok(());
            }
            Remote::Awaiting => true,
        };
        if newcomer {
            let peer = PresenceRecord {
                peer_id: from.clone(),
                joined_at: now_millis(),
            };
            info!("Discovered peer {} through its offer", from);
            self.remote = Remote::Tracked(peer.clone());
            self.role = Some(Role::Responder);
            out.push(NegotiationOutcome::PeerDiscovered {
                peer,
                role: Role::Responder,
            });
        }

        if self.remote_description.as_ref() == Some(&description) {
            debug!("Duplicate offer from {}, ignoring", from);
            return Ok(());
        }

        if self.signaling == SignalingState::HaveLocalOffer {
            if !yields_to(self.local_id(), &from) {
                info!("Glare with {}: keeping our offer", from);
                return Ok(());
            }
            info!("Glare with {}: rolling back our offer", from);
            self.connection
                .rollback()
                .await
                .map_err(|e| CallError::negotiation(NegotiationStep::Rollback, e))?;
            self.signaling = SignalingState::Stable;
            self.local_description = None;
            self.role = Some(Role::Responder);
        }

        self.apply_remote_description(&from, description).await?;

        let answer = self
            .connection
            .create_answer()
            .await
            .map_err(|e| CallError::negotiation(NegotiationStep::CreateAnswer, e))?;
        // answer полностью применён до отправки
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| CallError::negotiation(NegotiationStep::SetLocalDescription, e))?;
        self.local_description = Some(answer.clone());

        info!("Sending answer to {}", from);
        self.signals.send_description(&from, &answer).await?;
        self.flush_outbound(&from).await?;
        out.push(self.negotiated());
        Ok(())
    }

    async fn on_remote_answer(
        &mut self,
        from: String,
        description: SessionDescription,
        out: &mut Vec<NegotiationOutcome>,
    ) -> Result<()> {
        if self.remote_peer() != Some(from.as_str()) {
            warn!("Ignoring answer from untracked peer {}", from);
            return Ok(());
        }
        if self.signaling != SignalingState::HaveLocalOffer {
            debug!("No outstanding offer, ignoring answer from {}", from);
            return Ok(());
        }

        self.apply_remote_description(&from, description).await?;
        self.signaling = SignalingState::Stable;
        out.push(self.negotiated());
        Ok(())
    }

    /// Устанавливает remote description и затем применяет отложенные кандидаты
    async fn apply_remote_description(
        &mut self,
        from: &str,
        description: SessionDescription,
    ) -> Result<()> {
        self.connection
            .set_remote_description(description.clone())
            .await
            .map_err(|e| CallError::negotiation(NegotiationStep::SetRemoteDescription, e))?;
        self.remote_description = Some(description);

        let pending = self.candidates.drain_for(from);
        if !pending.is_empty() {
            info!("Applying {} buffered candidates from {}", pending.len(), from);
        }
        if !self.candidates.is_empty() {
            debug!("Dropping {} buffered candidates from other peers", self.candidates.len());
            self.candidates.clear();
        }
        let mut first_error = None;
        for candidate in pending {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                warn!("Failed to apply buffered candidate: {}", e);
                first_error.get_or_insert(CallError::negotiation(
                    NegotiationStep::AddIceCandidate,
                    e,
                ));
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn on_remote_candidate(&mut self, from: String, candidate: IceCandidate) -> Result<()> {
        match &self.remote {
            Remote::Tracked(current) if current.peer_id != from => {
                debug!("Ignoring candidate from untracked peer {}", from);
                return Ok(());
            }
            Remote::Departed(_) => {
                debug!("Ignoring candidate from {}: no active negotiation", from);
                return Ok(());
            }
            _ => {}
        }
        if self.remote_description.is_none() {
            self.candidates.push(&from, candidate);
            return Ok(());
        }
        self.connection
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| CallError::negotiation(NegotiationStep::AddIceCandidate, e))
    }

    async fn flush_outbound(&mut self, peer_id: &str) -> Result<()> {
        for candidate in std::mem::take(&mut self.outbound) {
            self.signals.send_candidate(peer_id, &candidate).await?;
        }
        Ok(())
    }

    fn negotiated(&self) -> NegotiationOutcome {
        let code = match (&self.local_description, &self.remote_description) {
            (Some(local), Some(remote)) => verification_code(&local.sdp, &remote.sdp),
            _ => None,
        };
        NegotiationOutcome::Negotiated {
            verification_code: code,
        }
    }

    /// Закрывает соединение и сбрасывает отложенные кандидаты
    pub async fn close(&mut self) -> Result<()> {
        self.candidates.clear();
        self.connection
            .close()
            .await
            .map_err(|e| CallError::ConnectionFailed(format!("close: {}", e)))
    }
}

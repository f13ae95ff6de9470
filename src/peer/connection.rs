use crate::config::{CallConfig, IceServerConfig};
use crate::error::ConnectionError;
use crate::logger::log_candidate;
use crate::peer::types::{
    ConnectionEvent, IceCandidate, LocalTrack, PeerConnectionState, RemoteTrack, SdpKind,
    SessionDescription, TrackKind,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Согласуемое соединение (offer/answer/candidates). Сеть не реализуем сами,
/// только оркестрируем.
#[async_trait]
pub trait NegotiableConnection: Send + Sync {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), ConnectionError>;
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), ConnectionError>;
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError>;
    /// Откат неотвеченного локального offer (glare)
    async fn rollback(&self) -> Result<(), ConnectionError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Создаёт соединения; события соединения уходят в `events`
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn NegotiableConnection>, ConnectionError>;
}

/// Фабрика на базе `webrtc::RTCPeerConnection`
pub struct WebRtcConnectionFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl WebRtcConnectionFactory {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn NegotiableConnection>, ConnectionError> {
        let connection = WebRtcConnection::new(rtc_config(&self.ice_servers), events).await?;
        Ok(Arc::new(connection))
    }
}

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcConnection {
    pub async fn new(
        config: RTCConfiguration,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self, ConnectionError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(api.new_peer_connection(config).await?);

        // Trickle ICE: каждый кандидат отдаём сразу
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate::from(init);
                        log_candidate("LOCAL", &candidate);
                        let _ = tx.send(ConnectionEvent::LocalCandidate(candidate));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {:?}", e),
                },
                None => {
                    // cand == None означает конец сбора
                    debug!("ICE candidate gathering completed (null candidate received)");
                    let _ = tx.send(ConnectionEvent::GatheringComplete);
                }
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!("Peer connection state changed to: {:?}", st);
            let _ = tx.send(ConnectionEvent::StateChanged(map_state(st)));
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                let remote = RemoteTrack {
                    id: track.id().to_string(),
                    stream_id: track.stream_id().to_string(),
                    kind,
                };
                info!("Remote track attached: {:?}", remote);
                let _ = tx.send(ConnectionEvent::RemoteTrack(remote));
                Box::pin(async {})
            },
        ));

        Ok(Self { pc })
    }
}

#[async_trait]
impl NegotiableConnection for WebRtcConnection {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), ConnectionError> {
        let mime_type = match track.kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            track.stream_id.clone(),
        ));
        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ConnectionError> {
        let rollback: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))
                .map_err(|e| ConnectionError(e.to_string()))?;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        log_candidate("REMOTE", &candidate);
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn map_state(st: RTCPeerConnectionState) -> PeerConnectionState {
    match st {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[IceServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceServerKind;

    #[test]
    fn config_carries_servers_and_policies() {
        let servers = vec![IceServerConfig {
            id: "relay".into(),
            kind: IceServerKind::Turn,
            url: "relay.example.com:3478".into(),
            username: Some("coach".into()),
            credential: Some("secret".into()),
        }];
        let config = rtc_config(&servers);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec!["turn:relay.example.com:3478"]);
        assert_eq!(config.ice_servers[0].username, "coach");
        assert_eq!(config.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(config.ice_candidate_pool_size, 10);
    }

    #[test]
    fn state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            PeerConnectionState::Connected
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Unspecified),
            PeerConnectionState::New
        );
    }
}

pub mod connection;
pub mod fingerprint;
pub mod ice;
pub mod negotiation;
pub mod state;
pub mod types;

pub use connection::{ConnectionFactory, NegotiableConnection, WebRtcConnectionFactory};
pub use fingerprint::verification_code;
pub use ice::{analyze_candidates, CandidateBuffer, CandidateSummary};
pub use negotiation::{
    Discovery, NegotiationEngine, NegotiationEvent, NegotiationOutcome, Role,
};
pub use state::{CallState, ConnectionStateMachine, LifecycleEvent, Transition};
pub use types::*;

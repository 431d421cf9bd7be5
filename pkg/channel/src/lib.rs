//! Message-channel plumbing shared by the control plane and the node agent:
//! request/response correlation, watermarked send queues, capped exponential
//! backoff, and the client-side WebSocket connector.

pub mod backoff;
pub mod client;
pub mod correlation;
pub mod sendq;

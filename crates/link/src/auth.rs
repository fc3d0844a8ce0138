//! Channel authentication.
//!
//! Keys a channel session through the channel's driver: a fresh ephemeral
//! key pair from the key store, an offer signed with the borrowed identity,
//! the driver's handshake bounded by the configured timeout, and an answer
//! that must verify against the responder's known public identity.

use crate::channel::ChannelDriver;
use crate::error::{LinkError, LinkResult};
use std::sync::Arc;
use std::time::Duration;
use swarmlink_core::{ChannelKind, ConfigHandle};
use swarmlink_crypto::{borrow_identity, ChannelSessions, KeyExchangeMessage, KeyStore};

/// Establishes channel sessions.
pub struct Authenticator {
    keystore: Arc<dyn KeyStore>,
    sessions: Arc<ChannelSessions>,
    config: ConfigHandle,
}

impl Authenticator {
    /// Authenticator writing into `sessions`.
    pub fn new(keystore: Arc<dyn KeyStore>, sessions: Arc<ChannelSessions>, config: ConfigHandle) -> Self {
        Self {
            keystore,
            sessions,
            config,
        }
    }

    /// Key the session for `driver`'s channel.
    ///
    /// On any failure the half-open handshake is discarded and an existing
    /// session for the channel is left untouched.
    pub async fn authenticate(&self, driver: &dyn ChannelDriver) -> LinkResult<()> {
        let channel = driver.kind();
        let offer = self.offer(channel)?;
        let timeout = Duration::from_millis(self.config.snapshot().auth_timeout_ms);

        let answer = match tokio::time::timeout(timeout, driver.handshake(offer)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                self.sessions.abort(channel);
                return Err(LinkError::AuthenticationFailed {
                    channel,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.sessions.abort(channel);
                return Err(LinkError::AuthenticationFailed {
                    channel,
                    reason: format!("handshake timed out after {}ms", timeout.as_millis()),
                });
            }
        };

        let responder = match self.keystore.peer_public_key(&answer.sender_id) {
            Ok(identity) => identity,
            Err(e) => {
                self.sessions.abort(channel);
                return Err(LinkError::AuthenticationFailed {
                    channel,
                    reason: e.to_string(),
                });
            }
        };
        self.sessions.complete(channel, &answer, Some(&responder))?;
        tracing::info!(channel = %channel, responder = %answer.sender_id, "Channel authenticated");
        Ok(())
    }

    fn offer(&self, channel: ChannelKind) -> LinkResult<KeyExchangeMessage> {
        let keypair = self.keystore.rotate_session_key(channel)?;
        let identity = borrow_identity(self.keystore.as_ref())?;
        Ok(self.sessions.begin(channel, keypair, &identity))
    }
}

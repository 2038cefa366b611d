//! Client-side authentication plugins.
//!
//! Authentication runs between connect and serve: the channel obtains a
//! fresh provider for each connection attempt and shuttles the provider's
//! opaque payloads across the wire in AUTH frames. The provider signals the
//! outcome through the completion handle it was constructed with; the
//! channel transitions to connected (or tears the connection down) based on
//! that signal.
//!
//! The envelope around every payload names the plugin that produced it, so
//! both ends can detect a plugin mismatch before interpreting bytes.

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tidepool_core::ServerAddress;

use crate::error::ErrorCode;

/// Envelope for auth payloads crossing the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMessage {
    /// Name of the plugin that produced the payload.
    pub auth_plugin_name: String,
    /// Opaque plugin payload.
    pub payload: Vec<u8>,
}

/// Handle through which a provider reports the outcome of its handshake.
///
/// May be invoked more than once; the channel only honors the first signal
/// per authentication session.
pub type AuthCompletion = Rc<dyn Fn(ErrorCode)>;

/// A single authentication session against one server connection.
///
/// `init` is called once right after the connection is established;
/// `process` is called for every AUTH frame the server sends back. Both
/// receive a `send` sink for emitting further handshake messages.
pub trait ClientAuthProvider {
    /// Start the handshake.
    fn init(&mut self, send: &mut dyn FnMut(AuthMessage));

    /// Handle a handshake message from the server.
    fn process(&mut self, message: AuthMessage, send: &mut dyn FnMut(AuthMessage));
}

/// Factory producing one [`ClientAuthProvider`] per connection attempt.
pub trait AuthProviderFactory {
    /// Name of this plugin; must match the server side.
    fn plugin_name(&self) -> &str;

    /// Create a provider for a new session against `addr`.
    fn new_provider(
        &self,
        addr: &ServerAddress,
        completion: AuthCompletion,
    ) -> Box<dyn ClientAuthProvider>;
}

/// The no-op auth plugin, used when a client is built without one.
///
/// Completes successfully during `init` without sending anything, so
/// unauthenticated deployments go straight from connect to serve.
pub struct NullAuthFactory;

impl NullAuthFactory {
    /// Plugin name advertised by the null plugin.
    pub const PLUGIN_NAME: &'static str = "null";
}

impl AuthProviderFactory for NullAuthFactory {
    fn plugin_name(&self) -> &str {
        Self::PLUGIN_NAME
    }

    fn new_provider(
        &self,
        _addr: &ServerAddress,
        completion: AuthCompletion,
    ) -> Box<dyn ClientAuthProvider> {
        Box::new(NullAuthProvider { completion })
    }
}

struct NullAuthProvider {
    completion: AuthCompletion,
}

impl ClientAuthProvider for NullAuthProvider {
    fn init(&mut self, _send: &mut dyn FnMut(AuthMessage)) {
        (self.completion)(ErrorCode::Ok);
    }

    fn process(&mut self, _message: AuthMessage, _send: &mut dyn FnMut(AuthMessage)) {
        // nothing to negotiate; any unexpected server message is harmless
        (self.completion)(ErrorCode::Ok);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use tidepool_core::{JsonCodec, MessageCodec};

    use super::*;

    #[test]
    fn test_auth_message_codec_roundtrip() {
        let codec = JsonCodec;
        let msg = AuthMessage {
            auth_plugin_name: "sasl".to_string(),
            payload: vec![0, 1, 2, 255],
        };
        let bytes = codec.encode(&msg).expect("encode");
        let decoded: AuthMessage = codec.decode(&bytes).expect("decode");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_null_provider_completes_ok_in_init() {
        let outcome: Rc<RefCell<Option<ErrorCode>>> = Rc::new(RefCell::new(None));
        let outcome_clone = outcome.clone();
        let completion: AuthCompletion = Rc::new(move |rc| {
            *outcome_clone.borrow_mut() = Some(rc);
        });

        let factory = NullAuthFactory;
        let addr = ServerAddress::new("127.0.0.1", 3181);
        let mut provider = factory.new_provider(&addr, completion);

        let sent: Rc<RefCell<Vec<AuthMessage>>> = Rc::new(RefCell::new(Vec::new()));
        let sent_clone = sent.clone();
        let mut send = move |m: AuthMessage| sent_clone.borrow_mut().push(m);
        provider.init(&mut send);

        assert_eq!(*outcome.borrow(), Some(ErrorCode::Ok));
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn test_null_factory_plugin_name() {
        assert_eq!(NullAuthFactory.plugin_name(), "null");
    }
}

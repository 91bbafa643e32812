use std::collections::HashMap;
use std::fmt;

use super::connection::NetChannel;
use super::messages::MsgStringTableEntries;
use super::protocol::{DeliveryMethod, MessageGroup, NetError};

/// A typed application message with a stable wire name.
///
/// Both peers must register the same names; ids are assigned by the
/// server's string table, so registration order does not matter.
pub trait NetMessage: Sized + fmt::Debug + 'static {
    const NAME: &'static str;
    const GROUP: MessageGroup;

    fn encode(&self) -> Result<Vec<u8>, NetError>;

    /// Parses an untrusted payload. Must fail with an error, never panic.
    fn decode(payload: &[u8]) -> Result<Self, NetError>;

    fn delivery() -> DeliveryMethod {
        Self::GROUP.delivery()
    }
}

/// Implements [`NetMessage::encode`] and [`NetMessage::decode`] for a type
/// deriving rkyv's `Archive`, `Serialize` and `Deserialize`. Decoding copies
/// the payload into an aligned buffer and validates it before use.
#[macro_export]
macro_rules! rkyv_codec {
    () => {
        fn encode(&self) -> ::core::result::Result<Vec<u8>, $crate::net::NetError> {
            ::rkyv::to_bytes::<::rkyv::rancor::Error>(self)
                .map(|aligned| aligned.into_vec())
                .map_err($crate::net::NetError::Encode)
        }

        fn decode(payload: &[u8]) -> ::core::result::Result<Self, $crate::net::NetError> {
            let mut aligned = ::rkyv::util::AlignedVec::<16>::with_capacity(payload.len());
            aligned.extend_from_slice(payload);
            ::rkyv::from_bytes::<Self, ::rkyv::rancor::Error>(&aligned)
                .map_err($crate::net::NetError::Decode)
        }
    };
}

type ErasedHandler = Box<dyn FnMut(&NetChannel, &[u8]) -> Result<(), NetError>>;

struct MessageRegistration {
    group: MessageGroup,
    handler: Option<ErasedHandler>,
}

/// Maps message names to their decoder and the single callback that
/// receives them.
pub struct MessageRegistry {
    registrations: HashMap<&'static str, MessageRegistration>,
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("names", &self.registrations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        let mut registrations = HashMap::new();
        registrations.insert(
            MsgStringTableEntries::NAME,
            MessageRegistration {
                group: MsgStringTableEntries::GROUP,
                handler: None,
            },
        );
        Self { registrations }
    }

    /// Registers `M` without a callback. Frames of this type are dropped on
    /// receipt, but the type can be sent.
    pub fn register<M: NetMessage>(&mut self) -> Result<(), NetError> {
        self.insert::<M>(None)
    }

    pub fn register_with_handler<M, F>(&mut self, mut callback: F) -> Result<(), NetError>
    where
        M: NetMessage,
        F: FnMut(&NetChannel, M) + 'static,
    {
        let handler: ErasedHandler = Box::new(move |channel: &NetChannel, payload: &[u8]| {
            let message = M::decode(payload)?;
            callback(channel, message);
            Ok(())
        });
        self.insert::<M>(Some(handler))
    }

    fn insert<M: NetMessage>(&mut self, handler: Option<ErasedHandler>) -> Result<(), NetError> {
        if self.registrations.contains_key(M::NAME) {
            return Err(NetError::DuplicateMessage(M::NAME.to_string()));
        }
        self.registrations.insert(
            M::NAME,
            MessageRegistration {
                group: M::GROUP,
                handler,
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    pub fn group(&self, name: &str) -> Option<MessageGroup> {
        self.registrations.get(name).map(|r| r.group)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.registrations.keys().copied()
    }

    /// Decodes `payload` as message `name` and hands it to its callback.
    pub fn dispatch(
        &mut self,
        name: &str,
        channel: &NetChannel,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let registration = self
            .registrations
            .get_mut(name)
            .ok_or_else(|| NetError::UnregisteredMessage(name.to_string()))?;
        let handler = registration
            .handler
            .as_mut()
            .ok_or_else(|| NetError::NoHandler(name.to_string()))?;
        handler(channel, payload)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::net::connection::ConnectionId;
    use crate::net::messages::MsgStateAck;

    fn channel() -> NetChannel {
        NetChannel::new(
            ConnectionId(3),
            "player".to_string(),
            "127.0.0.1:5000".parse().unwrap(),
        )
    }

    #[test]
    fn double_registration_fails() {
        let mut registry = MessageRegistry::new();
        registry.register::<MsgStateAck>().unwrap();

        assert!(matches!(
            registry.register::<MsgStateAck>(),
            Err(NetError::DuplicateMessage(_))
        ));
        assert!(matches!(
            registry.register::<MsgStringTableEntries>(),
            Err(NetError::DuplicateMessage(_))
        ));
    }

    #[test]
    fn dispatch_invokes_handler_with_channel() {
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);

        let mut registry = MessageRegistry::new();
        registry
            .register_with_handler(move |channel: &NetChannel, msg: MsgStateAck| {
                sink.borrow_mut().push((channel.connection(), msg.tick));
            })
            .unwrap();

        let payload = MsgStateAck { tick: 42 }.encode().unwrap();
        registry
            .dispatch(MsgStateAck::NAME, &channel(), &payload)
            .unwrap();

        assert_eq!(*received.borrow(), vec![(ConnectionId(3), 42)]);
    }

    #[test]
    fn dispatch_without_handler_or_registration() {
        let mut registry = MessageRegistry::new();
        registry.register::<MsgStateAck>().unwrap();

        assert!(matches!(
            registry.dispatch(MsgStateAck::NAME, &channel(), &[]),
            Err(NetError::NoHandler(_))
        ));
        assert!(matches!(
            registry.dispatch("MsgNope", &channel(), &[]),
            Err(NetError::UnregisteredMessage(_))
        ));
    }

    #[test]
    fn garbage_payload_is_an_error() {
        let mut registry = MessageRegistry::new();
        registry
            .register_with_handler(|_: &NetChannel, _: MsgStateAck| {
                panic!("handler must not run for garbage");
            })
            .unwrap();

        for garbage in [&[][..], &[0xff][..], &[0x01, 0x02, 0x03][..]] {
            assert!(registry
                .dispatch(MsgStateAck::NAME, &channel(), garbage)
                .is_err());
        }
    }
}

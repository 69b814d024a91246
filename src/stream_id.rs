use crate::error::{MuxError, Result};
use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

/// A 31-bit stream identifier. The top bit of the wire field is reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u32);

impl StreamId {
    pub const ZERO: StreamId = StreamId(0);
    pub const MAX: u32 = 0x7FFF_FFFF;

    /// Builds an id from a raw wire value, dropping the reserved bit.
    pub fn new(raw: u32) -> Self {
        StreamId(raw & Self::MAX)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for StreamId {
    fn from(raw: u32) -> Self {
        StreamId::new(raw)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which end of the transport a session sits on.
///
/// The initiator opens odd-numbered streams, the acceptor even-numbered
/// ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        }
    }

    /// True if streams with this id are opened by this role.
    pub fn owns(self, id: StreamId) -> bool {
        let odd = id.get() % 2 == 1;
        match self {
            Role::Initiator => odd,
            Role::Acceptor => !odd && !id.is_zero(),
        }
    }
}

#[derive(Debug)]
pub struct StreamIdGenerator {
    next_id: AtomicU32,
    role: Role,
}

impl StreamIdGenerator {
    pub fn new(role: Role) -> Self {
        Self {
            next_id: AtomicU32::new(role.first_id()),
            role,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Allocates the next id of this role's parity. Never wraps: once the
    /// 31-bit space is used up every call fails.
    pub fn next(&self) -> Result<StreamId> {
        let mut current = self.next_id.load(Ordering::Relaxed);
        loop {
            if current > StreamId::MAX {
                return Err(MuxError::StreamsExhausted);
            }
            match self.next_id.compare_exchange_weak(
                current,
                current + 2,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(StreamId(current)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Checks that a stream announced by the peer carries the peer's parity.
    pub fn validate_peer_stream_id(&self, id: StreamId) -> Result<()> {
        if id.is_zero() {
            return Err(MuxError::Protocol("stream id 0 opened by peer".into()));
        }
        if self.role.owns(id) {
            return Err(MuxError::Protocol(format!(
                "peer opened stream {id} with the wrong parity"
            )));
        }
        Ok(())
    }

    pub fn is_local(&self, id: StreamId) -> bool {
        self.role.owns(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_stream_id_generation() {
        let generator = StreamIdGenerator::new(Role::Initiator);

        assert_eq!(generator.next().unwrap().get(), 1);
        assert_eq!(generator.next().unwrap().get(), 3);
        assert_eq!(generator.next().unwrap().get(), 5);
        assert_eq!(generator.next().unwrap().get(), 7);
    }

    #[test]
    fn test_acceptor_stream_id_generation() {
        let generator = StreamIdGenerator::new(Role::Acceptor);

        assert_eq!(generator.next().unwrap().get(), 2);
        assert_eq!(generator.next().unwrap().get(), 4);
        assert_eq!(generator.next().unwrap().get(), 6);
    }

    #[test]
    fn test_stream_id_exhaustion() {
        let generator = StreamIdGenerator::new(Role::Initiator);
        generator.next_id.store(StreamId::MAX, Ordering::Relaxed);

        assert_eq!(generator.next().unwrap().get(), StreamId::MAX);
        assert!(matches!(generator.next(), Err(MuxError::StreamsExhausted)));
        // Stays exhausted rather than wrapping around
        assert!(matches!(generator.next(), Err(MuxError::StreamsExhausted)));

        let generator = StreamIdGenerator::new(Role::Acceptor);
        generator.next_id.store(StreamId::MAX - 1, Ordering::Relaxed);
        assert_eq!(generator.next().unwrap().get(), StreamId::MAX - 1);
        assert!(matches!(generator.next(), Err(MuxError::StreamsExhausted)));
    }

    #[test]
    fn test_peer_stream_id_validation() {
        let initiator = StreamIdGenerator::new(Role::Initiator);
        let acceptor = StreamIdGenerator::new(Role::Acceptor);

        // Initiator accepts even ids from its peer
        assert!(initiator.validate_peer_stream_id(StreamId::new(2)).is_ok());
        assert!(initiator.validate_peer_stream_id(StreamId::new(100)).is_ok());
        assert!(initiator.validate_peer_stream_id(StreamId::new(1)).is_err());
        assert!(initiator.validate_peer_stream_id(StreamId::new(99)).is_err());

        // Acceptor accepts odd ids from its peer
        assert!(acceptor.validate_peer_stream_id(StreamId::new(1)).is_ok());
        assert!(acceptor.validate_peer_stream_id(StreamId::new(99)).is_ok());
        assert!(acceptor.validate_peer_stream_id(StreamId::new(2)).is_err());

        assert!(initiator.validate_peer_stream_id(StreamId::ZERO).is_err());
        assert!(acceptor.validate_peer_stream_id(StreamId::ZERO).is_err());
    }

    #[test]
    fn test_reserved_bit_is_masked() {
        assert_eq!(StreamId::new(0x8000_0005).get(), 5);
        assert!(StreamId::new(0x8000_0000).is_zero());
    }

    #[test]
    fn test_concurrent_id_generation() {
        use std::{collections::HashSet, sync::Arc, thread};

        let generator = Arc::new(StreamIdGenerator::new(Role::Initiator));
        let mut handles = vec![];

        for _ in 0..10 {
            let generator_clone = Arc::clone(&generator);
            let handle = thread::spawn(move || {
                let mut ids = Vec::new();
                for _ in 0..100 {
                    ids.push(generator_clone.next().unwrap());
                }
                ids
            });
            handles.push(handle);
        }

        let mut all_ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all_ids.insert(id), "Duplicate stream id: {id}");
                assert_eq!(id.get() % 2, 1);
            }
        }
        assert_eq!(all_ids.len(), 1000);
    }
}

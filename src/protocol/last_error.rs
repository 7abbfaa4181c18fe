/// Per-session cache of the most recent getLastError reply
use super::MsgHeader;

/// Holds the last known getLastError reply for one client session.
///
/// Either both the header and the trailing bytes are present, or neither is;
/// the tuple representation makes the half-set state unrepresentable.
#[derive(Debug, Default)]
pub struct LastError {
    cached: Option<(MsgHeader, Vec<u8>)>,
}

impl LastError {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a reply is cached.
    pub fn exists(&self) -> bool {
        self.cached.is_some()
    }

    /// Clear the cache. A no-op when already empty.
    pub fn reset(&mut self) {
        self.cached = None;
    }

    /// Store a reply: the header and every body byte that followed it.
    pub fn set(&mut self, header: MsgHeader, rest: Vec<u8>) {
        self.cached = Some((header, rest));
    }

    /// Serve the cached reply for a new request: patches `response_to` to
    /// the request id and returns the header along with the payload.
    pub fn for_request(&mut self, request_id: i32) -> Option<(MsgHeader, &[u8])> {
        let (header, rest) = self.cached.as_mut()?;
        header.response_to = request_id;
        Some((*header, rest.as_slice()))
    }
}

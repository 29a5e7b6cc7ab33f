use bytes::Bytes;

/// Port the relay (and its discovery endpoint) listens on
pub const DEFAULT_PORT: u16 = 3000;
/// Upgrade path for the single producer
pub const PRODUCER_PATH: &str = "/transmitter";
/// Upgrade path for consumers
pub const CONSUMER_PATH: &str = "/viewer";
/// Address discovery side-channel
pub const DISCOVERY_PATH: &str = "/local-ip";

/// The role a connection takes, chosen by its upgrade path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn path(self) -> &'static str {
        match self {
            Role::Producer => PRODUCER_PATH,
            Role::Consumer => CONSUMER_PATH,
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            PRODUCER_PATH => Some(Role::Producer),
            CONSUMER_PATH => Some(Role::Consumer),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

/// One compressed image, exactly as it travels on the wire.
///
/// The payload is shared (cloning never copies pixels) and there are no
/// mutators: `width`/`height` describe the encoded image, which may be
/// smaller than what was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
    width: u32,
    height: u32,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            width,
            height,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// `ws://host:port/<role path>`
pub fn relay_url(host: &str, port: u16, role: Role) -> String {
    format!("ws://{}:{}{}", host, port, role.path())
}

/// `http://host:port/local-ip`
pub fn discovery_url(host: &str, port: u16) -> String {
    format!("http://{}:{}{}", host, port, DISCOVERY_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_paths() {
        assert_eq!(Role::from_path("/transmitter"), Some(Role::Producer));
        assert_eq!(Role::from_path("/viewer"), Some(Role::Consumer));
        assert_eq!(Role::from_path("/viewer/"), None);
        assert_eq!(Role::from_path("/"), None);
        assert_eq!(Role::Producer.path(), PRODUCER_PATH);
    }

    #[test]
    fn test_urls() {
        assert_eq!(
            relay_url("192.168.0.7", 3000, Role::Producer),
            "ws://192.168.0.7:3000/transmitter"
        );
        assert_eq!(
            relay_url("localhost", DEFAULT_PORT, Role::Consumer),
            "ws://localhost:3000/viewer"
        );
        assert_eq!(
            discovery_url("localhost", 3000),
            "http://localhost:3000/local-ip"
        );
    }

    #[test]
    fn test_frame_clone_shares_payload() {
        let frame = Frame::new(vec![1u8, 2, 3], 4, 2);
        let copy = frame.clone();
        assert_eq!(copy.data().as_ptr(), frame.data().as_ptr());
        assert_eq!((copy.width(), copy.height(), copy.len()), (4, 2, 3));
    }
}
